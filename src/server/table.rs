use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net;

use super::session::{FifoLimits, Session, SessionId};

/// Why a UDP endpoint could not be bound to a session.
#[derive(Debug, Eq, PartialEq)]
pub enum BindError {
    UnknownId,
    EndpointTaken(SessionId),
}

/// All live sessions, indexed by id and by bound UDP endpoint.
pub struct SessionTable {
    // Ordered so that reports and mixes visit sessions in id order
    sessions: BTreeMap<SessionId, Session>,
    // Mapping from bound UDP endpoint to session id
    endpoints: HashMap<net::SocketAddr, SessionId>,
    // Ids are assigned sequentially and never reused
    next_id: SessionId,
    limits: FifoLimits,
}

impl SessionTable {
    pub fn new(limits: FifoLimits) -> Self {
        Self {
            sessions: BTreeMap::new(),
            endpoints: HashMap::new(),
            next_id: 0,
            limits,
        }
    }

    /// Creates a session for a newly accepted control connection and returns its id.
    pub fn insert(&mut self, control_addr: net::SocketAddr) -> SessionId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        self.sessions
            .insert(id, Session::new(id, control_addr, self.limits));

        return id;
    }

    /// Associates `endpoint` with session `id`. A session may rebind to a new endpoint, but an
    /// endpoint already bound to a different live session stays with that session.
    pub fn bind(
        &mut self,
        id: SessionId,
        endpoint: net::SocketAddr,
    ) -> Result<&mut Session, BindError> {
        if !self.sessions.contains_key(&id) {
            return Err(BindError::UnknownId);
        }

        match self.endpoints.get(&endpoint) {
            Some(&owner) if owner != id => return Err(BindError::EndpointTaken(owner)),
            _ => (),
        }

        let session = self.sessions.get_mut(&id).ok_or(BindError::UnknownId)?;

        if let Some(previous) = session.endpoint().copied() {
            if previous != endpoint {
                self.endpoints.remove(&previous);
            }
        }

        session.bind_endpoint(endpoint);
        self.endpoints.insert(endpoint, id);

        Ok(session)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn find_by_endpoint_mut(&mut self, endpoint: &net::SocketAddr) -> Option<&mut Session> {
        let id = self.endpoints.get(endpoint)?;
        self.sessions.get_mut(id)
    }

    /// Removes a session along with its endpoint binding.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;

        if let Some(endpoint) = session.endpoint() {
            if self.endpoints.get(endpoint) == Some(&id) {
                self.endpoints.remove(endpoint);
            }
        }

        Some(session)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn bound_endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}
