/// Bytes of PCM produced per millisecond of audio (44.1 kHz, 16-bit, stereo, rounded).
pub const BYTES_PER_MS: usize = 176;

const SAMPLE_SIZE: usize = 2;

/// Result of a single mixing pass.
#[derive(Debug, Eq, PartialEq)]
pub struct Mix {
    /// Mixed PCM, `2 * result_samples` bytes.
    pub bytes: Box<[u8]>,
    /// Bytes taken from each input, in input order. The caller drains this many bytes from the
    /// corresponding source.
    pub consumed: Vec<usize>,
}

/// Returns the number of output samples a tick of `tick_ms` produces, limited by
/// `output_capacity` bytes.
pub fn result_samples(output_capacity: usize, tick_ms: u64) -> usize {
    let wanted_samples = (BYTES_PER_MS as u64).saturating_mul(tick_ms) / SAMPLE_SIZE as u64;
    let available_samples = (output_capacity / SAMPLE_SIZE) as u64;

    wanted_samples.min(available_samples) as usize
}

/// Mixes `inputs` by saturating addition into a fresh buffer of one tick's length.
///
/// Inputs and output are signed 16-bit little-endian samples. Inputs shorter than the tick are
/// padded with silence.
pub fn mix(inputs: &[&[u8]], output_capacity: usize, tick_ms: u64) -> Mix {
    let result_samples = result_samples(output_capacity, tick_ms);

    let mut acc = vec![0i16; result_samples];
    let mut consumed = Vec::with_capacity(inputs.len());

    for input in inputs.iter() {
        let input_samples = input.len() / SAMPLE_SIZE;
        let used = input_samples.min(result_samples);

        for (out, chunk) in acc.iter_mut().zip(input.chunks_exact(SAMPLE_SIZE)).take(used) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            *out = out.saturating_add(sample);
        }

        consumed.push(used * SAMPLE_SIZE);
    }

    let bytes = acc
        .iter()
        .flat_map(|sample| sample.to_le_bytes())
        .collect::<Vec<_>>()
        .into_boxed_slice();

    Mix { bytes, consumed }
}
