use std::io;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

const RECONNECT_DELAY: Duration = Duration::from_millis(800);

#[derive(Parser)]
#[command(name = "campfire-client")]
#[command(about = "Uploads audio from stdin and plays the group mix to stdout")]
struct Args {
    #[arg(short, long)]
    server: String,

    #[arg(short, long, default_value_t = campfire::DEFAULT_PORT)]
    port: u16,

    #[arg(short = 'X', long, default_value_t = 10, help = "How far ahead a mix may be before missing mixes are given up on")]
    retransmit_limit: u32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = campfire::client::Config {
        server_name: args.server,
        port: args.port,
        retransmit_limit: args.retransmit_limit,
    };

    config.validate()?;

    let mut input = io::stdin();
    let mut output = io::stdout();

    loop {
        let result = campfire::Client::connect(config.clone())
            .and_then(|mut client| client.run(&mut input, &mut output));

        if let Err(err) = result {
            log::error!("{}", err);
        }

        log::info!("reconnecting in {} ms", RECONNECT_DELAY.as_millis());

        thread::sleep(RECONNECT_DELAY);
    }
}
