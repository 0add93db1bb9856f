use anyhow::Result;
use clap::Parser;

#[derive(Parser)]
#[command(name = "campfire-server")]
#[command(about = "Mixes audio uploaded by every client and broadcasts the mix back")]
struct Args {
    #[arg(short, long, default_value_t = campfire::DEFAULT_PORT)]
    port: u16,

    #[arg(short = 'F', long, default_value_t = 10560, help = "FIFO size per client, in bytes")]
    fifo_size: usize,

    #[arg(short = 'L', long, default_value_t = 0, help = "FIFO low watermark, in bytes")]
    fifo_low_watermark: usize,

    #[arg(short = 'H', long, help = "FIFO high watermark, in bytes [default: FIFO size]")]
    fifo_high_watermark: Option<usize>,

    #[arg(short = 'X', long, default_value_t = 10, help = "Number of mixes kept for retransmission")]
    buf_len: usize,

    #[arg(short = 'i', long, default_value_t = 5, help = "Mixing interval in ms")]
    tx_interval: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = campfire::server::Config {
        port: args.port,
        fifo_size: args.fifo_size,
        fifo_low_watermark: args.fifo_low_watermark,
        fifo_high_watermark: args.fifo_high_watermark.unwrap_or(args.fifo_size),
        buf_len: args.buf_len,
        tx_interval_ms: args.tx_interval,
    };

    let mut server = campfire::Server::bind(config)?;

    log::info!("server started on {}", server.local_addr());

    if let Err(err) = server.run() {
        log::error!("server stopped: {}", err);
        return Err(err.into());
    }

    Ok(())
}
