use std::sync::Arc;
use std::time::Duration;

use beacon::{PinId, Sensor, SysfsPins};
use clap::Parser;
use eyre::Result;
use tracing::info;

/// Prints the button state every `poll_ms` until interrupted.
#[derive(Parser, Debug)]
struct Args {
    #[arg(default_value_t = PinId(18))]
    pin: PinId,
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,
    /// Treat a high level as pressed
    #[arg(long)]
    active_high: bool,
}

fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    let args = Args::parse();
    let button = Sensor::bind("button", args.pin, !args.active_high, Arc::new(SysfsPins::default()))?;
    let mut last = None;
    loop {
        let state = button.read()?;
        if last != Some(state) {
            info!("{:?} ({})", state, state.status_line().trim_end());
            last = Some(state);
        }
        std::thread::sleep(Duration::from_millis(args.poll_ms));
    }
}
