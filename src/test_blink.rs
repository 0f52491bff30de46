use std::sync::Arc;
use std::time::Duration;

use beacon::{Actuator, Level, PinId, PinInterface, SysfsPins};
use beacon::mock::MockPins;
use clap::Parser;
use eyre::Result;
use tracing::info;

/// Blinks one LED for a while, then parks it low and releases the pin.
#[derive(Parser, Debug)]
struct Args {
    #[arg(default_value_t = PinId(17))]
    pin: PinId,
    #[arg(long, default_value_t = 250)]
    half_period_ms: u64,
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Run against the in-memory backend
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    let args = Args::parse();
    let pins: Arc<dyn PinInterface> = if args.mock {
        Arc::new(MockPins::new())
    } else {
        Arc::new(SysfsPins::default())
    };

    let led = Actuator::bind("led", args.pin, pins)?;
    led.set(Level::High).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    led.start_blink(Duration::from_millis(args.half_period_ms)).await?;
    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    led.stop_blink().await?;
    info!("Stopped, level is {:?}", led.level());
    led.unbind().await?;
    Ok(())
}
