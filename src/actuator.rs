use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, span, warn, Level as SpanLevel};

use crate::blink::{BlinkPhase, BlinkScheduler};
use crate::error::{Error, Result};
use crate::pin::{Direction, Level, PinId, PinInterface};

/// Last level known to be on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Observed {
    Low,
    High,
    /// The last write failed; the line may be at either level.
    Unknown,
}

#[derive(Debug, Default)]
struct LevelCell(AtomicU8);

impl LevelCell {
    const LOW: u8 = 0;
    const HIGH: u8 = 1;
    const UNKNOWN: u8 = 2;

    fn load(&self) -> Observed {
        match self.0.load(Ordering::Acquire) {
            Self::LOW => Observed::Low,
            Self::HIGH => Observed::High,
            _ => Observed::Unknown,
        }
    }

    fn store(&self, observed: Observed) {
        let raw = match observed {
            Observed::Low => Self::LOW,
            Observed::High => Self::HIGH,
            Observed::Unknown => Self::UNKNOWN,
        };
        self.0.store(raw, Ordering::Release);
    }
}

/// Everything needed to drive one output line; shared with the blink task.
#[derive(Clone)]
pub(crate) struct Line {
    pub name: Arc<str>,
    pub pin: PinId,
    pub pins: Arc<dyn PinInterface>,
    level: Arc<LevelCell>,
}

impl Line {
    /// Writes `level` and records what the line is now known to be.
    pub fn write(&self, level: Level) -> io::Result<()> {
        match self.pins.write_level(self.pin, level) {
            Ok(()) => {
                self.level.store(match level {
                    Level::Low => Observed::Low,
                    Level::High => Observed::High,
                });
                Ok(())
            }
            Err(e) => {
                self.level.store(Observed::Unknown);
                Err(e)
            }
        }
    }

    /// `write` on the blocking pool; sysfs writes are file I/O.
    pub async fn write_blocking(&self, level: Level) -> io::Result<()> {
        let line = self.clone();
        match tokio::task::spawn_blocking(move || line.write(level)).await {
            Ok(written) => written,
            Err(e) => {
                self.level.store(Observed::Unknown);
                Err(io::Error::other(e))
            }
        }
    }
}

struct Control {
    bound: bool,
    blink: BlinkScheduler,
}

/// One output line (an LED) bound to one pin.
///
/// `set`, `start_blink`, `stop_blink` and `unbind` are serialized by a
/// per-actuator lock, so at most one of them is in flight and at most one
/// blink task exists. The lock is held while a blink task is being joined.
pub struct Actuator {
    line: Line,
    control: Mutex<Control>,
}

impl Actuator {
    /// Exports `pin`, makes it an output and drives it low.
    ///
    /// On failure after a successful export the pin is unexported again.
    pub fn bind(name: &str, pin: PinId, pins: Arc<dyn PinInterface>) -> Result<Self> {
        let _span_ = span!(SpanLevel::DEBUG, "Actuator::bind", name, %pin).entered();
        let bind_err = |stage, source| Error::Bind {
            name: name.to_string(),
            pin,
            stage,
            source,
        };
        pins.export(pin).map_err(|e| bind_err("export", e))?;
        let line = Line {
            name: Arc::from(name),
            pin,
            pins: pins.clone(),
            level: Arc::new(LevelCell::default()),
        };
        let configured = pins
            .set_direction(pin, Direction::Out)
            .map_err(|e| bind_err("direction", e))
            .and_then(|()| line.write(Level::Low).map_err(|e| bind_err("initial write", e)));
        if let Err(e) = configured {
            if let Err(undo) = pins.unexport(pin) {
                warn!("{}: unexport after failed bind failed: {}", name, undo);
            }
            return Err(e);
        }
        info!("Bound {} to gpio {}", name, pin);
        Ok(Self {
            line,
            control: Mutex::new(Control {
                bound: true,
                blink: BlinkScheduler::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.line.name
    }

    pub fn pin(&self) -> PinId {
        self.line.pin
    }

    pub fn level(&self) -> Observed {
        self.line.level.load()
    }

    /// Current blink phase, once any operation in flight has finished.
    pub async fn blink_phase(&self) -> BlinkPhase {
        self.control.lock().await.blink.phase()
    }

    pub async fn is_blinking(&self) -> bool {
        self.control.lock().await.blink.is_running()
    }

    /// High or blinking.
    pub async fn is_active(&self) -> bool {
        self.level() == Observed::High || self.is_blinking().await
    }

    fn ensure_bound(&self, control: &Control) -> Result<()> {
        if control.bound {
            Ok(())
        } else {
            Err(Error::Unbound(self.name().to_string()))
        }
    }

    fn write_err(&self, source: io::Error) -> Error {
        Error::Write {
            name: self.name().to_string(),
            pin: self.pin(),
            source,
        }
    }

    /// Stops and joins the blink task, if any. Ok means the pin is low.
    async fn halt(&self, control: &mut Control) -> Result<()> {
        match control.blink.stop().await {
            None => Ok(()),
            Some(Ok(Ok(()))) => {
                info!("{}: stopped blinking", self.name());
                Ok(())
            }
            Some(Ok(Err(source))) => Err(self.write_err(source)),
            Some(Err(join)) => {
                warn!("{}: blink task did not finish cleanly: {}", self.name(), join);
                self.line.level.store(Observed::Unknown);
                Err(Error::BlinkTask(self.name().to_string()))
            }
        }
    }

    /// Writes `level`, stopping any blink first.
    pub async fn set(&self, level: Level) -> Result<()> {
        let mut control = self.control.lock().await;
        self.ensure_bound(&control)?;
        if let Err(e) = self.halt(&mut control).await {
            // The write below is authoritative either way.
            warn!("{}", e);
        }
        debug!("{}: set {:?}", self.name(), level);
        self.line.write_blocking(level).await.map_err(|e| self.write_err(e))
    }

    pub async fn start_blink(&self, half_period: Duration) -> Result<()> {
        let mut control = self.control.lock().await;
        self.ensure_bound(&control)?;
        if half_period.is_zero() {
            return Err(Error::InvalidHalfPeriod(self.name().to_string()));
        }
        if control.blink.is_running() {
            return Err(Error::AlreadyBlinking(self.name().to_string()));
        }
        if control.blink.has_task() {
            // A task that died on a write failure; collect it before respawning.
            if let Err(e) = self.halt(&mut control).await {
                warn!("Reaped failed blink task: {}", e);
            }
        }
        control.blink.start(self.line.clone(), half_period);
        info!("{}: blinking every {:?}", self.name(), half_period);
        Ok(())
    }

    /// No-op when not blinking. Returns once the task is gone and the pin is low.
    pub async fn stop_blink(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        self.ensure_bound(&control)?;
        self.halt(&mut control).await
    }

    /// Stops any blink and unexports the pin. Unbinding twice is a no-op.
    pub async fn unbind(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        if !control.bound {
            return Ok(());
        }
        let halted = self.halt(&mut control).await;
        let released = self.line.pins.unexport(self.pin()).map_err(|source| Error::Unexport {
            name: self.name().to_string(),
            pin: self.pin(),
            source,
        });
        if released.is_ok() {
            control.bound = false;
            info!("Unbound {} from gpio {}", self.name(), self.pin());
        }
        Error::collect(halted.err().into_iter().chain(released.err()).collect())
    }
}

impl Drop for Actuator {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        if !control.bound {
            return;
        }
        control.bound = false;
        if control.blink.release() {
            return;
        }
        match self.line.pins.unexport(self.line.pin) {
            Ok(()) => debug!("{}: released gpio {} on drop", self.line.name, self.line.pin),
            Err(e) => warn!("{}: unexport on drop failed: {}", self.line.name, e),
        }
    }
}
