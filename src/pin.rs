use std::fmt;
use std::io;
use std::num::ParseIntError;
use std::str::FromStr;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// A GPIO line number, as understood by the kernel's sysfs interface.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PinId(pub u64);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PinId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(PinId)
    }
}

impl From<u64> for PinId {
    fn from(n: u64) -> Self {
        PinId(n)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn value(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }

    pub fn from_value(value: u8) -> Self {
        if value == 0 {
            Level::Low
        } else {
            Level::High
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Raw pin access. Implementations must be reentrant for different pins;
/// a single pin is only ever driven by the one actuator or sensor owning it.
pub trait PinInterface: Send + Sync {
    fn export(&self, pin: PinId) -> io::Result<()>;
    fn set_direction(&self, pin: PinId, direction: Direction) -> io::Result<()>;
    fn write_level(&self, pin: PinId, level: Level) -> io::Result<()>;
    fn read_level(&self, pin: PinId) -> io::Result<Level>;
    fn unexport(&self, pin: PinId) -> io::Result<()>;
}

/// `/sys/class/gpio` backend.
///
/// Every call is blocking file I/O, and a fresh export sleeps for `settle`.
/// Async callers go through `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct SysfsPins {
    settle: Duration,
}

impl SysfsPins {
    /// `settle` is how long to wait after exporting before touching the
    /// freshly created attribute files; udev needs a moment to chown them.
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }
}

impl Default for SysfsPins {
    fn default() -> Self {
        Self::new(Duration::from_millis(90))
    }
}

fn sysfs_err(e: sysfs_gpio::Error) -> io::Error {
    match e {
        sysfs_gpio::Error::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

impl PinInterface for SysfsPins {
    fn export(&self, pin: PinId) -> io::Result<()> {
        let line = sysfs_gpio::Pin::new(pin.0);
        // Exporting twice is fine, sysfs_gpio checks for the gpioN directory.
        let fresh = !line.is_exported();
        line.export().map_err(sysfs_err)?;
        if fresh && !self.settle.is_zero() {
            sleep(self.settle);
        }
        debug!("Exported gpio {}", pin);
        Ok(())
    }

    fn set_direction(&self, pin: PinId, direction: Direction) -> io::Result<()> {
        let direction = match direction {
            Direction::In => sysfs_gpio::Direction::In,
            Direction::Out => sysfs_gpio::Direction::Out,
        };
        sysfs_gpio::Pin::new(pin.0)
            .set_direction(direction)
            .map_err(sysfs_err)
    }

    fn write_level(&self, pin: PinId, level: Level) -> io::Result<()> {
        trace!("gpio {} <- {:?}", pin, level);
        sysfs_gpio::Pin::new(pin.0)
            .set_value(level.value())
            .map_err(sysfs_err)
    }

    fn read_level(&self, pin: PinId) -> io::Result<Level> {
        sysfs_gpio::Pin::new(pin.0)
            .get_value()
            .map(Level::from_value)
            .map_err(sysfs_err)
    }

    fn unexport(&self, pin: PinId) -> io::Result<()> {
        sysfs_gpio::Pin::new(pin.0).unexport().map_err(sysfs_err)?;
        debug!("Unexported gpio {}", pin);
        Ok(())
    }
}
