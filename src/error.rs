use std::io;

use thiserror::Error;

use crate::pin::PinId;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by actuators, the group and the sensor.
///
/// Every variant raised for a specific line carries the logical name and the
/// pin, so a failure inside a group operation stays attributable.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{name} (gpio {pin}): bind failed during {stage}: {source}")]
    Bind {
        name: String,
        pin: PinId,
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{name} (gpio {pin}): level write failed: {source}")]
    Write {
        name: String,
        pin: PinId,
        #[source]
        source: io::Error,
    },

    #[error("{name} (gpio {pin}): read failed: {source}")]
    Read {
        name: String,
        pin: PinId,
        #[source]
        source: io::Error,
    },

    #[error("{name} (gpio {pin}): unexport failed: {source}")]
    Unexport {
        name: String,
        pin: PinId,
        #[source]
        source: io::Error,
    },

    #[error("{0} is already blinking")]
    AlreadyBlinking(String),

    #[error("{0} has been unbound")]
    Unbound(String),

    #[error("no actuator named {0}")]
    NotFound(String),

    #[error("an actuator named {0} is already registered")]
    AlreadyRegistered(String),

    #[error("gpio {pin} is already owned by {owner}")]
    PinInUse { pin: PinId, owner: String },

    #[error("{0}: blink half-period must be non-zero")]
    InvalidHalfPeriod(String),

    #[error("no default actuator: {0} registered, expected exactly one")]
    NoDefaultActuator(usize),

    #[error("{0}: blink task panicked")]
    BlinkTask(String),

    #[error("{} operation(s) failed: {}", .0.len(), join(.0))]
    Aggregate(Vec<Error>),
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Short machine-readable name, used on the control socket.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Write { .. } => "write",
            Self::Read { .. } => "read",
            Self::Unexport { .. } => "unexport",
            Self::AlreadyBlinking(_) => "already_blinking",
            Self::Unbound(_) => "unbound",
            Self::NotFound(_) => "not_found",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::PinInUse { .. } => "pin_in_use",
            Self::InvalidHalfPeriod(_) => "invalid_half_period",
            Self::NoDefaultActuator(_) => "no_default_actuator",
            Self::BlinkTask(_) => "blink_task",
            Self::Aggregate(_) => "aggregate",
        }
    }

    /// Folds collected best-effort failures into a single result.
    pub(crate) fn collect(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate(errors)),
        }
    }
}
