//! GPIO actuator and sensor core: LEDs with exclusive selection and a
//! cancellable blink task, plus a polled push-button.
pub mod actuator;
pub mod blink;
pub mod config;
pub mod control;
pub mod error;
pub mod group;
pub mod mock;
pub mod pin;
pub mod sensor;
pub mod server;

pub use actuator::{Actuator, Observed};
pub use blink::{BlinkPhase, DEFAULT_HALF_PERIOD};
pub use error::{Error, Result};
pub use group::{ActuatorGroup, ActuatorStatus, Mode};
pub use pin::{Direction, Level, PinId, PinInterface, SysfsPins};
pub use sensor::{ButtonState, Sensor};
