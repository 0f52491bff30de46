use std::io::{self, Read};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::pin::{Direction, Level, PinId, PinInterface};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ButtonState {
    Pressed,
    Released,
}

impl ButtonState {
    /// `"1\n"` when pressed, `"0\n"` otherwise.
    pub fn status_line(self) -> &'static str {
        match self {
            ButtonState::Pressed => "1\n",
            ButtonState::Released => "0\n",
        }
    }
}

/// A push-button on an input pin. Every read polls the hardware.
pub struct Sensor {
    name: String,
    pin: PinId,
    pins: Arc<dyn PinInterface>,
    active_low: bool,
    bound: bool,
}

impl Sensor {
    pub fn bind(
        name: &str,
        pin: PinId,
        active_low: bool,
        pins: Arc<dyn PinInterface>,
    ) -> Result<Self> {
        let bind_err = |stage, source| Error::Bind {
            name: name.to_string(),
            pin,
            stage,
            source,
        };
        pins.export(pin).map_err(|e| bind_err("export", e))?;
        if let Err(e) = pins.set_direction(pin, Direction::In) {
            if let Err(undo) = pins.unexport(pin) {
                warn!("{}: unexport after failed bind failed: {}", name, undo);
            }
            return Err(bind_err("direction", e));
        }
        info!("Bound sensor {} to gpio {}", name, pin);
        Ok(Self {
            name: name.to_string(),
            pin,
            pins,
            active_low,
            bound: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    pub fn read(&self) -> Result<ButtonState> {
        if !self.bound {
            return Err(Error::Unbound(self.name.clone()));
        }
        let raw = self.pins.read_level(self.pin).map_err(|source| Error::Read {
            name: self.name.clone(),
            pin: self.pin,
            source,
        })?;
        let pressed = (raw == Level::Low) == self.active_low;
        Ok(if pressed {
            ButtonState::Pressed
        } else {
            ButtonState::Released
        })
    }

    /// A read handle with character-device semantics: one status line, then EOF.
    pub fn open_status(&self) -> StatusFile<'_> {
        StatusFile {
            sensor: self,
            line: None,
            offset: 0,
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.bound {
            return Ok(());
        }
        self.pins.unexport(self.pin).map_err(|source| Error::Unexport {
            name: self.name.clone(),
            pin: self.pin,
            source,
        })?;
        self.bound = false;
        info!("Closed sensor {}", self.name);
        Ok(())
    }
}

impl Drop for Sensor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}", e);
        }
    }
}

pub struct StatusFile<'a> {
    sensor: &'a Sensor,
    line: Option<&'static str>,
    offset: usize,
}

impl Read for StatusFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let line = match self.line {
            Some(line) => line,
            None => {
                let state = self.sensor.read().map_err(io::Error::other)?;
                *self.line.insert(state.status_line())
            }
        };
        let rest = &line.as_bytes()[self.offset..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.offset += n;
        Ok(n)
    }
}
