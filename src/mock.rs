//! In-memory [`PinInterface`] used by the test suite and by the daemon's
//! `mock` backend when no GPIO hardware is around.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Mutex, MutexGuard};

use tracing::trace;

use crate::pin::{Direction, Level, PinId, PinInterface};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Export,
    Direction,
    Write,
    Read,
    Unexport,
}

#[derive(Debug, Default)]
struct Line {
    exported: bool,
    direction: Option<Direction>,
    level: Option<Level>,
    input: Option<Level>,
}

#[derive(Debug, Default)]
struct State {
    lines: HashMap<PinId, Line>,
    faults: HashSet<(PinId, Fault)>,
    writes: Vec<(PinId, Level)>,
    exports: Vec<PinId>,
    unexports: Vec<PinId>,
}

#[derive(Debug, Default)]
pub struct MockPins {
    state: Mutex<State>,
}

fn injected(pin: PinId, fault: Fault) -> io::Error {
    io::Error::other(format!("injected {:?} fault on gpio {}", fault, pin))
}

impl MockPins {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge every other assertion.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail(&self, pin: PinId, fault: Fault) {
        self.state().faults.insert((pin, fault));
    }

    pub fn heal(&self, pin: PinId, fault: Fault) {
        self.state().faults.remove(&(pin, fault));
    }

    /// Level presented on an input line. Defaults to high (pulled up).
    pub fn drive_input(&self, pin: PinId, level: Level) {
        self.state().lines.entry(pin).or_default().input = Some(level);
    }

    pub fn level(&self, pin: PinId) -> Option<Level> {
        self.state().lines.get(&pin).and_then(|l| l.level)
    }

    pub fn is_exported(&self, pin: PinId) -> bool {
        self.state().lines.get(&pin).map_or(false, |l| l.exported)
    }

    pub fn direction(&self, pin: PinId) -> Option<Direction> {
        self.state().lines.get(&pin).and_then(|l| l.direction)
    }

    /// Every successful write to `pin`, oldest first.
    pub fn writes(&self, pin: PinId) -> Vec<Level> {
        self.state()
            .writes
            .iter()
            .filter(|(p, _)| *p == pin)
            .map(|(_, level)| *level)
            .collect()
    }

    /// Number of level changes among the writes to `pin`, starting from low.
    pub fn transitions(&self, pin: PinId) -> usize {
        let mut current = Level::Low;
        let mut count = 0;
        for level in self.writes(pin) {
            if level != current {
                count += 1;
                current = level;
            }
        }
        count
    }

    pub fn unexport_count(&self, pin: PinId) -> usize {
        self.state().unexports.iter().filter(|p| **p == pin).count()
    }

    pub fn export_count(&self, pin: PinId) -> usize {
        self.state().exports.iter().filter(|p| **p == pin).count()
    }

    fn check(state: &State, pin: PinId, fault: Fault) -> io::Result<()> {
        if state.faults.contains(&(pin, fault)) {
            return Err(injected(pin, fault));
        }
        Ok(())
    }

    fn configured(state: &State, pin: PinId, want: Direction) -> io::Result<()> {
        match state.lines.get(&pin) {
            Some(line) if line.exported && line.direction == Some(want) => Ok(()),
            Some(line) if line.exported => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("gpio {} is not configured as {:?}", pin, want),
            )),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("gpio {} is not exported", pin),
            )),
        }
    }
}

impl PinInterface for MockPins {
    fn export(&self, pin: PinId) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&state, pin, Fault::Export)?;
        state.lines.entry(pin).or_default().exported = true;
        state.exports.push(pin);
        Ok(())
    }

    fn set_direction(&self, pin: PinId, direction: Direction) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&state, pin, Fault::Direction)?;
        match state.lines.get_mut(&pin) {
            Some(line) if line.exported => {
                line.direction = Some(direction);
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("gpio {} is not exported", pin),
            )),
        }
    }

    fn write_level(&self, pin: PinId, level: Level) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&state, pin, Fault::Write)?;
        Self::configured(&state, pin, Direction::Out)?;
        trace!("mock gpio {} <- {:?}", pin, level);
        if let Some(line) = state.lines.get_mut(&pin) {
            line.level = Some(level);
        }
        state.writes.push((pin, level));
        Ok(())
    }

    fn read_level(&self, pin: PinId) -> io::Result<Level> {
        let state = self.state();
        Self::check(&state, pin, Fault::Read)?;
        Self::configured(&state, pin, Direction::In)?;
        Ok(state
            .lines
            .get(&pin)
            .and_then(|l| l.input)
            .unwrap_or(Level::High))
    }

    fn unexport(&self, pin: PinId) -> io::Result<()> {
        let mut state = self.state();
        Self::check(&state, pin, Fault::Unexport)?;
        if let Some(line) = state.lines.get_mut(&pin) {
            line.exported = false;
            line.direction = None;
        }
        state.unexports.push(pin);
        Ok(())
    }
}
