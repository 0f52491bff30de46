//! Background toggling of a single output line.
//!
//! The scheduler owns at most one task. Cancellation goes over a oneshot
//! channel rather than a shared flag, and the stopper joins the task, so a
//! returned `stop` means the task has parked the line low and exited.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::actuator::Line;
use crate::pin::Level;

pub const DEFAULT_HALF_PERIOD: Duration = Duration::from_millis(250);

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlinkPhase {
    Idle,
    Running,
    Stopping,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    /// Drive low and leave the pin exported.
    Park,
    /// Drive low, then unexport. Used when the owning actuator is dropped.
    Release,
}

struct BlinkTask {
    cancel: oneshot::Sender<StopMode>,
    handle: JoinHandle<io::Result<()>>,
}

pub(crate) struct BlinkScheduler {
    phase: Arc<AtomicU8>,
    task: Option<BlinkTask>,
}

impl BlinkScheduler {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(AtomicU8::new(IDLE)),
            task: None,
        }
    }

    pub fn phase(&self) -> BlinkPhase {
        match self.phase.load(Ordering::Acquire) {
            RUNNING => BlinkPhase::Running,
            STOPPING => BlinkPhase::Stopping,
            _ => BlinkPhase::Idle,
        }
    }

    pub fn has_task(&self) -> bool {
        self.task.is_some()
    }

    /// True while a task exists and is still toggling.
    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map_or(false, |t| !t.handle.is_finished())
    }

    /// Spawns the toggling task. The caller has already reaped any previous one.
    pub fn start(&mut self, line: Line, half_period: Duration) {
        debug_assert!(self.task.is_none());
        let (cancel, cancelled) = oneshot::channel();
        self.phase.store(RUNNING, Ordering::Release);
        let phase = self.phase.clone();
        let handle = tokio::spawn(run(line, half_period, cancelled, phase));
        self.task = Some(BlinkTask { cancel, handle });
    }

    /// Cancels the task and waits for it to finish. `None` when idle.
    ///
    /// The inner `io::Result` is the outcome of the task's final low write.
    pub async fn stop(&mut self) -> Option<Result<io::Result<()>, JoinError>> {
        let task = self.task.take()?;
        self.phase.store(STOPPING, Ordering::Release);
        // Fails only if the task already gave up on its own.
        let _ = task.cancel.send(StopMode::Park);
        let joined = task.handle.await;
        self.phase.store(IDLE, Ordering::Release);
        Some(joined)
    }

    /// Hands the pin over to the running task for a final park-and-unexport.
    /// Returns false when there is no live task to take it.
    pub fn release(&mut self) -> bool {
        match self.task.take() {
            Some(task) => task.cancel.send(StopMode::Release).is_ok(),
            None => false,
        }
    }
}

async fn run(
    line: Line,
    half_period: Duration,
    mut cancelled: oneshot::Receiver<StopMode>,
    phase: Arc<AtomicU8>,
) -> io::Result<()> {
    debug!("{}: blink task started, half period {:?}", line.name, half_period);
    let mut next = Level::High;
    let mode = loop {
        if let Err(e) = line.write_blocking(next).await {
            error!("{}: blink write failed on gpio {}: {}", line.name, line.pin, e);
            // No sender may hand us the pin after this point; pick up a
            // release that raced with the failure.
            cancelled.close();
            break cancelled.try_recv().unwrap_or(StopMode::Park);
        }
        tokio::select! {
            mode = &mut cancelled => break mode.unwrap_or(StopMode::Park),
            _ = sleep(half_period) => {}
        }
        next = next.toggled();
    };
    phase.store(STOPPING, Ordering::Release);

    let parked = line.write_blocking(Level::Low).await;
    if let Err(e) = &parked {
        warn!("{}: could not park gpio {} low: {}", line.name, line.pin, e);
    }
    if mode == StopMode::Release {
        let pins = line.pins.clone();
        let pin = line.pin;
        let released = tokio::task::spawn_blocking(move || pins.unexport(pin))
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)));
        match released {
            Ok(()) => debug!("{}: released gpio {}", line.name, line.pin),
            Err(e) => warn!("{}: unexport of gpio {} failed: {}", line.name, line.pin, e),
        }
    }
    debug!("{}: blink task exiting", line.name);
    parked
}
