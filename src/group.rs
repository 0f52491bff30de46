use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, span, warn, Instrument, Level as SpanLevel};

use crate::actuator::{Actuator, Observed};
use crate::error::{Error, Result};
use crate::pin::{Level, PinId, PinInterface};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    On,
    Blink(Duration),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActuatorStatus {
    pub name: String,
    pub pin: PinId,
    pub level: Observed,
    pub blinking: bool,
}

/// Named actuators in registration order, at most one of them active.
///
/// A pin belongs to at most one actuator, and never to a pin reserved for
/// another owner such as the button.
pub struct ActuatorGroup {
    pins: Arc<dyn PinInterface>,
    actuators: Vec<Actuator>,
    reserved: Vec<(PinId, String)>,
}

impl ActuatorGroup {
    pub fn new(pins: Arc<dyn PinInterface>) -> Self {
        Self {
            pins,
            actuators: Vec::new(),
            reserved: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.actuators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }

    pub fn get(&self, name: &str) -> Result<&Actuator> {
        self.actuators
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Looks up `name`, or the only registered actuator when no name is given.
    pub fn resolve(&self, name: Option<&str>) -> Result<&Actuator> {
        match name {
            Some(name) => self.get(name),
            None if self.actuators.len() == 1 => Ok(&self.actuators[0]),
            None => Err(Error::NoDefaultActuator(self.actuators.len())),
        }
    }

    fn owner_of(&self, pin: PinId) -> Option<&str> {
        self.actuators
            .iter()
            .find(|a| a.pin() == pin)
            .map(Actuator::name)
            .or_else(|| {
                self.reserved
                    .iter()
                    .find(|(reserved, _)| *reserved == pin)
                    .map(|(_, owner)| owner.as_str())
            })
    }

    /// Keeps `pin` away from actuators; `owner` is named in the refusal.
    pub fn reserve(&mut self, pin: PinId, owner: &str) -> Result<()> {
        if let Some(current) = self.owner_of(pin) {
            return Err(Error::PinInUse {
                pin,
                owner: current.to_string(),
            });
        }
        self.reserved.push((pin, owner.to_string()));
        Ok(())
    }

    fn check_free(&self, name: &str, pin: PinId) -> Result<()> {
        if self.get(name).is_ok() {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }
        match self.owner_of(pin) {
            Some(owner) => Err(Error::PinInUse {
                pin,
                owner: owner.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Binds on the calling thread; `register_all` is the non-blocking form.
    pub fn register(&mut self, name: &str, pin: PinId) -> Result<()> {
        self.check_free(name, pin)?;
        let actuator = Actuator::bind(name, pin, self.pins.clone())?;
        self.actuators.push(actuator);
        Ok(())
    }

    async fn register_off_thread(&mut self, name: &str, pin: PinId) -> Result<()> {
        self.check_free(name, pin)?;
        let pins = self.pins.clone();
        let owned = name.to_string();
        let actuator = tokio::task::spawn_blocking(move || Actuator::bind(&owned, pin, pins))
            .await
            .unwrap_or_else(|e| {
                Err(Error::Bind {
                    name: name.to_string(),
                    pin,
                    stage: "export",
                    source: io::Error::other(e),
                })
            })?;
        self.actuators.push(actuator);
        Ok(())
    }

    /// Registers every entry or none: on the first failure the actuators
    /// added by this call are unbound again. Exports run on the blocking pool.
    pub async fn register_all(&mut self, entries: &[(String, PinId)]) -> Result<()> {
        let before = self.actuators.len();
        for (name, pin) in entries {
            if let Err(e) = self.register_off_thread(name, *pin).await {
                warn!("Registering {} failed, rolling back: {}", name, e);
                for added in self.actuators.drain(before..) {
                    if let Err(undo) = added.unbind().await {
                        warn!("Rollback of {} failed: {}", added.name(), undo);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drives every actuator except `name` low, in registration order, then
    /// applies `mode` to `name`. The target is left untouched if any of the
    /// others could not be switched off.
    pub async fn activate(&self, name: &str, mode: Mode) -> Result<()> {
        let span = span!(SpanLevel::DEBUG, "ActuatorGroup::activate", name, ?mode);
        self.switch_to(name, mode).instrument(span).await
    }

    async fn switch_to(&self, name: &str, mode: Mode) -> Result<()> {
        let target = self.get(name)?;
        if mode == Mode::Blink(Duration::ZERO) {
            return Err(Error::InvalidHalfPeriod(name.to_string()));
        }
        let mut failures = Vec::new();
        for other in self.actuators.iter().filter(|a| a.name() != name) {
            if let Err(e) = other.set(Level::Low).await {
                failures.push(e);
            }
        }
        if !failures.is_empty() {
            warn!("Not activating {}: {} actuator(s) failed to switch off", name, failures.len());
            return Error::collect(failures);
        }
        match mode {
            Mode::On => target.set(Level::High).await?,
            Mode::Blink(half_period) => target.start_blink(half_period).await?,
        }
        debug!("Activated {} ({:?})", name, mode);
        Ok(())
    }

    pub async fn deactivate(&self, name: &str) -> Result<()> {
        self.get(name)?.set(Level::Low).await
    }

    pub async fn stop_blink(&self, name: &str) -> Result<()> {
        self.get(name)?.stop_blink().await
    }

    /// Best effort: every actuator is tried, all failures are reported.
    pub async fn deactivate_all(&self) -> Result<()> {
        let mut failures = Vec::new();
        for actuator in &self.actuators {
            if let Err(e) = actuator.set(Level::Low).await {
                failures.push(e);
            }
        }
        Error::collect(failures)
    }

    /// Unbinds every actuator exactly once and empties the group.
    pub async fn close_all(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for actuator in self.actuators.drain(..) {
            if let Err(e) = actuator.unbind().await {
                failures.push(e);
            }
        }
        info!("Closed actuator group ({} failure(s))", failures.len());
        Error::collect(failures)
    }

    pub async fn status(&self) -> Vec<ActuatorStatus> {
        let mut status = Vec::with_capacity(self.actuators.len());
        for actuator in &self.actuators {
            status.push(ActuatorStatus {
                name: actuator.name().to_string(),
                pin: actuator.pin(),
                level: actuator.level(),
                blinking: actuator.is_blinking().await,
            });
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blink::DEFAULT_HALF_PERIOD;
    use crate::mock::{Fault, MockPins};
    use tokio::time::sleep;

    const RED: PinId = PinId(16);
    const YELLOW: PinId = PinId(20);
    const GREEN: PinId = PinId(21);

    fn traffic_light(pins: &Arc<MockPins>) -> ActuatorGroup {
        let mut group = ActuatorGroup::new(pins.clone());
        group.register("red", RED).unwrap();
        group.register("yellow", YELLOW).unwrap();
        group.register("green", GREEN).unwrap();
        group
    }

    #[tokio::test]
    async fn activate_switches_others_off() {
        let pins = Arc::new(MockPins::new());
        let group = traffic_light(&pins);
        group.activate("red", Mode::On).await.unwrap();
        group.activate("yellow", Mode::On).await.unwrap();
        assert_eq!(pins.level(RED), Some(Level::Low));
        assert_eq!(pins.level(YELLOW), Some(Level::High));
        assert_eq!(pins.level(GREEN), Some(Level::Low));
        // red was switched off before yellow came on
        assert_eq!(pins.writes(RED), vec![Level::Low, Level::High, Level::Low]);
        assert!(group.get("yellow").unwrap().is_active().await);
        assert!(!group.get("red").unwrap().is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn activate_stops_blinking_neighbour() {
        let pins = Arc::new(MockPins::new());
        let group = traffic_light(&pins);
        group.activate("green", Mode::Blink(DEFAULT_HALF_PERIOD)).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        group.activate("red", Mode::On).await.unwrap();
        let status = group.status().await;
        assert!(status.iter().all(|s| !s.blinking));
        assert_eq!(status[0].level, Observed::High);
        assert_eq!(status[2].level, Observed::Low);
    }

    #[tokio::test(start_paused = true)]
    async fn blink_scenario_transition_count() {
        let pins = Arc::new(MockPins::new());
        let mut group = ActuatorGroup::new(pins.clone());
        group.register("led", "17".parse().unwrap()).unwrap();
        group
            .activate("led", Mode::Blink(Duration::from_millis(250)))
            .await
            .unwrap();
        sleep(Duration::from_millis(1100)).await;
        group.stop_blink("led").await.unwrap();
        let led = group.get("led").unwrap();
        assert_eq!(led.level(), Observed::Low);
        let transitions = pins.transitions(PinId(17));
        assert!((4..=6).contains(&transitions), "transitions: {}", transitions);
    }

    #[tokio::test]
    async fn failed_register_leaves_group_unchanged() {
        let pins = Arc::new(MockPins::new());
        let mut group = traffic_light(&pins);
        pins.fail(PinId(5), Fault::Export);
        let err = group.register("blue", PinId(5)).unwrap_err();
        assert!(matches!(err, Error::Bind { stage: "export", .. }));
        assert_eq!(group.len(), 3);
        assert!(matches!(group.get("blue"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let pins = Arc::new(MockPins::new());
        let mut group = traffic_light(&pins);
        let err = group.register("red", PinId(4)).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(ref n) if n == "red"));
        assert!(!pins.is_exported(PinId(4)));
    }

    #[tokio::test]
    async fn duplicate_pin_is_rejected_before_export() {
        let pins = Arc::new(MockPins::new());
        let mut group = traffic_light(&pins);
        let err = group.register("amber", YELLOW).unwrap_err();
        assert!(matches!(err, Error::PinInUse { pin: YELLOW, ref owner } if owner == "yellow"));
        assert_eq!(pins.export_count(YELLOW), 1);
        assert_eq!(group.len(), 3);

        group.activate("yellow", Mode::On).await.unwrap();
        group.close_all().await.unwrap();
        assert_eq!(pins.unexport_count(YELLOW), 1);
    }

    #[tokio::test]
    async fn reserved_pin_is_refused() {
        let pins = Arc::new(MockPins::new());
        let mut group = ActuatorGroup::new(pins.clone());
        group.reserve(PinId(18), "button").unwrap();
        let entries = vec![("red".to_string(), RED), ("fake".to_string(), PinId(18))];
        let err = group.register_all(&entries).await.unwrap_err();
        assert!(matches!(err, Error::PinInUse { ref owner, .. } if owner == "button"));
        assert!(group.is_empty());
        assert_eq!(pins.export_count(PinId(18)), 0);
        assert!(!pins.is_exported(RED));

        group.register("red", RED).unwrap();
        assert!(matches!(group.reserve(RED, "button"), Err(Error::PinInUse { .. })));
    }

    #[tokio::test]
    async fn duplicate_pin_within_one_call_rolls_back() {
        let pins = Arc::new(MockPins::new());
        let mut group = ActuatorGroup::new(pins.clone());
        let entries = vec![("a".to_string(), PinId(17)), ("b".to_string(), PinId(17))];
        let err = group.register_all(&entries).await.unwrap_err();
        assert!(matches!(err, Error::PinInUse { ref owner, .. } if owner == "a"));
        assert!(group.is_empty());
        assert!(!pins.is_exported(PinId(17)));
        assert_eq!(pins.export_count(PinId(17)), 1);
    }

    #[tokio::test]
    async fn deactivate_drives_only_that_actuator_low() {
        let pins = Arc::new(MockPins::new());
        let group = traffic_light(&pins);
        group.activate("green", Mode::On).await.unwrap();
        group.deactivate("green").await.unwrap();
        assert_eq!(pins.level(GREEN), Some(Level::Low));
        assert_eq!(pins.writes(RED), vec![Level::Low, Level::Low]);
        assert!(matches!(group.deactivate("blue").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn register_all_rolls_back() {
        let pins = Arc::new(MockPins::new());
        let mut group = ActuatorGroup::new(pins.clone());
        pins.fail(GREEN, Fault::Export);
        let entries = vec![
            ("red".to_string(), RED),
            ("yellow".to_string(), YELLOW),
            ("green".to_string(), GREEN),
        ];
        assert!(group.register_all(&entries).await.is_err());
        assert!(group.is_empty());
        assert!(!pins.is_exported(RED));
        assert!(!pins.is_exported(YELLOW));
    }

    #[tokio::test]
    async fn zero_half_period_leaves_others_alone() {
        let pins = Arc::new(MockPins::new());
        let group = traffic_light(&pins);
        group.activate("red", Mode::On).await.unwrap();
        let err = group.activate("green", Mode::Blink(Duration::ZERO)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidHalfPeriod(ref n) if n == "green"));
        assert_eq!(pins.level(RED), Some(Level::High));
        assert!(!group.get("green").unwrap().is_blinking().await);
    }

    #[tokio::test]
    async fn unknown_name() {
        let pins = Arc::new(MockPins::new());
        let group = traffic_light(&pins);
        assert!(matches!(
            group.activate("blue", Mode::On).await,
            Err(Error::NotFound(ref n)) if n == "blue"
        ));
        assert_eq!(pins.writes(RED), vec![Level::Low]);
    }

    #[tokio::test]
    async fn failed_switch_off_blocks_activation() {
        let pins = Arc::new(MockPins::new());
        let group = traffic_light(&pins);
        group.activate("red", Mode::On).await.unwrap();
        pins.fail(RED, Fault::Write);
        let err = group.activate("green", Mode::On).await.unwrap_err();
        assert!(matches!(err, Error::Write { ref name, .. } if name == "red"));
        assert_eq!(pins.level(GREEN), Some(Level::Low));
        assert_eq!(group.get("red").unwrap().level(), Observed::Unknown);
    }

    #[tokio::test]
    async fn resolve_default_actuator() {
        let pins = Arc::new(MockPins::new());
        let mut group = ActuatorGroup::new(pins.clone());
        assert!(matches!(group.resolve(None), Err(Error::NoDefaultActuator(0))));
        group.register("led", PinId(17)).unwrap();
        assert_eq!(group.resolve(None).unwrap().name(), "led");
        group.register("aux", PinId(18)).unwrap();
        assert!(matches!(group.resolve(None), Err(Error::NoDefaultActuator(2))));
    }

    #[tokio::test]
    async fn deactivate_all_reports_every_failure() {
        let pins = Arc::new(MockPins::new());
        let group = traffic_light(&pins);
        group.activate("yellow", Mode::On).await.unwrap();
        pins.fail(RED, Fault::Write);
        pins.fail(GREEN, Fault::Write);
        match group.deactivate_all().await {
            Err(Error::Aggregate(errors)) => {
                let names: Vec<_> = errors
                    .iter()
                    .map(|e| match e {
                        Error::Write { name, .. } => name.as_str(),
                        _ => "?",
                    })
                    .collect();
                assert_eq!(names, vec!["red", "green"]);
            }
            other => panic!("expected aggregate, got {:?}", other),
        }
        assert_eq!(pins.level(YELLOW), Some(Level::Low));
    }

    #[tokio::test]
    async fn close_all_unexports_each_pin_once() {
        let pins = Arc::new(MockPins::new());
        let mut group = traffic_light(&pins);
        pins.fail(YELLOW, Fault::Unexport);
        let err = group.close_all().await.unwrap_err();
        assert!(matches!(err, Error::Unexport { ref name, .. } if name == "yellow"));
        assert!(group.is_empty());
        assert_eq!(pins.unexport_count(RED), 1);
        assert_eq!(pins.unexport_count(GREEN), 1);
        assert!(!pins.is_exported(RED));
        assert!(!pins.is_exported(GREEN));
    }
}
