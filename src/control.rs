use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, span, warn, Instrument, Level};

use crate::config::{ActuatorConfig, Config};
use crate::error::Error;
use crate::group::{ActuatorGroup, ActuatorStatus, Mode};
use crate::pin::PinInterface;
use crate::sensor::{ButtonState, Sensor};

const MIN_POLL: Duration = Duration::from_millis(1);

/// Requests accepted on the control socket. `led` may be omitted when
/// exactly one actuator is registered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum HardwareRequest {
    Init { actuators: Vec<ActuatorConfig> },
    On { led: Option<String> },
    Off { led: Option<String> },
    AllOff,
    StartBlink { led: Option<String>, half_period_ms: Option<u64> },
    StopBlink { led: Option<String> },
    Close,
    ReadStatus,
    Status,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum HardwareResponse {
    Ok,
    /// `"1\n"` pressed, `"0\n"` released; polled fresh for every request.
    ButtonStatus(String),
    Actuators(Vec<ActuatorStatus>),
    Error { kind: String, message: String },
}

impl HardwareResponse {
    fn from_result(result: crate::Result<()>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(e) => Self::from_error(&e),
        }
    }

    fn from_error(e: &Error) -> Self {
        warn!("Request failed: {}", e);
        Self::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ControlRequest {
    pub body: HardwareRequest,
    tx: oneshot::Sender<HardwareResponse>,
}

impl ControlRequest {
    pub fn from_hardware_request(
        body: HardwareRequest,
    ) -> (oneshot::Receiver<HardwareResponse>, Self) {
        let (tx, rx) = oneshot::channel();
        (rx, Self { body, tx })
    }
}

/// Owns the actuator group and the sensor; every command goes through here
/// one at a time.
pub struct Controller {
    group: ActuatorGroup,
    sensor: Option<Sensor>,
    half_period: Duration,
    last_button: Option<ButtonState>,
}

impl Controller {
    pub fn new(pins: Arc<dyn PinInterface>, half_period: Duration) -> Self {
        Self {
            group: ActuatorGroup::new(pins),
            sensor: None,
            half_period,
            last_button: None,
        }
    }

    /// Binds the configured sensor and registers the configured actuators.
    /// The sensor pin is reserved, so no actuator can take it over.
    pub async fn from_config(config: &Config, pins: Arc<dyn PinInterface>) -> crate::Result<Self> {
        let mut controller = Self::new(pins.clone(), config.half_period());
        if let Some(sensor) = &config.sensor {
            let (name, pin, active_low) = (sensor.name.clone(), sensor.pin, sensor.active_low);
            let bound = tokio::task::spawn_blocking(move || Sensor::bind(&name, pin, active_low, pins))
                .await
                .unwrap_or_else(|e| {
                    Err(Error::Bind {
                        name: sensor.name.clone(),
                        pin,
                        stage: "export",
                        source: std::io::Error::other(e),
                    })
                })?;
            controller.group.reserve(bound.pin(), bound.name())?;
            controller.sensor = Some(bound);
        }
        controller.group.register_all(&config.actuator_entries()).await?;
        Ok(controller)
    }

    pub fn group(&self) -> &ActuatorGroup {
        &self.group
    }

    pub async fn respond(&mut self, req: HardwareRequest) -> HardwareResponse {
        let span = span!(Level::DEBUG, "Controller::respond", req = ?req);
        self.dispatch(req).instrument(span).await
    }

    async fn dispatch(&mut self, req: HardwareRequest) -> HardwareResponse {
        debug!("Handling request");
        match req {
            HardwareRequest::Init { actuators } => {
                let entries: Vec<_> = actuators.into_iter().map(|a| (a.name, a.pin)).collect();
                HardwareResponse::from_result(self.group.register_all(&entries).await)
            }
            HardwareRequest::On { led } => {
                let result = match self.group.resolve(led.as_deref()) {
                    Ok(actuator) => {
                        let name = actuator.name().to_string();
                        self.group.activate(&name, Mode::On).await
                    }
                    Err(e) => Err(e),
                };
                HardwareResponse::from_result(result)
            }
            HardwareRequest::Off { led } => {
                let result = match self.group.resolve(led.as_deref()) {
                    Ok(actuator) => {
                        let name = actuator.name().to_string();
                        self.group.deactivate(&name).await
                    }
                    Err(e) => Err(e),
                };
                HardwareResponse::from_result(result)
            }
            HardwareRequest::AllOff => HardwareResponse::from_result(self.group.deactivate_all().await),
            HardwareRequest::StartBlink { led, half_period_ms } => {
                let half_period = half_period_ms.map_or(self.half_period, Duration::from_millis);
                let result = match self.group.resolve(led.as_deref()) {
                    Ok(actuator) => {
                        let name = actuator.name().to_string();
                        self.group.activate(&name, Mode::Blink(half_period)).await
                    }
                    Err(e) => Err(e),
                };
                HardwareResponse::from_result(result)
            }
            HardwareRequest::StopBlink { led } => {
                let result = match self.group.resolve(led.as_deref()) {
                    Ok(actuator) => actuator.stop_blink().await,
                    Err(e) => Err(e),
                };
                HardwareResponse::from_result(result)
            }
            HardwareRequest::Close => HardwareResponse::from_result(self.group.close_all().await),
            HardwareRequest::ReadStatus => match &self.sensor {
                Some(sensor) => match sensor.read() {
                    Ok(state) => HardwareResponse::ButtonStatus(state.status_line().to_string()),
                    Err(e) => HardwareResponse::from_error(&e),
                },
                None => HardwareResponse::Error {
                    kind: "no_sensor".to_string(),
                    message: "no sensor configured".to_string(),
                },
            },
            HardwareRequest::Status => HardwareResponse::Actuators(self.group.status().await),
        }
    }

    /// Reads the sensor once and logs press/release edges.
    pub fn poll_sensor(&mut self) {
        let Some(sensor) = &self.sensor else {
            return;
        };
        match sensor.read() {
            Ok(state) => {
                if self.last_button != Some(state) {
                    if self.last_button.is_some() {
                        info!("{} {:?}", sensor.name(), state);
                    }
                    self.last_button = Some(state);
                }
            }
            Err(e) => warn!("Sensor poll failed: {}", e),
        }
    }

    /// Switches everything off and releases every pin.
    pub async fn shutdown(&mut self) -> crate::Result<()> {
        info!("Shutting down controller");
        let mut failures = Vec::new();
        if let Err(e) = self.group.close_all().await {
            failures.push(e);
        }
        if let Some(sensor) = self.sensor.as_mut() {
            if let Err(e) = sensor.close() {
                failures.push(e);
            }
        }
        Error::collect(failures)
    }

    /// Runs until `shutdown` resolves or every request sender is gone, then
    /// releases the hardware.
    pub async fn serve(
        mut self,
        mut requests: mpsc::Receiver<ControlRequest>,
        poll: Duration,
        shutdown: impl Future<Output = ()>,
    ) -> crate::Result<()> {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(poll.max(MIN_POLL));
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    self.poll_sensor();
                }
                req = requests.recv() => {
                    let Some(req) = req else {
                        debug!("All request senders dropped");
                        break;
                    };
                    let response = self.respond(req.body).await;
                    if req.tx.send(response).is_err() {
                        error!("Requester went away before the response was ready");
                    }
                }
            }
        }
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPins;
    use crate::pin::{Direction, Level as PinLevel, PinId};

    fn light(name: &str, pin: u64) -> ActuatorConfig {
        ActuatorConfig {
            name: name.to_string(),
            pin: PinId(pin),
        }
    }

    #[tokio::test]
    async fn single_actuator_needs_no_name() {
        let pins = Arc::new(MockPins::new());
        let mut controller = Controller::new(pins.clone(), Duration::from_millis(250));
        let init = HardwareRequest::Init {
            actuators: vec![light("led", 17)],
        };
        assert_eq!(controller.respond(init).await, HardwareResponse::Ok);
        assert_eq!(
            controller.respond(HardwareRequest::On { led: None }).await,
            HardwareResponse::Ok
        );
        assert_eq!(pins.level(PinId(17)), Some(PinLevel::High));
        assert_eq!(
            controller.respond(HardwareRequest::Off { led: None }).await,
            HardwareResponse::Ok
        );
        assert_eq!(pins.level(PinId(17)), Some(PinLevel::Low));
    }

    #[tokio::test]
    async fn errors_carry_kind() {
        let pins = Arc::new(MockPins::new());
        let mut controller = Controller::new(pins, Duration::from_millis(250));
        let response = controller
            .respond(HardwareRequest::On {
                led: Some("red".to_string()),
            })
            .await;
        assert!(matches!(response, HardwareResponse::Error { ref kind, .. } if kind == "not_found"));
        let response = controller.respond(HardwareRequest::ReadStatus).await;
        assert!(matches!(response, HardwareResponse::Error { ref kind, .. } if kind == "no_sensor"));
    }

    async fn with_button() -> (Arc<MockPins>, Controller) {
        let config = Config::from_toml(
            r#"
            [gpio]
            backend = "mock"

            [sensor]
            name = "button"
            pin = 18

            [[actuator]]
            name = "red"
            pin = 16
            "#,
        )
        .unwrap();
        let pins = Arc::new(MockPins::new());
        let controller = Controller::from_config(&config, pins.clone()).await.unwrap();
        (pins, controller)
    }

    #[tokio::test]
    async fn init_cannot_take_the_button_pin() {
        let (pins, mut controller) = with_button().await;
        let init = HardwareRequest::Init {
            actuators: vec![light("fake", 18)],
        };
        match controller.respond(init).await {
            HardwareResponse::Error { kind, message } => {
                assert_eq!(kind, "pin_in_use");
                assert!(message.contains("button"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pins.direction(PinId(18)), Some(Direction::In));
        assert_eq!(pins.export_count(PinId(18)), 1);
        let init = HardwareRequest::Init {
            actuators: vec![light("blue", 16)],
        };
        assert!(matches!(
            controller.respond(init).await,
            HardwareResponse::Error { ref kind, .. } if kind == "pin_in_use"
        ));
        assert_eq!(
            controller.respond(HardwareRequest::ReadStatus).await,
            HardwareResponse::ButtonStatus("0\n".to_string())
        );
    }

    #[tokio::test]
    async fn config_actuator_on_button_pin_is_refused() {
        let config = Config::from_toml(
            r#"
            [sensor]
            name = "button"
            pin = 18

            [[actuator]]
            name = "red"
            pin = 18
            "#,
        )
        .unwrap();
        let pins = Arc::new(MockPins::new());
        let err = Controller::from_config(&config, pins.clone()).await.err().unwrap();
        assert!(matches!(err, Error::PinInUse { ref owner, .. } if owner == "button"));
    }

    #[tokio::test]
    async fn zero_half_period_request_is_refused() {
        let (pins, mut controller) = with_button().await;
        let response = controller
            .respond(HardwareRequest::StartBlink {
                led: Some("red".to_string()),
                half_period_ms: Some(0),
            })
            .await;
        assert!(matches!(response, HardwareResponse::Error { ref kind, .. } if kind == "invalid_half_period"));
        assert_eq!(pins.writes(PinId(16)), vec![PinLevel::Low]);
    }

    #[tokio::test]
    async fn off_leaves_other_actuators_alone() {
        let pins = Arc::new(MockPins::new());
        let mut controller = Controller::new(pins.clone(), Duration::from_millis(250));
        let init = HardwareRequest::Init {
            actuators: vec![light("red", 16), light("green", 21)],
        };
        assert_eq!(controller.respond(init).await, HardwareResponse::Ok);
        let on = HardwareRequest::On {
            led: Some("green".to_string()),
        };
        assert_eq!(controller.respond(on).await, HardwareResponse::Ok);
        let off = HardwareRequest::Off {
            led: Some("green".to_string()),
        };
        assert_eq!(controller.respond(off).await, HardwareResponse::Ok);
        assert_eq!(pins.level(PinId(21)), Some(PinLevel::Low));
        assert_eq!(pins.writes(PinId(16)), vec![PinLevel::Low, PinLevel::Low]);
    }

    #[tokio::test]
    async fn zero_poll_interval_still_serves() {
        let (pins, controller) = with_button().await;
        let (tx, rx) = mpsc::channel(1);
        let serving = tokio::spawn(controller.serve(rx, Duration::ZERO, std::future::pending()));
        let (reply, req) = ControlRequest::from_hardware_request(HardwareRequest::On { led: None });
        tx.send(req).await.unwrap();
        assert_eq!(reply.await.unwrap(), HardwareResponse::Ok);
        drop(tx);
        serving.await.unwrap().unwrap();
        assert!(!pins.is_exported(PinId(16)));
        assert!(!pins.is_exported(PinId(18)));
    }

    #[test]
    fn request_wire_format() {
        let req: HardwareRequest =
            serde_json::from_str(r#"{"StartBlink":{"led":"green"}}"#).unwrap();
        assert_eq!(
            req,
            HardwareRequest::StartBlink {
                led: Some("green".to_string()),
                half_period_ms: None
            }
        );
        let req: HardwareRequest = serde_json::from_str(r#""AllOff""#).unwrap();
        assert_eq!(req, HardwareRequest::AllOff);
    }
}
