use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::schedule::Mode;

/// Delay between sending a command and querying for confirmation. Devices
/// need a moment before the new setpoints show up in `/query/info`.
const SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Pause before re-sending after a failed send.
const SEND_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum DeviceError {
    /// Confirmation retries exhausted without the device reporting the
    /// commanded setpoint.
    #[error("failed to confirm new state after {0} attempts")]
    CommandFailed(u32),
    #[error("unexpected device response: {0}")]
    UnexpectedResponse(String),
}

/// Operating mode reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Off,
    Heat,
    Cool,
    Auto,
}

impl OperatingMode {
    fn from_code(code: u8) -> Result<OperatingMode, DeviceError> {
        match code {
            0 => Ok(OperatingMode::Off),
            1 => Ok(OperatingMode::Heat),
            2 => Ok(OperatingMode::Cool),
            3 => Ok(OperatingMode::Auto),
            other => Err(DeviceError::UnexpectedResponse(format!(
                "invalid mode: {other}"
            ))),
        }
    }

    /// The schedule mode this operating mode is driven by, if any. Off
    /// and auto are left alone.
    pub fn schedule_mode(self) -> Option<Mode> {
        match self {
            OperatingMode::Heat => Some(Mode::Heat),
            OperatingMode::Cool => Some(Mode::Cool),
            OperatingMode::Off | OperatingMode::Auto => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperatingMode::Off => "off",
            OperatingMode::Heat => "heat",
            OperatingMode::Cool => "cool",
            OperatingMode::Auto => "auto",
        }
    }
}

/// Status payload from `/query/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermostatStatus {
    pub mode: u8,
    pub state: u8,
    pub schedule: u8,
    pub heattemp: f64,
    pub cooltemp: f64,
    #[serde(default)]
    pub fanstate: u8,
}

impl ThermostatStatus {
    pub fn operating_mode(&self) -> Result<OperatingMode, DeviceError> {
        OperatingMode::from_code(self.mode)
    }

    /// True while the device is actively heating or cooling.
    pub fn is_running(&self) -> bool {
        matches!(self.state, 1 | 2)
    }

    /// True when the device runs its own internal schedule.
    pub fn internal_schedule_active(&self) -> bool {
        self.schedule != 0
    }
}

/// Command for `/control`: the full setpoint pair plus the fan flag.
/// Repeating an identical command is safe at the protocol level.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub mode: Mode,
    pub heattemp: f64,
    pub cooltemp: f64,
    pub fan: bool,
}

impl Command {
    fn form(&self) -> [(&'static str, String); 4] {
        [
            ("mode", self.mode.device_code().to_string()),
            ("heattemp", self.heattemp.to_string()),
            ("cooltemp", self.cooltemp.to_string()),
            ("fan", u8::from(self.fan).to_string()),
        ]
    }

    /// Setpoint the confirmation query must echo back.
    fn confirm_value(&self) -> f64 {
        match self.mode {
            Mode::Heat => self.heattemp,
            Mode::Cool => self.cooltemp,
        }
    }
}

/// Devices requantize setpoints, so confirmation compares to one decimal
/// place instead of exact equality.
pub fn equiv_temps(left: f64, right: f64) -> bool {
    (left * 10.0).round() == (right * 10.0).round()
}

/// HTTP client for one thermostat.
pub struct DeviceClient {
    http: reqwest::Client,
    base_url: Url,
    settle: Duration,
    backoff: Duration,
}

impl DeviceClient {
    pub fn new(url: &str, timeout: Duration) -> Result<DeviceClient> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        let base_url =
            Url::parse(url).with_context(|| format!("invalid thermostat url: {url}"))?;
        Ok(DeviceClient {
            http,
            base_url,
            settle: SETTLE_DELAY,
            backoff: SEND_BACKOFF,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_timing(mut self, settle: Duration, backoff: Duration) -> DeviceClient {
        self.settle = settle;
        self.backoff = backoff;
        self
    }

    pub async fn status(&self) -> Result<ThermostatStatus> {
        let url = self.base_url.join("/query/info")?;
        let resp = self.http.get(url).send().await?.error_for_status()?;
        let status = resp
            .json::<ThermostatStatus>()
            .await
            .map_err(|err| DeviceError::UnexpectedResponse(err.to_string()))?;
        Ok(status)
    }

    async fn send_command(&self, command: &Command) -> Result<()> {
        let url = self.base_url.join("/control")?;
        self.http
            .post(url)
            .form(&command.form())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Apply `command` and confirm the device took it, retrying the whole
    /// send/settle/confirm sequence up to `tries` times. Send and query
    /// failures consume an attempt; the last attempt's error is returned
    /// as-is.
    pub async fn apply_confirmed(&self, command: &Command, tries: u32) -> Result<()> {
        let mut remaining = tries;
        while remaining > 0 {
            if let Err(err) = self.send_command(command).await {
                if remaining == 1 {
                    return Err(err).context("failed to set new state");
                }
                warn!(error = %err, "command send failed, will retry");
                tokio::time::sleep(self.backoff).await;
                remaining -= 1;
                continue;
            }

            tokio::time::sleep(self.settle).await;

            let status = match self.status().await {
                Ok(status) => status,
                Err(err) => {
                    if remaining == 1 {
                        return Err(err).context("failed to set new state");
                    }
                    warn!(error = %err, "confirmation query failed, will retry");
                    remaining -= 1;
                    continue;
                }
            };

            let reported = match command.mode {
                Mode::Heat => status.heattemp,
                Mode::Cool => status.cooltemp,
            };
            if equiv_temps(reported, command.confirm_value()) {
                return Ok(());
            }
            remaining -= 1;
        }
        Err(DeviceError::CommandFailed(tries).into())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockThermostat;
    use super::*;

    fn idle_status(mode: u8, heattemp: f64, cooltemp: f64) -> ThermostatStatus {
        ThermostatStatus {
            mode,
            state: 0,
            schedule: 0,
            heattemp,
            cooltemp,
            fanstate: 0,
        }
    }

    fn fast(client: DeviceClient) -> DeviceClient {
        client.with_timing(Duration::from_millis(2), Duration::from_millis(2))
    }

    #[test]
    fn equivalence_tolerates_requantized_values() {
        assert!(equiv_temps(20.0, 20.0));
        assert!(equiv_temps(20.0, 20.04));
        assert!(equiv_temps(19.96, 20.0));
        assert!(!equiv_temps(20.0, 20.06));
        assert!(!equiv_temps(20.0, 20.1));
    }

    #[test]
    fn status_payload_tolerates_extra_fields() {
        let status: ThermostatStatus = serde_json::from_str(
            r#"{"mode":2,"state":1,"schedule":0,"heattemp":18.5,"cooltemp":25.5,"fan":0,"fanstate":1,"spacetemp":24.0}"#,
        )
        .unwrap();
        assert_eq!(status.operating_mode().unwrap(), OperatingMode::Cool);
        assert!(status.is_running());
        assert!(!status.internal_schedule_active());
    }

    #[test]
    fn unknown_mode_code_is_rejected() {
        let status = idle_status(7, 20.0, 25.0);
        assert!(matches!(
            status.operating_mode(),
            Err(DeviceError::UnexpectedResponse(_))
        ));
    }

    #[tokio::test]
    async fn apply_succeeds_when_device_confirms() {
        let mock = MockThermostat::new(idle_status(1, 18.0, 25.0), true);
        let addr = mock.serve().await;
        let client = fast(
            DeviceClient::new(&format!("http://{addr}"), Duration::from_secs(1)).unwrap(),
        );

        let command = Command {
            mode: Mode::Heat,
            heattemp: 20.5,
            cooltemp: 25.0,
            fan: false,
        };
        client.apply_confirmed(&command, 3).await.unwrap();

        let commands = mock.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].mode, 1);
        assert_eq!(commands[0].heattemp, 20.5);
        assert_eq!(commands[0].fan, 0);
    }

    #[tokio::test]
    async fn apply_gives_up_when_device_never_confirms() {
        let mock = MockThermostat::new(idle_status(1, 18.0, 25.0), false);
        let addr = mock.serve().await;
        let client = fast(
            DeviceClient::new(&format!("http://{addr}"), Duration::from_secs(1)).unwrap(),
        );

        let command = Command {
            mode: Mode::Heat,
            heattemp: 20.5,
            cooltemp: 25.0,
            fan: false,
        };
        let err = client.apply_confirmed(&command, 3).await.unwrap_err();

        // Exactly three sends, never a fourth.
        assert_eq!(mock.commands().len(), 3);
        match err.downcast_ref::<DeviceError>() {
            Some(DeviceError::CommandFailed(3)) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_failure_on_final_attempt_surfaces_the_error() {
        // Nothing listens on the discard port.
        let client = fast(
            DeviceClient::new("http://127.0.0.1:9", Duration::from_millis(100)).unwrap(),
        );
        let command = Command {
            mode: Mode::Cool,
            heattemp: 18.0,
            cooltemp: 26.0,
            fan: false,
        };
        let err = client.apply_confirmed(&command, 2).await.unwrap_err();
        assert!(err.to_string().contains("failed to set new state"));
    }
}
