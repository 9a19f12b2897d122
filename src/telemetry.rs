use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::error;

use crate::peak::PowerReading;

/// Flux query for the most recent smoothed production/consumption
/// averages. Values arrive in watts.
const POWER_QUERY: &str = r#"from(bucket: "{bucket}")
  |> range(start: -2h)
  |> filter(fn: (r) => r["_measurement"] == "realtime_energy")
  |> filter(fn: (r) => r["_field"] == "production" or r["_field"] == "consumption")
  |> timedMovingAverage(every: {every}s, period: 10m)
  |> last()"#;

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxSettings {
    pub url: String,
    pub token: String,
    pub org: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

fn default_bucket() -> String {
    "solar".to_string()
}

/// InfluxDB-backed source of recent solar production and consumption.
pub struct PowerMonitor {
    http: reqwest::Client,
    settings: InfluxSettings,
    every_secs: u64,
}

impl PowerMonitor {
    pub fn new(settings: InfluxSettings, every_secs: u64, timeout: Duration) -> Result<PowerMonitor> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(PowerMonitor {
            http,
            settings,
            every_secs: every_secs.max(1),
        })
    }

    /// Recent average production and consumption in kW.
    pub async fn recent_production_consumption(&self) -> Result<PowerReading> {
        let url = format!(
            "{}/api/v2/query?org={}",
            self.settings.url.trim_end_matches('/'),
            self.settings.org
        );
        let query = POWER_QUERY
            .replace("{bucket}", &self.settings.bucket)
            .replace("{every}", &self.every_secs.to_string());
        let body = self
            .http
            .post(&url)
            .header("Authorization", format!("Token {}", self.settings.token))
            .header("Accept", "application/csv")
            .header("Content-Type", "application/vnd.flux")
            .body(query)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_power_csv(&body)
    }

    /// Degrading wrapper: telemetry failure must never block a control
    /// cycle, so errors collapse to zero readings.
    pub async fn reading_or_zero(&self) -> PowerReading {
        match self.recent_production_consumption().await {
            Ok(reading) => reading,
            Err(err) => {
                error!(error = ?err, "failed to get solar production");
                PowerReading::default()
            }
        }
    }
}

/// Extract the `production` and `consumption` rows from InfluxDB
/// annotated CSV, scaled from watts to kW.
fn parse_power_csv(body: &str) -> Result<PowerReading> {
    let mut reading = PowerReading::default();
    let mut columns = None;
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        match columns {
            None => {
                let field = cells.iter().position(|c| *c == "_field");
                let value = cells.iter().position(|c| *c == "_value");
                columns = match (field, value) {
                    (Some(field), Some(value)) => Some((field, value)),
                    _ => bail!("flux response is missing _field/_value columns"),
                };
            }
            Some((field_col, value_col)) => {
                let (Some(field), Some(value)) = (cells.get(field_col), cells.get(value_col))
                else {
                    continue;
                };
                let Ok(watts) = value.parse::<f64>() else {
                    continue;
                };
                match *field {
                    "production" => reading.production = watts / 1000.0,
                    "consumption" => reading.consumption = watts / 1000.0,
                    _ => {}
                }
            }
        }
    }
    Ok(reading)
}
