use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::peak::PeakWindow;
use crate::schedule::{DaySchedule, Mode, ModeSchedule, ScheduleCatalog, SeasonalEntry, Setpoint};
use crate::telemetry::InfluxSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration")]
    Yaml(#[from] serde_yaml::Error),
    /// A mode schedule must supply all seven weekdays.
    #[error("season {season} {mode}: schedule does not contain all days of the week ({day} missing)")]
    IncompleteSchedule {
        season: String,
        mode: &'static str,
        day: &'static str,
    },
    #[error("season {season} {mode} {day}: no setpoints")]
    EmptyDay {
        season: String,
        mode: &'static str,
        day: &'static str,
    },
    #[error("season {season} {mode} {day}: invalid time of day {hhmm}")]
    InvalidTime {
        season: String,
        mode: &'static str,
        day: &'static str,
        hhmm: u32,
    },
    #[error("season {season}: invalid start date {start:?}")]
    InvalidStart { season: String, start: String },
    #[error("duplicate season start {month:02}/{day:02}")]
    DuplicateStart { month: u32, day: u32 },
}

/// Global settings. Every field has a default so a bare `settings:` (or
/// none at all) is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Control cycle interval in seconds. Clamped to at most a minute
    /// and snapped to a divisor of 60 at load.
    pub interval: u64,
    /// Per-request HTTP timeout in seconds.
    pub timeout: f64,
    /// Minimum fan runtime per clock hour, in minutes. Zero disables the
    /// duty cycle.
    pub fan_mins_per_hour: f64,
    /// Holiday-name prefixes that activate holiday schedules.
    pub holidays: Vec<String>,
    /// Solar production (kW) an idle device must see to skip the peak
    /// override, per mode.
    pub solar_prod_thresh: HashMap<Mode, f64>,
    /// Production surplus (kW) a running device must see to skip the
    /// peak override, per mode.
    pub consumption_thresh: HashMap<Mode, f64>,
    pub status_listen: SocketAddr,
    pub influxdb: Option<InfluxSettings>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            interval: 60,
            timeout: 3.0,
            fan_mins_per_hour: 0.0,
            holidays: Vec::new(),
            solar_prod_thresh: HashMap::new(),
            consumption_thresh: HashMap::new(),
            status_listen: ([0, 0, 0, 0], 8080).into(),
            influxdb: None,
        }
    }
}

impl Settings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    pub fn production_threshold(&self, mode: Mode) -> f64 {
        self.solar_prod_thresh.get(&mode).copied().unwrap_or(100.0)
    }

    pub fn consumption_threshold(&self, mode: Mode) -> f64 {
        self.consumption_thresh.get(&mode).copied().unwrap_or(0.0)
    }

    /// Clamp the interval to at most a minute and snap it to a divisor
    /// of 60 so cycles stay aligned to wall-clock minutes.
    fn normalize_interval(&mut self) {
        let requested = self.interval.clamp(1, 60);
        let snapped = 60 / (60.0 / requested as f64).round() as u64;
        if snapped != self.interval {
            warn!(
                requested = self.interval,
                adjusted = snapped,
                "interval was adjusted"
            );
        }
        self.interval = snapped;
    }
}

/// One thermostat with its validated yearly catalog.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub url: String,
    pub catalog: ScheduleCatalog,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    thermostats: Vec<RawThermostat>,
    #[serde(default)]
    settings: Settings,
}

#[derive(Debug, Deserialize)]
struct RawThermostat {
    url: String,
    schedules: BTreeMap<String, RawSeason>,
}

#[derive(Debug, Deserialize)]
struct RawSeason {
    start: String,
    heat: Option<RawModeSchedule>,
    cool: Option<RawModeSchedule>,
}

/// HHMM -> temperature. A map keeps the times sorted and unique.
type RawDay = BTreeMap<u32, f64>;

#[derive(Debug, Deserialize)]
struct RawModeSchedule {
    monday: Option<RawDay>,
    tuesday: Option<RawDay>,
    wednesday: Option<RawDay>,
    thursday: Option<RawDay>,
    friday: Option<RawDay>,
    saturday: Option<RawDay>,
    sunday: Option<RawDay>,
    holiday: Option<RawDay>,
    peak: Option<RawPeak>,
}

#[derive(Debug, Deserialize)]
struct RawPeak {
    value: f64,
    #[serde(default)]
    windows: Vec<PeakWindow>,
}

pub fn load(path: &Path) -> Result<(Vec<DeviceConfig>, Settings), ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<(Vec<DeviceConfig>, Settings), ConfigError> {
    let doc: RawDocument = serde_yaml::from_str(text)?;
    let mut settings = doc.settings;
    settings.normalize_interval();

    let mut devices = Vec::with_capacity(doc.thermostats.len());
    for thermostat in &doc.thermostats {
        let mut entries = Vec::with_capacity(thermostat.schedules.len());
        for (name, season) in &thermostat.schedules {
            entries.push(build_season(name, season)?);
        }
        entries.sort_by_key(|entry| entry.start);
        for pair in entries.windows(2) {
            if pair[0].start == pair[1].start {
                let (month, day) = pair[0].start;
                return Err(ConfigError::DuplicateStart { month, day });
            }
        }
        devices.push(DeviceConfig {
            url: thermostat.url.clone(),
            catalog: ScheduleCatalog::new(entries),
        });
    }
    Ok((devices, settings))
}

fn build_season(name: &str, raw: &RawSeason) -> Result<SeasonalEntry, ConfigError> {
    Ok(SeasonalEntry {
        start: parse_start(name, &raw.start)?,
        heat: raw
            .heat
            .as_ref()
            .map(|mode| build_mode(name, "heat", mode))
            .transpose()?,
        cool: raw
            .cool
            .as_ref()
            .map(|mode| build_mode(name, "cool", mode))
            .transpose()?,
    })
}

fn parse_start(season: &str, start: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = || ConfigError::InvalidStart {
        season: season.to_string(),
        start: start.to_string(),
    };
    let (month, day) = start.split_once('/').ok_or_else(invalid)?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    let day: u32 = day.parse().map_err(|_| invalid())?;
    // 2000 is a leap year, so 02/29 passes.
    NaiveDate::from_ymd_opt(2000, month, day).ok_or_else(invalid)?;
    Ok((month, day))
}

fn build_mode(
    season: &str,
    mode: &'static str,
    raw: &RawModeSchedule,
) -> Result<ModeSchedule, ConfigError> {
    let required = |day: &'static str, raw_day: &Option<RawDay>| match raw_day {
        Some(raw_day) => build_day(season, mode, day, raw_day),
        None => Err(ConfigError::IncompleteSchedule {
            season: season.to_string(),
            mode,
            day,
        }),
    };

    let days = [
        required("monday", &raw.monday)?,
        required("tuesday", &raw.tuesday)?,
        required("wednesday", &raw.wednesday)?,
        required("thursday", &raw.thursday)?,
        required("friday", &raw.friday)?,
        required("saturday", &raw.saturday)?,
        required("sunday", &raw.sunday)?,
    ];
    let holiday = raw
        .holiday
        .as_ref()
        .map(|raw_day| build_day(season, mode, "holiday", raw_day))
        .transpose()?;
    let (peak_windows, peak_value) = match &raw.peak {
        Some(peak) => (peak.windows.clone(), Some(peak.value)),
        None => (Vec::new(), None),
    };
    Ok(ModeSchedule::new(days, holiday, peak_windows, peak_value))
}

fn build_day(
    season: &str,
    mode: &'static str,
    day: &'static str,
    raw_day: &RawDay,
) -> Result<DaySchedule, ConfigError> {
    if raw_day.is_empty() {
        return Err(ConfigError::EmptyDay {
            season: season.to_string(),
            mode,
            day,
        });
    }
    let mut points = Vec::with_capacity(raw_day.len());
    for (&hhmm, &value) in raw_day {
        let time = NaiveTime::from_hms_opt(hhmm / 100, hhmm % 100, 0).ok_or(
            ConfigError::InvalidTime {
                season: season.to_string(),
                mode,
                day,
                hhmm,
            },
        )?;
        points.push(Setpoint { time, value });
    }
    Ok(DaySchedule::new(points))
}
