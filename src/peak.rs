use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::Deserialize;

use crate::holiday::{is_scheduled_holiday, HolidayCalendar};

/// Demand-response window, minute-of-day encoded as an HHMM integer.
/// Half-open: an instant at `start` is inside, one at `end` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PeakWindow {
    pub start: u32,
    pub end: u32,
}

/// True when `instant` falls inside one of `windows` on a working day
/// that is not a scheduled holiday. Holidays suppress peak pricing.
pub fn in_peak_window(
    calendar: &dyn HolidayCalendar,
    prefixes: &[String],
    windows: &[PeakWindow],
    instant: NaiveDateTime,
) -> bool {
    if matches!(instant.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let hhmm = instant.hour() * 100 + instant.minute();
    if windows.iter().any(|w| w.start <= hhmm && hhmm < w.end) {
        return !is_scheduled_holiday(calendar, prefixes, instant.date());
    }
    false
}

/// Recent average solar production and household consumption, in kW.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerReading {
    pub production: f64,
    pub consumption: f64,
}

/// Whether the peak setpoint should replace the scheduled one. A running
/// device holds its scheduled setpoint while the solar surplus covers the
/// consumption threshold; an idle device holds it while raw production
/// clears the production threshold.
pub fn peak_override(
    running: bool,
    reading: PowerReading,
    production_thresh: f64,
    consumption_thresh: f64,
) -> bool {
    if running {
        reading.production - reading.consumption < consumption_thresh
    } else {
        reading.production < production_thresh
    }
}
