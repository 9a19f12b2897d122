use chrono::{NaiveDateTime, Timelike};

/// Tracks how many minutes the fan has run in the current clock hour and
/// forces it on near the end of the hour while the configured minimum has
/// not been met. One tracker per device.
#[derive(Debug, Default)]
pub struct FanDutyCycle {
    minutes: f64,
    forced: bool,
    last_update: Option<NaiveDateTime>,
}

impl FanDutyCycle {
    /// Fan state recorded by the last successful command.
    pub fn forced(&self) -> bool {
        self.forced
    }

    /// Advance the accumulator by one tick. Crossing a top-of-hour
    /// boundary resets the hour's bookkeeping; otherwise a tick counts
    /// toward the accumulator whenever the device was running or the fan
    /// was already forced on.
    pub fn tick(&mut self, now: NaiveDateTime, running: bool, interval_secs: u64) {
        match self.last_update {
            Some(prev) if prev.date() == now.date() && prev.hour() == now.hour() => {
                if running || self.forced {
                    self.minutes += interval_secs as f64 / 60.0;
                }
            }
            _ => {
                self.minutes = 0.0;
                self.forced = false;
            }
        }
        self.last_update = Some(now);
    }

    /// Desired fan state for this tick: on only while the minutes left in
    /// the hour are few enough that the remaining deficit must be burned
    /// down now.
    pub fn desired(&self, now: NaiveDateTime, fan_mins_per_hour: f64) -> bool {
        if fan_mins_per_hour <= 0.0 {
            return false;
        }
        let remaining = 60.0 - f64::from(now.minute());
        remaining <= fan_mins_per_hour && fan_mins_per_hour - self.minutes > 0.0
    }

    /// Record the fan state confirmed by the device.
    pub fn set_forced(&mut self, forced: bool) {
        self.forced = forced;
    }
}
