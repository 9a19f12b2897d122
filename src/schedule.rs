use chrono::{Datelike, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::holiday::{is_scheduled_holiday, HolidayCalendar};
use crate::peak::{in_peak_window, PeakWindow};

/// Climate mode a schedule can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Heat,
    Cool,
}

impl Mode {
    /// Wire code the device API uses (1 = heat, 2 = cool).
    pub fn device_code(self) -> u8 {
        match self {
            Mode::Heat => 1,
            Mode::Cool => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Heat => "heat",
            Mode::Cool => "cool",
        }
    }
}

/// A target temperature active from `time` onward within a day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    pub time: NaiveTime,
    pub value: f64,
}

/// Ordered setpoints for one day. Non-empty, times strictly increasing;
/// the config loader enforces both.
#[derive(Debug, Clone)]
pub struct DaySchedule(Vec<Setpoint>);

impl DaySchedule {
    pub fn new(points: Vec<Setpoint>) -> DaySchedule {
        debug_assert!(!points.is_empty());
        DaySchedule(points)
    }

    pub fn last(&self) -> Setpoint {
        self.0[self.0.len() - 1]
    }

    /// Latest setpoint whose time is <= `time`, or `None` when `time`
    /// precedes the first setpoint of the day.
    pub fn floor(&self, time: NaiveTime) -> Option<Setpoint> {
        match self.0.partition_point(|point| point.time <= time) {
            0 => None,
            n => Some(self.0[n - 1]),
        }
    }
}

/// Weekly setpoints for one climate mode within a season.
#[derive(Debug, Clone)]
pub struct ModeSchedule {
    days: [DaySchedule; 7], // Monday = 0 .. Sunday = 6
    holiday: Option<DaySchedule>,
    peak_windows: Vec<PeakWindow>,
    peak_value: Option<f64>,
}

impl ModeSchedule {
    pub fn new(
        days: [DaySchedule; 7],
        holiday: Option<DaySchedule>,
        peak_windows: Vec<PeakWindow>,
        peak_value: Option<f64>,
    ) -> ModeSchedule {
        ModeSchedule {
            days,
            holiday,
            peak_windows,
            peak_value,
        }
    }

    /// Day schedule for `weekday`, substituting the holiday schedule when
    /// `holiday` is set. A mode without a holiday schedule falls back to
    /// the plain weekday.
    fn day_for(&self, weekday: usize, holiday: bool) -> &DaySchedule {
        if holiday {
            self.holiday.as_ref().unwrap_or(&self.days[weekday])
        } else {
            &self.days[weekday]
        }
    }
}

/// Schedule definition effective from `start` until the next entry's
/// start, wrapping across year-end.
#[derive(Debug, Clone)]
pub struct SeasonalEntry {
    pub start: (u32, u32), // (month, day)
    pub heat: Option<ModeSchedule>,
    pub cool: Option<ModeSchedule>,
}

impl SeasonalEntry {
    fn mode(&self, mode: Mode) -> Option<&ModeSchedule> {
        match mode {
            Mode::Heat => self.heat.as_ref(),
            Mode::Cool => self.cool.as_ref(),
        }
    }
}

/// Identity of "what the device should currently be set to". The control
/// loop re-sends a command only when this (or the fan state) changes.
#[derive(Debug, Clone, PartialEq)]
pub struct StateIdentity {
    pub season: usize,
    pub mode: Mode,
    pub weekday: usize,
    pub setpoint_time: NaiveTime,
    pub setpoint_value: f64,
    pub target: f64,
}

/// Resolver output for one instant.
#[derive(Debug, Clone)]
pub struct ActiveSetpoint {
    pub season: usize,
    pub mode: Mode,
    pub weekday: usize,
    pub setpoint_time: NaiveTime,
    pub setpoint_value: f64,
    /// Value the device should be set to. Starts equal to
    /// `setpoint_value`; the control loop replaces it with the peak value
    /// when the demand-response override triggers.
    pub target: f64,
    pub is_holiday: bool,
    pub is_peak: bool,
    pub peak_value: Option<f64>,
}

impl ActiveSetpoint {
    pub fn identity(&self) -> StateIdentity {
        StateIdentity {
            season: self.season,
            mode: self.mode,
            weekday: self.weekday,
            setpoint_time: self.setpoint_time,
            setpoint_value: self.setpoint_value,
            target: self.target,
        }
    }
}

/// Immutable yearly schedule for one device: seasonal entries sorted
/// ascending by start date. Built once at startup; a config reload
/// replaces the whole catalog.
#[derive(Debug, Clone, Default)]
pub struct ScheduleCatalog {
    entries: Vec<SeasonalEntry>,
}

impl ScheduleCatalog {
    /// `entries` must be sorted ascending by `start` with no duplicates;
    /// the config loader enforces this.
    pub fn new(entries: Vec<SeasonalEntry>) -> ScheduleCatalog {
        ScheduleCatalog { entries }
    }

    /// Resolve the setpoint active at `instant` for `mode`.
    ///
    /// Seasons form a circular year: an instant before the first entry's
    /// start belongs to the last entry, which carries over from the
    /// previous year. An instant earlier than the day's first setpoint
    /// still belongs to the previous day's last setpoint: the weekday
    /// steps back by one and, exactly on a season's start date, the
    /// season steps back with it.
    pub fn resolve(
        &self,
        calendar: &dyn HolidayCalendar,
        holiday_prefixes: &[String],
        instant: NaiveDateTime,
        mode: Mode,
    ) -> Option<ActiveSetpoint> {
        if self.entries.is_empty() {
            return None;
        }

        let mmdd = (instant.month(), instant.day());
        let mut season = match self.entries.partition_point(|entry| entry.start <= mmdd) {
            // Before the first start: wrap to the last entry.
            0 => self.entries.len() - 1,
            n => n - 1,
        };
        let mut sched = self.entries[season].mode(mode)?;

        let mut weekday = instant.weekday().num_days_from_monday() as usize;
        let time = instant.time();
        let is_holiday = is_scheduled_holiday(calendar, holiday_prefixes, instant.date());

        let day = sched.day_for(weekday, is_holiday);
        let point = match day.floor(time) {
            Some(point) => point,
            None => {
                // The schedule has not ticked over for the new day yet;
                // the previous day's last setpoint is still active.
                weekday = (weekday + 6) % 7;
                if mmdd == self.entries[season].start {
                    season = (season + self.entries.len() - 1) % self.entries.len();
                    sched = self.entries[season].mode(mode)?;
                }
                let yesterday = instant.date().pred_opt()?;
                let was_holiday = is_scheduled_holiday(calendar, holiday_prefixes, yesterday);
                sched.day_for(weekday, was_holiday).last()
            }
        };

        Some(ActiveSetpoint {
            season,
            mode,
            weekday,
            setpoint_time: point.time,
            setpoint_value: point.value,
            target: point.value,
            is_holiday,
            is_peak: in_peak_window(calendar, holiday_prefixes, &sched.peak_windows, instant),
            peak_value: sched.peak_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::holiday::testing::FixedHolidays;

    fn day(points: &[(u32, f64)]) -> DaySchedule {
        DaySchedule::new(
            points
                .iter()
                .map(|&(hhmm, value)| Setpoint {
                    time: NaiveTime::from_hms_opt(hhmm / 100, hhmm % 100, 0).unwrap(),
                    value,
                })
                .collect(),
        )
    }

    fn at(year: i32, month: u32, dom: u32, hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, month, dom)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    /// Two heat seasons. Summer (from 5/1) runs 30 from 06:00 and 40 from
    /// 20:00 every day, with a distinct holiday schedule and a peak
    /// window. Winter (from 10/1) runs 100/110, except Fridays which end
    /// the day at 120 so weekday rollback is observable.
    fn catalog() -> ScheduleCatalog {
        let summer_day = [(600, 30.0), (2000, 40.0)];
        let summer = ModeSchedule::new(
            std::array::from_fn(|_| day(&summer_day)),
            Some(day(&[(600, 35.0), (2000, 45.0)])),
            vec![PeakWindow {
                start: 1500,
                end: 1900,
            }],
            Some(25.0),
        );
        let winter = ModeSchedule::new(
            std::array::from_fn(|weekday| {
                if weekday == 4 {
                    day(&[(600, 100.0), (2000, 120.0)])
                } else {
                    day(&[(600, 100.0), (2000, 110.0)])
                }
            }),
            None,
            Vec::new(),
            None,
        );
        ScheduleCatalog::new(vec![
            SeasonalEntry {
                start: (5, 1),
                heat: Some(summer),
                cool: None,
            },
            SeasonalEntry {
                start: (10, 1),
                heat: Some(winter),
                cool: None,
            },
        ])
    }

    fn resolve(catalog: &ScheduleCatalog, instant: NaiveDateTime) -> Option<ActiveSetpoint> {
        catalog.resolve(&FixedHolidays::default(), &[], instant, Mode::Heat)
    }

    #[test]
    fn empty_catalog_resolves_nothing() {
        let catalog = ScheduleCatalog::default();
        assert!(resolve(&catalog, at(2021, 6, 15, 12, 0)).is_none());
    }

    #[test]
    fn missing_mode_resolves_nothing() {
        let catalog = catalog();
        assert!(catalog
            .resolve(&FixedHolidays::default(), &[], at(2021, 6, 15, 12, 0), Mode::Cool)
            .is_none());
    }

    #[test]
    fn floor_search_within_day() {
        let catalog = catalog();
        assert_eq!(resolve(&catalog, at(2021, 6, 15, 19, 59)).unwrap().target, 30.0);
        assert_eq!(resolve(&catalog, at(2021, 6, 15, 20, 0)).unwrap().target, 40.0);
        assert_eq!(resolve(&catalog, at(2021, 6, 15, 23, 59)).unwrap().target, 40.0);
    }

    #[test]
    fn dates_before_first_season_wrap_to_last() {
        // 3/15 precedes the summer start, so the winter entry from the
        // previous year is still in effect.
        let active = resolve(&catalog(), at(2021, 3, 15, 12, 0)).unwrap();
        assert_eq!(active.season, 1);
        assert_eq!(active.target, 100.0);
    }

    #[test]
    fn before_first_setpoint_uses_previous_day() {
        // Tuesday 05:30 precedes the 06:00 tick-over; Monday's last
        // setpoint is still active.
        let active = resolve(&catalog(), at(2021, 6, 15, 5, 30)).unwrap();
        assert_eq!(active.target, 40.0);
        assert_eq!(active.weekday, 0);
        assert_eq!(active.season, 0);
    }

    #[test]
    fn wrapped_season_still_rolls_back_a_day() {
        // Monday 3/15 05:30: wrapped into winter, then back to Sunday.
        let active = resolve(&catalog(), at(2021, 3, 15, 5, 30)).unwrap();
        assert_eq!(active.season, 1);
        assert_eq!(active.weekday, 6);
        assert_eq!(active.target, 110.0);
    }

    #[test]
    fn season_boundary_plus_day_rollback() {
        // 2021-05-01 is the summer start, a Saturday. 05:30 precedes the
        // day's first setpoint, so both the weekday and the season step
        // back: winter's Friday ends the day at 120.
        let active = resolve(&catalog(), at(2021, 5, 1, 5, 30)).unwrap();
        assert_eq!(active.season, 1);
        assert_eq!(active.weekday, 4);
        assert_eq!(active.target, 120.0);
    }

    #[test]
    fn season_boundary_after_first_setpoint() {
        let active = resolve(&catalog(), at(2021, 5, 1, 6, 0)).unwrap();
        assert_eq!(active.season, 0);
        assert_eq!(active.target, 30.0);
    }

    #[test]
    fn season_boundary_at_midnight() {
        let active = resolve(&catalog(), at(2021, 5, 1, 0, 0)).unwrap();
        assert_eq!(active.season, 1);
        assert_eq!(active.target, 120.0);
    }

    #[test]
    fn holiday_uses_holiday_schedule() {
        let calendar = FixedHolidays::on(at(2021, 5, 3, 0, 0).date(), "Test Holiday");
        let allow = vec!["test".to_string()];

        // Monday 5/3 15:00 on an allow-listed holiday.
        let active = catalog()
            .resolve(&calendar, &allow, at(2021, 5, 3, 15, 0), Mode::Heat)
            .unwrap();
        assert!(active.is_holiday);
        assert_eq!(active.target, 35.0);

        // Same instant, prefix not in the allow list.
        let other = vec!["thanksgiving".to_string()];
        let active = catalog()
            .resolve(&calendar, &other, at(2021, 5, 3, 15, 0), Mode::Heat)
            .unwrap();
        assert!(!active.is_holiday);
        assert_eq!(active.target, 30.0);
    }

    #[test]
    fn weekend_holidays_are_ignored() {
        // Saturday 5/8 marked as a holiday still uses the weekday grid.
        let calendar = FixedHolidays::on(at(2021, 5, 8, 0, 0).date(), "Test Holiday");
        let allow = vec!["test".to_string()];
        let active = catalog()
            .resolve(&calendar, &allow, at(2021, 5, 8, 15, 0), Mode::Heat)
            .unwrap();
        assert!(!active.is_holiday);
        assert_eq!(active.target, 30.0);
    }

    #[test]
    fn missing_holiday_schedule_falls_back_to_weekday() {
        // Winter has no holiday schedule.
        let calendar = FixedHolidays::on(at(2021, 11, 1, 0, 0).date(), "Test Holiday");
        let allow = vec!["test".to_string()];
        let active = catalog()
            .resolve(&calendar, &allow, at(2021, 11, 1, 12, 0), Mode::Heat)
            .unwrap();
        assert!(active.is_holiday);
        assert_eq!(active.target, 100.0);
    }

    #[test]
    fn day_rollback_recomputes_holiday_for_yesterday() {
        // Monday 5/3 was a holiday; Tuesday 05:30 still belongs to it, so
        // the holiday schedule's last setpoint applies.
        let calendar = FixedHolidays::on(at(2021, 5, 3, 0, 0).date(), "Test Holiday");
        let allow = vec!["test".to_string()];
        let active = catalog()
            .resolve(&calendar, &allow, at(2021, 5, 4, 5, 30), Mode::Heat)
            .unwrap();
        assert!(!active.is_holiday);
        assert_eq!(active.target, 45.0);
    }

    #[test]
    fn peak_flags_follow_the_selected_season() {
        let active = resolve(&catalog(), at(2021, 6, 14, 16, 0)).unwrap();
        assert!(active.is_peak);
        assert_eq!(active.peak_value, Some(25.0));

        // Weekends never hit peak.
        let active = resolve(&catalog(), at(2021, 6, 12, 16, 0)).unwrap();
        assert!(!active.is_peak);

        // Winter has no windows.
        let active = resolve(&catalog(), at(2021, 11, 1, 16, 0)).unwrap();
        assert!(!active.is_peak);
        assert_eq!(active.peak_value, None);
    }

    #[test]
    fn holiday_suppresses_peak() {
        let calendar = FixedHolidays::on(at(2021, 6, 14, 0, 0).date(), "Test Holiday");
        let allow = vec!["test".to_string()];
        let active = catalog()
            .resolve(&calendar, &allow, at(2021, 6, 14, 16, 0), Mode::Heat)
            .unwrap();
        assert!(active.is_holiday);
        assert!(!active.is_peak);
    }

    #[test]
    fn identity_changes_with_target() {
        let mut left = resolve(&catalog(), at(2021, 6, 14, 16, 0)).unwrap();
        let right = resolve(&catalog(), at(2021, 6, 14, 16, 30)).unwrap();
        assert_eq!(left.identity(), right.identity());

        // A peak substitution counts as a state change.
        left.target = left.peak_value.unwrap();
        assert_ne!(left.identity(), right.identity());
    }
}
