use chrono::{Datelike, NaiveDate, Weekday};

/// Calendar capability: the name of the public holiday falling on `date`,
/// if any.
pub trait HolidayCalendar: Send + Sync {
    fn holiday_name(&self, date: NaiveDate) -> Option<String>;
}

/// True when `date` is a working-day holiday whose name matches one of
/// the configured prefixes (case-insensitive). Weekends are never treated
/// as holidays: Saturday and Sunday carry their own day schedules.
pub fn is_scheduled_holiday(
    calendar: &dyn HolidayCalendar,
    prefixes: &[String],
    date: NaiveDate,
) -> bool {
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let Some(name) = calendar.holiday_name(date) else {
        return false;
    };
    let name = name.to_lowercase();
    prefixes
        .iter()
        .any(|prefix| name.starts_with(&prefix.to_lowercase()))
}

/// United States federal holidays with observed dates: a Saturday holiday
/// is observed the preceding Friday, a Sunday holiday the following
/// Monday.
pub struct UsHolidays;

impl HolidayCalendar for UsHolidays {
    fn holiday_name(&self, date: NaiveDate) -> Option<String> {
        // An observed New Year's Day can land on Dec 31 of the prior year.
        for year in [date.year(), date.year() + 1] {
            for (holiday, name) in federal_holidays(year) {
                if holiday == date {
                    return Some(name);
                }
            }
        }
        None
    }
}

fn federal_holidays(year: i32) -> Vec<(NaiveDate, String)> {
    let mut days = Vec::new();
    fixed(&mut days, year, 1, 1, "New Year's Day");
    nth_weekday(&mut days, year, 1, Weekday::Mon, 3, "Martin Luther King Jr. Day");
    nth_weekday(&mut days, year, 2, Weekday::Mon, 3, "Washington's Birthday");
    last_weekday(&mut days, year, 5, Weekday::Mon, "Memorial Day");
    if year >= 2021 {
        fixed(&mut days, year, 6, 19, "Juneteenth National Independence Day");
    }
    fixed(&mut days, year, 7, 4, "Independence Day");
    nth_weekday(&mut days, year, 9, Weekday::Mon, 1, "Labor Day");
    nth_weekday(&mut days, year, 10, Weekday::Mon, 2, "Columbus Day");
    fixed(&mut days, year, 11, 11, "Veterans Day");
    nth_weekday(&mut days, year, 11, Weekday::Thu, 4, "Thanksgiving");
    fixed(&mut days, year, 12, 25, "Christmas Day");
    days
}

/// A fixed-date holiday plus its observed date when it falls on a
/// weekend.
fn fixed(out: &mut Vec<(NaiveDate, String)>, year: i32, month: u32, dom: u32, name: &str) {
    let Some(date) = NaiveDate::from_ymd_opt(year, month, dom) else {
        return;
    };
    out.push((date, name.to_string()));
    let observed = match date.weekday() {
        Weekday::Sat => date.pred_opt(),
        Weekday::Sun => date.succ_opt(),
        _ => None,
    };
    if let Some(observed) = observed {
        out.push((observed, format!("{name} (observed)")));
    }
}

/// The `n`-th `weekday` of a month (1-based).
fn nth_weekday(
    out: &mut Vec<(NaiveDate, String)>,
    year: i32,
    month: u32,
    weekday: Weekday,
    n: u32,
    name: &str,
) {
    let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return;
    };
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    if let Some(date) = NaiveDate::from_ymd_opt(year, month, 1 + offset + (n - 1) * 7) {
        out.push((date, name.to_string()));
    }
}

/// The last `weekday` of a month.
fn last_weekday(
    out: &mut Vec<(NaiveDate, String)>,
    year: i32,
    month: u32,
    weekday: Weekday,
    name: &str,
) {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    let Some(mut date) = first_of_next.and_then(|d| d.pred_opt()) else {
        return;
    };
    while date.weekday() != weekday {
        let Some(prev) = date.pred_opt() else { return };
        date = prev;
    }
    out.push((date, name.to_string()));
}
