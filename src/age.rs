//! Age of a patient at a point in their history.
//!
//! A birthday only counts as having happened once the comparison date is *past* it, so on the day
//! of their birthday a patient is still the younger age. Patients born on 29 February celebrate on
//! 1 March in years without one.
use chrono::{Datelike, NaiveDate};

/// Seconds in the average (Julian) year.
pub(crate) const MEAN_SECONDS_PER_YEAR: f64 = 365.25 * 24. * 60. * 60.;

/// Whole years between `born` and `comparison`, rounding down.
pub fn age_at(born: NaiveDate, comparison: NaiveDate) -> i32 {
    let not_yet = if birthday_occurred(born, comparison) {
        0
    } else {
        1
    };
    comparison.year() - born.year() - not_yet
}

/// Age in years including the fraction of the year since the last birthday.
///
/// `None` only if the next birthday can't be represented as a date. Only whole years are written
/// out, and [`age_at`] must always be the floor of this.
#[allow(dead_code)]
pub(crate) fn fractional_age_at(born: NaiveDate, comparison: NaiveDate) -> Option<f64> {
    let next = next_birthday(born, comparison)?;
    let until_birthday = next.signed_duration_since(comparison).num_seconds() as f64;
    Some(
        f64::from(age_at(born, comparison))
            + (MEAN_SECONDS_PER_YEAR - until_birthday) / MEAN_SECONDS_PER_YEAR,
    )
}

fn birthday_occurred(born: NaiveDate, comparison: NaiveDate) -> bool {
    (born.month(), born.day()) < (comparison.month(), comparison.day())
}

fn next_birthday(born: NaiveDate, comparison: NaiveDate) -> Option<NaiveDate> {
    let year = if birthday_occurred(born, comparison) {
        comparison.year() + 1
    } else {
        comparison.year()
    };
    born.with_year(year)
        .or_else(|| NaiveDate::from_ymd_opt(year, 3, 1))
}
