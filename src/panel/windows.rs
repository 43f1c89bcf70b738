//! Calendar arithmetic for seal events
//!
//! Maps a seal date to the weekly offer partitions and monthly click
//! partitions that have to be loaded, and converts between Unix time and the
//! week running variable `t`. Everything here is pure.

use chrono::{Datelike, Months, NaiveDate, Weekday};

/// Mon May 14 2007 00:00:00 GMT+0200, the origin of the running variable
pub const UNIX_TIME_ORIGIN: i64 = 1_179_093_600;

pub const UNIX_DAY: i64 = 24 * 60 * 60;
pub const UNIX_WEEK: i64 = 7 * UNIX_DAY;

/// Every observation lies within this many weeks of its seal date
pub const OBSERVATION_BOUND_WEEKS: i64 = 26;

pub const SEAL_DATE_PATTERN: &str = "%d.%m.%Y";

pub const OFFER_FILE_PREFIX: &str = "angebot";
pub const CLICK_FILE_PREFIX: &str = "clicks";

/// Running variable `t` for a Unix timestamp
///
/// Floors toward negative infinity, so the week before the origin is `-1`.
pub fn running_var(unix_time: i64) -> i64 {
    (unix_time - UNIX_TIME_ORIGIN).div_euclid(UNIX_WEEK)
}

/// First second of week `t`
pub fn unix_from_running_var(week_running_var: i64) -> i64 {
    UNIX_TIME_ORIGIN + week_running_var * UNIX_WEEK
}

/// Parse a `DD.MM.YYYY` seal date; single-digit day/month are accepted
pub fn parse_seal_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), SEAL_DATE_PATTERN).ok()
}

pub fn format_seal_date(date: NaiveDate) -> String {
    date.format(SEAL_DATE_PATTERN).to_string()
}

/// Midnight UTC of `date`
pub fn date_to_unix(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

/// Monday of the ISO week containing `date`
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Number of ISO weeks (52 or 53) in `year`
pub fn iso_weeks_in_year(year: i32) -> u32 {
    if NaiveDate::from_isoywd_opt(year, 53, Weekday::Mon).is_some() {
        53
    } else {
        52
    }
}

/// Normalize a possibly out-of-range week index relative to `year`
///
/// Indices `<= 0` walk back into the tail of earlier years, indices past the
/// year's last ISO week walk forward into the next year's week 1 onwards.
pub fn roll_week(mut year: i32, mut week: i64) -> (i32, u32) {
    while week <= 0 {
        year -= 1;
        week += iso_weeks_in_year(year) as i64;
    }
    while week > iso_weeks_in_year(year) as i64 {
        week -= iso_weeks_in_year(year) as i64;
        year += 1;
    }
    (year, week as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// ISO year + ISO week (offer partitions)
    Weekly,
    /// Calendar year + month (click partitions)
    Monthly,
}

/// One time slice of a partitioned dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub year: i32,
    /// ISO week for weekly partitions, month for monthly ones
    pub index: u32,
}

impl PartitionKey {
    /// File name under the fixed naming scheme, e.g. `angebot_2022w01.parquet`
    pub fn file_name(&self, granularity: Granularity) -> String {
        match granularity {
            Granularity::Weekly => {
                format!("{}_{}w{:02}.parquet", OFFER_FILE_PREFIX, self.year, self.index)
            }
            Granularity::Monthly => {
                format!("{}_{}m{:02}.parquet", CLICK_FILE_PREFIX, self.year, self.index)
            }
        }
    }
}

/// Ordered partitions from `pre` units before the anchor to `post` units after it
///
/// The anchor's own partition is always included, so the result has
/// `pre + post + 1` entries with no duplicates.
pub fn resolve(anchor: NaiveDate, pre: u32, post: u32, granularity: Granularity) -> Vec<PartitionKey> {
    match granularity {
        Granularity::Weekly => {
            let iso = anchor.iso_week();
            let (year, week) = (iso.year(), iso.week() as i64);
            (-(pre as i64)..=post as i64)
                .map(|offset| {
                    let (year, index) = roll_week(year, week + offset);
                    PartitionKey { year, index }
                })
                .collect()
        }
        Granularity::Monthly => {
            let Some(first) = NaiveDate::from_ymd_opt(anchor.year(), anchor.month(), 1) else {
                return Vec::new();
            };
            let mut months = Vec::with_capacity((pre + post + 1) as usize);
            for back in (1..=pre).rev() {
                if let Some(date) = first.checked_sub_months(Months::new(back)) {
                    months.push(PartitionKey { year: date.year(), index: date.month() });
                }
            }
            for forward in 0..=post {
                if let Some(date) = first.checked_add_months(Months::new(forward)) {
                    months.push(PartitionKey { year: date.year(), index: date.month() });
                }
            }
            months
        }
    }
}

/// Window sizes used to resolve the partitions of one seal event
#[derive(Debug, Clone, Copy)]
pub struct WindowResolver {
    pub offer_weeks_pre: u32,
    pub offer_weeks_post: u32,
    pub click_months_pre: u32,
    pub click_months_post: u32,
}

impl WindowResolver {
    pub fn offer_partitions(&self, seal_date: NaiveDate) -> Vec<PartitionKey> {
        resolve(seal_date, self.offer_weeks_pre, self.offer_weeks_post, Granularity::Weekly)
    }

    pub fn click_partitions(&self, seal_date: NaiveDate) -> Vec<PartitionKey> {
        resolve(seal_date, self.click_months_pre, self.click_months_post, Granularity::Monthly)
    }

    /// Unix range `[seal - pre weeks, seal + post weeks]` of offer spells considered for an event
    pub fn offer_time_range(&self, seal_date: NaiveDate) -> (i64, i64) {
        let seal = date_to_unix(seal_date);
        (
            seal - self.offer_weeks_pre as i64 * UNIX_WEEK,
            seal + self.offer_weeks_post as i64 * UNIX_WEEK,
        )
    }
}

/// Inclusive `t` bounds an observation of this seal event may take
pub fn observation_bounds(seal_unix: i64) -> (i64, i64) {
    (
        running_var(seal_unix - OBSERVATION_BOUND_WEEKS * UNIX_WEEK),
        running_var(seal_unix + OBSERVATION_BOUND_WEEKS * UNIX_WEEK),
    )
}
