//! Operator business calendar
//!
//! All timestamps are stored and compared as UTC instants. The operator runs
//! its limits on a fixed-offset local calendar (UTC+8 by default): "today"
//! and "this month" start at local midnight. This module is the only place
//! where that offset is applied.

use chrono::{
    DateTime, Datelike, Days, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, NaiveTime,
    Offset, TimeZone, Utc,
};
use serde::{Deserialize, Serialize};

/// Operator timezone offset used when no configuration is given
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 8;

/// Offset between the Minguo (ROC) calendar year and the Gregorian year
const ROC_YEAR_OFFSET: i32 = 1911;

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// Fixed-offset business calendar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessCalendar {
    offset: FixedOffset,
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        Self::from_utc_offset_hours(DEFAULT_UTC_OFFSET_HOURS).unwrap_or(Self::new(Utc.fix()))
    }
}

impl BusinessCalendar {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Returns `None` if the offset is outside +/- 24h
    pub fn from_utc_offset_hours(hours: i32) -> Option<Self> {
        FixedOffset::east_opt(hours.checked_mul(3600)?).map(Self::new)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// View an instant in the business timezone
    pub fn local(&self, t: DateTime<Utc>) -> DateTime<FixedOffset> {
        t.with_timezone(&self.offset)
    }

    /// Local midnight of `date`, as a UTC instant
    pub fn midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        self.local_to_utc(date.and_time(NaiveTime::MIN))
    }

    fn local_to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }

    fn local_date(&self, t: DateTime<Utc>) -> NaiveDate {
        self.local(t).date_naive()
    }

    /// 00:00 local of the day containing `t`
    pub fn start_of_day(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.midnight(self.local_date(t))
    }

    /// 00:00 local of the day after the one containing `t`
    pub fn start_of_next_day(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let date = self.local_date(t);
        self.midnight(date.succ_opt().unwrap_or(date))
    }

    /// 00:00 local on the first day of the month containing `t`
    pub fn start_of_month(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.midnight(first_of_month(self.local_date(t)))
    }

    /// 00:00 local on the first day of the following month
    pub fn start_of_next_month(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let first = first_of_month(self.local_date(t));
        self.midnight(first.checked_add_months(Months::new(1)).unwrap_or(first))
    }

    /// Last representable millisecond of the month containing `t`
    pub fn end_of_month(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.start_of_next_month(t) - Duration::milliseconds(1)
    }

    /// Start of a rolling window of `days` calendar days that ends today.
    ///
    /// `days = 1` is today's midnight, `days = 7` is midnight six days ago.
    pub fn window_start(&self, t: DateTime<Utc>, days: u32) -> DateTime<Utc> {
        let today = self.local_date(t);
        let back = u64::from(days.saturating_sub(1));
        self.midnight(today.checked_sub_days(Days::new(back)).unwrap_or(today))
    }

    /// Calendar-aware distance between two instants, measured on the local calendar
    pub fn interval_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> CalendarInterval {
        CalendarInterval::between(self.local(start).naive_local(), self.local(end).naive_local())
    }

    /// Re-apply an interval to an instant on the local calendar
    pub fn add_interval(
        &self,
        t: DateTime<Utc>,
        interval: &CalendarInterval,
    ) -> Option<DateTime<Utc>> {
        interval
            .add_to(self.local(t).naive_local())
            .map(|local| self.local_to_utc(local))
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.checked_sub_days(Days::new(u64::from(date.day0())))
        .unwrap_or(date)
}

/// Parse a Minguo calendar date integer (`YYYMMDD`, e.g. `1130315` = 2024-03-15)
pub fn parse_roc_date(raw: u32) -> Option<NaiveDate> {
    let year = i32::try_from(raw / 10_000).ok()? + ROC_YEAR_OFFSET;
    let month = (raw % 10_000) / 100;
    let day = raw % 100;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Years/months/days/hours/minutes/seconds between two local times.
///
/// Unlike a raw millisecond delta this keeps month lengths intact when the
/// interval is added back onto another instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarInterval {
    pub years: u32,
    pub months: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub millis: u32,
}

impl CalendarInterval {
    /// Zero when `end <= start`
    pub fn between(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        if end <= start {
            return Self::default();
        }

        let mut total_months = (end.year() - start.year()) * 12 + end.month() as i32
            - start.month() as i32;
        let mut anchor = add_months(start, total_months);
        while total_months > 0 && anchor.is_none_or(|a| a > end) {
            total_months -= 1;
            anchor = add_months(start, total_months);
        }
        let anchor = anchor.unwrap_or(start);

        let mut rem = (end - anchor).num_milliseconds().max(0);
        let days = rem / MILLIS_PER_DAY;
        rem %= MILLIS_PER_DAY;
        let hours = rem / MILLIS_PER_HOUR;
        rem %= MILLIS_PER_HOUR;
        let minutes = rem / MILLIS_PER_MINUTE;
        rem %= MILLIS_PER_MINUTE;
        let seconds = rem / MILLIS_PER_SECOND;
        let millis = rem % MILLIS_PER_SECOND;

        let total_months = total_months.max(0) as u32;
        Self {
            years: total_months / 12,
            months: total_months % 12,
            days: days as u32,
            hours: hours as u32,
            minutes: minutes as u32,
            seconds: seconds as u32,
            millis: millis as u32,
        }
    }

    pub fn add_to(&self, t: NaiveDateTime) -> Option<NaiveDateTime> {
        let months = self.years.checked_mul(12)?.checked_add(self.months)?;
        let shifted = t.checked_add_months(Months::new(months))?;
        shifted.checked_add_signed(self.sub_month_part())
    }

    fn sub_month_part(&self) -> Duration {
        Duration::days(i64::from(self.days))
            + Duration::hours(i64::from(self.hours))
            + Duration::minutes(i64::from(self.minutes))
            + Duration::seconds(i64::from(self.seconds))
            + Duration::milliseconds(i64::from(self.millis))
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

fn add_months(t: NaiveDateTime, months: i32) -> Option<NaiveDateTime> {
    let months = u32::try_from(months).ok()?;
    t.checked_add_months(Months::new(months))
}
