//! Suspension Scheduler
//!
//! Calendar-aligned suspension ends and the rolling-window starts used to
//! evaluate a customer. Everything is computed on the [`BusinessCalendar`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use super::limits::EffectiveLimits;
use crate::calendar::{BusinessCalendar, CalendarInterval, parse_roc_date};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SuspensionKind {
    /// Until the next business midnight
    Daily,
    /// Until the last instant of the business month
    Monthly,
}

impl SuspensionKind {
    /// Period reported to the operator with a SUSPENDED notice
    pub fn nominal_days(&self) -> u32 {
        match self {
            SuspensionKind::Daily => 1,
            SuspensionKind::Monthly => 30,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SuspensionKind::Daily => "daily",
            SuspensionKind::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuspensionWindow {
    pub kind: SuspensionKind,
    pub end: DateTime<Utc>,
    /// `end - now` on the business calendar
    pub duration: CalendarInterval,
}

/// Events that reset a customer's history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowAnchors {
    /// Business midnight of the CIB caution-list expiry
    pub cib_expiry: Option<DateTime<Utc>>,
    pub black_cleared_at: Option<DateTime<Utc>>,
}

impl WindowAnchors {
    fn latest(&self) -> Option<DateTime<Utc>> {
        self.cib_expiry.max(self.black_cleared_at)
    }
}

/// Start instants (exclusive) of every rolling sum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EvaluationWindows {
    pub today: DateTime<Utc>,
    pub month: DateTime<Utc>,
    pub level1: DateTime<Utc>,
    pub level2: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SuspensionScheduler {
    calendar: BusinessCalendar,
}

impl SuspensionScheduler {
    pub fn new(calendar: BusinessCalendar) -> Self {
        Self { calendar }
    }

    pub fn calendar(&self) -> &BusinessCalendar {
        &self.calendar
    }

    pub fn window(&self, kind: SuspensionKind, now: DateTime<Utc>) -> SuspensionWindow {
        let end = match kind {
            SuspensionKind::Daily => self.calendar.start_of_next_day(now),
            SuspensionKind::Monthly => self.calendar.end_of_month(now),
        };
        SuspensionWindow {
            kind,
            end,
            duration: self.calendar.interval_between(now, end),
        }
    }

    /// Suspension end when `window.duration` is applied at `now`
    pub fn suspended_until(
        &self,
        window: &SuspensionWindow,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        self.calendar
            .add_interval(now, &window.duration)
            .unwrap_or(window.end)
    }

    /// Anchor for a CIB expiry given as a Minguo date; unparsable dates are ignored
    pub fn cib_anchor(&self, raw: Option<u32>) -> Option<DateTime<Utc>> {
        raw.and_then(parse_roc_date)
            .map(|date: NaiveDate| self.calendar.midnight(date))
    }

    pub fn evaluation_windows(
        &self,
        now: DateTime<Utc>,
        limits: &EffectiveLimits,
        anchors: &WindowAnchors,
    ) -> EvaluationWindows {
        let clamp = |boundary: DateTime<Utc>| match anchors.latest() {
            Some(anchor) if anchor > boundary => anchor,
            _ => boundary,
        };
        EvaluationWindows {
            today: clamp(self.calendar.start_of_day(now)),
            month: clamp(self.calendar.start_of_month(now)),
            level1: clamp(self.calendar.window_start(now, limits.level1_days)),
            level2: clamp(self.calendar.window_start(now, limits.level2_days)),
        }
    }
}
