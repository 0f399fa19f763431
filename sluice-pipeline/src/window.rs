//! Time windows of aggregators.

use chrono::{DateTime, TimeDelta, Utc};

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Outcome of [`AggregationWindow::admit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The point belongs to the open window.
    Accept,
    /// The point is too early or too late for the open window.
    Reject,
}

/// The time range an aggregator currently accumulates into.
///
/// The window covers `[start, end)` with `end == start + period`. Points are admitted with a
/// tolerance of `grace` before the start and `delay` after the end.
///
/// The window is advanced exactly once per push and never per point. It re-anchors to a
/// multiple of the period since the Unix epoch if the wall clock left the next intended window,
/// for instance after a suspend or a manual clock adjustment. Missed windows are never replayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregationWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    period: TimeDelta,
    grace: TimeDelta,
    delay: TimeDelta,
}

impl AggregationWindow {
    /// Opens a window `[now, now + period)`.
    pub fn new(now: DateTime<Utc>, period: TimeDelta, grace: TimeDelta, delay: TimeDelta) -> Self {
        Self {
            start: now,
            end: saturating_add(now, period),
            period,
            grace,
            delay,
        }
    }

    /// Opens the window aligned to the period that contains `now`.
    ///
    /// If `now` lies exactly on a boundary, the window starts at `now`.
    pub fn aligned(
        now: DateTime<Utc>,
        period: TimeDelta,
        grace: TimeDelta,
        delay: TimeDelta,
    ) -> Self {
        Self::new(floor_to(now, period), period, grace, delay)
    }

    /// Start of the window, inclusive.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// End of the window, exclusive for aggregation but inclusive for admission.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Length of the window.
    pub fn period(&self) -> TimeDelta {
        self.period
    }

    /// Tolerance for points that arrive before the start.
    pub fn grace(&self) -> TimeDelta {
        self.grace
    }

    /// Tolerance for points that arrive after the end.
    pub fn delay(&self) -> TimeDelta {
        self.delay
    }

    /// Decides whether a point with the given timestamp belongs to this window.
    ///
    /// Both bounds are inclusive: `start - grace <= time <= end + delay`.
    pub fn admit(&self, time: DateTime<Utc>) -> Admission {
        let earliest = saturating_sub(self.start, self.grace);
        let latest = saturating_add(self.end, self.delay);

        if time < earliest || time > latest {
            Admission::Reject
        } else {
            Admission::Accept
        }
    }

    /// Moves the window forward and returns the new `(start, end)`.
    ///
    /// The next window is `[end, end + period)` as long as `now` lies within these bounds, compared
    /// at whole seconds. Otherwise, the window re-anchors to the period containing `now`.
    ///
    /// Must be called exactly once per push. Calling it twice skips a window.
    pub fn advance(&mut self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let mut start = self.end;
        let mut end = saturating_add(start, self.period);

        let now_secs = truncate_secs(now);
        if now_secs < truncate_secs(start) || now_secs > truncate_secs(end) {
            start = floor_to(now, self.period);
            end = saturating_add(start, self.period);
        }

        self.start = start;
        self.end = end;
        (start, end)
    }
}

fn saturating_add(time: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    time.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn saturating_sub(time: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    time.checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn truncate_secs(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}

fn total_nanos(secs: i64, nanos: i128) -> i128 {
    i128::from(secs) * NANOS_PER_SEC + nanos
}

/// Aligns `time` down to a multiple of `period` since the Unix epoch.
fn floor_to(time: DateTime<Utc>, period: TimeDelta) -> DateTime<Utc> {
    let period = total_nanos(period.num_seconds(), i128::from(period.subsec_nanos()));
    if period <= 0 {
        return time;
    }

    let nanos = total_nanos(time.timestamp(), i128::from(time.timestamp_subsec_nanos()));
    let floored = nanos - nanos.rem_euclid(period);

    let secs = i64::try_from(floored.div_euclid(NANOS_PER_SEC));
    let subsec = u32::try_from(floored.rem_euclid(NANOS_PER_SEC));
    match (secs, subsec) {
        (Ok(secs), Ok(subsec)) => DateTime::from_timestamp(secs, subsec).unwrap_or(time),
        _ => time,
    }
}
