//! Operating-hours admission.
//!
//! A restaurant publishes its daily hours as two local wall-clock strings.
//! When `close <= open` the hours wrap past midnight, so the window opening on
//! local day `d` closes on day `d + 1`. A reservation is admissible when every
//! instant of it falls inside some daily window: it is clipped to each local
//! calendar day it touches, and each clipped portion must be covered by the
//! window opening that day or the one left over from the night before.
//!
//! Windows are closed at open and open at close: ending exactly at closing
//! time is admitted, starting exactly at opening time is admitted.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::model::*;

/// Zone every restaurant's wall-clock hours are interpreted in.
pub const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";

/// Offset used when the named zone cannot be resolved. Must agree with
/// `DEFAULT_TIMEZONE` on every date for the fallback to be exact.
pub const DEFAULT_FALLBACK_OFFSET_SECS: i32 = 8 * 3600;

/// The single, system-wide local calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl LocalZone {
    /// Resolve `name` as an IANA zone, falling back to a fixed offset.
    pub fn resolve(name: &str, fallback: FixedOffset) -> Self {
        match name.parse::<Tz>() {
            Ok(tz) => LocalZone::Named(tz),
            Err(e) => {
                warn!("unknown timezone {name:?} ({e}), using fixed offset {fallback}");
                LocalZone::Fixed(fallback)
            }
        }
    }

    /// Local calendar date of an instant. `None` if the instant is out of chrono's range.
    pub fn local_date(&self, t: Ms) -> Option<NaiveDate> {
        let utc = DateTime::<Utc>::from_timestamp_millis(t)?;
        Some(match self {
            LocalZone::Named(tz) => utc.with_timezone(tz).date_naive(),
            LocalZone::Fixed(offset) => utc.with_timezone(offset).date_naive(),
        })
    }

    /// Instant of a local date + wall-clock time.
    ///
    /// Ambiguous local times resolve to the earlier instant; a time inside a
    /// DST gap falls back to reading the wall clock as UTC.
    pub fn instant(&self, date: NaiveDate, time: NaiveTime) -> Ms {
        let naive = date.and_time(time);
        let resolved = match self {
            LocalZone::Named(tz) => naive.and_local_timezone(*tz).earliest().map(|dt| dt.timestamp_millis()),
            LocalZone::Fixed(offset) => naive
                .and_local_timezone(*offset)
                .earliest()
                .map(|dt| dt.timestamp_millis()),
        };
        resolved.unwrap_or_else(|| naive.and_utc().timestamp_millis())
    }
}

/// `DEFAULT_FALLBACK_OFFSET_SECS` as an offset.
pub fn default_fallback_offset() -> FixedOffset {
    FixedOffset::east_opt(DEFAULT_FALLBACK_OFFSET_SECS).unwrap_or(Utc.fix())
}

impl Default for LocalZone {
    fn default() -> Self {
        LocalZone::resolve(DEFAULT_TIMEZONE, default_fallback_offset())
    }
}

/// Parse "HH:MM" (24-hour). Extra components, non-numeric parts and
/// out-of-range values are `None`.
pub fn parse_clock(s: &str) -> Option<NaiveTime> {
    let (hour, minute) = s.trim().split_once(':')?;
    let hour: u32 = hour.trim().parse().ok()?;
    let minute: u32 = minute.trim().parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl OperatingHours {
    pub fn parse(open: &str, close: &str) -> Option<Self> {
        Some(Self {
            open: parse_clock(open)?,
            close: parse_clock(close)?,
        })
    }

    pub fn of(restaurant: &Restaurant) -> Option<Self> {
        Self::parse(&restaurant.open_time, &restaurant.close_time)
    }

    /// Close at or before open: the window ends on the following day.
    pub fn wraps_midnight(&self) -> bool {
        self.close <= self.open
    }

    /// The operating window that opens on local day `date`.
    fn window_opening_on(&self, zone: &LocalZone, date: NaiveDate) -> Option<Span> {
        let close_date = if self.wraps_midnight() { date.succ_opt()? } else { date };
        let start = zone.instant(date, self.open);
        let end = zone.instant(close_date, self.close);
        (start < end).then_some(Span { start, end })
    }

    /// True if every instant of `span` falls inside an operating window.
    pub fn admits(&self, zone: &LocalZone, span: Span) -> bool {
        if span.end <= span.start {
            return false;
        }
        let (Some(first), Some(last)) = (zone.local_date(span.start), zone.local_date(span.end)) else {
            return false;
        };

        let mut day = first;
        while day <= last {
            let Some(next) = day.succ_opt() else { return false };
            let day_start = zone.instant(day, NaiveTime::MIN);
            let day_end = zone.instant(next, NaiveTime::MIN);

            let portion_start = span.start.max(day_start);
            let portion_end = span.end.min(day_end);
            if portion_start < portion_end {
                let portion = Span { start: portion_start, end: portion_end };

                // Yesterday's window only reaches into today when the hours wrap.
                let mut windows: Vec<Span> = Vec::with_capacity(2);
                windows.extend(day.pred_opt().and_then(|prev| self.window_opening_on(zone, prev)));
                windows.extend(self.window_opening_on(zone, day));
                windows.sort_by_key(|w| w.start);

                let uncovered = subtract_intervals(&[portion], &merge_overlapping(&windows));
                if !uncovered.is_empty() {
                    debug!(
                        "out of hours on {day}: [{}, {}) uncovered",
                        uncovered[0].start, uncovered[0].end
                    );
                    return false;
                }
            }
            day = next;
        }
        true
    }
}

/// Operating-hours check for a restaurant. Fails closed on unparseable hours.
pub fn is_within_operating_hours(restaurant: &Restaurant, span: Span, zone: &LocalZone) -> bool {
    match OperatingHours::of(restaurant) {
        Some(hours) => hours.admits(zone, span),
        None => {
            debug!(
                "restaurant {} has malformed hours {:?}-{:?}",
                restaurant.id, restaurant.open_time, restaurant.close_time
            );
            false
        }
    }
}
