use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Remove every sorted, disjoint span in `to_remove` from the sorted spans in `base`.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
}

/// Who is making a request. Supplied by the transport, used for attribution
/// and the owner-or-admin check on cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), role: Role::User }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restaurant {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    /// Local wall-clock "HH:MM".
    pub open_time: String,
    /// Local wall-clock "HH:MM". At or before `open_time` means the hours wrap past midnight.
    pub close_time: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: Ulid,
    pub restaurant_id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub created_at: Ms,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub restaurant_id: Ulid,
    pub table_id: Ulid,
    pub user_id: String,
    pub span: Span,
    pub guests: u32,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

/// Scope and window of an overlap query. Every `None` scope field means
/// "no restriction on that dimension". The window is kept as two raw bounds
/// rather than a `Span` because empty or inverted windows are legal input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub restaurant_id: Option<Ulid>,
    pub table_id: Option<Ulid>,
    pub user_id: Option<String>,
    pub window_start: Ms,
    pub window_end: Ms,
}

impl ReservationFilter {
    pub fn window(window_start: Ms, window_end: Ms) -> Self {
        Self { window_start, window_end, ..Default::default() }
    }

    pub fn for_table(restaurant_id: Ulid, table_id: Ulid, span: Span) -> Self {
        Self {
            restaurant_id: Some(restaurant_id),
            table_id: Some(table_id),
            user_id: None,
            window_start: span.start,
            window_end: span.end,
        }
    }

    /// The overlap predicate: active, in scope, and `s < window_end ∧ e > window_start`.
    pub fn matches(&self, r: &Reservation) -> bool {
        r.is_active()
            && self.restaurant_id.is_none_or(|id| id == r.restaurant_id)
            && self.table_id.is_none_or(|id| id == r.table_id)
            && self.user_id.as_deref().is_none_or(|u| u == r.user_id)
            && r.span.start < self.window_end
            && r.span.end > self.window_start
    }
}

/// One row of an availability answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableTable {
    pub table_id: Ulid,
    pub capacity: u32,
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RestaurantCreated(Restaurant),
    TableCreated(Table),
    ReservationCreated(Reservation),
    ReservationCancelled { id: Ulid },
}
