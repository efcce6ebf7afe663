use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ADDRESS_LEN: usize = 1024;
pub const MAX_USER_ID_LEN: usize = 256;

pub const MAX_GUESTS: u32 = 1000;
pub const MAX_TABLE_CAPACITY: u32 = MAX_GUESTS;
pub const MAX_TABLES_PER_RESTAURANT: usize = 4096;

const DAY_MS: Ms = 86_400_000;

/// Longest single reservation. Also bounds the day loop of the hours check.
pub const MAX_RESERVATION_DURATION_MS: Ms = 7 * DAY_MS;

/// Widest window accepted by an overlap query.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
