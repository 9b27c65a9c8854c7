use crate::model::{DAY_MS, Ms};

pub const MAX_TENANTS: usize = 1024;
pub const MAX_INTERVALS_PER_RESOURCE: usize = 100_000;
pub const MAX_BOOKING_DURATION_MS: Ms = 31 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 400 * DAY_MS;
pub const MAX_BUFFER_MINUTES: u32 = 24 * 60;
pub const MAX_TEXT_LEN: usize = 4096;
pub const MAX_WAITLIST_CANDIDATES: usize = 64;

/// Ceiling on occurrences a single pattern expansion may produce.
pub const DEFAULT_MAX_OCCURRENCES: usize = 2000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
