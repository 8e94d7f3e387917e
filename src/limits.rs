use crate::model::{HOUR_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest availability window a mentor may publish in one go.
pub const MAX_AVAILABILITY_SPAN_MS: Ms = 31 * 24 * HOUR_MS;

/// Default cap on pending or confirmed sessions a party has not yet had.
pub const MAX_LIVE_SESSIONS_PER_PARTY: usize = 50_000;

/// Default split between upcoming and archived sessions.
pub const DEFAULT_HORIZON_MS: Ms = 24 * HOUR_MS;

pub const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024;
