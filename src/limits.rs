use crate::model::{Ms, HOUR_MS};

/// Cancellation is allowed until this long before the scheduled time.
pub const CANCELLATION_WINDOW_MS: Ms = 2 * HOUR_MS;

/// Fixed page size for appointment and notification listings.
pub const PAGE_SIZE: usize = 5;

pub const MAX_NOTIFICATION_CONTENT_LEN: usize = 1024;

/// Largest request body the HTTP layer accepts.
pub const MAX_BODY_BYTES: usize = 16 * 1024;

/// Pending appends buffered in front of each WAL writer.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;

/// Per-provider broadcast buffer for live notifications.
pub const NOTIFY_CHANNEL_CAPACITY: usize = 256;

/// Lowest page number; `page=0` is treated as the first page.
pub const FIRST_PAGE: usize = 1;
