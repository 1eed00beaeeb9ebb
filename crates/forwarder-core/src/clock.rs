//! Wall-clock helpers shared by every component that stamps a `ClientRequest`,
//! a `ServerResponse`, or a `PendingRequest`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before Unix epoch")
		.as_millis() as u64
}

/// Microseconds since the Unix epoch.
pub fn now_us() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before Unix epoch")
		.as_micros() as u64
}
