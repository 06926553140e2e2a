use std::time::{SystemTime, UNIX_EPOCH};

/// The current UNIX time in whole seconds, used for DNS cache expiry bookkeeping.
pub fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before UNIX epoch").as_secs()
}
