use rand::Rng;
use std::time::Duration;

pub mod endpoint;
pub mod key;
pub mod reliable;
pub mod timer;
pub mod transaction;
pub use endpoint::EndpointBuilder;
pub use transaction::{TransactionState, TransactionType};
#[cfg(test)]
mod tests;

/// RFC 3261 timer defaults. The endpoint option carries the live
/// values; these are only what `Default` fills in.
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_millis(4000);
pub const T4: Duration = Duration::from_millis(5000);
/// Transaction timeout, 64*T1.
pub const T1X64: Duration = Duration::from_millis(64 * 500);

pub(crate) const BRANCH_LEN: usize = 12;
pub(crate) const TAG_LEN: usize = 8;
pub(crate) const CALL_ID_LEN: usize = 22;

pub fn random_text(count: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn make_tag() -> rsip::param::Tag {
    rsip::param::Tag::new(random_text(TAG_LEN))
}

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(rsip::param::Branch::new(format!(
        "z9hG4bK{}",
        random_text(BRANCH_LEN)
    )))
}

pub fn make_call_id(suffix: Option<&str>) -> rsip::headers::CallId {
    match suffix {
        Some(suffix) => format!("{}@{}", random_text(CALL_ID_LEN), suffix).into(),
        None => random_text(CALL_ID_LEN).into(),
    }
}
