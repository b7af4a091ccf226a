//! Wire-level header names and request-id stamping
//!
//! All names are lowercase; `HeaderMap` matching is case-insensitive so
//! callers may supply any casing.

use reqwest::header::{HeaderMap, HeaderValue};
use uuid::Uuid;

/// Stable id for one cluster request, client-supplied or generated.
pub const REQUEST_TRANSACTION_ID: &str = "x-request-transaction-id";

/// Fresh id stamped on every dispatch round (verification and apply rounds
/// carry different values).
pub const REQUEST_ID: &str = "x-request-id";

/// Present only on verification-round requests, always `150-NodeContinue`.
pub const VERIFY_INTENT: &str = "x-verify-intent";

/// Opaque envelope passed through when the caller supplies it.
pub const CLUSTER_CONTEXT: &str = "x-cluster-context";

/// Value of [`VERIFY_INTENT`] asking a node whether it can apply the request.
pub const NODE_CONTINUE: &str = "150-NodeContinue";

/// Sentinel status a node answers with to accept a verification.
pub const NODE_CONTINUE_CODE: u16 = 150;

/// Sentinel status a node answers with to reject a verification.
pub const EXPECTATION_FAILED_CODE: u16 = 417;

/// Return the transaction id from `headers`, generating and inserting a
/// fresh UUID when absent. The returned value is the RequestID for the life
/// of the cluster request.
pub fn ensure_transaction_id(headers: &mut HeaderMap) -> crate::Result<String> {
    if let Some(value) = headers.get(REQUEST_TRANSACTION_ID) {
        return value
            .to_str()
            .map(|s| s.to_string())
            .map_err(|_| crate::Error::InvalidArgument("transaction id is not valid UTF-8".into()));
    }

    let id = Uuid::new_v4().to_string();
    // UUIDs are always valid header values
    headers.insert(REQUEST_TRANSACTION_ID, HeaderValue::from_str(&id).unwrap());
    Ok(id)
}

/// Stamp a fresh per-attempt id, replacing any previous one.
pub fn stamp_attempt_id(headers: &mut HeaderMap) -> String {
    let id = Uuid::new_v4().to_string();
    headers.insert(REQUEST_ID, HeaderValue::from_str(&id).unwrap());
    id
}
