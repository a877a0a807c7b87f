//! Fetch status codes carried on a [`CrawlUri`](crate::CrawlUri).
//!
//! Positive values are protocol results (HTTP status, DNS success) and count
//! as success; zero means unattempted; negative values are crawler-assigned
//! outcomes.

pub const S_UNATTEMPTED: i32 = 0;
pub const S_DNS_SUCCESS: i32 = 1;

pub const S_DOMAIN_UNRESOLVABLE: i32 = -1;
pub const S_CONNECT_FAILED: i32 = -2;
pub const S_CONNECT_LOST: i32 = -3;
pub const S_TIMEOUT: i32 = -4;
pub const S_RUNTIME_EXCEPTION: i32 = -5;
pub const S_DOMAIN_PREREQUISITE_FAILURE: i32 = -6;
pub const S_UNFETCHABLE_URI: i32 = -7;
pub const S_TOO_MANY_RETRIES: i32 = -8;
pub const S_DEFERRED: i32 = -50;
pub const S_UNQUEUEABLE: i32 = -60;
pub const S_ROBOTS_PREREQUISITE_FAILURE: i32 = -61;
pub const S_OTHER_PREREQUISITE_FAILURE: i32 = -62;
pub const S_PREREQUISITE_UNSCHEDULABLE_FAILURE: i32 = -63;
pub const S_DEEMED_NOT_FOUND: i32 = -404;
pub const S_SERIOUS_ERROR: i32 = -3000;
pub const S_DEEMED_CHAFF: i32 = -4000;
pub const S_TOO_MANY_LINK_HOPS: i32 = -4001;
pub const S_TOO_MANY_EMBED_HOPS: i32 = -4002;
pub const S_OUT_OF_SCOPE: i32 = -5000;
pub const S_BLOCKED_BY_USER: i32 = -5001;
pub const S_BLOCKED_BY_CUSTOM_PROCESSOR: i32 = -5002;
pub const S_BLOCKED_BY_QUOTA: i32 = -5003;
pub const S_BLOCKED_BY_RUNTIME_LIMIT: i32 = -5004;
pub const S_DELETED_BY_USER: i32 = -6000;
pub const S_PROCESSING_THREAD_KILLED: i32 = -7000;
pub const S_ROBOTS_PRECLUDED: i32 = -9998;

pub const HTTP_UNAUTHORIZED: i32 = 401;

pub fn is_success(status: i32) -> bool {
    status > 0
}

/// Outcomes where the crawler scheduled the URI but deliberately set it
/// aside afterwards. These are neither successes nor failures.
pub fn is_disregard(status: i32) -> bool {
    matches!(
        status,
        S_ROBOTS_PRECLUDED
            | S_BLOCKED_BY_CUSTOM_PROCESSOR
            | S_OUT_OF_SCOPE
            | S_BLOCKED_BY_USER
            | S_TOO_MANY_EMBED_HOPS
            | S_TOO_MANY_LINK_HOPS
            | S_DELETED_BY_USER
    )
}

/// Connect-class failures are the only retries that wait out a delay.
pub fn is_connect_class(status: i32) -> bool {
    matches!(
        status,
        S_CONNECT_FAILED | S_CONNECT_LOST | S_DOMAIN_UNRESOLVABLE
    )
}

pub fn is_recoverable(status: i32) -> bool {
    status == S_DEFERRED || is_connect_class(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_outcomes() {
        assert!(is_success(200));
        assert!(is_success(S_DNS_SUCCESS));
        assert!(!is_success(S_UNATTEMPTED));
        assert!(is_disregard(S_ROBOTS_PRECLUDED));
        assert!(!is_disregard(S_RUNTIME_EXCEPTION));
        assert!(is_recoverable(S_DEFERRED));
        assert!(!is_connect_class(S_DEFERRED));
        assert!(is_connect_class(S_CONNECT_LOST));
        assert!(!is_recoverable(S_TIMEOUT));
    }
}
