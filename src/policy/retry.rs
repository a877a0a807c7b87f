use crate::config::Config;
use crate::status::{self, HTTP_UNAUTHORIZED};
use crate::uri::CrawlUri;

/// Extra retry conditions beyond the built-in recoverable statuses.
pub trait RetryPredicate: Send + Sync {
    fn should_retry(&self, curi: &CrawlUri) -> bool;
}

/// Retries an auth challenge only when credentials were loaded for the
/// next attempt.
pub struct CredentialRetry;

impl RetryPredicate for CredentialRetry {
    fn should_retry(&self, curi: &CrawlUri) -> bool {
        if curi.fetch_status != HTTP_UNAUTHORIZED {
            return false;
        }
        if !curi.has_credentials {
            log::info!("Have 401 but no credentials loaded {}", curi);
        }
        curi.has_credentials
    }
}

/// `fetch_attempts` already counts the attempt being judged, so a URI is
/// retried `max_retries` times and fails on the attempt after that.
pub fn needs_retrying(config: &Config, predicate: &dyn RetryPredicate, curi: &CrawlUri) -> bool {
    if curi.fetch_attempts > config.max_retries {
        return false;
    }
    // a URI handed back with no attempt recorded goes around again
    curi.fetch_status == status::S_UNATTEMPTED
        || status::is_recoverable(curi.fetch_status)
        || predicate.should_retry(curi)
}

/// Seconds to snooze a queue before retrying its head.
pub fn retry_delay_for(config: &Config, curi: &CrawlUri) -> u64 {
    if status::is_connect_class(curi.fetch_status) {
        config.retry_delay_seconds
    } else {
        0
    }
}

/// Milliseconds a queue must wait after this fetch before serving again.
pub fn politeness_delay_for(config: &Config, curi: &CrawlUri) -> u64 {
    if let Some(delay) = curi.politeness_delay_ms {
        return delay;
    }
    let (began, completed) = match (curi.fetch_began_ms, curi.fetch_completed_ms) {
        (Some(b), Some(c)) => (b, c),
        _ => return 0,
    };
    let taken = (completed - began).max(0) as f64;
    let mut wait = (config.delay_factor * taken) as u64;
    if wait < config.min_delay_ms {
        wait = config.min_delay_ms;
    }
    if wait > config.max_delay_ms {
        wait = config.max_delay_ms;
    }
    wait
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::*;

    fn curi_with(status: i32, attempts: u32) -> CrawlUri {
        let mut curi = CrawlUri::new("http://a.example/").unwrap();
        curi.fetch_status = status;
        curi.fetch_attempts = attempts;
        curi
    }

    #[test]
    fn retry_ceiling() {
        let config = Config {
            max_retries: 3,
            ..Config::default()
        };
        assert!(needs_retrying(&config, &CredentialRetry, &curi_with(S_CONNECT_FAILED, 3)));
        assert!(!needs_retrying(&config, &CredentialRetry, &curi_with(S_CONNECT_FAILED, 4)));
        assert!(!needs_retrying(&config, &CredentialRetry, &curi_with(404, 1)));
        assert!(needs_retrying(&config, &CredentialRetry, &curi_with(S_UNATTEMPTED, 1)));
    }

    #[test]
    fn unauthorized_needs_credentials() {
        let config = Config::default();
        let mut curi = curi_with(HTTP_UNAUTHORIZED, 1);
        assert!(!needs_retrying(&config, &CredentialRetry, &curi));
        curi.has_credentials = true;
        assert!(needs_retrying(&config, &CredentialRetry, &curi));
    }

    #[test]
    fn retry_delay_only_for_connect_failures() {
        let config = Config::default();
        assert_eq!(retry_delay_for(&config, &curi_with(S_CONNECT_LOST, 1)), 900);
        assert_eq!(retry_delay_for(&config, &curi_with(S_DEFERRED, 1)), 0);
    }

    #[test]
    fn politeness_delay_is_clamped() {
        let config = Config::default();
        let mut curi = curi_with(200, 1);
        assert_eq!(politeness_delay_for(&config, &curi), 0);
        curi.fetch_began_ms = Some(1_000);
        curi.fetch_completed_ms = Some(1_100);
        assert_eq!(politeness_delay_for(&config, &curi), 3_000);
        curi.fetch_completed_ms = Some(2_000);
        assert_eq!(politeness_delay_for(&config, &curi), 5_000);
        curi.fetch_completed_ms = Some(61_000);
        assert_eq!(politeness_delay_for(&config, &curi), 30_000);
        curi.politeness_delay_ms = Some(7);
        assert_eq!(politeness_delay_for(&config, &curi), 7);
    }
}
