use chrono::Utc;
use url::Url;

use crate::error::{FrontierError, Result};

/// Join base url with another (possibly relative) url
pub fn join_url(current_url: &str, url: &str) -> Result<String> {
    let base = Url::parse(current_url)
        .map_err(|e| FrontierError::uri(current_url, e))?;
    let joined = base.join(url).map_err(|e| FrontierError::uri(url, e))?;
    Ok(joined.to_string())
}

/// Host of a parsed url. `dns:` urls carry their host in the path.
pub fn get_host(url: &Url) -> Option<String> {
    if url.scheme() == "dns" {
        let host = url.path().trim();
        if host.is_empty() {
            return None;
        }
        return Some(host.to_lowercase());
    }
    url.host_str().map(|x| x.to_lowercase())
}

/// Host plus a `#port` suffix when the port is explicit and not the
/// scheme's default.
pub fn get_authority_key(url: &Url) -> Option<String> {
    let host = get_host(url)?;
    match url.port() {
        Some(port) => Some(format!("{}#{}", host, port)),
        None => Some(host),
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn read_be_u64(input: &mut &[u8]) -> Option<u64> {
    if input.len() < std::mem::size_of::<u64>() {
        return None;
    }
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    int_bytes.try_into().ok().map(u64::from_be_bytes)
}
