use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FrontierError, Result};
use crate::status;
use crate::util;

/// Scheduling tier of a single URI within its queue. Lower sorts first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SchedulingDirective {
    Highest = 0,
    High = 1,
    Medium = 2,
    Normal = 3,
}

impl Default for SchedulingDirective {
    fn default() -> Self {
        SchedulingDirective::Normal
    }
}

/// One step on the path from a seed to a URI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hop {
    Link,
    Embed,
    Redirect,
    Prerequisite,
    Speculative,
}

impl Hop {
    pub fn as_char(&self) -> char {
        match self {
            Hop::Link => 'L',
            Hop::Embed => 'E',
            Hop::Redirect => 'R',
            Hop::Prerequisite => 'P',
            Hop::Speculative => 'X',
        }
    }
}

/// Per-URI budget override, consulted when its queue's session balance is
/// replenished.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetOverride {
    pub session_budget: Option<i32>,
    pub total_budget: Option<i64>,
}

/// A crawl candidate and the state of its latest fetch attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrawlUri {
    uri: String,
    pub via: Option<String>,
    /// Hop characters from the seed, e.g. `LLE`. Empty for seeds.
    pub path_from_seed: String,
    pub class_key: Option<String>,
    /// Discovery sequence number, assigned by the frontier when zero.
    pub ordinal: u64,
    pub scheduling_directive: SchedulingDirective,
    pub precedence: i32,
    pub holder_cost: Option<i32>,
    pub is_seed: bool,
    pub force_fetch: bool,
    /// Retire this URI's queue when the URI finishes.
    pub force_retire: bool,

    pub fetch_status: i32,
    pub fetch_attempts: u32,
    /// Credentials were loaded for a retry after an auth challenge.
    pub has_credentials: bool,
    pub recorded_size: u64,
    pub fetch_began_ms: Option<i64>,
    pub fetch_completed_ms: Option<i64>,
    /// Politeness delay chosen by the fetcher; overrides the computed one.
    pub politeness_delay_ms: Option<u64>,
    /// Epoch ms at which a finished URI should be scheduled again.
    pub reschedule_time: Option<i64>,
    pub non_fatal_failures: Vec<String>,
    pub budget_override: Option<BudgetOverride>,

    #[serde(skip)]
    pub(crate) holder_key: Option<Vec<u8>>,
}

impl CrawlUri {
    pub fn new(uri: &str) -> Result<Self> {
        let parsed = Url::parse(uri.trim()).map_err(|e| FrontierError::uri(uri, e))?;
        Ok(Self {
            uri: parsed.to_string(),
            via: None,
            path_from_seed: String::new(),
            class_key: None,
            ordinal: 0,
            scheduling_directive: SchedulingDirective::Normal,
            precedence: 0,
            holder_cost: None,
            is_seed: false,
            force_fetch: false,
            force_retire: false,
            fetch_status: status::S_UNATTEMPTED,
            fetch_attempts: 0,
            has_credentials: false,
            recorded_size: 0,
            fetch_began_ms: None,
            fetch_completed_ms: None,
            politeness_delay_ms: None,
            reschedule_time: None,
            non_fatal_failures: vec![],
            budget_override: None,
            holder_key: None,
        })
    }

    /// A seed enters the crawl at MEDIUM so it is fetched ahead of
    /// ordinary discoveries on the same host.
    pub fn seed(uri: &str) -> Result<Self> {
        let mut curi = Self::new(uri)?;
        curi.is_seed = true;
        curi.scheduling_directive = SchedulingDirective::Medium;
        Ok(curi)
    }

    /// A URI discovered from `parent` by one `hop`. Relative references
    /// are resolved against the parent.
    pub fn discovered(parent: &CrawlUri, uri: &str, hop: Hop) -> Result<Self> {
        let absolute = util::join_url(parent.uri(), uri)?;
        let mut curi = Self::new(&absolute)?;
        curi.via = Some(parent.uri().to_owned());
        curi.path_from_seed = format!("{}{}", parent.path_from_seed, hop.as_char());
        Ok(curi)
    }

    /// Parse the `uri [hops [via]]` form written to journals and logs. A
    /// `-` field means empty.
    pub fn from_hops_via_string(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let uri = parts
            .next()
            .ok_or_else(|| FrontierError::Journal(line.to_owned()))?;
        let mut curi = Self::new(uri)?;
        if let Some(hops) = parts.next() {
            if hops != "-" {
                curi.path_from_seed = hops.to_owned();
            }
        }
        if let Some(via) = parts.next() {
            if via != "-" {
                curi.via = Some(via.to_owned());
            }
        }
        Ok(curi)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.uri).map_err(|e| FrontierError::uri(&self.uri, e))
    }

    pub fn flatten_via(&self) -> &str {
        self.via.as_deref().unwrap_or("")
    }

    fn last_hop(&self) -> Option<char> {
        self.path_from_seed.chars().last()
    }

    pub fn is_location(&self) -> bool {
        self.last_hop() == Some(Hop::Redirect.as_char())
    }

    pub fn is_prerequisite(&self) -> bool {
        self.last_hop() == Some(Hop::Prerequisite.as_char())
    }

    /// Number of trailing non-link hops.
    pub fn trans_hops(&self) -> usize {
        self.path_from_seed
            .chars()
            .rev()
            .take_while(|c| *c != Hop::Link.as_char())
            .count()
    }

    pub fn link_hops(&self) -> usize {
        self.path_from_seed
            .chars()
            .filter(|c| *c == Hop::Link.as_char())
            .count()
    }

    pub fn is_success(&self) -> bool {
        status::is_success(self.fetch_status)
    }

    /// Drop the state of one fetch attempt so a retry starts clean.
    pub fn processing_cleanup(&mut self) {
        self.fetch_began_ms = None;
        self.fetch_completed_ms = None;
        self.politeness_delay_ms = None;
        self.non_fatal_failures.clear();
    }

    /// Reduce a finished URI to what is needed to fetch it again later.
    pub fn reset_for_rescheduling(&mut self) {
        self.processing_cleanup();
        self.fetch_status = status::S_UNATTEMPTED;
        self.fetch_attempts = 0;
        self.recorded_size = 0;
        self.holder_key = None;
        self.holder_cost = None;
        self.force_retire = false;
    }

    /// `uri hops via`, the long form journal lines carry.
    pub fn hops_via_string(&self) -> String {
        let hops = if self.path_from_seed.is_empty() {
            "-"
        } else {
            &self.path_from_seed
        };
        let via = match self.via.as_deref() {
            Some(v) if !v.is_empty() => v,
            _ => "-",
        };
        format!("{} {} {}", self.uri, hops, via)
    }
}

impl fmt::Display for CrawlUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// Canonical form used as the uniqueness key.
pub fn canonicalize(uri: &str) -> Result<String> {
    let mut url = Url::parse(uri).map_err(|e| FrontierError::uri(uri, e))?;
    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }
    if let Some(host) = url.host_str() {
        let stripped = strip_www(host);
        if stripped.len() != host.len() {
            let stripped = stripped.to_owned();
            url.set_host(Some(&stripped))
                .map_err(|e| FrontierError::uri(uri, e))?;
        }
    }
    Ok(url.to_string())
}

fn strip_www(host: &str) -> &str {
    if host.len() > 4 && host[..3].eq_ignore_ascii_case("www") {
        let rest = &host[3..];
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        let rest = &rest[digits..];
        if let Some(stripped) = rest.strip_prefix('.') {
            if stripped.contains('.') {
                return stripped;
            }
        }
    }
    host
}

/// Canonicalize with redirect awareness: a redirect whose via canonicalizes
/// to the same string is marked force-fetch so it is not mistaken for
/// already seen.
pub fn canonicalize_curi(curi: &mut CrawlUri) -> Result<String> {
    let canon = canonicalize(curi.uri())?;
    if curi.is_location() {
        if let Some(via) = curi.via.as_deref() {
            if via != curi.uri() && canonicalize(via).ok().as_deref() == Some(canon.as_str()) {
                curi.force_fetch = true;
            }
        }
    }
    Ok(canon)
}

/// SURT-ordered authority of a url, e.g. `com,example,www,` for
/// `http://www.example.com/`. Explicit ports are appended as `#port`.
pub fn surt_authority(url: &Url) -> Option<String> {
    let host = util::get_host(url)?;
    let is_ip = host.parse::<std::net::IpAddr>().is_ok() || host.starts_with('[');
    let mut surt = if is_ip {
        host.clone()
    } else {
        let mut labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
        labels.reverse();
        let mut s = labels.join(",");
        s.push(',');
        s
    };
    if let Some(port) = url.port() {
        surt.push('#');
        surt.push_str(&port.to_string());
    }
    Some(surt)
}

/// True when some path segment looks like a calendar step (a year followed
/// by a month or day segment).
pub(crate) fn has_calendar_path(url: &Url) -> bool {
    static CALENDAR: OnceLock<Option<Regex>> = OnceLock::new();
    let re = CALENDAR.get_or_init(|| {
        Regex::new(r"/(19|20)\d\d/(0?[1-9]|1[0-2]|[0-3]?\d)(/|$)").ok()
    });
    match re {
        Some(re) => re.is_match(url.path()),
        None => false,
    }
}
