use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use fasthash::FastHash;
use fasthash::xx::Hash64;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FrontierError, Result};
use crate::uri::{self, CrawlUri};
use crate::util;

/// Key used when nothing better can be derived from a URI.
pub const DEFAULT_CLASS_KEY: &str = "default...";

/// Above this many possible keys, queue state is expected to live on disk.
pub const MAX_QUEUES_TO_HOLD_ALLQUEUES_IN_MEMORY: usize = 3000;

const RING_REPLICAS: usize = 128;

/// Maps a URI to the class key of the queue that should hold it.
pub trait QueueAssignmentPolicy: Send + Sync {
    fn class_key(&self, curi: &CrawlUri) -> String;

    /// Upper bound on distinct keys this policy can produce, if known.
    fn maximum_number_of_keys(&self) -> Option<usize> {
        None
    }
}

impl<F> QueueAssignmentPolicy for F
where
    F: Fn(&CrawlUri) -> String + Send + Sync,
{
    fn class_key(&self, curi: &CrawlUri) -> String {
        self(curi)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    #[default]
    Hostname,
    Ip,
    SurtAuthority,
    Bucket,
}

/// How far a host is cut down before it becomes a key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    None,
    /// Registrable domain, e.g. `example.co.uk` for `www.example.co.uk`.
    Topmost,
    /// Keep this many labels from the top of the domain.
    Depth(usize),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub kind: AssignmentKind,
    pub reduction: Reduction,
    /// Split each key into this many sub-queues by path and query.
    pub parallel_queues: u32,
    /// Keep a URI's existing class key rather than recomputing it.
    pub defer_to_previous: bool,
    /// Number of buckets for [`AssignmentKind::Bucket`].
    pub buckets: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            kind: AssignmentKind::Hostname,
            reduction: Reduction::None,
            parallel_queues: 1,
            defer_to_previous: true,
            buckets: 1000,
        }
    }
}

/// Host to address map filled in by whatever resolves DNS.
#[derive(Clone, Default)]
pub struct ServerCache {
    inner: Arc<RwLock<HashMap<String, IpAddr>>>,
}

impl ServerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_resolved(&self, host: &str, ip: IpAddr) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(host.to_lowercase(), ip);
    }

    pub fn ip_for(&self, host: &str) -> Option<IpAddr> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(host).copied()
    }
}

/// Hostname, IP, SURT and bucket assignment share everything but the core
/// key derivation.
pub struct AuthorityAssignment {
    config: AssignmentConfig,
    conhash: ConsistentHash,
    servers: ServerCache,
}

impl AuthorityAssignment {
    pub fn new(config: AssignmentConfig, servers: ServerCache) -> Result<Self> {
        if config.parallel_queues == 0 {
            return Err(FrontierError::config("parallel_queues must be at least 1"));
        }
        if config.kind == AssignmentKind::Bucket && config.buckets == 0 {
            return Err(FrontierError::config("buckets must be at least 1"));
        }
        let conhash = ConsistentHash::new(config.parallel_queues);
        Ok(Self {
            config,
            conhash,
            servers,
        })
    }

    fn basis_url(curi: &CrawlUri) -> Option<Url> {
        // prerequisites queue with the URI that needed them
        if curi.is_prerequisite() {
            if let Some(via) = curi.via.as_deref() {
                if let Ok(url) = Url::parse(via) {
                    return Some(url);
                }
            }
        }
        curi.url().ok()
    }

    fn core_key(&self, basis: &Url) -> Option<String> {
        let host = util::get_host(basis)?;
        let port = basis.port().map(|p| format!("#{}", p)).unwrap_or_default();
        match self.config.kind {
            AssignmentKind::Hostname => {
                Some(format!("{}{}", reduce_host(&host, self.config.reduction), port))
            }
            AssignmentKind::Ip => match self.servers.ip_for(&host) {
                Some(ip) => Some(format!("{}{}", ip, port)),
                None => Some(format!("{}{}", reduce_host(&host, self.config.reduction), port)),
            },
            AssignmentKind::SurtAuthority => {
                let reduced = reduce_host(&host, self.config.reduction);
                let mut url = basis.clone();
                if basis.scheme() == "dns" || url.set_host(Some(&reduced)).is_err() {
                    return uri::surt_authority(basis);
                }
                uri::surt_authority(&url)
            }
            AssignmentKind::Bucket => {
                let reduced = reduce_host(&host, self.config.reduction);
                let bucket = Hash64::hash(reduced.as_bytes()) % self.config.buckets as u64;
                Some(bucket.to_string())
            }
        }
    }
}

impl QueueAssignmentPolicy for AuthorityAssignment {
    fn class_key(&self, curi: &CrawlUri) -> String {
        if self.config.defer_to_previous {
            if let Some(key) = curi.class_key.as_deref() {
                if !key.is_empty() {
                    return key.to_owned();
                }
            }
        }
        let basis = match Self::basis_url(curi) {
            Some(basis) => basis,
            None => return DEFAULT_CLASS_KEY.to_owned(),
        };
        let mut candidate = match self.core_key(&basis) {
            Some(key) if !key.is_empty() => key,
            _ => return DEFAULT_CLASS_KEY.to_owned(),
        };
        if self.config.parallel_queues > 1 {
            let path_query = match basis.query() {
                Some(q) => format!("{}?{}", basis.path(), q),
                None => basis.path().to_owned(),
            };
            let subqueue = self.conhash.bucket_for(&path_query);
            if subqueue > 0 {
                candidate.push('+');
                candidate.push_str(&subqueue.to_string());
            }
        }
        candidate
    }

    fn maximum_number_of_keys(&self) -> Option<usize> {
        match self.config.kind {
            AssignmentKind::Bucket => {
                Some(self.config.buckets as usize * self.config.parallel_queues as usize)
            }
            _ => None,
        }
    }
}

fn reduce_host(host: &str, reduction: Reduction) -> String {
    if host.parse::<IpAddr>().is_ok() || host.starts_with('[') {
        return host.to_owned();
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    let keep = match reduction {
        Reduction::None => return host.to_owned(),
        Reduction::Topmost => topmost_label_count(&labels),
        Reduction::Depth(n) => n.max(1),
    };
    if labels.len() <= keep {
        return host.to_owned();
    }
    labels[labels.len() - keep..].join(".")
}

/// Labels in the registrable domain. Two-letter country suffixes with a
/// generic second level (`co.uk`, `com.au`) need three.
fn topmost_label_count(labels: &[&str]) -> usize {
    const SECOND_LEVELS: [&str; 9] = ["co", "com", "org", "net", "ac", "gov", "edu", "ne", "or"];
    if labels.len() >= 3 {
        let tld = labels[labels.len() - 1];
        let sld = labels[labels.len() - 2];
        if tld.len() == 2 && SECOND_LEVELS.contains(&sld) {
            return 3;
        }
    }
    2
}

/// Maps strings onto `0..buckets` so that most strings keep their bucket
/// when the bucket count changes.
struct ConsistentHash {
    ring: BTreeMap<u64, u32>,
}

impl ConsistentHash {
    fn new(buckets: u32) -> Self {
        let mut ring = BTreeMap::new();
        for bucket in 0..buckets {
            let mut rng = ChaCha8Rng::seed_from_u64(bucket as u64);
            for _ in 0..RING_REPLICAS {
                ring.insert(rng.next_u64(), bucket);
            }
        }
        Self { ring }
    }

    fn bucket_for(&self, s: &str) -> u32 {
        let point = Hash64::hash(s.as_bytes());
        self.ring
            .range(point..)
            .chain(self.ring.iter())
            .next()
            .map(|(_, bucket)| *bucket)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(config: AssignmentConfig) -> AuthorityAssignment {
        AuthorityAssignment::new(config, ServerCache::new()).unwrap()
    }

    fn key(policy: &dyn QueueAssignmentPolicy, uri: &str) -> String {
        policy.class_key(&CrawlUri::new(uri).unwrap())
    }

    #[test]
    fn hostname_keys() {
        let p = policy(AssignmentConfig::default());
        assert_eq!(key(&p, "http://a.example/1"), "a.example");
        assert_eq!(key(&p, "http://A.Example:8080/1"), "a.example#8080");
        assert_eq!(key(&p, "dns:b.example"), "b.example");
    }

    #[test]
    fn reductions() {
        let p = policy(AssignmentConfig {
            reduction: Reduction::Topmost,
            ..AssignmentConfig::default()
        });
        assert_eq!(key(&p, "http://www.news.example.co.uk/"), "example.co.uk");
        assert_eq!(key(&p, "http://www.example.com/"), "example.com");
        let p = policy(AssignmentConfig {
            reduction: Reduction::Depth(3),
            ..AssignmentConfig::default()
        });
        assert_eq!(key(&p, "http://a.b.c.example.org/"), "c.example.org");
    }

    #[test]
    fn surt_keys() {
        let p = policy(AssignmentConfig {
            kind: AssignmentKind::SurtAuthority,
            ..AssignmentConfig::default()
        });
        assert_eq!(key(&p, "http://www.example.com/x"), "com,example,www,");
    }

    #[test]
    fn ip_keys_fall_back_to_host() {
        let servers = ServerCache::new();
        let p = AuthorityAssignment::new(
            AssignmentConfig {
                kind: AssignmentKind::Ip,
                defer_to_previous: false,
                ..AssignmentConfig::default()
            },
            servers.clone(),
        )
        .unwrap();
        assert_eq!(key(&p, "http://a.example/"), "a.example");
        servers.note_resolved("a.example", "10.1.2.3".parse().unwrap());
        assert_eq!(key(&p, "http://a.example/"), "10.1.2.3");
    }

    #[test]
    fn bucket_keys_are_bounded() {
        let p = policy(AssignmentConfig {
            kind: AssignmentKind::Bucket,
            buckets: 4,
            ..AssignmentConfig::default()
        });
        let k: u32 = key(&p, "http://a.example/").parse().unwrap();
        assert!(k < 4);
        assert_eq!(key(&p, "http://a.example/"), key(&p, "http://a.example/other"));
        assert_eq!(p.maximum_number_of_keys(), Some(4));
    }

    #[test]
    fn parallel_queues_split_by_path() {
        let p = policy(AssignmentConfig {
            parallel_queues: 4,
            ..AssignmentConfig::default()
        });
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            let k = key(&p, &format!("http://a.example/page/{}", i));
            assert!(k == "a.example" || k.starts_with("a.example+"));
            seen.insert(k);
        }
        assert!(seen.len() > 1);
        assert_eq!(key(&p, "http://a.example/x?y=1"), key(&p, "http://a.example/x?y=1"));
    }

    #[test]
    fn prerequisites_follow_via_and_previous_key_sticks() {
        let p = policy(AssignmentConfig::default());
        let mut curi = CrawlUri::new("dns:b.example").unwrap();
        curi.via = Some("http://a.example/".to_owned());
        curi.path_from_seed = "P".to_owned();
        assert_eq!(p.class_key(&curi), "a.example");

        let mut curi = CrawlUri::new("http://a.example/").unwrap();
        curi.class_key = Some("elsewhere".to_owned());
        assert_eq!(p.class_key(&curi), "elsewhere");
    }

    #[test]
    fn closures_are_policies() {
        let p = |_: &CrawlUri| "fixed".to_owned();
        assert_eq!(key(&p, "http://a.example/"), "fixed");
    }
}
