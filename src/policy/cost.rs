use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::uri::{self, CrawlUri};

/// Budget units a URI charges against its queue.
pub trait CostAssignmentPolicy: Send + Sync {
    fn cost_of(&self, curi: &CrawlUri) -> i32;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostPolicyKind {
    #[default]
    Unit,
    Zero,
    Wag,
}

impl CostPolicyKind {
    pub fn build(&self) -> Box<dyn CostAssignmentPolicy> {
        match self {
            CostPolicyKind::Unit => Box::new(UnitCost),
            CostPolicyKind::Zero => Box::new(ZeroCost),
            CostPolicyKind::Wag => Box::new(WagCost),
        }
    }
}

pub struct UnitCost;

impl CostAssignmentPolicy for UnitCost {
    fn cost_of(&self, _curi: &CrawlUri) -> i32 {
        1
    }
}

/// Disables budgeting entirely.
pub struct ZeroCost;

impl CostAssignmentPolicy for ZeroCost {
    fn cost_of(&self, _curi: &CrawlUri) -> i32 {
        0
    }
}

/// Charges more for URIs that tend to be crawler traps.
pub struct WagCost;

impl CostAssignmentPolicy for WagCost {
    fn cost_of(&self, curi: &CrawlUri) -> i32 {
        let mut cost = 1;
        let url = match curi.url() {
            Ok(url) => url,
            Err(_) => return cost,
        };
        if url.query().is_some() {
            cost += 1;
        }
        if uri::has_calendar_path(&url) {
            cost += 1;
        }
        let mut seen = HashSet::new();
        let repeats = url
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .any(|s| !seen.insert(s.to_owned()))
            })
            .unwrap_or(false);
        if repeats {
            cost += 1;
        }
        cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cost(policy: &dyn CostAssignmentPolicy, uri: &str) -> i32 {
        policy.cost_of(&CrawlUri::new(uri).unwrap())
    }

    #[test]
    fn wag_penalises_traps() {
        assert_eq!(cost(&WagCost, "http://a.example/page"), 1);
        assert_eq!(cost(&WagCost, "http://a.example/page?id=3"), 2);
        assert_eq!(cost(&WagCost, "http://a.example/events/2019/12/"), 2);
        assert_eq!(cost(&WagCost, "http://a.example/a/b/a/b?x"), 3);
    }

    #[test]
    fn unit_and_zero() {
        assert_eq!(cost(&UnitCost, "http://a.example/?q"), 1);
        assert_eq!(cost(&ZeroCost, "http://a.example/?q"), 0);
        assert_eq!(cost(CostPolicyKind::Wag.build().as_ref(), "http://a.example/x?y"), 2);
    }
}
