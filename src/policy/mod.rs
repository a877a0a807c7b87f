//! Pluggable decisions the frontier delegates: which queue a URI joins, what
//! it costs, how urgent it and its queue are, and whether a failed attempt
//! goes around again.

pub mod assignment;
pub mod cost;
pub mod precedence;
pub mod retry;

pub use assignment::{
    AssignmentConfig, AssignmentKind, AuthorityAssignment, QueueAssignmentPolicy, Reduction,
    ServerCache, DEFAULT_CLASS_KEY,
};
pub use cost::{CostAssignmentPolicy, CostPolicyKind};
pub use precedence::{PrecedenceProvider, QueuePrecedencePolicy, Stage, UriPrecedencePolicy};
pub use retry::{CredentialRetry, RetryPredicate};
