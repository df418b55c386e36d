//! Test doubles for the operator.
//!
//! Production code receives the cluster, identity generator and traffic
//! probe through [`OperatorContext`](crate::controller::OperatorContext);
//! tests pass these instead.
//!
//! # Example
//!
//! ```ignore
//! use wko_core::providers::{MemoryFs, MockClock};
//! use wko_operator::testing::{FakeCluster, StaticIdentityGenerator};
//!
//! let clock = Arc::new(MockClock::fixed("2024-01-15T10:30:00Z"));
//! let fake = Arc::new(FakeCluster::new(clock.clone()));
//! let ctx = OperatorContext::new(fake.clone(), OperatorConfig::default())
//!     .with_clock(clock)
//!     .with_fs(Arc::new(MemoryFs::new()))
//!     .with_identity_generator(Arc::new(StaticIdentityGenerator::new()));
//! ```

mod doubles;
mod fake_cluster;

pub use doubles::{FakeTrafficProbe, ProbeRecord, StaticIdentityGenerator};
pub use fake_cluster::{
    merge_patch, ApiCall, ApiOp, FailureRule, FakeCluster, JobLifecycle, PodLifecycle,
};
