//! WKO Kubernetes Operator
//!
//! This crate provides a Kubernetes operator that reconciles `Domain`
//! resources: an admin server plus clusters of managed servers, optionally
//! created on a persistent volume by a one-shot job.
//!
//! Each Domain change starts a make-right fiber on the [`wko_core`] engine.
//! The fiber verifies the operator's webhook identity, ensures storage and
//! the creation job, starts the admin server and scales every cluster to its
//! replica limit while keeping the cluster's routing set in step with the
//! pods that are actually live.
//!
//! # Custom Resource Definitions
//!
//! - **Domain**: a clustered application server topology
//!
//! # Example
//!
//! ```yaml
//! apiVersion: weblogic.oracle/v2
//! kind: Domain
//! metadata:
//!   name: domain1
//! spec:
//!   domainUID: domain1
//!   domainName: base_domain
//!   replicas: 2
//!   clusterStartup:
//!     - clusterName: cluster-1
//!       replicas: 4
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod identity;
pub mod observability;
pub mod resources;
pub mod routing;
pub mod steps;
pub mod testing;
pub mod watch;

pub use cache::WatchCache;
pub use client::{ApiBackend, ClusterClient, KubeBackend};
pub use config::{OperatorConfig, ScaleDownPolicy};
pub use controller::{DomainProcessor, OperatorContext};
pub use crd::{Domain, DomainSpec, DomainStatus};
pub use error::{OperatorError, OperatorResult};
pub use watch::{WatchConsumer, WatchEvent};
