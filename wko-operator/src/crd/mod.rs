//! Custom Resource Definitions for the WKO domain operator.
//!
//! - [`Domain`]: a clustered application server topology

mod domain;

pub use domain::{
    ClusterStartup, ClusterStatus, Domain, DomainPhase, DomainSpec, DomainStatus, DomainStorage,
    EffectiveServerSpec, EnvVarSpec, ServerStartup, ServerStatus, StartupControl,
};
