//! Domain reconciliation.
//!
//! - [`OperatorContext`]: shared dependencies handed to every step
//! - [`plan`]: builds the make-right step chain for a Domain
//! - [`DomainProcessor`]: runs one fiber per Domain and reports the outcome

pub mod plan;
mod processor;

pub use processor::{bootstrap_identity, DomainKey, DomainProcessor};

use crate::cache::WatchCache;
use crate::client::{ApiBackend, ClusterClient};
use crate::config::OperatorConfig;
use crate::events::EventRecorder;
use crate::identity::{IdentityGenerator, SelfSignedGenerator};
use crate::routing::{HttpTrafficProbe, TrafficProbe};
use std::sync::Arc;
use wko_core::providers::{Clock, FileSystem, RealFs, SystemClock};

/// Shared context for steps and controllers.
#[derive(Clone)]
pub struct OperatorContext {
    /// Cluster API client.
    pub client: ClusterClient,
    /// Watch cache (read-only for steps).
    pub cache: WatchCache,
    /// Event recorder.
    pub events: EventRecorder,
    /// Operator configuration.
    pub config: Arc<OperatorConfig>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Filesystem used for the webhook identity.
    pub fs: Arc<dyn FileSystem>,
    /// Identity generator.
    pub identity: Arc<dyn IdentityGenerator>,
    /// Traffic probe run after scaling, if configured.
    pub probe: Option<Arc<dyn TrafficProbe>>,
}

impl OperatorContext {
    /// Create a context over a backend with production providers.
    ///
    /// An HTTP traffic probe is installed when `config.probe_url` is set.
    pub fn new(backend: Arc<dyn ApiBackend>, config: OperatorConfig) -> Self {
        let client = ClusterClient::new(backend);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let probe = config.probe_url.as_ref().map(|url| {
            Arc::new(HttpTrafficProbe::new(url.clone(), config.probe_attempts)) as Arc<dyn TrafficProbe>
        });
        Self {
            events: EventRecorder::new(client.clone(), clock.clone()),
            client,
            cache: WatchCache::new(),
            config: Arc::new(config),
            clock,
            fs: Arc::new(RealFs::new()),
            identity: Arc::new(SelfSignedGenerator),
            probe,
        }
    }

    /// Use a different clock (for events, waits and deadlines).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.events = EventRecorder::new(self.client.clone(), clock.clone());
        self.clock = clock;
        self
    }

    /// Use a different filesystem.
    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Use a different identity generator.
    pub fn with_identity_generator(mut self, generator: Arc<dyn IdentityGenerator>) -> Self {
        self.identity = generator;
        self
    }

    /// Use a traffic probe.
    pub fn with_probe(mut self, probe: Arc<dyn TrafficProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Share an existing watch cache.
    pub fn with_cache(mut self, cache: WatchCache) -> Self {
        self.cache = cache;
        self
    }
}
