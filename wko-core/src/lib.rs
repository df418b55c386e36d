//! WKO execution engine.
//!
//! Every interaction the domain operator has with the Kubernetes API is
//! expressed as a chain of [`Step`]s executed by a [`Fiber`](fiber::FiberHandle).
//! Steps never block a worker: they return a [`NextAction`] that tells the
//! [`Engine`] whether to continue, suspend and retry later, fan out child
//! chains, or finish.
//!
//! # Building blocks
//!
//! - [`Packet`]: per-attempt context bag shared by the steps of one fiber
//! - [`Step`] / [`StepChain`]: units of work and the immutable chains linking them
//! - [`NextAction`]: the directive a step hands back to the scheduler
//! - [`Engine`]: the scheduler running fibers on a bounded worker pool
//! - [`RetryPolicy`]: classification of API failures into retry/backoff decisions
//! - [`providers`]: injectable clock and filesystem seams
//!
//! # Example
//!
//! ```ignore
//! use wko_core::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::default(), Arc::new(SystemClock::new()));
//! let chain = StepChain::from_steps([step_fn("hello", |packet| {
//!     packet.put("greeting", "hello".to_string());
//!     Ok(NextAction::Continue)
//! })]);
//! let fiber = engine.start("hello", chain, Packet::new());
//! assert!(fiber.join().await.is_completed());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod error;
pub mod fiber;
pub mod packet;
pub mod prelude;
pub mod providers;
pub mod retry;
pub mod step;

pub use api::ApiError;
pub use error::{EngineError, EngineResult, Failure, FailureKind, StepError};
pub use fiber::{Engine, EngineConfig, FiberHandle, FiberId, FiberState};
pub use packet::Packet;
pub use retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use step::{
    FnStep, Invocation, JoinPolicy, NextAction, Outcome, Step, StepChain, StepFuture, StepResult,
    step_fn,
};
