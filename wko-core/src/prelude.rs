//! Convenient re-exports for step authors.

pub use crate::api::ApiError;
pub use crate::error::{Failure, FailureKind, StepError};
pub use crate::fiber::{Engine, EngineConfig, FiberHandle, FiberState};
pub use crate::packet::Packet;
pub use crate::providers::{Clock, FileSystem, SystemClock};
pub use crate::retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use crate::step::{
    JoinPolicy, NextAction, Outcome, Step, StepChain, StepFuture, StepResult, step_fn,
};
pub use std::sync::Arc;
