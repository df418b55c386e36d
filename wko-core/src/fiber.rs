//! Fiber scheduler.
//!
//! A fiber runs one [`StepChain`] against one [`Packet`]. The [`Engine`]
//! interprets each [`NextAction`]:
//!
//! - `Continue` advances the cursor.
//! - `Then(chain)` runs `chain` first, then resumes after the current step.
//! - `Suspend(delay)` releases the worker permit, sleeps on the injected
//!   [`Clock`] (racing cancellation) and re-invokes the same step.
//! - `Invoke` forks the packet once per child chain, runs the children as
//!   separate tokio tasks and continues at `on_join` once all are terminal.
//! - `Done` finishes the fiber.
//!
//! ## Concurrency control
//!
//! Step invocations across every fiber of an engine share a semaphore of
//! `max_concurrent_steps` permits. A permit is held only while `apply` runs,
//! never while a fiber is suspended or waiting on children.
//!
//! ## Cancellation
//!
//! Cancellation is cooperative. The token is checked before every step and
//! before children are spawned. A step already running when the token fires
//! is allowed to finish, but its result is discarded. Child tokens derive
//! from the parent's, so cancelling a fiber cancels every descendant.

use crate::error::{EngineError, EngineResult, Failure, FailureKind};
use crate::packet::Packet;
use crate::providers::Clock;
use crate::step::{JoinPolicy, Link, NextAction, Outcome, StepChain};
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

type FiberFuture = Pin<Box<dyn Future<Output = (FiberState, Packet)> + Send + 'static>>;

/// Configuration for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of step invocations running at once, across all fibers.
    pub max_concurrent_steps: usize,
    /// Maximum number of step invocations per fiber (including re-invocations
    /// after a suspend). `None` disables the guard.
    pub max_steps_per_fiber: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 16,
            max_steps_per_fiber: None,
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads:
    /// - `WKO_MAX_CONCURRENT_STEPS`: worker pool size
    /// - `WKO_MAX_STEPS_PER_FIBER`: runaway-chain guard
    pub fn from_env() -> Self {
        let max_concurrent_steps = std::env::var("WKO_MAX_CONCURRENT_STEPS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(16);

        let max_steps_per_fiber = std::env::var("WKO_MAX_STEPS_PER_FIBER")
            .ok()
            .and_then(|s| s.parse::<u64>().ok());

        Self {
            max_concurrent_steps,
            max_steps_per_fiber,
        }
    }

    /// Set the worker pool size (at least 1).
    pub fn with_max_concurrent_steps(mut self, max: usize) -> Self {
        self.max_concurrent_steps = max.max(1);
        self
    }

    /// Fail any fiber that invokes more than `max` steps.
    pub fn with_max_steps_per_fiber(mut self, max: u64) -> Self {
        self.max_steps_per_fiber = Some(max);
        self
    }
}

/// Unique identifier of a fiber within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberState {
    /// Executing (or about to execute) a step.
    Running,
    /// Waiting on a timer or on its children.
    Suspended,
    /// Finished successfully.
    Completed,
    /// Finished with a failure.
    Failed(Failure),
    /// Stopped by cancellation.
    Cancelled,
}

impl FiberState {
    /// Whether the fiber will make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }

    /// Whether the fiber completed successfully.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// The failure, if the fiber failed.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

struct FiberShared {
    id: FiberId,
    name: String,
    state: watch::Sender<FiberState>,
    token: CancellationToken,
    children: Mutex<Vec<FiberHandle>>,
    packet: Mutex<Option<Packet>>,
}

/// Handle to a running (or finished) fiber.
#[derive(Clone)]
pub struct FiberHandle {
    shared: Arc<FiberShared>,
}

impl FiberHandle {
    fn new(id: FiberId, name: String, token: CancellationToken) -> Self {
        let (state, _) = watch::channel(FiberState::Running);
        Self {
            shared: Arc::new(FiberShared {
                id,
                name,
                state,
                token,
                children: Mutex::new(Vec::new()),
                packet: Mutex::new(None),
            }),
        }
    }

    /// Fiber id.
    pub fn id(&self) -> FiberId {
        self.shared.id
    }

    /// Fiber name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current state.
    pub fn state(&self) -> FiberState {
        self.shared.state.borrow().clone()
    }

    /// Request cancellation of this fiber and all its descendants.
    pub fn cancel(&self) {
        self.shared.token.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Child fibers spawned so far, in submission order.
    pub fn children(&self) -> Vec<FiberHandle> {
        self.shared.children.lock().clone()
    }

    /// Wait until the fiber reaches a terminal state.
    pub async fn join(&self) -> FiberState {
        let mut rx = self.shared.state.subscribe();
        let state = match rx.wait_for(FiberState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    /// Take the packet the fiber finished with.
    pub fn take_packet(&self) -> EngineResult<Packet> {
        if !self.state().is_terminal() {
            return Err(EngineError::NotFinished(self.id().to_string()));
        }
        self.shared
            .packet
            .lock()
            .take()
            .ok_or_else(|| EngineError::PacketTaken(self.id().to_string()))
    }

    fn publish(&self, state: FiberState) {
        self.shared.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn finish(&self, state: FiberState, packet: Packet) {
        *self.shared.packet.lock() = Some(packet);
        self.publish(state);
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

enum Applied {
    Action(NextAction),
    Failed(Failure),
    Cancelled,
}

struct EngineInner {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    permits: Semaphore,
    next_id: AtomicU64,
}

/// Runs fibers on a bounded worker pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine.
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let permits = Semaphore::new(config.max_concurrent_steps.max(1));
        Self {
            inner: Arc::new(EngineInner {
                config,
                clock,
                permits,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The clock used for suspensions.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Worker permits not currently held by a running step.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Close the worker pool. Fibers fail at their next step.
    pub fn shutdown(&self) {
        self.inner.permits.close();
    }

    /// Start a fiber on the tokio runtime and return its handle.
    pub fn start(&self, name: impl Into<String>, chain: StepChain, packet: Packet) -> FiberHandle {
        let handle = self.new_handle(name.into(), &packet);
        let span = tracing::info_span!("fiber", id = %handle.id(), name = %handle.name());
        let fiber = self.drive(handle.clone(), chain, packet);
        let finished = handle.clone();
        tokio::spawn(
            async move {
                let (state, packet) = fiber.await;
                log_terminal(&finished, &state);
                finished.finish(state, packet);
            }
            .instrument(span),
        );
        handle
    }

    /// Run a fiber to completion on the current task.
    ///
    /// Returns the terminal state and the final packet.
    pub async fn run(
        &self,
        name: impl Into<String>,
        chain: StepChain,
        packet: Packet,
    ) -> (FiberState, Packet) {
        let handle = self.new_handle(name.into(), &packet);
        let span = tracing::info_span!("fiber", id = %handle.id(), name = %handle.name());
        let (state, packet) = self
            .drive(handle.clone(), chain, packet)
            .instrument(span)
            .await;
        log_terminal(&handle, &state);
        handle.publish(state.clone());
        (state, packet)
    }

    fn new_handle(&self, name: String, packet: &Packet) -> FiberHandle {
        let id = FiberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        FiberHandle::new(id, name, packet.cancellation().clone())
    }

    fn drive(&self, fiber: FiberHandle, chain: StepChain, packet: Packet) -> FiberFuture {
        let engine = self.clone();
        Box::pin(async move { engine.run_loop(fiber, chain, packet).await })
    }

    async fn run_loop(
        &self,
        fiber: FiberHandle,
        chain: StepChain,
        mut packet: Packet,
    ) -> (FiberState, Packet) {
        let token = fiber.shared.token.clone();
        let mut cursor: Option<Arc<Link>> = chain.head();
        // Successors to resume once a `Then` or `Invoke` sub-chain is exhausted.
        let mut resume: Vec<Option<Arc<Link>>> = Vec::new();
        let mut executed: u64 = 0;

        loop {
            if token.is_cancelled() {
                return (FiberState::Cancelled, packet);
            }

            let link = match cursor.take() {
                Some(link) => link,
                None => match resume.pop() {
                    Some(next) => {
                        cursor = next;
                        continue;
                    }
                    None => return (FiberState::Completed, packet),
                },
            };
            let step_name = link.step.name().to_string();

            executed += 1;
            if let Some(budget) = self.inner.config.max_steps_per_fiber {
                if executed > budget {
                    let failure = Failure::new(
                        FailureKind::Fatal,
                        format!("step budget of {} invocations exceeded", budget),
                    )
                    .in_step(&step_name);
                    return (FiberState::Failed(failure), packet);
                }
            }

            fiber.publish(FiberState::Running);
            let action = match self.apply_step(&link, &mut packet, &token).await {
                Applied::Action(action) => action,
                Applied::Failed(failure) => return (FiberState::Failed(failure), packet),
                Applied::Cancelled => return (FiberState::Cancelled, packet),
            };

            if token.is_cancelled() {
                tracing::debug!(
                    step = %step_name,
                    action = action.label(),
                    "Discarding result of step that finished after cancellation"
                );
                return (FiberState::Cancelled, packet);
            }

            tracing::trace!(step = %step_name, action = action.label(), "Step applied");

            match action {
                NextAction::Continue => cursor = link.next.clone(),
                NextAction::Then(chain) => {
                    resume.push(link.next.clone());
                    cursor = chain.head();
                }
                NextAction::Suspend(delay) => {
                    fiber.publish(FiberState::Suspended);
                    let clock = Arc::clone(&self.inner.clock);
                    tokio::select! {
                        _ = token.cancelled() => return (FiberState::Cancelled, packet),
                        _ = clock.sleep(delay) => {}
                    }
                    cursor = Some(link);
                }
                NextAction::Invoke(invocation) => {
                    let failure = self
                        .join_children(&fiber, &packet, invocation.children, invocation.policy)
                        .await;
                    if token.is_cancelled() {
                        return (FiberState::Cancelled, packet);
                    }
                    packet.set_join_failure(failure);
                    resume.push(link.next.clone());
                    cursor = invocation.on_join.head();
                }
                NextAction::Done(Outcome::Success) => return (FiberState::Completed, packet),
                NextAction::Done(Outcome::Failure(failure)) => {
                    let failure = match failure.step {
                        Some(_) => failure,
                        None => failure.in_step(&step_name),
                    };
                    return (FiberState::Failed(failure), packet);
                }
            }
        }
    }

    async fn apply_step(
        &self,
        link: &Link,
        packet: &mut Packet,
        token: &CancellationToken,
    ) -> Applied {
        let name = link.step.name();
        let permit = tokio::select! {
            _ = token.cancelled() => return Applied::Cancelled,
            permit = self.inner.permits.acquire() => permit,
        };
        let Ok(_permit) = permit else {
            let failure = Failure::new(FailureKind::Fatal, EngineError::PoolClosed.to_string());
            return Applied::Failed(failure.in_step(name));
        };

        let invocation = AssertUnwindSafe(async move { link.step.apply(packet).await });
        match invocation.catch_unwind().await {
            Ok(Ok(action)) => Applied::Action(action),
            Ok(Err(err)) => {
                tracing::debug!(step = %name, error = %err, "Step returned an error");
                Applied::Failed(Failure::from_step_error(name, &err))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(step = %name, panic = %message, "Step panicked");
                Applied::Failed(Failure::new(FailureKind::Panicked, message).in_step(name))
            }
        }
    }

    /// Run `children` as child fibers and wait until all are terminal.
    ///
    /// Returns the failure of the first failed child in submission order.
    /// Children stopped by cancellation do not count as failures.
    async fn join_children(
        &self,
        parent: &FiberHandle,
        packet: &Packet,
        children: Vec<StepChain>,
        policy: JoinPolicy,
    ) -> Option<Failure> {
        let count = children.len();
        let mut tasks: JoinSet<(usize, FiberState)> = JoinSet::new();
        let mut handles = Vec::with_capacity(count);

        for (index, chain) in children.into_iter().enumerate() {
            let child_packet = packet.fork();
            let child = self.new_handle(format!("{}/{}", parent.name(), index), &child_packet);
            parent.shared.children.lock().push(child.clone());
            handles.push(child.clone());

            let span = tracing::info_span!("fiber", id = %child.id(), name = %child.name());
            let fiber = self.drive(child.clone(), chain, child_packet);
            tasks.spawn(
                async move {
                    let (state, packet) = fiber.await;
                    log_terminal(&child, &state);
                    child.finish(state.clone(), packet);
                    (index, state)
                }
                .instrument(span),
            );
        }

        if count > 0 {
            parent.publish(FiberState::Suspended);
        }

        let mut states: Vec<Option<FiberState>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, state)) => {
                    if policy == JoinPolicy::FailFast && state.failure().is_some() {
                        handles.iter().for_each(FiberHandle::cancel);
                    }
                    states[index] = Some(state);
                }
                Err(err) => {
                    tracing::error!(parent = %parent.id(), error = %err, "Child fiber task aborted");
                    if policy == JoinPolicy::FailFast {
                        handles.iter().for_each(FiberHandle::cancel);
                    }
                }
            }
        }

        states
            .into_iter()
            .enumerate()
            .find_map(|(index, state)| match state {
                Some(FiberState::Failed(failure)) => Some(failure),
                Some(_) => None,
                None => Some(Failure::new(
                    FailureKind::Panicked,
                    format!("child fiber {} did not report a terminal state", index),
                )),
            })
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("available_permits", &self.available_permits())
            .finish()
    }
}

fn log_terminal(fiber: &FiberHandle, state: &FiberState) {
    match state {
        FiberState::Failed(failure) => {
            tracing::warn!(fiber = %fiber.id(), name = %fiber.name(), failure = %failure, "Fiber failed")
        }
        FiberState::Cancelled => {
            tracing::debug!(fiber = %fiber.id(), name = %fiber.name(), "Fiber cancelled")
        }
        _ => tracing::debug!(fiber = %fiber.id(), name = %fiber.name(), "Fiber completed"),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "step panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockClock;
    use crate::step::step_fn;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default(), Arc::new(MockClock::new()))
    }

    #[tokio::test]
    async fn empty_chain_completes() {
        let (state, _) = engine().run("empty", StepChain::empty(), Packet::new()).await;
        assert_eq!(state, FiberState::Completed);
    }

    #[tokio::test]
    async fn done_failure_is_attributed_to_step() {
        let chain = StepChain::from_steps([step_fn("Deny", |_| {
            Ok(NextAction::fail(Failure::new(FailureKind::Fatal, "forbidden")))
        })]);
        let (state, _) = engine().run("deny", chain, Packet::new()).await;
        let failure = state.failure().cloned().unwrap();
        assert_eq!(failure.step.as_deref(), Some("Deny"));
        assert_eq!(failure.kind, FailureKind::Fatal);
    }

    #[tokio::test]
    async fn handle_join_and_take_packet() {
        let chain = StepChain::from_steps([step_fn("Mark", |packet| {
            packet.put("marked", true);
            Ok(NextAction::Continue)
        })]);
        let fiber = engine().start("mark", chain, Packet::new());
        assert!(fiber.join().await.is_completed());

        let packet = fiber.take_packet().unwrap();
        assert_eq!(packet.get::<bool>("marked"), Some(&true));
        assert!(matches!(fiber.take_packet(), Err(EngineError::PacketTaken(_))));
    }

    #[test]
    fn config_builders() {
        let config = EngineConfig::default()
            .with_max_concurrent_steps(0)
            .with_max_steps_per_fiber(10);
        assert_eq!(config.max_concurrent_steps, 1);
        assert_eq!(config.max_steps_per_fiber, Some(10));
        assert_eq!(FiberId(7).to_string(), "fiber-7");
    }

    #[tokio::test]
    async fn shutdown_fails_pending_fibers() {
        let engine = engine();
        engine.shutdown();
        let chain = StepChain::from_steps([step_fn("Never", |_| Ok(NextAction::Continue))]);
        let (state, _) = engine.run("closed", chain, Packet::new()).await;
        assert_eq!(state.failure().map(|f| f.kind), Some(FailureKind::Fatal));
    }
}
