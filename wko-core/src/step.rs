//! Steps, step chains and the directives they return.

use crate::error::{Failure, StepError};
use crate::packet::Packet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Result of applying a step.
pub type StepResult = Result<NextAction, StepError>;

/// A boxed future for async step execution.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = StepResult> + Send + 'a>>;

/// A unit of reconciliation logic.
///
/// `apply` may be invoked again with the same packet after the step returned
/// [`NextAction::Suspend`], so it must be safe to re-run: read before
/// mutating, and keep any progress marker in the packet rather than in the
/// step itself. Steps may run on any worker.
///
/// # Example
///
/// ```ignore
/// struct ReadSecret { name: String }
///
/// impl Step for ReadSecret {
///     fn name(&self) -> &str { "ReadSecret" }
///
///     fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
///         Box::pin(async move {
///             packet.put("secret", self.name.clone());
///             Ok(NextAction::Continue)
///         })
///     }
/// }
/// ```
pub trait Step: Send + Sync {
    /// Name used in logs and failure details.
    fn name(&self) -> &str;

    /// Run the step against the packet.
    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a>;
}

/// How a fan-out waits for its children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Let every child run to a terminal state.
    #[default]
    WaitAll,
    /// Cancel the remaining children as soon as one fails. The join still
    /// waits for every child to reach a terminal state.
    FailFast,
}

/// Children to run for a [`NextAction::Invoke`].
pub struct Invocation {
    /// Independent child chains, in submission order.
    pub children: Vec<StepChain>,
    /// Chain to run once every child is terminal.
    pub on_join: StepChain,
    /// Join policy.
    pub policy: JoinPolicy,
}

/// Final outcome reported by [`NextAction::Done`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The fiber finished successfully.
    Success,
    /// The fiber failed.
    Failure(Failure),
}

/// What the engine should do after a step ran.
pub enum NextAction {
    /// Proceed to the next step of the chain.
    Continue,
    /// Run the given chain, then proceed to the next step of the current chain.
    Then(StepChain),
    /// Re-invoke the current step after the delay, releasing the worker meanwhile.
    Suspend(Duration),
    /// Run child chains (possibly concurrently) and continue at `on_join`.
    Invoke(Invocation),
    /// Finish the fiber.
    Done(Outcome),
}

impl NextAction {
    /// Fan out `children` and continue with `on_join` once all are terminal.
    pub fn invoke(children: Vec<StepChain>, on_join: StepChain) -> Self {
        Self::Invoke(Invocation {
            children,
            on_join,
            policy: JoinPolicy::WaitAll,
        })
    }

    /// Fan out with an explicit join policy.
    pub fn invoke_with(children: Vec<StepChain>, on_join: StepChain, policy: JoinPolicy) -> Self {
        Self::Invoke(Invocation {
            children,
            on_join,
            policy,
        })
    }

    /// Finish successfully, skipping the rest of the chain.
    pub fn success() -> Self {
        Self::Done(Outcome::Success)
    }

    /// Finish with a failure.
    pub fn fail(failure: Failure) -> Self {
        Self::Done(Outcome::Failure(failure))
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Then(_) => "then",
            Self::Suspend(_) => "suspend",
            Self::Invoke(_) => "invoke",
            Self::Done(Outcome::Success) => "done",
            Self::Done(Outcome::Failure(_)) => "failed",
        }
    }
}

impl fmt::Debug for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "Continue"),
            Self::Then(chain) => f.debug_tuple("Then").field(chain).finish(),
            Self::Suspend(delay) => f.debug_tuple("Suspend").field(delay).finish(),
            Self::Invoke(inv) => f
                .debug_struct("Invoke")
                .field("children", &inv.children)
                .field("on_join", &inv.on_join)
                .field("policy", &inv.policy)
                .finish(),
            Self::Done(outcome) => f.debug_tuple("Done").field(outcome).finish(),
        }
    }
}

/// One link of a chain.
pub(crate) struct Link {
    pub(crate) step: Arc<dyn Step>,
    pub(crate) next: Option<Arc<Link>>,
}

/// An immutable, singly-linked chain of steps.
///
/// Chains are built back to front from shared links, so a chain can never
/// reference one of its ancestors: cycles are impossible by construction.
/// Cloning a chain is cheap.
#[derive(Clone, Default)]
pub struct StepChain {
    head: Option<Arc<Link>>,
}

impl StepChain {
    /// A chain with no steps.
    pub fn empty() -> Self {
        Self { head: None }
    }

    /// A chain of one step.
    pub fn single(step: impl Step + 'static) -> Self {
        Self::from_steps([Arc::new(step) as Arc<dyn Step>])
    }

    /// Build a chain running `steps` in order.
    pub fn from_steps<I>(steps: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Step>>,
        I::IntoIter: DoubleEndedIterator,
    {
        Self::link_onto(steps, None)
    }

    fn link_onto<I>(steps: I, tail: Option<Arc<Link>>) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Step>>,
        I::IntoIter: DoubleEndedIterator,
    {
        let head = steps
            .into_iter()
            .rev()
            .fold(tail, |next, step| Some(Arc::new(Link { step, next })));
        Self { head }
    }

    /// Append `other` after the last step of this chain.
    pub fn then(self, other: StepChain) -> StepChain {
        Self::link_onto(self.steps(), other.head)
    }

    /// Append a single step.
    pub fn push(self, step: impl Step + 'static) -> StepChain {
        self.then(StepChain::single(step))
    }

    /// Whether the chain has no steps.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of steps in the chain.
    pub fn len(&self) -> usize {
        self.links().count()
    }

    /// Names of the steps in order.
    pub fn step_names(&self) -> Vec<String> {
        self.links().map(|link| link.step.name().to_string()).collect()
    }

    fn steps(&self) -> Vec<Arc<dyn Step>> {
        self.links().map(|link| Arc::clone(&link.step)).collect()
    }

    fn links(&self) -> impl Iterator<Item = &Arc<Link>> {
        std::iter::successors(self.head.as_ref(), |link| link.next.as_ref())
    }

    pub(crate) fn head(&self) -> Option<Arc<Link>> {
        self.head.clone()
    }
}

impl fmt::Debug for StepChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.step_names()).finish()
    }
}

/// A step backed by a synchronous closure. Handy for glue logic and tests.
pub struct FnStep<F> {
    name: String,
    f: F,
}

impl<F> Step for FnStep<F>
where
    F: Fn(&mut Packet) -> StepResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        let result = (self.f)(packet);
        Box::pin(std::future::ready(result))
    }
}

/// Create a closure-backed step, already shared for use in a chain.
pub fn step_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Step>
where
    F: Fn(&mut Packet) -> StepResult + Send + Sync + 'static,
{
    Arc::new(FnStep {
        name: name.into(),
        f,
    })
}
