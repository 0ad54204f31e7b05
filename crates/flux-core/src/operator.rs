//! Operator abstraction (spec §4.D): the single contract every pipeline
//! stage implements, generalizing the teacher's separate `Source`/
//! `Transform`/`Sink` traits into one shape distinguished by declared
//! element kinds.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::control::ControlPlane;
use crate::error::Result;
use crate::message::Message;

/// The element kind an operator's input or output stream carries (spec
/// §4.D). `AnyEvents` unifies with `Events` during composition (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Bytes,
    Events,
    Void,
    AnyEvents,
}

impl ElementKind {
    /// Whether `self`, as a declared output kind, may feed an input declared
    /// as `other` (spec §4.E: `any-events` unifies with `events`).
    pub fn compatible_with(self, other: ElementKind) -> bool {
        use ElementKind::*;
        match (self, other) {
            (a, b) if a == b => true,
            (AnyEvents, Events) | (Events, AnyEvents) => true,
            _ => false,
        }
    }
}

/// Where an operator instance is allowed to run (spec §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationHint {
    Any,
    Local,
    Remote,
}

/// A predicate pushed upstream during optimization (spec §4.C/§4.E). Carried
/// opaquely by the core; `flux-expr` defines its actual shape and how
/// operators inspect/split it.
#[derive(Debug, Clone)]
pub struct Predicate(pub crate::value::Attributes);

impl Predicate {
    pub fn none() -> Self {
        Self(Default::default())
    }

    pub fn is_trivial(&self) -> bool {
        self.0.is_empty()
    }
}

/// A requested output ordering, pushed upstream alongside a [`Predicate`]
/// during optimization (spec §4.C).
#[derive(Debug, Clone, Default)]
pub struct OrderHint {
    pub columns: Vec<String>,
    pub descending: bool,
}

impl OrderHint {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_trivial(&self) -> bool {
        self.columns.is_empty()
    }
}

/// The result of asking an operator to `optimize` (spec §4.D). An operator
/// that fully absorbs the incoming predicate/order returns `None` for both
/// residuals and may replace itself (e.g. a `where` that gets pushed into a
/// source's native filter becomes that source).
pub struct OptimizeResult {
    /// If set, the composer replaces this operator with the returned one.
    pub replacement: Option<Box<dyn Operator>>,
    /// What of the predicate this operator could not absorb, to keep pushing
    /// upstream.
    pub residual_predicate: Predicate,
    /// What of the order hint this operator could not absorb.
    pub residual_order_hint: OrderHint,
}

impl OptimizeResult {
    /// The operator absorbs nothing: residuals equal the inputs unchanged.
    pub fn unchanged(predicate: Predicate, order_hint: OrderHint) -> Self {
        Self {
            replacement: None,
            residual_predicate: predicate,
            residual_order_hint: order_hint,
        }
    }

    pub fn fully_absorbed() -> Self {
        Self {
            replacement: None,
            residual_predicate: Predicate::none(),
            residual_order_hint: OrderHint::none(),
        }
    }

    /// For an operator that never reorders or drops rows (e.g. `select`,
    /// `flatten`): it trivially satisfies whatever order hint arrived from
    /// downstream, so the hint need not keep propagating upstream, while the
    /// predicate is passed on unchanged for someone upstream to absorb.
    pub fn order_invariant(residual_predicate: Predicate) -> Self {
        Self {
            replacement: None,
            residual_predicate,
            residual_order_hint: OrderHint::none(),
        }
    }
}

/// The boxed stream of [`Message`]s an instantiated operator produces. This
/// is the crate's concession to "cooperative coroutines" in a language
/// without native generators (Design Notes): `async`/`await` already
/// desugars to an explicit poll-based state machine, so a `Stream` built
/// from an `async fn` *is* that state machine.
pub type MessageStream = BoxStream<'static, Message>;

/// Whether operators on a link may reorder events relative to each other
/// (spec §4.F). `Unordered` operators may batch, split, and interleave
/// per-schema runs freely; downstream must not assume FIFO in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrder {
    Fifo,
    Unordered,
}

/// The base contract every pipeline stage implements (spec §4.D).
#[async_trait]
pub trait Operator: Send + Sync {
    /// Stable identifier, used for logging and pipeline graph construction.
    fn name(&self) -> &str;

    fn input_kind(&self) -> ElementKind;

    fn output_kind(&self) -> ElementKind;

    fn location_hint(&self) -> LocationHint {
        LocationHint::Any
    }

    /// Excluded from user-visible listings when `true` (e.g. an operator
    /// synthesized by `optimize`, or an internal helper stage).
    fn internal(&self) -> bool {
        false
    }

    /// If `false`, the executor must not speculatively retry this operator's
    /// instance after a transient failure (spec §4.D); side-effecting sinks
    /// typically declare this.
    fn is_deterministic(&self) -> bool {
        true
    }

    fn event_order(&self) -> EventOrder {
        EventOrder::Fifo
    }

    /// Names of the operators in any sub-pipeline this operator carries
    /// internally (spec §2, §4.E: `group`/`fork` and other compound
    /// operators wrap a nested pipeline rather than being a single stage
    /// themselves). Empty for an ordinary operator. The composer uses this
    /// to extend the pipeline DAG it validates with each compound
    /// operator's nested chain.
    fn sub_operators(&self) -> Vec<String> {
        Vec::new()
    }

    /// Attempts to push a predicate/order hint into this operator (spec
    /// §4.D, §4.C). The default implementation absorbs nothing.
    fn optimize(&self, predicate: Predicate, order_hint: OrderHint) -> OptimizeResult {
        OptimizeResult::unchanged(predicate, order_hint)
    }

    /// Turns the declaration into a running instance consuming `input` and
    /// producing an output stream (spec §4.D). Returning an error of kind
    /// `configuration` aborts the pipeline before any data flows; errors
    /// encountered while streaming are instead surfaced through
    /// [`ControlPlane::emit`] and either drop the offending batch or end the
    /// pipeline, depending on severity.
    async fn instantiate(
        &self,
        input: MessageStream,
        control: ControlPlane,
    ) -> Result<MessageStream>;

    /// Serializes this operator instance's state for a checkpoint (spec
    /// §4.G). Stateless operators keep the default empty snapshot.
    fn checkpoint_state(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Restores state captured by a prior [`Operator::checkpoint_state`]
    /// call (spec §4.G). Receiving state that doesn't parse is a
    /// `state_corruption` error, not a panic.
    fn restore_state(&mut self, _state: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_events_unifies_with_events_only() {
        assert!(ElementKind::AnyEvents.compatible_with(ElementKind::Events));
        assert!(ElementKind::Events.compatible_with(ElementKind::AnyEvents));
        assert!(!ElementKind::AnyEvents.compatible_with(ElementKind::Bytes));
        assert!(ElementKind::Bytes.compatible_with(ElementKind::Bytes));
        assert!(!ElementKind::Bytes.compatible_with(ElementKind::Events));
    }

    #[test]
    fn optimize_default_absorbs_nothing() {
        let predicate = Predicate::none();
        let order = OrderHint::none();
        let result = OptimizeResult::unchanged(predicate, order);
        assert!(result.replacement.is_none());
        assert!(result.residual_predicate.is_trivial());
        assert!(result.residual_order_hint.is_trivial());
    }
}
