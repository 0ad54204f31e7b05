//! Column projection operator (spec §4.B `select_columns`), grounded in
//! `libtenzir/builtins/operators/select.cpp`'s "order-invariant" treatment of
//! column projection during optimization: dropping/reordering columns never
//! reorders rows, so a requested row order survives through this operator
//! untouched.

use async_trait::async_trait;
use futures::stream::StreamExt;

use flux_core::control::ControlPlane;
use flux_core::error::{ErrorKind, PipelineError};
use flux_core::message::Message;
use flux_core::operator::{ElementKind, MessageStream, OptimizeResult, Operator, OrderHint, Predicate};
use flux_core::Result;

/// `select <paths>`: keeps only the named columns, in original schema order,
/// deduplicating repeated paths (spec §4.B).
pub struct Select {
    name: String,
    paths: Vec<String>,
}

impl Select {
    pub fn new(name: impl Into<String>, paths: Vec<String>) -> Self {
        Self { name: name.into(), paths }
    }
}

#[async_trait]
impl Operator for Select {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::AnyEvents
    }

    fn output_kind(&self) -> ElementKind {
        ElementKind::Events
    }

    fn optimize(&self, predicate: Predicate, order_hint: OrderHint) -> OptimizeResult {
        let _ = order_hint;
        OptimizeResult::order_invariant(predicate)
    }

    async fn instantiate(&self, input: MessageStream, control: ControlPlane) -> Result<MessageStream> {
        let paths = self.paths.clone();
        Ok(input
            .filter_map(move |msg| {
                let control = control.clone();
                let paths = paths.clone();
                async move {
                    match msg {
                        Message::Batch(slice) => match slice.select_columns(&paths) {
                            Ok(projected) => Some(Message::Batch(projected)),
                            Err(e) => {
                                control.emit(flux_core::diagnostics::Diagnostic::warning(format!(
                                    "select dropped a batch: {e}"
                                )));
                                None
                            }
                        },
                        other => Some(other),
                    }
                }
            })
            .boxed())
    }

    fn checkpoint_state(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<()> {
        if !state.is_empty() {
            return Err(PipelineError::new(
                ErrorKind::StateCorruption,
                "select is stateless but received a non-empty checkpoint blob",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Int64Array, RecordBatch, StringArray};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use flux_core::control::NoSecrets;
    use flux_core::diagnostics::CollectingSink;
    use flux_core::TableSlice;
    use futures::stream;
    use std::sync::Arc;

    // S2: `where a > 2 | select a` fed [{a:1,b:"x"},{a:2,b:"y"},{a:3,b:"z"}]
    // emits [{a:3}]. This test covers the `select` half in isolation; the
    // full composed scenario lives in the integration test alongside
    // `filter`.
    #[tokio::test]
    async fn keeps_only_named_column() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![3])),
                Arc::new(StringArray::from(vec!["z"])),
            ],
        )
        .unwrap();
        let input = stream::iter(vec![Message::Batch(TableSlice::from_batch(batch)), Message::Eos]).boxed();

        let op = Select::new("select", vec!["a".to_string()]);
        let control = ControlPlane::new(Arc::new(CollectingSink::new()), Arc::new(NoSecrets));
        let mut out = op.instantiate(input, control).await.unwrap();

        let first = out.next().await.unwrap();
        let Message::Batch(slice) = first else { panic!("expected batch") };
        let names: Vec<_> = slice.schema().fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(names, vec!["a"]);
    }
}
