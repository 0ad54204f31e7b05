//! Nested-record hoisting operator (spec §4.B `flatten`), grounded in
//! `libtenzir/builtins/operators/flatten.cpp`. Collisions produced by
//! hoisting are reported both as renamed fields (returned by
//! `TableSlice::flatten`) and as a diagnostic note, so a user sees why a
//! field ended up as `x_y.1` instead of `x_y`.

use async_trait::async_trait;
use futures::stream::StreamExt;

use flux_core::control::ControlPlane;
use flux_core::diagnostics::Diagnostic;
use flux_core::message::Message;
use flux_core::operator::{ElementKind, MessageStream, OptimizeResult, Operator, OrderHint, Predicate};
use flux_core::Result;

/// `flatten <sep>`: hoists nested record fields to the top level, joined by
/// `sep`, renaming later fields on collision (spec §4.B).
pub struct Flatten {
    name: String,
    sep: String,
}

impl Flatten {
    pub fn new(name: impl Into<String>, sep: impl Into<String>) -> Self {
        Self { name: name.into(), sep: sep.into() }
    }
}

#[async_trait]
impl Operator for Flatten {
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
        let sep = self.sep.clone();
        Ok(input
            .filter_map(move |msg| {
                let control = control.clone();
                let sep = sep.clone();
                async move {
                    match msg {
                        Message::Batch(slice) => match slice.flatten(&sep) {
                            Ok((flat, renamed)) => {
                                if !renamed.is_empty() {
                                    control.emit(
                                        Diagnostic::note(format!(
                                            "flatten renamed {} colliding field(s) to avoid a duplicate name",
                                            renamed.len()
                                        ))
                                        .with_note(renamed.join(", ")),
                                    );
                                }
                                Some(Message::Batch(flat))
                            }
                            Err(e) => {
                                control.emit(Diagnostic::warning(format!("flatten dropped a batch: {e}")));
                                None
                            }
                        },
                        other => Some(other),
                    }
                }
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{ArrayRef, Int64Array, RecordBatch, StructArray};
    use datafusion::arrow::datatypes::{DataType, Field, Fields, Schema};
    use flux_core::control::NoSecrets;
    use flux_core::diagnostics::CollectingSink;
    use flux_core::TableSlice;
    use futures::stream;
    use std::sync::Arc;

    fn nested_slice() -> TableSlice {
        let inner_fields = Fields::from(vec![
            Field::new("y", DataType::Int64, true),
            Field::new("z", DataType::Int64, true),
        ]);
        let inner = StructArray::new(
            inner_fields.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1])) as ArrayRef,
                Arc::new(Int64Array::from(vec![2])) as ArrayRef,
            ],
            None,
        );
        let schema = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Struct(inner_fields), true),
            Field::new("x_y", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(inner) as ArrayRef, Arc::new(Int64Array::from(vec![9])) as ArrayRef],
        )
        .unwrap();
        TableSlice::from_batch(batch)
    }

    // S3: flatten on {x:{y:1,z:2}, x_y:9} yields x.y=1, x.z=2, x_y.1=9.
    #[tokio::test]
    async fn s3_flattens_and_renames_collision_with_diagnostic_note() {
        let input = stream::iter(vec![Message::Batch(nested_slice()), Message::Eos]).boxed();
        let sink = Arc::new(CollectingSink::new());
        let control = ControlPlane::new(sink.clone(), Arc::new(NoSecrets));
        let op = Flatten::new("flatten", ".");
        let mut out = op.instantiate(input, control).await.unwrap();

        let first = out.next().await.unwrap();
        let Message::Batch(slice) = first else { panic!("expected batch") };
        let names: Vec<_> = slice.schema().fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(names, vec!["x.y", "x.z", "x_y.1"]);

        let diagnostics = sink.drain();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("renamed"));
    }
}
