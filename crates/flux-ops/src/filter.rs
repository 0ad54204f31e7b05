//! Row-filtering operator (`where <expr>`), grounded in the teacher's
//! transform stages in `rde_tx` and in Arrow's `compute::filter_record_batch`
//! kernel for the actual row selection.

use async_trait::async_trait;
use datafusion::arrow::array::BooleanArray;
use datafusion::arrow::compute::filter_record_batch;
use futures::stream::StreamExt;

use flux_core::control::ControlPlane;
use flux_core::error::{ErrorKind, PipelineError};
use flux_core::message::Message;
use flux_core::operator::{ElementKind, MessageStream, Operator};
use flux_core::{Result, TableSlice};
use flux_expr::{eval, EvalContext, Expr};

/// `where <expr>`: keeps only the rows for which `expr` evaluates to `true`.
/// Null and `false` are both exclusions (spec §4.C: three-valued predicates
/// are never "true", so a null predicate drops the row rather than keeping
/// it).
pub struct Where {
    name: String,
    predicate: Expr,
}

impl Where {
    pub fn new(name: impl Into<String>, predicate: Expr) -> Self {
        Self { name: name.into(), predicate }
    }
}

#[async_trait]
impl Operator for Where {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::AnyEvents
    }

    fn output_kind(&self) -> ElementKind {
        ElementKind::AnyEvents
    }

    async fn instantiate(&self, input: MessageStream, control: ControlPlane) -> Result<MessageStream> {
        let predicate = self.predicate.clone();
        Ok(input
            .filter_map(move |msg| {
                let control = control.clone();
                let predicate = predicate.clone();
                async move {
                    match msg {
                        Message::Batch(slice) => match apply(&predicate, &slice, &control) {
                            Ok(filtered) => Some(Message::Batch(filtered)),
                            Err(e) => {
                                control.emit(flux_core::diagnostics::Diagnostic::warning(format!(
                                    "where dropped a batch: {e}"
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
}

fn apply(predicate: &Expr, slice: &TableSlice, control: &ControlPlane) -> Result<TableSlice> {
    let ctx = EvalContext::new(control);
    let series = eval(predicate, slice, &ctx)?;
    let mask = series
        .array
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| PipelineError::new(ErrorKind::TypeMismatch, "where predicate did not evaluate to bool"))?;
    let filtered = filter_record_batch(slice.batch(), mask)
        .map_err(|e| PipelineError::runtime(format!("filter_record_batch failed: {e}")))?;
    TableSlice::new(filtered, slice.import_time(), slice.offset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Int64Array, RecordBatch};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use flux_core::control::NoSecrets;
    use flux_core::diagnostics::CollectingSink;
    use flux_core::value::Value;
    use flux_expr::ast::{BinaryOp, FieldPath};
    use futures::stream;
    use std::sync::Arc;

    fn batch_a(values: Vec<i64>) -> TableSlice {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap();
        TableSlice::from_batch(batch)
    }

    // S2 first half: `where a > 2` fed [1,2,3] keeps only [3].
    #[tokio::test]
    async fn keeps_rows_matching_predicate() {
        let predicate = Expr::binary(
            BinaryOp::Gt,
            Expr::field(FieldPath::single("a")),
            Expr::literal(Value::Int64(2)),
        );
        let input = stream::iter(vec![Message::Batch(batch_a(vec![1, 2, 3])), Message::Eos]).boxed();

        let op = Where::new("where", predicate);
        let control = ControlPlane::new(Arc::new(CollectingSink::new()), Arc::new(NoSecrets));
        let mut out = op.instantiate(input, control).await.unwrap();

        let first = out.next().await.unwrap();
        let Message::Batch(slice) = first else { panic!("expected batch") };
        let col = slice.batch().column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(col.values(), &[3]);
    }
}
