//! Composed-pipeline integration tests, run through the real composer and
//! scheduler (`flux-exec`) rather than by chaining `instantiate` calls by
//! hand, so the test exercises actual channel wiring and the optimize fixed
//! point alongside the operators themselves.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use datafusion::arrow::array::{Int64Array, RecordBatch};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use flux_core::control::{ControlPlane, NoSecrets};
use flux_core::diagnostics::CollectingSink;
use flux_core::message::Message;
use flux_core::operator::{ElementKind, MessageStream, Operator};
use flux_core::value::Value;
use flux_core::{Result, TableSlice};
use flux_exec::compose::compose;
use flux_exec::schedule::{spawn, ExecutorConfig};
use flux_expr::ast::{BinaryOp, FieldPath};
use flux_expr::Expr;
use flux_ops::{Select, Where};

struct VecSource {
    rows: Vec<i64>,
}

#[async_trait]
impl Operator for VecSource {
    fn name(&self) -> &str {
        "source"
    }
    fn input_kind(&self) -> ElementKind {
        ElementKind::Void
    }
    fn output_kind(&self) -> ElementKind {
        ElementKind::Events
    }
    async fn instantiate(&self, _input: MessageStream, _control: ControlPlane) -> Result<MessageStream> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Utf8, true),
        ]));
        let n = self.rows.len();
        let a = Arc::new(Int64Array::from(self.rows.clone()));
        let b = Arc::new(datafusion::arrow::array::StringArray::from(
            (0..n).map(|i| format!("row{i}")).collect::<Vec<_>>(),
        ));
        let batch = RecordBatch::try_new(schema, vec![a, b]).unwrap();
        let slice = TableSlice::from_batch(batch);
        Ok(stream::iter(vec![Message::Batch(slice), Message::Eos]).boxed())
    }
}

struct RecordingSink {
    rows: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl Operator for RecordingSink {
    fn name(&self) -> &str {
        "sink"
    }
    fn input_kind(&self) -> ElementKind {
        ElementKind::AnyEvents
    }
    fn output_kind(&self) -> ElementKind {
        ElementKind::Void
    }
    async fn instantiate(&self, input: MessageStream, _control: ControlPlane) -> Result<MessageStream> {
        let rows = Arc::clone(&self.rows);
        let mut input = input;
        while let Some(msg) = input.next().await {
            match msg {
                Message::Batch(slice) => {
                    let col = slice.batch().column(0).as_any().downcast_ref::<Int64Array>().unwrap();
                    rows.lock().unwrap().extend(col.values().iter().copied());
                }
                Message::Eos => break,
                _ => {}
            }
        }
        Ok(stream::iter(vec![Message::Eos]).boxed())
    }
}

// S2: `where a > 2 | select a` fed [{a:1,b:"x"},{a:2,b:"y"},{a:3,b:"z"}]
// emits a single row, `a = 3`.
#[tokio::test]
async fn s2_where_then_select_composed_through_scheduler() {
    let predicate = Expr::binary(BinaryOp::Gt, Expr::field(FieldPath::single("a")), Expr::literal(Value::Int64(2)));
    let captured = Arc::new(Mutex::new(Vec::new()));

    let ops: Vec<Box<dyn Operator>> = vec![
        Box::new(VecSource { rows: vec![1, 2, 3] }),
        Box::new(Where::new("where", predicate)),
        Box::new(Select::new("select", vec!["a".to_string()])),
        Box::new(RecordingSink { rows: Arc::clone(&captured) }),
    ];

    let composed = compose(ops).unwrap();
    let control = ControlPlane::new(Arc::new(CollectingSink::new()), Arc::new(NoSecrets));
    let cancel = CancellationToken::new();
    let (handle, _snapshots, _barriers) = spawn(composed, control, cancel, ExecutorConfig::default());
    handle.join().await.unwrap();

    assert_eq!(*captured.lock().unwrap(), vec![3]);
}

// Invariant 2: `eval(e, s)` is deterministic for a deterministic expression
// evaluated repeatedly against the same slice.
#[tokio::test]
async fn invariant2_eval_is_deterministic_across_repeated_runs() {
    let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5]))]).unwrap();
    let slice = TableSlice::from_batch(batch);

    let predicate = Expr::binary(BinaryOp::Gt, Expr::field(FieldPath::single("a")), Expr::literal(Value::Int64(2)));
    let control = ControlPlane::new(Arc::new(CollectingSink::new()), Arc::new(NoSecrets));
    let ctx = flux_expr::EvalContext::new(&control);

    let first = flux_expr::eval(&predicate, &slice, &ctx).unwrap();
    let second = flux_expr::eval(&predicate, &slice, &ctx).unwrap();

    let as_bools = |series: &flux_expr::Series| {
        series
            .array
            .as_any()
            .downcast_ref::<datafusion::arrow::array::BooleanArray>()
            .unwrap()
            .iter()
            .collect::<Vec<_>>()
    };
    assert_eq!(as_bools(&first), as_bools(&second));
    assert_eq!(as_bools(&first), vec![Some(false), Some(false), Some(true), Some(true), Some(true)]);
}

// Invariant 4: for `A -> B` with `A.event_order = ordered` (the default every
// built-in operator reports), rows reach `B` in the same order `A` emitted
// them. A source producing a single batch whose rows are deliberately out of
// numeric order, composed through `passthrough`, must arrive at the sink with
// that exact row order intact.
#[tokio::test]
async fn invariant4_ordered_operators_preserve_fifo_row_order() {
    let captured = Arc::new(Mutex::new(Vec::new()));

    let ops: Vec<Box<dyn Operator>> = vec![
        Box::new(VecSource { rows: vec![5, 4, 3, 2, 1] }),
        Box::new(flux_ops::Passthrough::new("pass")),
        Box::new(RecordingSink { rows: Arc::clone(&captured) }),
    ];

    let composed = compose(ops).unwrap();
    let control = ControlPlane::new(Arc::new(CollectingSink::new()), Arc::new(NoSecrets));
    let cancel = CancellationToken::new();
    let (handle, _snapshots, _barriers) = spawn(composed, control, cancel, ExecutorConfig::default());
    handle.join().await.unwrap();

    assert_eq!(*captured.lock().unwrap(), vec![5, 4, 3, 2, 1]);
}
