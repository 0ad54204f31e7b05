//! Coalescing operator (spec §4.B `batch`): groups incoming events into
//! fixed-size slices, flushing early on a checkpoint barrier, end-of-stream,
//! or (if configured) an idle timeout. Grounded in the teacher's
//! `rde_tx::SchemaEvolution`-style stateful transform shape, generalized from
//! a single accumulator to the `stream::unfold` coroutine pattern spec §5
//! describes executor state as.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use futures::stream::{self, StreamExt};

use flux_core::control::ControlPlane;
use flux_core::message::Message;
use flux_core::operator::{ElementKind, MessageStream, Operator};
use flux_core::{Result, TableSlice};

/// `batch <limit> [timeout]`: emits a slice once `limit` rows have
/// accumulated, or earlier if a barrier/EOS arrives with a partial buffer. An
/// optional `timeout` additionally flushes a partial buffer once that much
/// time has passed since the last emission.
pub struct Batch {
    name: String,
    limit: usize,
    timeout: Option<Duration>,
}

impl Batch {
    pub fn new(name: impl Into<String>, limit: usize, timeout: Option<Duration>) -> Self {
        assert!(limit > 0, "batch limit must be positive");
        Self { name: name.into(), limit, timeout }
    }
}

#[async_trait]
impl Operator for Batch {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Events
    }

    fn output_kind(&self) -> ElementKind {
        ElementKind::Events
    }

    async fn instantiate(&self, input: MessageStream, control: ControlPlane) -> Result<MessageStream> {
        let state = State {
            input,
            control,
            limit: self.limit,
            timeout: self.timeout,
            buffered: Vec::new(),
            buffered_rows: 0,
            schema: None,
            pending: VecDeque::new(),
            done: false,
        };
        Ok(stream::unfold(state, step).boxed())
    }
}

struct State {
    input: MessageStream,
    control: ControlPlane,
    limit: usize,
    timeout: Option<Duration>,
    buffered: Vec<TableSlice>,
    buffered_rows: usize,
    schema: Option<SchemaRef>,
    pending: VecDeque<Message>,
    done: bool,
}

impl State {
    fn flush_full_batches(&mut self) -> Result<()> {
        while self.buffered_rows >= self.limit {
            let whole = std::mem::take(&mut self.buffered);
            let merged = TableSlice::concatenate(whole)?;
            let (head, tail) = merged.split(self.limit);
            self.pending.push_back(Message::Batch(head));
            self.buffered_rows = tail.len();
            if tail.is_empty() {
                self.buffered.clear();
            } else {
                self.buffered = vec![tail];
            }
        }
        Ok(())
    }

    fn flush_partial(&mut self) -> Result<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let whole = std::mem::take(&mut self.buffered);
        self.buffered_rows = 0;
        let merged = TableSlice::concatenate(whole)?;
        self.pending.push_back(Message::Batch(merged));
        Ok(())
    }
}

async fn step(mut state: State) -> Option<(Message, State)> {
    loop {
        if let Some(msg) = state.pending.pop_front() {
            return Some((msg, state));
        }
        if state.done {
            return None;
        }

        let next = match state.timeout {
            Some(d) => match tokio::time::timeout(d, state.input.next()).await {
                Ok(next) => next,
                Err(_elapsed) => {
                    if let Err(e) = state.flush_partial() {
                        tracing::warn!(error = %e, "batch failed flushing on idle timeout");
                        state.control.emit(flux_core::diagnostics::Diagnostic::warning(format!(
                            "batch dropped a partial batch on idle timeout: {e}"
                        )));
                    } else if state.pending.is_empty() && state.schema.is_some() {
                        // Nothing buffered and nothing to say: keep the
                        // downstream channel alive with an empty slice so a
                        // sink waiting on a watermark doesn't starve.
                        let empty = empty_slice(state.schema.as_ref().unwrap());
                        state.pending.push_back(Message::Batch(empty));
                    }
                    continue;
                }
            },
            None => state.input.next().await,
        };

        match next {
            Some(Message::Batch(slice)) => {
                state.schema = Some(slice.schema());
                state.buffered_rows += slice.len();
                state.buffered.push(slice);
                if let Err(e) = state.flush_full_batches() {
                    tracing::warn!(error = %e, "batch failed concatenating accumulated slices");
                    state.control.emit(flux_core::diagnostics::Diagnostic::warning(format!(
                        "batch dropped a batch while coalescing: {e}"
                    )));
                }
            }
            Some(Message::Barrier(id)) => {
                if let Err(e) = state.flush_partial() {
                    tracing::warn!(error = %e, "batch failed flushing before barrier");
                    state.control.emit(flux_core::diagnostics::Diagnostic::warning(format!(
                        "batch dropped a partial batch before a barrier: {e}"
                    )));
                }
                state.pending.push_back(Message::Barrier(id));
            }
            Some(Message::Eos) => {
                if let Err(e) = state.flush_partial() {
                    tracing::warn!(error = %e, "batch failed flushing before eos");
                    state.control.emit(flux_core::diagnostics::Diagnostic::warning(format!(
                        "batch dropped a partial batch before eos: {e}"
                    )));
                }
                state.pending.push_back(Message::Eos);
                state.done = true;
            }
            Some(other) => state.pending.push_back(other),
            None => {
                if let Err(e) = state.flush_partial() {
                    tracing::warn!(error = %e, "batch failed flushing on upstream close");
                    state.control.emit(flux_core::diagnostics::Diagnostic::warning(format!(
                        "batch dropped a partial batch on upstream close: {e}"
                    )));
                }
                state.pending.push_back(Message::Eos);
                state.done = true;
            }
        }
    }
}

fn empty_slice(schema: &SchemaRef) -> TableSlice {
    let batch = datafusion::arrow::array::RecordBatch::new_empty(schema.clone());
    TableSlice::from_batch(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Int64Array, RecordBatch};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use flux_core::control::NoSecrets;
    use flux_core::diagnostics::CollectingSink;
    use std::sync::Arc;

    fn one_row(v: i64) -> TableSlice {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![v]))]).unwrap();
        TableSlice::from_batch(batch)
    }

    // S1: batch 3 fed five single-row events (timeout disabled) emits a
    // 3-row slice, then a 2-row slice flushed at EOS.
    #[tokio::test]
    async fn s1_batches_by_limit_and_flushes_remainder_at_eos() {
        let messages: Vec<_> = (0..5).map(|i| Message::Batch(one_row(i))).chain([Message::Eos]).collect();
        let input = stream::iter(messages).boxed();

        let op = Batch::new("batch", 3, None);
        let control = ControlPlane::new(Arc::new(CollectingSink::new()), Arc::new(NoSecrets));
        let mut out = op.instantiate(input, control).await.unwrap();

        let first = out.next().await.unwrap();
        assert!(matches!(first, Message::Batch(ref b) if b.len() == 3));
        let second = out.next().await.unwrap();
        assert!(matches!(second, Message::Batch(ref b) if b.len() == 2));
        let third = out.next().await.unwrap();
        assert!(third.is_eos());
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn flushes_partial_buffer_on_barrier() {
        use flux_core::message::CheckpointId;

        let messages = vec![
            Message::Batch(one_row(1)),
            Message::Barrier(CheckpointId(1)),
            Message::Batch(one_row(2)),
            Message::Eos,
        ];
        let input = stream::iter(messages).boxed();

        let op = Batch::new("batch", 10, None);
        let control = ControlPlane::new(Arc::new(CollectingSink::new()), Arc::new(NoSecrets));
        let mut out = op.instantiate(input, control).await.unwrap();

        let first = out.next().await.unwrap();
        assert!(matches!(first, Message::Batch(ref b) if b.len() == 1));
        let second = out.next().await.unwrap();
        assert!(matches!(second, Message::Barrier(id) if id == CheckpointId(1)));
        let third = out.next().await.unwrap();
        assert!(matches!(third, Message::Batch(ref b) if b.len() == 1));
        let fourth = out.next().await.unwrap();
        assert!(fourth.is_eos());
    }
}
