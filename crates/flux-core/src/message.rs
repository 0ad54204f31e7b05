//! The message envelope operators exchange over their channels (spec §3.4,
//! §4.G). Generalizes the teacher's `Batch`-only message into the closed set
//! the spec names: data (bytes or events), checkpoint barriers, and EOS.

use tokio::sync::mpsc;

use crate::slice::TableSlice;

/// Identifies one checkpoint round (spec §4.G). Monotonically increasing;
/// assigned by the checkpoint coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointId(pub u64);

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "checkpoint-{}", self.0)
    }
}

/// What flows between two operator tasks.
///
/// `Bytes` and `Batch` are mutually exclusive on a given channel: an edge's
/// element kind (spec §4.D `input_kind`/`output_kind`) is fixed once the
/// composer wires the pipeline, so a well-formed pipeline never mixes them on
/// one channel.
#[derive(Debug, Clone)]
pub enum Message {
    /// An opaque byte chunk, for pipeline stages still inside the `Bytes`
    /// element kind (e.g. a raw file reader ahead of its parser).
    Bytes(bytes::Bytes),
    /// A unit batch of decoded events.
    Batch(TableSlice),
    /// A checkpoint barrier (spec §4.G): every operator receiving one on all
    /// of its inputs must snapshot its state before forwarding the barrier
    /// downstream, aligning the checkpoint across the whole pipeline.
    Barrier(CheckpointId),
    /// End-of-stream: no further messages will arrive on this channel.
    Eos,
}

impl Message {
    pub fn is_eos(&self) -> bool {
        matches!(self, Message::Eos)
    }

    pub fn as_batch(&self) -> Option<&TableSlice> {
        match self {
            Message::Batch(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_barrier(&self) -> Option<CheckpointId> {
        match self {
            Message::Barrier(id) => Some(*id),
            _ => None,
        }
    }
}

/// Sender half of an inter-operator channel (bounded, for backpressure —
/// spec §4.F).
pub type BatchTx = mpsc::Sender<Message>;
/// Receiver half of an inter-operator channel.
pub type BatchRx = mpsc::Receiver<Message>;

/// Default channel capacity used when an operator spec doesn't override it.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

pub fn channel(capacity: usize) -> (BatchTx, BatchRx) {
    mpsc::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_predicates() {
        assert!(Message::Eos.is_eos());
        assert!(!Message::Barrier(CheckpointId(1)).is_eos());
        assert_eq!(Message::Barrier(CheckpointId(3)).as_barrier(), Some(CheckpointId(3)));
        assert!(Message::Eos.as_batch().is_none());
    }
}
