//! Fan-out operator (spec §2, §4.E: "general DAGs are supported through
//! `group`/`fork` operators"). Each branch is a [`CompoundOperator`] wrapping
//! its own sub-pipeline that must end in a sink; `fork` clones every incoming
//! message onto every branch and runs them independently, the way
//! `flux-exec`'s scheduler runs top-level operators rather than as a single
//! sequential stream transform.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;

use flux_core::control::ControlPlane;
use flux_core::message::{channel, BatchRx, Message, DEFAULT_CHANNEL_CAPACITY};
use flux_core::operator::{ElementKind, MessageStream, Operator};
use flux_core::{PipelineError, Result};
use flux_exec::compose::CompoundOperator;

fn receiver_to_stream(rx: BatchRx) -> MessageStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) }).boxed()
}

/// `fork <branch...>`. Every branch must declare the same `input_kind` (what
/// `fork` itself accepts) and an `output_kind` of `Void` (a branch is a leaf
/// of the pipeline DAG; nothing downstream of `fork` reads a branch's own
/// output).
pub struct Fork {
    name: String,
    input_kind: ElementKind,
    branches: Vec<Arc<CompoundOperator>>,
}

impl Fork {
    pub fn new(name: impl Into<String>, branches: Vec<CompoundOperator>) -> Result<Self> {
        let name = name.into();
        let Some(first) = branches.first() else {
            return Err(PipelineError::configuration(format!("fork `{name}` requires at least one branch")));
        };
        let input_kind = first.input_kind();
        for branch in &branches {
            if branch.input_kind() != input_kind {
                return Err(PipelineError::configuration(format!(
                    "fork `{name}` branch `{}` expects {:?} but branch `{}` expects {:?}; all branches of a fork must share an input kind",
                    first.name(),
                    input_kind,
                    branch.name(),
                    branch.input_kind(),
                )));
            }
            if branch.output_kind() != ElementKind::Void {
                return Err(PipelineError::configuration(format!(
                    "fork `{name}` branch `{}` must end in a sink (output kind Void), got {:?}",
                    branch.name(),
                    branch.output_kind(),
                )));
            }
        }
        Ok(Self { name, input_kind, branches: branches.into_iter().map(Arc::new).collect() })
    }
}

#[async_trait]
impl Operator for Fork {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> ElementKind {
        self.input_kind
    }

    fn output_kind(&self) -> ElementKind {
        ElementKind::Void
    }

    fn sub_operators(&self) -> Vec<String> {
        self.branches
            .iter()
            .flat_map(|b| std::iter::once(b.name().to_string()).chain(b.sub_operators()))
            .collect()
    }

    /// Spawns one task per branch (mirroring how `flux-exec::schedule` gives
    /// every top-level operator its own task) that drains the branch's own
    /// channel through its nested pipeline, then broadcasts a clone of every
    /// upstream message onto each branch's channel before closing it at EOS.
    /// A branch's sink does its side-effecting work inside that task's
    /// `instantiate` call, the same way any sink does at the top level.
    async fn instantiate(&self, input: MessageStream, control: ControlPlane) -> Result<MessageStream> {
        let mut input = input;
        let mut txs = Vec::with_capacity(self.branches.len());
        let mut handles: Vec<JoinHandle<Result<()>>> = Vec::with_capacity(self.branches.len());

        for branch in &self.branches {
            let (tx, rx) = channel(DEFAULT_CHANNEL_CAPACITY);
            let branch = Arc::clone(branch);
            let branch_control = control.clone();
            handles.push(tokio::spawn(async move {
                let mut output = branch.instantiate(receiver_to_stream(rx), branch_control).await?;
                while output.next().await.is_some() {}
                Ok(())
            }));
            txs.push(tx);
        }

        let name = self.name.clone();
        while let Some(message) = input.next().await {
            let is_eos = message.is_eos();
            for tx in &txs {
                if tx.send(message.clone()).await.is_err() {
                    tracing::warn!(operator = %name, "fork branch closed its input before eos");
                }
            }
            if is_eos {
                break;
            }
        }
        drop(txs);

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(operator = %name, error = %e, "fork branch failed"),
                Err(join_err) => tracing::warn!(operator = %name, error = %join_err, "fork branch task panicked"),
            }
        }

        Ok(stream::once(async { Message::Eos }).boxed())
    }
}
