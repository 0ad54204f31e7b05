use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use flux_core::control::ControlPlane;
use flux_core::message::Message;
use flux_core::operator::{ElementKind, MessageStream, Operator};
use flux_core::Result;

const CHUNK_SIZE: usize = 64 * 1024;

/// `from_stdin`: reads standard input in fixed-size chunks, emitting
/// [`Message::Bytes`] until EOF.
pub struct StdioSource {
    name: String,
}

impl StdioSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Operator for StdioSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Void
    }

    fn output_kind(&self) -> ElementKind {
        ElementKind::Bytes
    }

    async fn instantiate(&self, _input: MessageStream, control: ControlPlane) -> Result<MessageStream> {
        let stdin = tokio::io::stdin();
        Ok(stream::unfold((stdin, control, false), |(mut stdin, control, done)| async move {
            if done {
                return None;
            }
            let mut buf = vec![0u8; CHUNK_SIZE];
            match stdin.read(&mut buf).await {
                Ok(0) => Some((Message::Eos, (stdin, control, true))),
                Ok(n) => {
                    buf.truncate(n);
                    Some((Message::Bytes(Bytes::from(buf)), (stdin, control, false)))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stdio source read failed");
                    control.emit(flux_core::diagnostics::Diagnostic::error(format!(
                        "stdio source read failed: {e}"
                    )));
                    Some((Message::Eos, (stdin, control, true)))
                }
            }
        })
        .boxed())
    }
}

/// `to_stdout`: writes every incoming byte chunk to standard output.
/// Generalizes the teacher's `rde_io::StdoutSink` (which printed decoded
/// string columns) down to the raw-bytes level this crate's in-scope
/// connectors operate at.
pub struct StdioSink {
    name: String,
}

impl StdioSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Operator for StdioSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Bytes
    }

    fn output_kind(&self) -> ElementKind {
        ElementKind::Void
    }

    async fn instantiate(&self, input: MessageStream, control: ControlPlane) -> Result<MessageStream> {
        let name = self.name.clone();
        let mut input = input;
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = input.next().await {
            match msg {
                Message::Bytes(chunk) => {
                    if let Err(e) = stdout.write_all(&chunk).await {
                        tracing::warn!(operator = %name, error = %e, "stdio sink write failed");
                        control.emit(flux_core::diagnostics::Diagnostic::error(format!(
                            "stdio sink write failed: {e}"
                        )));
                        break;
                    }
                }
                Message::Eos => break,
                _ => {}
            }
        }
        if let Err(e) = stdout.flush().await {
            tracing::warn!(operator = %name, error = %e, "stdio sink flush failed");
            control.emit(flux_core::diagnostics::Diagnostic::error(format!(
                "stdio sink flush failed: {e}"
            )));
        }
        Ok(stream::iter(vec![Message::Eos]).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_eos_after_draining_input() {
        let sink = StdioSink::new("stdout");
        let control = ControlPlane::new(
            std::sync::Arc::new(flux_core::diagnostics::CollectingSink::new()),
            std::sync::Arc::new(flux_core::control::NoSecrets),
        );
        let input = stream::iter(vec![Message::Bytes(Bytes::from_static(b"hi")), Message::Eos]).boxed();
        let mut out = sink.instantiate(input, control).await.unwrap();
        assert!(out.next().await.unwrap().is_eos());
        assert!(out.next().await.is_none());
    }
}
