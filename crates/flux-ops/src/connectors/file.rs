use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use flux_core::control::ControlPlane;
use flux_core::error::PipelineError;
use flux_core::message::Message;
use flux_core::operator::{ElementKind, MessageStream, Operator};
use flux_core::Result;

const CHUNK_SIZE: usize = 64 * 1024;

/// `from_file <path>`: reads a file in fixed-size chunks, emitting
/// [`Message::Bytes`] until EOF.
pub struct FileSource {
    name: String,
    path: PathBuf,
}

impl FileSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), path: path.into() }
    }
}

#[async_trait]
impl Operator for FileSource {
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
        let file = tokio::fs::File::open(&self.path).await.map_err(PipelineError::from)?;
        let state = (file, control, false);
        Ok(stream::unfold(state, |(mut file, control, done)| async move {
            if done {
                return None;
            }
            let mut buf = vec![0u8; CHUNK_SIZE];
            match file.read(&mut buf).await {
                Ok(0) => Some((Message::Eos, (file, control, true))),
                Ok(n) => {
                    buf.truncate(n);
                    Some((Message::Bytes(Bytes::from(buf)), (file, control, false)))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "file source read failed");
                    control.emit(flux_core::diagnostics::Diagnostic::error(format!(
                        "file source read failed: {e}"
                    )));
                    Some((Message::Eos, (file, control, true)))
                }
            }
        })
        .boxed())
    }
}

/// `to_file <path>`: writes every incoming byte chunk to a file, truncating
/// it first.
pub struct FileSink {
    name: String,
    path: PathBuf,
}

impl FileSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), path: path.into() }
    }
}

#[async_trait]
impl Operator for FileSink {
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
        let mut file = tokio::fs::File::create(&self.path).await.map_err(PipelineError::from)?;
        let name = self.name.clone();
        let mut input = input;
        while let Some(msg) = input.next().await {
            match msg {
                Message::Bytes(chunk) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        tracing::warn!(operator = %name, error = %e, "file sink write failed");
                        control.emit(flux_core::diagnostics::Diagnostic::error(format!(
                            "file sink write failed: {e}"
                        )));
                        break;
                    }
                }
                Message::Eos => break,
                _ => {}
            }
        }
        if let Err(e) = file.flush().await {
            tracing::warn!(operator = %name, error = %e, "file sink flush failed");
            control.emit(flux_core::diagnostics::Diagnostic::error(format!(
                "file sink flush failed: {e}"
            )));
        }
        Ok(stream::iter(vec![Message::Eos]).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_bytes_through_a_temp_file() {
        let dir = tempdir();
        let path = dir.join("roundtrip.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let source = FileSource::new("src", path.clone());
        let control = ControlPlane::new(
            std::sync::Arc::new(flux_core::diagnostics::CollectingSink::new()),
            std::sync::Arc::new(flux_core::control::NoSecrets),
        );
        let empty = stream::empty().boxed();
        let mut out = source.instantiate(empty, control.clone()).await.unwrap();

        let mut collected = Vec::new();
        while let Some(msg) = out.next().await {
            match msg {
                Message::Bytes(b) => collected.extend_from_slice(&b),
                Message::Eos => break,
                _ => {}
            }
        }
        assert_eq!(collected, b"hello world");

        let sink_path = dir.join("sink.bin");
        let sink = FileSink::new("sink", sink_path.clone());
        let input = stream::iter(vec![Message::Bytes(Bytes::from(collected)), Message::Eos]).boxed();
        let mut sink_out = sink.instantiate(input, control).await.unwrap();
        assert!(sink_out.next().await.unwrap().is_eos());

        let written = std::fs::read(&sink_path).unwrap();
        assert_eq!(written, b"hello world");
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flux-ops-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
