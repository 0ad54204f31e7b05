//! Identity operator, generalized from the teacher's `rde_tx::Passthrough`
//! (which forwarded `Message::Batch`/`Watermark`/`Eos` verbatim) onto the
//! unified [`Operator`] message set.

use async_trait::async_trait;
use futures::stream::StreamExt;
use tracing::info;

use flux_core::control::ControlPlane;
use flux_core::message::Message;
use flux_core::operator::{ElementKind, MessageStream, Operator};
use flux_core::Result;

/// Forwards every message downstream unmodified. Useful for testing pipeline
/// connectivity and as a placeholder during pipeline authoring, exactly the
/// teacher's stated purpose for it.
pub struct Passthrough {
    name: String,
}

impl Passthrough {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Operator for Passthrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::AnyEvents
    }

    fn output_kind(&self) -> ElementKind {
        ElementKind::AnyEvents
    }

    async fn instantiate(&self, input: MessageStream, _control: ControlPlane) -> Result<MessageStream> {
        let name = self.name.clone();
        Ok(input
            .inspect(move |msg| match msg {
                Message::Batch(b) => info!(operator = %name, rows = b.len(), "passthrough forwarding batch"),
                Message::Eos => info!(operator = %name, "passthrough forwarding eos"),
                _ => {}
            })
            .boxed())
    }
}
