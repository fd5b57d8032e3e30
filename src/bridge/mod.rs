//! Bridge from mesh replies to the side-channel notifier
//!
//! Replies are reformatted as `DEVICE<id>:<KIND>:<payload>` and split into
//! frames the notifier can carry.

pub mod chunking;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::mesh::{Address, Opcode};
use crate::{Error, Result};

pub use chunking::{Reassembler, split_frames};

/// Low-payload notification transport to the companion application
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Notifier name for logs
    fn name(&self) -> &'static str;

    /// Largest frame `notify` accepts
    fn frame_limit(&self) -> usize;

    /// Whether a companion is connected to receive frames
    fn is_connected(&self) -> bool {
        true
    }

    /// Deliver one frame of at most `frame_limit` bytes
    async fn notify(&self, frame: &[u8]) -> Result<()>;
}

/// Formats replies and status lines for the notifier
#[derive(Clone)]
pub struct ResponseBridge {
    notifier: Arc<dyn Notifier>,
    node_base: Address,
    max_message_len: usize,
}

impl ResponseBridge {
    /// `node_base` is the address reported as device 0
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, node_base: Address, max_message_len: usize) -> Self {
        Self {
            notifier,
            node_base,
            max_message_len,
        }
    }

    /// Device number shown for `source`; addresses below the base map to 0
    #[must_use]
    pub const fn device_number(&self, source: Address) -> u16 {
        if source.0 >= self.node_base.0 {
            source.0 - self.node_base.0
        } else {
            0
        }
    }

    /// Forward an application reply from the mesh
    pub async fn forward_reply(&self, source: Address, opcode: Opcode, payload: &[u8], in_reply_to: Opcode) {
        let id = self.device_number(source);
        let message = match (opcode, in_reply_to) {
            (Opcode::VendorStatus, _) => {
                let mut message = format!("DEVICE{id}:DATA:").into_bytes();
                message.extend_from_slice(payload);
                message
            }
            (Opcode::OnOffStatus, Opcode::OnOffGet) => {
                format!("DEVICE{id}:ONOFF:{}", payload.first().copied().unwrap_or(0)).into_bytes()
            }
            (Opcode::OnOffStatus, _) => {
                format!("DEVICE{id}:ACK:{}", payload.first().copied().unwrap_or(0)).into_bytes()
            }
            _ => {
                tracing::debug!(%source, ?opcode, "reply not forwarded");
                return;
            }
        };
        self.deliver(&message).await;
    }

    /// Report the result of a command executed on this device
    pub async fn report_local(&self, own_address: Address, reply: &str) {
        let id = self.device_number(own_address);
        self.deliver(format!("DEVICE{id}:DATA:{reply}").as_bytes()).await;
    }

    /// Report an on/off exchange that got no answer
    pub async fn report_timeout(&self, target: Address) {
        let id = self.device_number(target);
        self.deliver(format!("DEVICE{id}:TIMEOUT:0x{:04x}", target.0).as_bytes())
            .await;
    }

    /// Send a router status line such as `SENT:RAMP`
    pub async fn status(&self, line: &str) {
        self.deliver(line.as_bytes()).await;
    }

    async fn deliver(&self, message: &[u8]) {
        if !self.notifier.is_connected() {
            tracing::debug!(
                notifier = self.notifier.name(),
                "no companion connected, dropping notification"
            );
            return;
        }

        let message = if message.len() > self.max_message_len {
            tracing::debug!(
                len = message.len(),
                max = self.max_message_len,
                "truncating notification"
            );
            &message[..self.max_message_len]
        } else {
            message
        };

        let frames = split_frames(message, self.notifier.frame_limit());
        let count = frames.len();
        for (i, frame) in frames.iter().enumerate() {
            if let Err(e) = self.notifier.notify(frame).await {
                tracing::warn!(
                    notifier = self.notifier.name(),
                    frame = i,
                    unsent = count - i - 1,
                    error = %e,
                    "notify failed, dropping rest of message"
                );
                return;
            }
        }
        tracing::debug!(frames = count, len = message.len(), "notification sent");
    }
}

/// Notifier that reassembles frames and prints whole messages to stdout
pub struct StdoutNotifier {
    frame_limit: usize,
    reassembler: Mutex<Reassembler>,
}

impl StdoutNotifier {
    #[must_use]
    pub fn new(frame_limit: usize) -> Self {
        Self {
            frame_limit,
            reassembler: Mutex::new(Reassembler::new()),
        }
    }
}

#[async_trait]
impl Notifier for StdoutNotifier {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn frame_limit(&self) -> usize {
        self.frame_limit
    }

    async fn notify(&self, frame: &[u8]) -> Result<()> {
        tracing::trace!(frame = %String::from_utf8_lossy(frame), "frame");
        let complete = self
            .reassembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);

        if let Some(mut message) = complete {
            message.push(b'\n');
            let mut out = tokio::io::stdout();
            out.write_all(&message)
                .await
                .map_err(|e| Error::Notifier(e.to_string()))?;
            out.flush().await.map_err(|e| Error::Notifier(e.to_string()))?;
        }
        Ok(())
    }
}
