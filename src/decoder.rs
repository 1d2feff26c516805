//! Attachment payload decoding on a dedicated worker thread.
//!
//! The worker is stateless: every request carries the encoded payload and its
//! content type, every reply carries the decoded bytes. Nothing is shared
//! between the worker and its callers beyond the messages themselves.

use base64::Engine;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};

/// A decode request: the base64 payload and its MIME type.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
  pub str: String,
  pub content_type: String,
}

/// Binary large object produced by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
  pub content_type: String,
  pub bytes: Arc<[u8]>,
}

impl Blob {
  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

/// Worker reply.
#[derive(Debug, Clone)]
pub struct Decoded {
  pub binary: Vec<u8>,
  pub blob: Blob,
}

enum Message {
  Decode {
    request: DecodeRequest,
    reply: oneshot::Sender<Result<Decoded>>,
  },
}

/// Handle to the decoder worker. The thread exits once every handle is dropped.
#[derive(Clone)]
pub struct Decoder {
  tx: mpsc::Sender<Message>,
}

impl Decoder {
  /// Start the worker with room for `queue` pending requests.
  pub fn spawn(queue: usize) -> Result<Self> {
    let (tx, rx) = mpsc::channel(queue.max(1));

    std::thread::Builder::new()
      .name("bugsync-decoder".into())
      .spawn(move || Self::run_loop(rx))
      .map_err(|e| Error::Decode(format!("Failed to spawn decoder thread: {}", e)))?;

    Ok(Self { tx })
  }

  fn run_loop(mut rx: mpsc::Receiver<Message>) {
    debug!("Decoder worker started");
    while let Some(message) = rx.blocking_recv() {
      match message {
        Message::Decode { request, reply } => {
          let _ = reply.send(decode(&request));
        }
      }
    }
    debug!("Decoder worker stopped");
  }

  pub async fn decode(&self, request: DecodeRequest) -> Result<Decoded> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Message::Decode { request, reply })
      .await
      .map_err(|_| Error::Decode("Decoder worker unavailable".to_string()))?;
    rx.await
      .map_err(|_| Error::Decode("Decoder worker unavailable".to_string()))?
  }
}

/// Decode a base64 payload. Line breaks inside the payload are tolerated.
pub fn decode(request: &DecodeRequest) -> Result<Decoded> {
  let compact: String = request
    .str
    .chars()
    .filter(|c| !c.is_ascii_whitespace())
    .collect();
  let binary = base64::engine::general_purpose::STANDARD
    .decode(compact.as_bytes())
    .map_err(|e| Error::Decode(e.to_string()))?;

  Ok(Decoded {
    blob: Blob {
      content_type: request.content_type.clone(),
      bytes: Arc::from(binary.as_slice()),
    },
    binary,
  })
}

/// Whether a payload of this type gets a text projection.
pub fn is_textual(content_type: &str, is_patch: bool) -> bool {
  if is_patch {
    return true;
  }
  let mime = content_type
    .split(';')
    .next()
    .unwrap_or_default()
    .trim()
    .to_ascii_lowercase();

  mime.starts_with("text/")
    || matches!(
      mime.as_str(),
      "application/json" | "application/xml" | "application/javascript" | "application/x-sh"
    )
    || mime.ends_with("+xml")
    || mime.ends_with("+json")
}

/// UTF-8 projection of decoded bytes, for textual content only.
pub fn text_projection(binary: &[u8], content_type: &str, is_patch: bool) -> Option<String> {
  is_textual(content_type, is_patch).then(|| String::from_utf8_lossy(binary).into_owned())
}
