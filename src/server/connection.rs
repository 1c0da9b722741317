//! Client connection handling

use crate::protocol::{self, crypto::SecretKey, Response};
use anyhow::{anyhow, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound queue depth per client; a peer that stops reading hits this
/// high-water mark and is disconnected rather than buffered without bound.
pub const SEND_QUEUE_DEPTH: usize = 256;

/// Represents a connected client
pub struct ClientConnection {
    /// Unique client identifier
    id: Uuid,

    /// Queue feeding this client's writer task
    sender: mpsc::Sender<Response>,
}

impl ClientConnection {
    pub fn new(sender: mpsc::Sender<Response>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a response without blocking. Errors mean the queue is full or
    /// the writer is gone; the caller drops the connection either way.
    pub fn send(&self, response: Response) -> Result<()> {
        self.sender
            .try_send(response)
            .map_err(|_| anyhow!("Client {} send queue unavailable", self.id))
    }
}

/// Writer task: seal queued responses and write them to the socket.
pub async fn client_writer_task(
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<Response>,
    key: SecretKey,
) {
    while let Some(response) = receiver.recv().await {
        match protocol::seal(&response, &key) {
            Ok(frame) => {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::warn!("Failed to write response to client: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Failed to seal response: {}", e);
            }
        }
    }

    tracing::debug!("Client writer task finished");
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
