//! Framed message channel
//!
//! Carries [`Message`]s over any byte stream pair. The network process uses
//! stdin for inbound frames and stdout for outbound frames.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{CodecError, Decoder, Encoder, Message};

/// Channel errors; any of them ends the process
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Channel closed mid-frame")]
    Truncated,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Reads frames from a byte stream
pub struct FrameReader<R> {
    reader: R,
    decoder: Decoder,
    read_buf: BytesMut,
    frames_received: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            frames_received: 0,
        }
    }

    /// Receive the next message; `None` on a clean close between frames
    pub async fn recv(&mut self) -> ChannelResult<Option<Message>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.frames_received += 1;
                return Ok(Some(frame.message));
            }

            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                // The decoder may hold a parsed header with no payload yet
                return if self.read_buf.is_empty() && self.decoder.is_idle() {
                    Ok(None)
                } else {
                    Err(ChannelError::Truncated)
                };
            }
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }
}

/// Writes frames to a byte stream
pub struct FrameWriter<W> {
    writer: W,
    encoder: Encoder,
    write_buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            encoder: Encoder::new(),
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Send a message as a single frame
    pub async fn send(&mut self, message: &Message) -> ChannelResult<()> {
        self.write_buf.clear();
        self.encoder.encode(message, &mut self.write_buf)?;

        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> ChannelResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Forward decoded frames into `tx` until the stream closes
///
/// Returns `Ok(())` on a clean close, or when the receiving side is gone.
pub async fn pump_inbound<R: AsyncRead + Unpin>(
    reader: R,
    tx: mpsc::Sender<Message>,
) -> ChannelResult<()> {
    let mut reader = FrameReader::new(reader);
    while let Some(message) = reader.recv().await? {
        tracing::trace!("Inbound frame: {:?}", message.type_id());
        if tx.send(message).await.is_err() {
            break;
        }
    }
    tracing::debug!("Inbound channel closed after {} frames", reader.frames_received());
    Ok(())
}

/// Encode every message from `rx` onto the stream until all senders drop
pub async fn pump_outbound<W: AsyncWrite + Unpin>(
    writer: W,
    mut rx: mpsc::Receiver<Message>,
) -> ChannelResult<()> {
    let mut writer = FrameWriter::new(writer);
    while let Some(message) = rx.recv().await {
        writer.send(&message).await?;
    }
    writer.shutdown().await
}
