//! Chunked, acknowledged framing over a byte stream.
//!
//! A message travels as `payload + "\r\n"` cut into frames of at most
//! `chunk_size` bytes. After every frame the sender blocks until the receiver
//! answers with a 15-byte space-padded token: `ACK\r\n` for an intermediate
//! frame, `COMPLETE\r\n` once the accumulated bytes end with the terminator.
//! Payloads must not contain `\r\n` themselves; compact JSON never does.
//!
//! Every read and write is bounded by the configured progress timeout, so a
//! stalled peer turns into [`TransportError::Timeout`] instead of a hang.

use std::future::Future;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::trace;

use crate::{config::FramingConfig, error::TransportError};

pub const TERMINATOR: &[u8] = b"\r\n";
pub const TOKEN_LEN: usize = 15;

const ACK: &[u8] = b"ACK\r\n";
const COMPLETE: &[u8] = b"COMPLETE\r\n";

/// A handshake word padded with spaces to [`TOKEN_LEN`] bytes.
pub fn token(word: &[u8]) -> [u8; TOKEN_LEN] {
    let mut padded = [b' '; TOKEN_LEN];
    padded[..word.len()].copy_from_slice(word);
    padded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Ack,
    Complete,
}

fn parse_token(raw: &[u8]) -> Result<Handshake, TransportError> {
    if contains(raw, COMPLETE) {
        Ok(Handshake::Complete)
    } else if contains(raw, ACK) {
        Ok(Handshake::Ack)
    } else {
        Err(TransportError::UnexpectedToken(
            String::from_utf8_lossy(raw).into_owned(),
        ))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

async fn within<F, T>(config: &FramingConfig, op: F) -> Result<T, TransportError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout(config.progress_timeout, op).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::Timeout(config.progress_timeout)),
    }
}

/// Sends one message and waits for the receiver to confirm it.
pub async fn send_message<S>(
    stream: &mut S,
    payload: &[u8],
    config: &FramingConfig,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if contains(payload, TERMINATOR) {
        return Err(TransportError::EmbeddedTerminator);
    }

    let mut wire = Vec::with_capacity(payload.len() + TERMINATOR.len());
    wire.extend_from_slice(payload);
    wire.extend_from_slice(TERMINATOR);

    let chunk_size = config.chunk_size.max(TERMINATOR.len());
    let frames = wire.chunks(chunk_size).count();
    for (index, frame) in wire.chunks(chunk_size).enumerate() {
        within(config, stream.write_all(frame)).await?;
        within(config, stream.flush()).await?;

        let mut raw = [0u8; TOKEN_LEN];
        within(config, stream.read_exact(&mut raw)).await.map_err(closed_on_eof)?;
        let handshake = parse_token(&raw)?;
        trace!(frame = index + 1, frames, len = frame.len(), ?handshake, "frame acknowledged");

        let terminal = index + 1 == frames;
        match (terminal, handshake) {
            (false, Handshake::Ack) | (true, Handshake::Complete) => {}
            _ => {
                return Err(TransportError::UnexpectedToken(
                    String::from_utf8_lossy(&raw).into_owned(),
                ));
            }
        }
    }

    Ok(())
}

/// Receives one message, acknowledging each frame, and strips the terminator.
pub async fn recv_message<S>(
    stream: &mut S,
    config: &FramingConfig,
) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let chunk_size = config.chunk_size.max(TERMINATOR.len());
    let mut data = Vec::new();
    let mut buffer = vec![0u8; chunk_size];
    let mut frame_len = 0;
    let mut frames = 0usize;

    loop {
        let read = within(config, stream.read(&mut buffer[..chunk_size - frame_len])).await?;
        if read == 0 {
            return Err(TransportError::Closed);
        }
        data.extend_from_slice(&buffer[..read]);
        frame_len += read;

        if data.ends_with(TERMINATOR) {
            frames += 1;
            within(config, stream.write_all(&token(COMPLETE))).await?;
            within(config, stream.flush()).await?;
            trace!(frames, len = data.len(), "sent COMPLETE");
            data.truncate(data.len() - TERMINATOR.len());
            return Ok(data);
        }

        if frame_len == chunk_size {
            frames += 1;
            frame_len = 0;
            within(config, stream.write_all(&token(ACK))).await?;
            within(config, stream.flush()).await?;
            trace!(frames, len = data.len(), "sent ACK");
        }
    }
}

fn closed_on_eof(error: TransportError) -> TransportError {
    match error {
        TransportError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            TransportError::Closed
        }
        other => other,
    }
}
