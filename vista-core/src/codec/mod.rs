//! Length-prefixed bincode framing for `tokio_util::codec`.
//!
//! ```text
//! length: u32 LE   (body bytes)
//! body:   [u8]     bincode(message)
//! ```
//!
//! `WireCodec<D, E>` decodes `D` and encodes `E`, so a server uses
//! `WireCodec<ClientMessage, ServerMessage>` and a client the reverse.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StreamError;
use crate::message::{ClientMessage, ServerMessage};

/// Length prefix size.
pub const LENGTH_PREFIX: usize = 4;
/// Largest accepted body.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Server side: reads client messages, writes server messages.
pub type ServerCodec = WireCodec<ClientMessage, ServerMessage>;
/// Client side: reads server messages, writes client messages.
pub type ClientCodec = WireCodec<ServerMessage, ClientMessage>;

pub struct WireCodec<D, E> {
    max_frame: usize,
    _marker: PhantomData<fn(E) -> D>,
}

impl<D, E> WireCodec<D, E> {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame,
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for WireCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, E> std::fmt::Debug for WireCodec<D, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireCodec")
            .field("max_frame", &self.max_frame)
            .finish()
    }
}

impl<D: DeserializeOwned, E> tokio_util::codec::Decoder for WireCodec<D, E> {
    type Item = D;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX]);
        let len = u32::from_le_bytes(prefix) as usize;

        if len > self.max_frame {
            return Err(StreamError::Encoding(format!(
                "frame too large: {len} bytes (max {})",
                self.max_frame
            )));
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let body = src.split_to(len);
        let item = bincode::deserialize(&body)?;
        Ok(Some(item))
    }
}

impl<D, E: Serialize> tokio_util::codec::Encoder<E> for WireCodec<D, E> {
    type Error = StreamError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = bincode::serialize(&item)?;
        if body.len() > self.max_frame {
            return Err(StreamError::Encoding(format!(
                "frame too large: {} bytes (max {})",
                body.len(),
                self.max_frame
            )));
        }
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
