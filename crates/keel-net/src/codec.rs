use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use bytes::Bytes;

use crate::{Conn, NetError};

/// What `input` learned from the head of the receive buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameVerdict {
    /// Not enough bytes to size the frame yet.
    Incomplete,
    /// The next frame spans exactly this many bytes (header included).
    Frame(usize),
    /// The byte stream violates the protocol; the connection is destroyed.
    Invalid,
}

/// Read-only connection facts handed to the pure codec phases.
///
/// `input`/`decode`/`encode` are pure over (bytes, context); they never get
/// the live handle, so a codec cannot re-enter the connection mid-read.
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    pub connection_id: u64,
    pub remote_addr: Option<SocketAddr>,
    pub transport: &'static str,
    pub max_package_size: usize,
}

/// The three-phase framing contract.
///
/// `input` sizes the next frame, `decode` parses one sized frame into the
/// message handed to `on_message`, `encode` serialises an outgoing message.
/// For any concatenation of encoded messages, `input` must report exactly
/// the encoded lengths regardless of how the stream is chunked.
///
/// The lifecycle hooks run on the live handle: user `on_connect` fires
/// first, then [`Codec::on_connect`]; [`Codec::on_close`] fires after the
/// user's `on_close`.
pub trait Codec {
    fn input(&self, buffer: &[u8], ctx: &ConnectionContext) -> FrameVerdict;

    fn decode(&self, frame: Bytes, ctx: &ConnectionContext) -> Bytes;

    fn encode(&self, payload: Bytes, ctx: &ConnectionContext) -> Bytes;

    fn on_connect(&self, _conn: &Conn) {}

    fn on_close(&self, _conn: &Conn) {}
}

pub type CodecHandle = Arc<dyn Codec + Send + Sync>;

/// Scheme-name → codec mapping.
///
/// Replaces string-to-class reflection with explicit registration: a
/// listener scheme that is not a built-in transport must resolve here or
/// configuration fails fast.
pub struct CodecRegistry {
    codecs: HashMap<String, CodecHandle>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self { codecs: HashMap::new() };
        registry.register("text", Arc::new(crate::TextCodec));
        registry.register("frame", Arc::new(crate::FrameCodec));
        registry
    }
}

impl CodecRegistry {
    pub fn register(&mut self, scheme: impl Into<String>, codec: CodecHandle) {
        self.codecs.insert(scheme.into(), codec);
    }

    pub fn resolve(&self, scheme: &str) -> Result<CodecHandle, NetError> {
        self.codecs
            .get(scheme)
            .cloned()
            .ok_or_else(|| NetError::UnknownCodec(scheme.to_string()))
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.codecs.contains_key(scheme)
    }
}
