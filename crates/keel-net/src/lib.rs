//! Per-connection state machines: TCP (plain and TLS), UDP, and the
//! client-side connector, glued to the codec contract.

mod callbacks;
mod client;
mod codec;
mod codecs;
mod registry;
mod stats;
mod tcp;
mod tls;
mod udp;

use std::io;

pub use callbacks::{
    BufferCallback, CallbackSet, CloseCallback, ConnectCallback, ErrorCallback, MessageCallback,
};
pub use client::AsyncTcpConnection;
pub use codec::{Codec, CodecHandle, CodecRegistry, ConnectionContext, FrameVerdict};
pub use codecs::{FrameCodec, TextCodec};
pub use registry::ConnectionRegistry;
pub use stats::Statistics;
pub use tcp::{ConnectionOptions, StreamSocket, TcpConnection};
use thiserror::Error;
pub use tls::TlsContext;
pub use udp::{dispatch_datagram, AsyncUdpConnection, UdpConnection};

/// Read chunk per readiness firing.
pub const READ_BUFFER_SIZE: usize = 65535;
/// Default cap on a connection's send buffer.
pub const DEFAULT_MAX_SEND_BUFFER_SIZE: usize = 1024 * 1024;
/// Default cap on one decoded frame.
pub const DEFAULT_MAX_PACKAGE_SIZE: usize = 10 * 1024 * 1024;
/// TLS writes are flushed in chunks of this size.
pub const TLS_WRITE_CHUNK: usize = 8192;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Initial,
    Connecting,
    Established,
    Closing,
    Closed,
}

/// Error codes handed to `on_error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    ConnectFail = 1,
    SendFail = 2,
}

/// A connection handle as seen by user callbacks: TCP (server or client
/// side) or a per-datagram UDP view.
#[derive(Clone)]
pub enum Conn {
    Tcp(TcpConnection),
    Udp(UdpConnection),
}

impl Conn {
    pub fn id(&self) -> u64 {
        match self {
            Self::Tcp(c) => c.id(),
            Self::Udp(c) => c.id(),
        }
    }

    /// Encode through the codec (when present) and transmit.
    pub fn send(&self, data: bytes::Bytes) -> bool {
        match self {
            Self::Tcp(c) => c.send(data),
            Self::Udp(c) => c.send(data),
        }
    }

    /// Transmit without running the codec's encode step.
    pub fn send_raw(&self, data: bytes::Bytes) -> bool {
        match self {
            Self::Tcp(c) => c.send_raw(data),
            Self::Udp(c) => c.send_raw(data),
        }
    }

    pub fn close(&self) {
        match self {
            Self::Tcp(c) => c.close(None),
            Self::Udp(_) => {}
        }
    }

    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Self::Tcp(c) => c.remote_addr(),
            Self::Udp(c) => Some(c.remote_addr()),
        }
    }

    pub fn transport(&self) -> &'static str {
        match self {
            Self::Tcp(c) => c.transport(),
            Self::Udp(_) => "udp",
        }
    }

    /// The TCP side of this handle, when it has one.
    pub fn as_tcp(&self) -> Option<&TcpConnection> {
        match self {
            Self::Tcp(c) => Some(c),
            Self::Udp(_) => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("unknown codec scheme `{0}`")]
    UnknownCodec(String),
    #[error("no certificates found in {0}")]
    EmptyCertChain(String),
    #[error("no private key found in {0}")]
    MissingKey(String),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
