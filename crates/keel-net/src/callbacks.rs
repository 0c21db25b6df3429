use std::rc::Rc;

use bytes::Bytes;

use crate::{Conn, ErrorCode};

pub type ConnectCallback = Rc<dyn Fn(&Conn)>;
pub type MessageCallback = Rc<dyn Fn(&Conn, Bytes)>;
pub type CloseCallback = Rc<dyn Fn(&Conn)>;
pub type ErrorCallback = Rc<dyn Fn(&Conn, ErrorCode, &str)>;
pub type BufferCallback = Rc<dyn Fn(&Conn)>;

/// The per-connection callback surface, frozen at listener creation and
/// copied into every accepted connection (which may then override single
/// entries, e.g. by `pipe`).
#[derive(Clone, Default)]
pub struct CallbackSet {
    pub on_connect: Option<ConnectCallback>,
    pub on_message: Option<MessageCallback>,
    pub on_close: Option<CloseCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_buffer_full: Option<BufferCallback>,
    pub on_buffer_drain: Option<BufferCallback>,
    pub on_websocket_connect: Option<ConnectCallback>,
}

impl CallbackSet {
    /// Release every closure. Called from `destroy` so the connection no
    /// longer keeps user state (and hence possible cycles) alive.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
