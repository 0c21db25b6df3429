//! Multi-process socket server runtime: listeners replicated across
//! forked workers, each driving one reactor.
//!
//! ```no_run
//! use std::rc::Rc;
//! use keel::{Server, Supervisor};
//!
//! let mut server = Server::new("text://127.0.0.1:8080").expect("listen target");
//! server.set_on_message(Rc::new(|conn, msg| {
//!     conn.send(msg);
//! }));
//!
//! let mut supervisor = Supervisor::new("echo");
//! supervisor.add_server(server);
//! supervisor.run_all().expect("runtime");
//! ```

mod logging;
mod scheme;
pub mod server;
pub mod supervisor;
pub mod timer;
pub mod worker;

pub use keel_net as net;
pub use keel_reactor as reactor;
pub use keel_utils as utils;
use thiserror::Error;
pub use tracing;

pub use crate::{
    scheme::{ListenTarget, Transport},
    server::Server,
    supervisor::{stop_all, Backend, Supervisor},
    timer::{TickScheduler, Timer, TimerHandle},
};

/// Worker exit code for faults the runtime cannot contain: a user
/// callback panicking with no handler installed, or `on_server_start`
/// failing. The master respawns and the exit-status histogram surfaces it.
pub const EXIT_CALLBACK_FAILURE: i32 = 250;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown user `{0}`")]
    UnknownUser(String),
    #[error("unknown group `{0}`")]
    UnknownGroup(String),
    #[error(transparent)]
    Net(#[from] keel_net::NetError),
    #[error(transparent)]
    Reactor(#[from] keel_reactor::ReactorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Os(#[from] nix::Error),
}
