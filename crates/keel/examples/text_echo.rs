//! Line-based TCP echo across four workers:
//! `cargo run --example text_echo -- start`, then `nc 127.0.0.1 8080`.

use std::rc::Rc;

use keel::{Server, ServerError, Supervisor};

fn main() -> Result<(), ServerError> {
    let mut server = Server::new("text://127.0.0.1:8080")?;
    server.set_name("text-echo");
    server.set_count(4);
    server.set_reuse_port(true);
    server.set_on_connect(Rc::new(|conn| {
        keel::tracing::info!(id = conn.id(), "client connected");
    }));
    server.set_on_message(Rc::new(|conn, line| {
        conn.send(line);
    }));
    server.set_on_close(Rc::new(|conn| {
        keel::tracing::info!(id = conn.id(), "client gone");
    }));

    let mut supervisor = Supervisor::new("text-echo");
    supervisor.add_server(server);
    supervisor.run_all()
}
