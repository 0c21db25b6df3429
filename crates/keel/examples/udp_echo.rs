//! UDP echo: `cargo run --example udp_echo -- start`
//! then `echo -n xiami | nc -u 127.0.0.1 6789`.

use std::rc::Rc;

use bytes::Bytes;
use keel::{Server, ServerError, Supervisor};

fn main() -> Result<(), ServerError> {
    let mut server = Server::new("udp://127.0.0.1:6789")?;
    server.set_name("udp-echo");
    server.set_on_message(Rc::new(|conn, data| {
        let mut reply = b"received: ".to_vec();
        reply.extend_from_slice(&data);
        conn.send(Bytes::from(reply));
    }));

    let mut supervisor = Supervisor::new("udp-echo");
    supervisor.add_server(server);
    supervisor.run_all()
}
