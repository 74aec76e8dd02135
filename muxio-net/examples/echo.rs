//! Echo server on a single loop: `cargo run --example echo`, then
//! `nc 127.0.0.1 2007`.

use muxio_net::{EventLoop, TcpServer};
use std::net::SocketAddr;
use std::sync::Arc;

fn main() -> std::io::Result<()> {
    let event_loop = EventLoop::new()?;
    let addr: SocketAddr = "0.0.0.0:2007".parse().expect("valid listen address");
    let server = TcpServer::new(&event_loop, &addr, "echo", false)?;
    server.set_connection_callback(Arc::new(|conn| {
        println!(
            "{} {}",
            conn.peer_addr(),
            if conn.connected() { "up" } else { "down" }
        );
    }));
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let msg = buf.retrieve_all_as_bytes();
        conn.send(&msg);
    }));
    server.start()?;
    println!("echo listening on {}", server.local_addr()?);
    event_loop.run();
    Ok(())
}
