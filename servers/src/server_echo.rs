//! Line-based echo server.
//!
//! Four workers on a text listener; every line comes straight back. The
//! usual verbs apply: `server_echo start [-d]`, `stop [-g]`, `reload [-g]`,
//! `status`, `connections`.

use anyhow::Result;
use tracing::info;

use lib_server::{Server, Supervisor};

fn main() -> Result<()> {
    // Environment first: SERVER_RUNTIME_DIR, SERVER_LOG_FILE, RUST_LOG ...
    dotenvy::dotenv().ok();

    let echo = Server::new("text://0.0.0.0:8484")
        .name("echo")
        .count(4)
        .on_server_start(|_| {
            info!("echo worker serving");
            Ok(())
        })
        .on_connect(|conn| {
            info!(id = conn.id(), peer = %conn.remote_address(), "client connected");
            Ok(())
        })
        .on_message(|conn, packet| {
            conn.send(packet);
            Ok(())
        })
        .on_close(|conn| {
            info!(id = conn.id(), "client left");
            Ok(())
        });

    let mut supervisor = Supervisor::new()?;
    supervisor.add_server(echo);
    let code = supervisor.run_all()?;
    std::process::exit(code);
}
