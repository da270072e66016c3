//! WebSocket echo server with a cron heartbeat.
//!
//! Upgrades on `ws://0.0.0.0:8686`, echoes every message back, and logs a
//! heartbeat at second 30 of every minute through the cron scheduler.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use lib_server::{Crontab, Server, Supervisor, Timers};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let ws = Server::new("websocket://0.0.0.0:8686")
        .name("ws-echo")
        .count(2)
        .on_server_start(|handle| {
            // The armed minute tick keeps the registry alive.
            let cron = Crontab::new(handle.clone());
            cron.add("30 * * * * *", "heartbeat", || {
                info!("ws-echo heartbeat");
                Ok(())
            })?;

            let timers = Timers::new(handle.clone());
            timers.add(
                Duration::from_secs(10),
                Box::new(|| {
                    info!("ten seconds in");
                    Ok(())
                }),
                false,
            )?;
            Ok(())
        })
        .on_websocket_connect(|conn, request| {
            info!(id = conn.id(), path = %request.path, "websocket client joined");
            Ok(())
        })
        .on_message(|conn, packet| {
            conn.send(packet);
            Ok(())
        })
        .on_close(|conn| {
            info!(id = conn.id(), "websocket client left");
            Ok(())
        });

    let mut supervisor = Supervisor::new()?;
    supervisor.add_server(ws);
    let code = supervisor.run_all()?;
    std::process::exit(code);
}
