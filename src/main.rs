//! jsrdbg-bridge - connects a debugging front-end to a remote jsrdbg target.
//!
//! Wires the TCP transport, the correlation layer and a minimal session
//! coordinator together. Mostly useful for probing a target: it can fire a
//! single command and print the reply, load a local source file through
//! encoding resolution, or just sit on the connection and log unsolicited
//! traffic.

use anyhow::Context;
use clap::Parser;
use jsrdbg_bridge::connection::{
    spawn_dispatch, Connection, ConnectionEvent, ConnectionLike, Coordinator,
};
use jsrdbg_bridge::encoding::{EncodingResolver, SocketEncodingHost};
use jsrdbg_bridge::protocol::{Command, Response};
use jsrdbg_bridge::sourcemap::LocalSource;
use jsrdbg_bridge::transport::TcpTransport;
use log::{info, warn};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address of the jsrdbg target (default: 127.0.0.1:8089).
    #[clap(long, default_value = "127.0.0.1:8089")]
    target: String,

    /// Unix socket on which the host process answers encoding questions.
    #[clap(long, default_value = "/tmp/jsrdbg-bridge-encoding.sock")]
    encoding_socket: PathBuf,

    /// Load this local source file, resolving its encoding, and print it.
    #[clap(long)]
    print_source: Option<String>,

    /// Send this command once after connecting and print the reply.
    #[clap(long)]
    exec: Option<String>,
}

/// Fallback coordinator: surfaces newly discovered execution contexts as
/// connection events and logs everything else.
struct LoggingCoordinator;

impl Coordinator for LoggingCoordinator {
    fn handle_response(&mut self, connection: &dyn ConnectionLike, response: Response) {
        let content = &response.content;
        if let (Some(id), Some(name)) = (
            content.get("contextId").and_then(|v| v.as_i64()),
            content.get("contextName").and_then(|v| v.as_str()),
        ) {
            connection.emit(ConnectionEvent::NewContext {
                id,
                name: name.to_string(),
                stopped: content
                    .get("stopped")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            });
            return;
        }
        info!(target: "bridge", "unsolicited response: {content}");
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    // Source loading needs no target connection, only the encoding host.
    if let Some(path) = args.print_source {
        let host = SocketEncodingHost::new(&args.encoding_socket);
        let resolver = EncodingResolver::new(Box::new(host));
        let text = LocalSource::new(path)
            .load_from_disk(&resolver)
            .context("load source file")?;
        print!("{text}");
        return Ok(());
    }

    let transport =
        TcpTransport::connect(&args.target).with_context(|| format!("connect {}", args.target))?;
    let source = transport.try_clone()?;
    info!(target: "bridge", "connected to target at {}", args.target);

    let (connection, events) =
        Connection::new(Box::new(transport), Box::new(LoggingCoordinator));
    let dispatch = spawn_dispatch(connection.clone(), Box::new(source));

    if let Some(name) = args.exec {
        let reply = connection.send_request(
            Command::new(name),
            Some(Box::new(|response| Ok(response.content))),
        )?;
        let content = reply.wait()?;
        println!("{content:#}");
        connection.disconnect()?;
    }

    // The dispatch thread keeps the event sender alive; once the connection
    // goes down the loop below ends with it.
    drop(connection);
    for event in events {
        match event {
            ConnectionEvent::NewContext { id, name, stopped } => {
                info!(target: "bridge", "new context {id} \"{name}\" (stopped: {stopped})");
            }
        }
    }

    if dispatch.join().is_err() {
        warn!(target: "bridge", "dispatch loop panicked");
    }
    Ok(())
}
