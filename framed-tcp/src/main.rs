use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use framed_tcp::{
    Client, Server, ServerConfig,
    cli::{Cli, Command, SendArgs, ServeArgs},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // Logs go to stderr; stdout carries only the relay transcript.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args),
        Command::Send(args) => send(args),
    }
}

fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig::new(args.port)
        .bind_ip(args.bind)
        .max_payload_len(args.max_payload);
    let server = Server::with_config(config).context("invalid server configuration")?;

    server.on_client_connected(|event| info!(id = %event.id, peer = %event.peer, "client joined"));
    server.on_client_disconnected(|event| {
        info!(id = %event.id, peer = %event.peer, reason = %event.reason, "client left")
    });
    let messages = server.messages();

    let addr = server.serve().context("failed to start server")?;
    println!("listening on {addr}");

    for event in messages.iter() {
        println!("{} [{}] {}", event.peer, event.message.code, event.message);
        match server.message_all(&event.message) {
            Ok(report) if !report.failed.is_empty() => {
                warn!(failed = report.failed.len(), "relay dropped unreachable clients")
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "relay failed"),
        }
    }

    Ok(())
}

fn send(args: SendArgs) -> Result<()> {
    let client = Client::connect_host(&args.host, args.port)
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    let replies = client.messages();

    client
        .send(args.code, args.text.as_bytes())
        .context("failed to send message")?;

    match replies.recv_timeout(Duration::from_millis(args.wait_ms)) {
        Ok(event) => println!("[{}] {}", event.message.code, event.message),
        Err(_) => info!(wait_ms = args.wait_ms, "no reply before timeout"),
    }

    client.disconnect();
    Ok(())
}
