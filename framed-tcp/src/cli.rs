use std::net::IpAddr;

use clap::{Args, Parser, Subcommand};

use crate::framing::DEFAULT_MAX_PAYLOAD_LEN;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a relay server that rebroadcasts every message to all clients.
    Serve(ServeArgs),
    /// Connect, send one message and print any reply.
    Send(SendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on (1024-65535).
    #[arg(long, default_value_t = 6565)]
    pub port: u32,

    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Frames declaring a larger payload are treated as corrupt.
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_LEN)]
    pub max_payload: usize,
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Host name or address of the server.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 6565)]
    pub port: u16,

    /// Message code sent alongside the text.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub code: i32,

    /// How long to wait for a reply before disconnecting.
    #[arg(long, default_value_t = 500)]
    pub wait_ms: u64,

    /// Text payload, sent as UTF-8.
    pub text: String,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn send_accepts_negative_codes() {
        let cli = Cli::try_parse_from(["framed_tcp", "send", "--code", "-3", "hello"])
            .expect("parse");
        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.code, -3);
                assert_eq!(args.text, "hello");
                assert_eq!(args.port, 6565);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
