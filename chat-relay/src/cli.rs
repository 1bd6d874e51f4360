use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::{codec::DEFAULT_MAX_FRAME_LEN, config::RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Serve(ServeArgs),
    /// Connect to a relay and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address the relay should bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = crate::config::DEFAULT_PORT)]
    pub port: u16,

    /// Largest frame payload accepted from a client, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,

    /// How long a single recipient may take to accept a broadcast frame.
    #[arg(long, default_value_t = 5_000)]
    pub send_timeout_ms: u64,
}

impl From<ServeArgs> for RelayConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            max_frame_len: args.max_frame_bytes,
            send_timeout: Duration::from_millis(args.send_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname used when joining the chat.
    #[arg(long)]
    pub nickname: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:5555")]
    pub server: SocketAddr,

    /// Largest frame payload accepted from the relay, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,
}
