// Trivial File Transfer Protocol (RFC 1350), octet mode only.
//
// A transfer begins with a read or write request sent to the server's
// well-known port. The server answers from a freshly chosen ephemeral port;
// from then on the two ports form the transfer identifiers and all traffic
// flows between them. The file moves in 512-byte blocks, each carried by a
// DATA packet that must be acknowledged before the next one is sent; a
// block shorter than 512 bytes ends the transfer, so a file whose size is
// an exact multiple of 512 is closed by an empty final block.
//
// Whoever is waiting keeps the last packet it sent and repeats it verbatim
// when the wait times out. Error packets terminate the transfer for both
// sides; they are sent once, never retransmitted and never acknowledged. A
// datagram arriving from an address other than the bound transfer
// identifier is answered with an error and otherwise ignored.

mod client;
mod conn;
mod processor;
mod server;
mod tftp;

use anyhow::Result;
use clap::{Parser, Subcommand};
use conn::RetryPolicy;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Trivial File Transfer Protocol server and client, octet mode.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve files from a directory.
    Serve {
        /// UDP port to listen on.
        #[arg(short, long, default_value_t = tftp::DEFAULT_PORT)]
        port: u16,

        /// Directory served to clients; requests cannot escape it.
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Seconds to wait for a peer before retransmitting.
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },

    /// Fetch a remote file from a server.
    Get {
        /// Server address.
        server: IpAddr,

        /// Name of the file on the server.
        remote: String,

        /// Where to write the fetched file locally.
        local: PathBuf,

        /// Server port.
        #[arg(short, long, default_value_t = tftp::DEFAULT_PORT)]
        port: u16,
    },

    /// Upload a local file to a server.
    Put {
        /// Server address.
        server: IpAddr,

        /// Local file to upload.
        local: PathBuf,

        /// Name to store the file under on the server.
        remote: String,

        /// Server port.
        #[arg(short, long, default_value_t = tftp::DEFAULT_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            root,
            timeout_secs,
        } => {
            let policy = RetryPolicy {
                timeout: Duration::from_secs(timeout_secs),
                ..RetryPolicy::default()
            };
            let server = server::TftpServer::bind((Ipv4Addr::UNSPECIFIED, port).into(), root)?
                .with_policy(policy);
            server.run().await
        }
        Command::Get {
            server,
            remote,
            local,
            port,
        } => {
            client::get(
                SocketAddr::new(server, port),
                &remote,
                &local,
                RetryPolicy::default(),
            )
            .await?;
            Ok(())
        }
        Command::Put {
            server,
            local,
            remote,
            port,
        } => {
            client::put(
                SocketAddr::new(server, port),
                &local,
                &remote,
                RetryPolicy::default(),
            )
            .await?;
            Ok(())
        }
    }
}
