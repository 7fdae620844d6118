// The client driver: build the initial request, bind an ephemeral socket
// and let the connection driver take it from there. The peer transfer
// identifier stays unbound until the server's first reply, which arrives
// from a port of the server's choosing rather than the well-known one.

use crate::conn::{self, Connection, RetryPolicy, TransferError};
use crate::processor::PacketProcessor;
use crate::tftp::{FileMode, Packet};
use std::net::SocketAddr;
use std::path::Path;

/// Fetches `remote` from the server into `local`. Refuses to overwrite an
/// existing local file; on any failure the partial local file is removed.
pub async fn get(
    server: SocketAddr,
    remote: &str,
    local: &Path,
    policy: RetryPolicy,
) -> Result<(), TransferError> {
    let sock = conn::bind_transfer_socket()?;
    let mut processor = PacketProcessor::new_for_receiving(local)
        .await
        .map_err(TransferError::File)?;

    log::info!("Requesting {remote} from {server}");
    let request = Packet::ReadReq {
        path: remote.to_string(),
        mode: FileMode::Octet,
    };
    // A timed-out read request is not retransmitted here: the server owns
    // the first data block and repeats it on its own timeouts, so this side
    // only counts its budget down.
    let mut connection = Connection::new(sock, server, policy);
    connection.drive(&mut processor, request, false).await
}

/// Sends `local` to the server under the name `remote`.
pub async fn put(
    server: SocketAddr,
    local: &Path,
    remote: &str,
    policy: RetryPolicy,
) -> Result<(), TransferError> {
    let sock = conn::bind_transfer_socket()?;
    let mut processor = PacketProcessor::new_for_sending(local)
        .await
        .map_err(TransferError::File)?;

    log::info!("Sending {local:?} to {server} as {remote}");
    let request = Packet::WriteReq {
        path: remote.to_string(),
        mode: FileMode::Octet,
    };
    let mut connection = Connection::new(sock, server, policy);
    connection.drive(&mut processor, request, true).await
}
