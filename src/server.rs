// The request dispatcher.
//
// The server listens on the well-known port and never moves transfer
// traffic over it. Each arriving datagram is validated (is it a request, is
// the mode octet, does the filename stay inside the served root) and, if it
// survives, answered from a freshly bound ephemeral socket whose port
// becomes the server's transfer identifier. Refusals are answered from that
// same fresh socket, because the client expects the reply to come from a
// new port either way. Transfers run one at a time; each owns its socket
// and file handle outright.

use crate::conn::{self, Connection, RetryPolicy};
use crate::processor::{PacketProcessor, ResultAction};
use crate::tftp::{self, ErrorCode, FileMode, Packet};
use anyhow::{ensure, Context, Result};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

pub struct TftpServer {
    sock: tftp::TftpSocket,
    root: PathBuf,
    policy: RetryPolicy,
}

impl TftpServer {
    pub fn bind(addr: SocketAddr, root: PathBuf) -> Result<TftpServer> {
        ensure!(root.is_dir(), "served root {root:?} is not a directory");
        let sock = tftp::TftpSocket::bind(addr)
            .with_context(|| format!("binding the listening socket on {addr}"))?;
        Ok(TftpServer {
            sock,
            root,
            policy: RetryPolicy::default(),
        })
    }

    /// Replaces the default per-transfer timeout and retry budget.
    pub fn with_policy(mut self, policy: RetryPolicy) -> TftpServer {
        self.policy = policy;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    pub async fn run(&self) -> Result<()> {
        log::info!(
            "Listening for transfer requests on {}, serving {:?}",
            self.local_addr()?,
            self.root
        );
        loop {
            match self.sock.recv().await {
                Ok((buf, client)) => self.dispatch(&buf, client).await,
                Err(e) => log::warn!("Receive failed on the listening socket: {e}"),
            }
        }
    }

    async fn dispatch(&self, buf: &[u8], client: SocketAddr) {
        let transfer_sock = match conn::bind_transfer_socket() {
            Ok(sock) => sock,
            Err(e) => {
                log::error!("No transfer socket available, dropping request: {e}");
                return;
            }
        };

        let request = match Packet::parse_from_buf(buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Malformed request from {client}: {e}");
                conn::send_error_packet(
                    &transfer_sock,
                    client,
                    ErrorCode::Illegal,
                    "Malformed request packet".to_string(),
                )
                .await;
                return;
            }
        };

        let (filename, mode, write) = match request {
            Packet::ReadReq { path, mode } => (path, mode, false),
            Packet::WriteReq { path, mode } => (path, mode, true),
            other => {
                log::warn!("Non-request packet {other:?} from {client} on the listening port");
                conn::send_error_packet(
                    &transfer_sock,
                    client,
                    ErrorCode::Illegal,
                    "Only read and write requests are accepted here".to_string(),
                )
                .await;
                return;
            }
        };

        if mode != FileMode::Octet {
            log::warn!("{client} requested unsupported mode {mode:?}");
            conn::send_error_packet(
                &transfer_sock,
                client,
                ErrorCode::Illegal,
                "Unsupported mode (use octet)".to_string(),
            )
            .await;
            return;
        }

        let path = match self.resolve(&filename) {
            Ok(path) => path,
            Err(reason) => {
                log::warn!("Refusing {filename:?} from {client}: {reason}");
                conn::send_error_packet(&transfer_sock, client, ErrorCode::AccessViolation, reason)
                    .await;
                return;
            }
        };

        let mut processor = match self.open_processor(&path, write).await {
            Ok(processor) => processor,
            Err((code, message)) => {
                log::warn!("Cannot open {path:?} for {client}: {message}");
                conn::send_error_packet(&transfer_sock, client, code, message).await;
                return;
            }
        };

        log::info!(
            "{} request for {:?} from {client}",
            if write { "Write" } else { "Read" },
            path
        );

        let opening = match processor.first_packet().await {
            ResultAction::SendPacketAndAwait(packet) => packet,
            ResultAction::TerminateWithPacket(packet) => {
                // The very first file read failed; tell the client and stop.
                let _ = transfer_sock.send(&packet, client).await;
                return;
            }
            other => {
                log::error!("Unusable opening action {other:?}, refusing the request");
                conn::send_error_packet(
                    &transfer_sock,
                    client,
                    ErrorCode::Undefined,
                    "Internal error, please retry".to_string(),
                )
                .await;
                return;
            }
        };

        let mut connection = Connection::locked(transfer_sock, client, self.policy);
        match connection.drive(&mut processor, opening, true).await {
            Ok(()) => log::info!("Transfer of {path:?} with {client} complete"),
            Err(e) => log::warn!("Transfer of {path:?} with {client} failed: {e}"),
        }
    }

    /// Maps a requested name onto the served root. Separators and parent
    /// references are refused outright, and whatever survives must still
    /// resolve under the root.
    fn resolve(&self, filename: &str) -> Result<PathBuf, String> {
        if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
            return Err("Invalid filename characters".to_string());
        }
        let path = self.root.join(filename);
        if !path.starts_with(&self.root) {
            return Err("Access denied".to_string());
        }
        Ok(path)
    }

    async fn open_processor(
        &self,
        path: &std::path::Path,
        write: bool,
    ) -> Result<PacketProcessor, (ErrorCode, String)> {
        if write {
            PacketProcessor::new_for_receiving(path)
                .await
                .map_err(|e| match e.kind() {
                    io::ErrorKind::AlreadyExists => (
                        ErrorCode::FileAlreadyExists,
                        "File already exists".to_string(),
                    ),
                    _ => (ErrorCode::AccessViolation, "Cannot write file".to_string()),
                })
        } else {
            PacketProcessor::new_for_sending(path)
                .await
                .map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => {
                        (ErrorCode::FileNotFound, "File not found".to_string())
                    }
                    kind => (kind.into(), format!("Cannot read file: {e}")),
                })
        }
    }
}
