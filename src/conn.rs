// This module contains the connection driver shared by both ends of a
// transfer.
//
// A Connection owns the transfer socket and the peer address and runs the
// lock-step loop around a PacketProcessor: send one packet, wait for the
// reply under a deadline, hand whatever arrives to the processor, act on its
// verdict. The driver is responsible for everything the processor is not:
//
// 1. Binding the peer transfer identifier. The first packet to arrive on an
//    unlocked connection fixes the peer address; from then on, datagrams
//    from anyone else are answered with Error(UnknownTid) and otherwise
//    ignored, without disturbing the transfer.
// 2. Retransmission. The last transmitted datagram is kept as raw bytes and
//    resent verbatim when a wait times out. Resending never re-reads the
//    file, so a zero-length final block stays a zero-length final block.
// 3. The retry budget. Each timed-out wait spends one retry; the budget is
//    refilled only when the transfer advances. An exhausted budget aborts
//    the transfer with no further emission.
// 4. Termination. After acknowledging the peer's final block the driver
//    lingers for one more deadline window, re-answering a duplicated final
//    block in case the last ack was lost. Error packets are sent at most
//    once and never acknowledged.

use crate::processor::{PacketProcessor, ResultAction};
use crate::tftp::{self, ErrorCode, Packet, SocketError};
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;

/// How long to wait for the peer, and how many timed-out waits to tolerate,
/// before giving a transfer up.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retry_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(5),
            retry_limit: 5,
        }
    }
}

/// A transfer's terminal failure, reported to whoever requested it.
#[derive(Debug)]
pub enum TransferError {
    /// The socket failed underneath the transfer.
    Socket(SocketError),

    /// The retry budget ran out with nothing heard from the peer.
    TimedOut,

    /// The peer violated the protocol; an error packet was sent to it.
    Protocol(String),

    /// The peer aborted the transfer with an error packet of its own.
    Peer { code: ErrorCode, message: String },

    /// A local file could not be opened for the transfer.
    File(io::Error),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "Socket error: {e}"),
            Self::TimedOut => write!(f, "Transfer timed out waiting for the peer"),
            Self::Protocol(msg) => write!(f, "Protocol violation: {msg}"),
            Self::Peer { code, message } => {
                write!(f, "Peer aborted the transfer: {code}: {message}")
            }
            Self::File(e) => write!(f, "File error: {e}"),
        }
    }
}

impl From<SocketError> for TransferError {
    fn from(e: SocketError) -> TransferError {
        TransferError::Socket(e)
    }
}

/// Attempts to bind a transfer socket on a random high port, falling back to
/// a kernel-assigned port. The chosen port is this side's transfer
/// identifier.
pub fn bind_transfer_socket() -> Result<tftp::TftpSocket, SocketError> {
    let mut rng = rand::thread_rng();
    for _ in 0..16 {
        let port = rng.gen_range(1024..65535);
        match tftp::TftpSocket::bind((Ipv4Addr::UNSPECIFIED, port).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => log::warn!("Couldn't bind transfer port {port}: {e}"),
        }
    }
    tftp::TftpSocket::bind((Ipv4Addr::UNSPECIFIED, 0).into())
}

pub async fn send_error_packet(
    sock: &tftp::TftpSocket,
    dst: SocketAddr,
    code: ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::Error { code, message }, dst).await;
}

pub struct Connection {
    sock: tftp::TftpSocket,
    peer: SocketAddr,
    peer_locked: bool,
    policy: RetryPolicy,
}

impl Connection {
    /// A connection whose peer transfer identifier is still unknown: the
    /// requesting client, which learns the server's transfer port from the
    /// first reply.
    pub fn new(sock: tftp::TftpSocket, peer: SocketAddr, policy: RetryPolicy) -> Connection {
        Connection {
            sock,
            peer,
            peer_locked: false,
            policy,
        }
    }

    /// A connection whose peer is already fixed: the server side, where the
    /// request itself carried the client's transfer identifier.
    pub fn locked(sock: tftp::TftpSocket, peer: SocketAddr, policy: RetryPolicy) -> Connection {
        Connection {
            sock,
            peer,
            peer_locked: true,
            policy,
        }
    }

    /// Does the work of sending and receiving over the connection until the
    /// transfer closes. `opening` is the first packet out; `retransmit_opening`
    /// decides whether it is repeated on a timeout (a read request is not:
    /// until the server answers there is no transfer to nudge, so the wait
    /// just counts the budget down).
    ///
    /// On any failure the processor's leftovers are discarded, so a receiver
    /// never leaves a partial file behind.
    pub async fn drive(
        &mut self,
        processor: &mut PacketProcessor,
        opening: Packet,
        retransmit_opening: bool,
    ) -> Result<(), TransferError> {
        let result = self.run(processor, opening, retransmit_opening).await;
        if result.is_err() {
            processor.discard().await;
        }
        result
    }

    async fn run(
        &mut self,
        processor: &mut PacketProcessor,
        opening: Packet,
        retransmit_opening: bool,
    ) -> Result<(), TransferError> {
        let mut out_bytes = self.sock.send(&opening, self.peer).await?;
        let mut retransmit_on_timeout = retransmit_opening;
        let mut retries_left = self.policy.retry_limit;

        'transfer: loop {
            let deadline = Instant::now() + self.policy.timeout;

            // One await window. Leaves either with a packet from the bound
            // peer or, via 'transfer, after a timeout.
            loop {
                let received = self.recv_until(deadline).await?;
                let Some((buf, src)) = received else {
                    if retries_left == 0 {
                        log::warn!("Giving up on {}: retries exhausted", self.peer);
                        return Err(TransferError::TimedOut);
                    }
                    retries_left -= 1;
                    if retransmit_on_timeout {
                        log::info!(
                            "Timed out, retransmitting last packet ({retries_left} retries left)"
                        );
                        self.sock.send_raw(&out_bytes, self.peer).await?;
                    } else {
                        log::info!("Timed out awaiting a first reply ({retries_left} retries left)");
                    }
                    continue 'transfer;
                };

                if !self.peer_locked {
                    // First reply wins: this is the peer's transfer
                    // identifier for the rest of the transfer.
                    self.peer = src;
                    self.peer_locked = true;
                } else if src != self.peer {
                    log::info!("Datagram from unknown source {src}, answering with an error");
                    send_error_packet(
                        &self.sock,
                        src,
                        ErrorCode::UnknownTid,
                        "Unknown transfer ID".to_string(),
                    )
                    .await;
                    // Not a reply; keep waiting out the same window.
                    continue;
                }

                let packet = match Packet::parse_from_buf(&buf) {
                    Ok(packet) => packet,
                    Err(SocketError::PacketParse(msg)) => {
                        send_error_packet(
                            &self.sock,
                            self.peer,
                            ErrorCode::Illegal,
                            format!("Error parsing incoming packet: {msg}"),
                        )
                        .await;
                        return Err(TransferError::Protocol(msg));
                    }
                    Err(e) => return Err(e.into()),
                };

                match processor.process_packet(&packet).await {
                    ResultAction::SendPacketAndAwait(p) => {
                        out_bytes = self.sock.send(&p, self.peer).await?;
                        retransmit_on_timeout = true;
                        retries_left = self.policy.retry_limit;
                        continue 'transfer;
                    }
                    ResultAction::SendPacketAndRetryRecv(p) => {
                        // Answering a duplicate. The transfer has not
                        // advanced, so the retry budget stays as it is.
                        out_bytes = self.sock.send(&p, self.peer).await?;
                        retransmit_on_timeout = true;
                        continue;
                    }
                    ResultAction::RetryRecv => continue,
                    ResultAction::Complete => return Ok(()),
                    ResultAction::TerminateWithPacket(p) => {
                        return match p {
                            Packet::Error { code, message } => {
                                // A courtesy packet: sent once, never
                                // retransmitted, never acknowledged.
                                send_error_packet(&self.sock, self.peer, code, message.clone())
                                    .await;
                                Err(TransferError::Protocol(message))
                            }
                            final_ack => {
                                let bytes = self.sock.send(&final_ack, self.peer).await?;
                                self.linger(&bytes).await;
                                Ok(())
                            }
                        };
                    }
                    ResultAction::PeerError { code, message } => {
                        return Err(TransferError::Peer { code, message });
                    }
                }
            }
        }
    }

    /// Receives one datagram before the deadline, or None on timeout.
    async fn recv_until(
        &self,
        deadline: Instant,
    ) -> Result<Option<(Vec<u8>, SocketAddr)>, TransferError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match self.sock.recv_with_timeout(remaining).await {
            Ok(datagram) => Ok(Some(datagram)),
            Err(SocketError::Timeout(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The transfer is done, but our final ack may have been lost. Stay
    /// around for one more window and answer a retransmitted final block
    /// with the same ack bytes; anything else, or silence, ends the linger.
    /// Whatever happens here, the transfer already succeeded.
    async fn linger(&self, final_ack: &[u8]) {
        let deadline = Instant::now() + self.policy.timeout;
        loop {
            let datagram = match self.recv_until(deadline).await {
                Ok(Some(datagram)) => datagram,
                _ => return,
            };
            let (buf, src) = datagram;
            if src != self.peer {
                send_error_packet(
                    &self.sock,
                    src,
                    ErrorCode::UnknownTid,
                    "Unknown transfer ID".to_string(),
                )
                .await;
                continue;
            }
            match Packet::parse_from_buf(&buf) {
                Ok(Packet::Data { .. }) => {
                    log::info!("Re-answering a duplicated final block for {}", self.peer);
                    let _ = self.sock.send_raw(final_ack, self.peer).await;
                }
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::{TftpSocket, BLOCK_SIZE};
    use tempdir::TempDir;

    // Roomy enough that scripted exchanges never race a window expiry on a
    // loaded machine, short enough that the post-transfer linger is cheap.
    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(700),
            retry_limit: 3,
        }
    }

    fn loopback_socket() -> (TftpSocket, SocketAddr) {
        let sock = TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    async fn expect_packet(sock: &TftpSocket, want: Packet) {
        let (buf, _) = sock
            .recv_with_timeout(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(Packet::parse_from_buf(&buf).unwrap(), want);
    }

    #[tokio::test]
    async fn test_receiver_reacks_duplicate_data() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("incoming.bin");
        let (conn_sock, conn_addr) = loopback_socket();
        let (peer_sock, peer_addr) = loopback_socket();

        let peer = tokio::spawn(async move {
            expect_packet(&peer_sock, Packet::Ack { block: 0 }).await;

            let block1 = Packet::Data {
                block: 1,
                data: vec![0xAB; BLOCK_SIZE],
            };
            peer_sock.send(&block1, conn_addr).await.unwrap();
            expect_packet(&peer_sock, Packet::Ack { block: 1 }).await;

            // The wire duplicated block 1; it must be re-acked, not re-written.
            peer_sock.send(&block1, conn_addr).await.unwrap();
            expect_packet(&peer_sock, Packet::Ack { block: 1 }).await;

            let final_block = Packet::Data {
                block: 2,
                data: vec![0xCD; 9],
            };
            peer_sock.send(&final_block, conn_addr).await.unwrap();
            expect_packet(&peer_sock, Packet::Ack { block: 2 }).await;
        });

        let mut processor = PacketProcessor::new_for_receiving(&path).await.unwrap();
        let mut conn = Connection::locked(conn_sock, peer_addr, fast_policy());
        conn.drive(&mut processor, Packet::Ack { block: 0 }, true)
            .await
            .unwrap();
        peer.await.unwrap();

        let mut want = vec![0xAB; BLOCK_SIZE];
        want.extend_from_slice(&[0xCD; 9]);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), want);
    }

    #[tokio::test]
    async fn test_foreign_source_gets_unknown_tid_error() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("incoming.bin");
        let (conn_sock, conn_addr) = loopback_socket();
        let (peer_sock, peer_addr) = loopback_socket();
        let (intruder_sock, _) = loopback_socket();

        let peer = tokio::spawn(async move {
            expect_packet(&peer_sock, Packet::Ack { block: 0 }).await;

            // A third party barges in mid-transfer.
            intruder_sock
                .send(
                    &Packet::Data {
                        block: 7,
                        data: vec![0xFF; 4],
                    },
                    conn_addr,
                )
                .await
                .unwrap();
            let (buf, _) = intruder_sock
                .recv_with_timeout(Duration::from_secs(2))
                .await
                .unwrap();
            match Packet::parse_from_buf(&buf).unwrap() {
                Packet::Error {
                    code: ErrorCode::UnknownTid,
                    ..
                } => {}
                other => panic!("intruder expected an unknown-TID error, got {other:?}"),
            }

            // The real transfer is undisturbed.
            peer_sock
                .send(
                    &Packet::Data {
                        block: 1,
                        data: b"payload".to_vec(),
                    },
                    conn_addr,
                )
                .await
                .unwrap();
            expect_packet(&peer_sock, Packet::Ack { block: 1 }).await;
        });

        let mut processor = PacketProcessor::new_for_receiving(&path).await.unwrap();
        let mut conn = Connection::locked(conn_sock, peer_addr, fast_policy());
        conn.drive(&mut processor, Packet::Ack { block: 0 }, true)
            .await
            .unwrap();
        peer.await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_sender_retransmits_same_bytes_on_lost_ack() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("outgoing.bin");
        tokio::fs::write(&path, vec![0x5A; 100]).await.unwrap();
        let (conn_sock, conn_addr) = loopback_socket();
        let (peer_sock, peer_addr) = loopback_socket();

        let peer = tokio::spawn(async move {
            let (first, _) = peer_sock
                .recv_with_timeout(Duration::from_secs(2))
                .await
                .unwrap();
            // Drop the ack; the sender must time out and repeat itself
            // byte for byte.
            let (second, _) = peer_sock
                .recv_with_timeout(Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(first, second);
            assert_eq!(
                Packet::parse_from_buf(&second).unwrap(),
                Packet::Data {
                    block: 1,
                    data: vec![0x5A; 100]
                }
            );
            peer_sock
                .send(&Packet::Ack { block: 1 }, conn_addr)
                .await
                .unwrap();
        });

        let mut processor = PacketProcessor::new_for_sending(&path).await.unwrap();
        let opening = match processor.first_packet().await {
            ResultAction::SendPacketAndAwait(p) => p,
            other => panic!("unexpected opening action {other:?}"),
        };
        let mut conn = Connection::locked(conn_sock, peer_addr, fast_policy());
        conn.drive(&mut processor, opening, true).await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_exhaustion_aborts_and_discards() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("incoming.bin");
        let (conn_sock, _) = loopback_socket();
        // Nobody is listening at the peer address.
        let (silent_sock, silent_addr) = loopback_socket();

        let mut processor = PacketProcessor::new_for_receiving(&path).await.unwrap();
        let policy = RetryPolicy {
            timeout: Duration::from_millis(100),
            retry_limit: 2,
        };
        let mut conn = Connection::locked(conn_sock, silent_addr, policy);
        let result = conn
            .drive(&mut processor, Packet::Ack { block: 0 }, true)
            .await;
        drop(silent_sock);

        match result {
            Err(TransferError::TimedOut) => {}
            other => panic!("expected a timeout abort, got {other:?}"),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_peer_error_aborts_and_discards() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("incoming.bin");
        let (conn_sock, conn_addr) = loopback_socket();
        let (peer_sock, peer_addr) = loopback_socket();

        let peer = tokio::spawn(async move {
            expect_packet(&peer_sock, Packet::Ack { block: 0 }).await;
            peer_sock
                .send(
                    &Packet::Error {
                        code: ErrorCode::DiskFull,
                        message: "out of space".to_string(),
                    },
                    conn_addr,
                )
                .await
                .unwrap();
        });

        let mut processor = PacketProcessor::new_for_receiving(&path).await.unwrap();
        let mut conn = Connection::locked(conn_sock, peer_addr, fast_policy());
        let result = conn
            .drive(&mut processor, Packet::Ack { block: 0 }, true)
            .await;
        peer.await.unwrap();

        match result {
            Err(TransferError::Peer {
                code: ErrorCode::DiskFull,
                ..
            }) => {}
            other => panic!("expected a peer abort, got {other:?}"),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_tid_binds_on_first_reply() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("fetched.bin");
        let (conn_sock, conn_addr) = loopback_socket();
        // The request goes to the well-known address, the reply comes from
        // a different port, as it does for a real server.
        let (listen_sock, listen_addr) = loopback_socket();
        let (transfer_sock, _) = loopback_socket();

        let peer = tokio::spawn(async move {
            let (buf, _) = listen_sock
                .recv_with_timeout(Duration::from_secs(2))
                .await
                .unwrap();
            assert!(matches!(
                Packet::parse_from_buf(&buf).unwrap(),
                Packet::ReadReq { .. }
            ));
            transfer_sock
                .send(
                    &Packet::Data {
                        block: 1,
                        data: b"bound".to_vec(),
                    },
                    conn_addr,
                )
                .await
                .unwrap();
            // The ack must come back to the transfer port, not the
            // listening port.
            expect_packet(&transfer_sock, Packet::Ack { block: 1 }).await;
        });

        let mut processor = PacketProcessor::new_for_receiving(&path).await.unwrap();
        let mut conn = Connection::new(conn_sock, listen_addr, fast_policy());
        let request = Packet::ReadReq {
            path: "fetched.bin".to_string(),
            mode: crate::tftp::FileMode::Octet,
        };
        conn.drive(&mut processor, request, false).await.unwrap();
        peer.await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"bound");
    }

    #[tokio::test]
    async fn test_lost_final_ack_is_reanswered_while_lingering() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("incoming.bin");
        let (conn_sock, conn_addr) = loopback_socket();
        let (peer_sock, peer_addr) = loopback_socket();

        let peer = tokio::spawn(async move {
            expect_packet(&peer_sock, Packet::Ack { block: 0 }).await;

            let final_block = Packet::Data {
                block: 1,
                data: vec![0x11; 30],
            };
            peer_sock.send(&final_block, conn_addr).await.unwrap();
            expect_packet(&peer_sock, Packet::Ack { block: 1 }).await;

            // Pretend the final ack was lost and retransmit the final
            // block; the receiver must still answer it.
            peer_sock.send(&final_block, conn_addr).await.unwrap();
            expect_packet(&peer_sock, Packet::Ack { block: 1 }).await;
        });

        let mut processor = PacketProcessor::new_for_receiving(&path).await.unwrap();
        let mut conn = Connection::locked(conn_sock, peer_addr, fast_policy());
        conn.drive(&mut processor, Packet::Ack { block: 0 }, true)
            .await
            .unwrap();
        peer.await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![0x11; 30]);
    }
}
