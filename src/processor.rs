use crate::tftp::{ErrorCode, Packet, BLOCK_SIZE};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// One side of a transfer, reduced to packet-in, action-out. A BlockSender
/// turns acknowledgements into the next data block read from its file; a
/// BlockReceiver turns data blocks into file writes and acknowledgements.
/// The processor never touches the network; the connection driver owns
/// timing, retransmission and the peer address.
#[derive(Debug)]
pub enum PacketProcessor {
    Sender(BlockSender),
    Receiver(BlockReceiver),
}

impl PacketProcessor {
    /// Opens a file whose blocks will be sent to the peer.
    pub async fn new_for_sending(path: &Path) -> Result<PacketProcessor, io::Error> {
        let f = File::open(path).await?;
        Ok(PacketProcessor::Sender(BlockSender::new(f)))
    }

    /// Creates the file the peer's blocks will be written into. Refuses a
    /// path that already exists.
    pub async fn new_for_receiving(path: &Path) -> Result<PacketProcessor, io::Error> {
        log::info!("Writing to {:?}", path);
        let f = File::create_new(path).await?;
        Ok(PacketProcessor::Receiver(BlockReceiver::new(
            f,
            path.to_path_buf(),
        )))
    }

    /// The opening move for the side that answers a request: the first data
    /// block for a read request, the block-zero acknowledgement for a write
    /// request. A requesting client skips this and opens with its RRQ/WRQ.
    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Sender(p) => p.send_next_block().await,
            PacketProcessor::Receiver(_) => {
                ResultAction::SendPacketAndAwait(Packet::Ack { block: 0 })
            }
        }
    }

    /// Given an incoming packet, processes it and describes the action the
    /// caller should take.
    pub async fn process_packet(&mut self, packet: &Packet) -> ResultAction {
        match self {
            PacketProcessor::Sender(p) => p.process_ack(packet).await,
            PacketProcessor::Receiver(p) => p.process_data(packet).await,
        }
    }

    /// Releases whatever the aborted transfer would otherwise leave behind.
    /// A receiver drops and removes its partially written file; a sender has
    /// nothing to undo.
    pub async fn discard(&mut self) {
        if let PacketProcessor::Receiver(p) = self {
            p.discard().await;
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(Packet),

    /// Caller should send the packet (an answer to a duplicate) and keep
    /// waiting for the packet it was already waiting for.
    SendPacketAndRetryRecv(Packet),

    /// Caller should try receiving the last packet again.
    RetryRecv,

    /// The transfer finished; there is nothing left to send.
    Complete,

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(Packet),

    /// The peer aborted the transfer with an error packet.
    PeerError { code: ErrorCode, message: String },
}

#[derive(Debug)]
pub struct BlockSender {
    f: File,
    curr_block: u16,
    awaiting_final_ack: bool,
}

impl BlockSender {
    fn new(f: File) -> BlockSender {
        BlockSender {
            f,
            curr_block: 0,
            awaiting_final_ack: false,
        }
    }

    async fn send_next_block(&mut self) -> ResultAction {
        let next = match self.curr_block.checked_add(1) {
            Some(n) => n,
            // Block numbers are 16 bits; past 65535 blocks the transfer
            // cannot continue.
            None => {
                return ResultAction::TerminateWithPacket(Packet::Error {
                    code: ErrorCode::Illegal,
                    message: "File does not fit in 65535 blocks".to_string(),
                })
            }
        };

        match read_block_from_file(&mut self.f, BLOCK_SIZE).await {
            Ok(data) => {
                self.curr_block = next;
                if data.len() < BLOCK_SIZE {
                    self.awaiting_final_ack = true;
                }
                ResultAction::SendPacketAndAwait(Packet::Data {
                    block: self.curr_block,
                    data,
                })
            }
            Err(e) => ResultAction::TerminateWithPacket(Packet::Error {
                code: e.kind().into(),
                message: format!("Failed to read from file: {e}"),
            }),
        }
    }

    async fn process_ack(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            &Packet::Ack { block } => match block {
                block if block == self.curr_block => {
                    if self.awaiting_final_ack {
                        return ResultAction::Complete;
                    }
                    self.send_next_block().await
                }
                block if block < self.curr_block => {
                    // A stale ack, e.g. duplicated in transit. Never answer
                    // it with data; the block it acknowledges is done.
                    ResultAction::RetryRecv
                }
                block => ResultAction::TerminateWithPacket(Packet::Error {
                    code: ErrorCode::Illegal,
                    message: format!(
                        "Cannot acknowledge a block which was not yet sent. Current block is {cb}, \
                         but received an ack for {block}",
                        cb = self.curr_block
                    ),
                }),
            },
            Packet::Error { code, message } => ResultAction::PeerError {
                code: *code,
                message: message.clone(),
            },
            _ => ResultAction::TerminateWithPacket(Packet::Error {
                code: ErrorCode::Illegal,
                message: "Expected to receive an Ack packet".to_string(),
            }),
        }
    }
}

async fn read_block_from_file(f: &mut File, block_size: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; block_size];
    let mut cursor = 0;

    // A single call to read may fill only part of the buffer, so keep
    // passing it a progressively smaller slice until it fills up or the
    // file runs out.
    loop {
        match f.read(&mut buf[cursor..]).await {
            Ok(s) => {
                if cursor + s == buf.len() {
                    return Ok(buf);
                } else if s == 0 {
                    buf.truncate(cursor);
                    return Ok(buf);
                } else {
                    cursor += s;
                }
            }
            Err(e) => return Err(e),
        };
    }
}

#[derive(Debug)]
pub struct BlockReceiver {
    f: Option<File>,
    path: PathBuf,
    curr_block: u16,
}

impl BlockReceiver {
    fn new(f: File, path: PathBuf) -> BlockReceiver {
        BlockReceiver {
            f: Some(f),
            path,
            curr_block: 0,
        }
    }

    async fn process_data(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            Packet::Data { block, data } => {
                let expected = match self.curr_block.checked_add(1) {
                    Some(n) => n,
                    None => {
                        return ResultAction::TerminateWithPacket(Packet::Error {
                            code: ErrorCode::Illegal,
                            message: "File does not fit in 65535 blocks".to_string(),
                        })
                    }
                };
                match *block {
                    block if block == expected => self.accept_block(block, data).await,
                    block if block < expected => {
                        // A block we already have, e.g. duplicated in
                        // transit or retransmitted after a lost ack.
                        // Re-acknowledge it without writing anything.
                        ResultAction::SendPacketAndRetryRecv(Packet::Ack { block })
                    }
                    block => ResultAction::TerminateWithPacket(Packet::Error {
                        code: ErrorCode::Illegal,
                        message: format!(
                            "Data blocks must arrive in sequence. Received block {block}, \
                             but only blocks up to {cb} have arrived",
                            cb = self.curr_block
                        ),
                    }),
                }
            }
            Packet::Error { code, message } => ResultAction::PeerError {
                code: *code,
                message: message.clone(),
            },
            _ => ResultAction::TerminateWithPacket(Packet::Error {
                code: ErrorCode::Illegal,
                message: "Expected to receive a Data packet".to_string(),
            }),
        }
    }

    async fn accept_block(&mut self, block: u16, data: &[u8]) -> ResultAction {
        let Some(f) = self.f.as_mut() else {
            return ResultAction::TerminateWithPacket(Packet::Error {
                code: ErrorCode::Undefined,
                message: "Transfer already closed".to_string(),
            });
        };

        if let Some(e) = write_block_to_file(f, data).await {
            log::warn!("Error writing to file: {e}");
            return ResultAction::TerminateWithPacket(Packet::Error {
                code: ErrorCode::DiskFull,
                message: "Disk full or write error".to_string(),
            });
        }
        self.curr_block = block;

        if data.len() < BLOCK_SIZE {
            // Final block. Settle the file before the last ack goes out so
            // a write failure can still be reported to the peer.
            if let Err(e) = f.flush().await {
                log::warn!("Error flushing file: {e}");
                return ResultAction::TerminateWithPacket(Packet::Error {
                    code: ErrorCode::DiskFull,
                    message: "Disk full or write error".to_string(),
                });
            }
            ResultAction::TerminateWithPacket(Packet::Ack { block })
        } else {
            ResultAction::SendPacketAndAwait(Packet::Ack { block })
        }
    }

    async fn discard(&mut self) {
        // Drop the handle before unlinking.
        if self.f.take().is_none() {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            log::debug!("Could not remove partial file {:?}: {e}", self.path);
        }
    }
}

async fn write_block_to_file(f: &mut File, buf: &[u8]) -> Option<io::Error> {
    let mut cursor = 0;
    while cursor < buf.len() {
        match f.write(&buf[cursor..]).await {
            Ok(s) => cursor += s,
            Err(e) => return Some(e),
        }
    }
    None
}
