use tokio::sync::mpsc;
use crate::block::BlockInfo;

mod connection;
mod handshake;
mod message;

pub use connection::Connection;
#[cfg(test)]
pub(crate) use connection::into_message_framed;
pub use handshake::{Handshake, HandshakeCodec, PROTOCOL};
pub use message::{Message, MessageCodec};

type Result<T, E = PeerError> = std::result::Result<T, E>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("connected to ourselves")]
    SelfConnection,

    #[error("no handshake recieved")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("invalid length {len} for message ID {id}")]
    InvalidLength { id: u8, len: usize },

    #[error("message of {0} bytes exceeds maximum length")]
    MessageTooLarge(usize),

    #[error("bitfield sent after first message")]
    UnexpectedBitfield,

    #[error("bitfield does not match piece count")]
    InvalidBitfield,

    #[error("have message with invalid piece index: {0}")]
    InvalidHave(u32),

    #[error("invalid block request: {0:?}")]
    InvalidRequest(BlockInfo),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection timeout")]
    Timeout,
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands from the torrent to a peer connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {

    // Queue a message to be written to the socket.
    Send(Message),

    // Drop a queued piece message that has not been written yet.
    Discard(BlockInfo),

    // End the peer session safely.
    Shutdown,

}
