// Wire protocol — each message is a length-prefixed JSON envelope:
//   [4 bytes BE length][utf8 json bytes]
//
// Envelope shape: {type, timestamp, data}. `data` is message-type specific
// and is kept as a raw `serde_json::Value` here; typed payload structs live
// per dispatch site in `p2p`/`sync` so this module stays a thin framing
// layer, the same separation of concerns as the teacher's NetworkMessage/
// FramedStream split.

use crate::config;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Handshake,
    Ping,
    Pong,
    GetBlocks,
    Blocks,
    GetHeaders,
    Headers,
    GetData,
    Transaction,
    Inventory,
    GetPeers,
    Peers,
    Alert,
    Reject,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::GetBlocks => "get_blocks",
            MessageType::Blocks => "blocks",
            MessageType::GetHeaders => "get_headers",
            MessageType::Headers => "headers",
            MessageType::GetData => "get_data",
            MessageType::Transaction => "transaction",
            MessageType::Inventory => "inventory",
            MessageType::GetPeers => "get_peers",
            MessageType::Peers => "peers",
            MessageType::Alert => "alert",
            MessageType::Reject => "reject",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "handshake" => MessageType::Handshake,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "get_blocks" => MessageType::GetBlocks,
            "blocks" => MessageType::Blocks,
            "get_headers" => MessageType::GetHeaders,
            "headers" => MessageType::Headers,
            "get_data" => MessageType::GetData,
            "transaction" => MessageType::Transaction,
            "inventory" => MessageType::Inventory,
            "get_peers" => MessageType::GetPeers,
            "peers" => MessageType::Peers,
            "alert" => MessageType::Alert,
            "reject" => MessageType::Reject,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub timestamp: f64,
    pub data: Value,
}

impl Envelope {
    pub fn new(msg_type: MessageType, timestamp: f64, data: Value) -> Self {
        Envelope { msg_type: msg_type.as_str().to_string(), timestamp, data }
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_str(&self.msg_type)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = serde_json::to_vec(self)?;
        if payload.len() > config::MAX_WIRE_MESSAGE_BYTES {
            return Err(ProtocolError::FrameTooLarge);
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// One per TCP socket. Sends are serialized through `&mut self`; callers
/// wrap the stream in a mutex to share it across the writer and the reader
/// loop, matching the Peer Connection's single send-mutex discipline.
pub struct FramedStream {
    stream: TcpStream,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> Self {
        FramedStream { stream }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> io::Result<()> {
        let frame = envelope
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.stream.write_all(&frame).await
    }

    /// Reads exactly one framed message. Returns `Ok(None)` on clean EOF.
    pub async fn recv(&mut self) -> io::Result<Option<Envelope>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > config::MAX_WIRE_MESSAGE_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum size"));
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        let envelope = Envelope::decode(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(Some(envelope))
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }
}
