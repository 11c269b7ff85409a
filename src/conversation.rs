//! # Conversations
//!
//! A [`Conversation`] is one reassembled TCP session as delivered by the
//! upstream stream reassembly: the flow 4-tuple, the first-packet time of
//! each side and the ordered list of directional data chunks.
//!
//! The decoders only ever read from a conversation. Once handed to a
//! decoder it is owned by that decoder and dropped when decoding finishes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocols::Direction;

// ---------------------------------------------------------------------------
// Flow Key
// ---------------------------------------------------------------------------

/// The TCP 4-tuple of a conversation, oriented client to server.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_ip: String, dst_ip: String, src_port: u16, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    /// The same flow seen from the server side.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip.clone(),
            dst_ip: self.src_ip.clone(),
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// A contiguous piece of payload sent in one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub direction: Direction,
    /// Arrival time (Unix epoch nanoseconds).
    pub timestamp: i64,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// One reassembled bidirectional TCP conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub flow: FlowKey,
    /// First packet from the client (ns). Zero if none was seen.
    pub client_first_seen: i64,
    /// First packet from the server (ns). Zero if none was seen.
    pub server_first_seen: i64,
    chunks: Vec<Chunk>,
}

impl Conversation {
    pub fn new(flow: FlowKey) -> Self {
        Self {
            flow,
            client_first_seen: 0,
            server_first_seen: 0,
            chunks: Vec::new(),
        }
    }

    /// Append a chunk. Empty payloads are ignored.
    pub fn push(&mut self, direction: Direction, timestamp: i64, data: impl Into<Vec<u8>>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        let first = match direction {
            Direction::Originator => &mut self.client_first_seen,
            Direction::Responder => &mut self.server_first_seen,
        };
        if *first == 0 {
            *first = timestamp;
        }
        self.chunks.push(Chunk {
            direction,
            timestamp,
            data,
        });
    }

    /// Builder form of [`Conversation::push`].
    pub fn with_chunk(mut self, direction: Direction, timestamp: i64, data: impl Into<Vec<u8>>) -> Self {
        self.push(direction, timestamp, data);
        self
    }

    /// Conversation identifier, `client:port->server:port`.
    pub fn ident(&self) -> String {
        self.flow.to_string()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// First payload chunk sent in `direction`, empty if none.
    pub fn first_chunk(&self, direction: Direction) -> &[u8] {
        self.chunks
            .iter()
            .find(|c| c.direction == direction)
            .map(|c| c.data.as_slice())
            .unwrap_or(&[])
    }

    /// All bytes sent in `direction`, concatenated.
    pub fn stream(&self, direction: Direction) -> Vec<u8> {
        self.stream_capped(direction, usize::MAX)
    }

    /// At most `cap` bytes sent in `direction`.
    pub fn stream_capped(&self, direction: Direction, cap: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        for chunk in self.chunks.iter().filter(|c| c.direction == direction) {
            if buf.len() >= cap {
                break;
            }
            let take = (cap - buf.len()).min(chunk.data.len());
            buf.extend_from_slice(&chunk.data[..take]);
        }
        buf
    }

    /// The first `size` bytes of both directions merged in arrival order.
    pub fn banner(&self, size: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(size.min(4096));
        for chunk in &self.chunks {
            if buf.len() >= size {
                break;
            }
            let take = (size - buf.len()).min(chunk.data.len());
            buf.extend_from_slice(&chunk.data[..take]);
        }
        buf
    }

    /// Consecutive same-direction chunks merged into turns.
    pub fn turns(&self) -> Vec<Chunk> {
        let mut turns: Vec<Chunk> = Vec::new();
        for chunk in &self.chunks {
            match turns.last_mut() {
                Some(last) if last.direction == chunk.direction => {
                    last.data.extend_from_slice(&chunk.data)
                }
                _ => turns.push(chunk.clone()),
            }
        }
        turns
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> Conversation {
        Conversation::new(FlowKey::new("10.0.0.1".into(), "10.0.0.2".into(), 40000, 21))
            .with_chunk(Direction::Responder, 100, b"220 ready\r\n".to_vec())
            .with_chunk(Direction::Originator, 200, b"USER a\r\n".to_vec())
            .with_chunk(Direction::Originator, 210, b"PASS b\r\n".to_vec())
            .with_chunk(Direction::Responder, 300, b"230 ok\r\n".to_vec())
    }

    #[test]
    fn test_flow_display_and_reverse() {
        let f = FlowKey::new("10.0.0.1".into(), "10.0.0.2".into(), 40000, 22);
        assert_eq!(f.to_string(), "10.0.0.1:40000->10.0.0.2:22");
        assert_eq!(f.reversed().to_string(), "10.0.0.2:22->10.0.0.1:40000");
    }

    #[test]
    fn test_first_seen_timestamps() {
        let c = conv();
        assert_eq!(c.client_first_seen, 200);
        assert_eq!(c.server_first_seen, 100);
    }

    #[test]
    fn test_streams_and_prefixes() {
        let c = conv();
        assert_eq!(c.first_chunk(Direction::Originator), b"USER a\r\n");
        assert_eq!(c.stream(Direction::Originator), b"USER a\r\nPASS b\r\n".to_vec());
        assert_eq!(c.stream_capped(Direction::Originator, 10), b"USER a\r\nPA".to_vec());
    }

    #[test]
    fn test_banner_merges_in_order() {
        let c = conv();
        assert_eq!(c.banner(1024), b"220 ready\r\nUSER a\r\nPASS b\r\n230 ok\r\n".to_vec());
        assert_eq!(c.banner(3), b"220".to_vec());
    }

    #[test]
    fn test_turns() {
        let turns = conv().turns();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1].data, b"USER a\r\nPASS b\r\n".to_vec());
        assert_eq!(turns[1].timestamp, 200);
    }

    #[test]
    fn test_empty_chunk_ignored() {
        let c = Conversation::new(FlowKey::new("a".into(), "b".into(), 1, 2))
            .with_chunk(Direction::Originator, 5, Vec::new());
        assert!(c.chunks().is_empty());
        assert_eq!(c.client_first_seen, 0);
    }
}
