//! Wire Framing
//!
//! Binary frames exchanged over a duplex channel during a session.
//! All integers are big-endian.
//!
//! ## Frame Layout
//!
//! Every frame starts with a one-byte kind tag:
//!
//! | Kind | Tag  | Body |
//! |------|------|------|
//! | Manifest | 0x01 | `[sessionId:16][senderIdLength:u16][senderId][senderNameLength:u16][senderName]` + manifest |
//! | ManifestAccept | 0x02 | empty |
//! | ManifestReject | 0x03 | `[reasonLength:u16][reason]` |
//! | Chunk | 0x04 | `[sequenceNumber:u32][payloadLength:u32][checksum:u32][payload]` |
//! | ChunkAck | 0x05 | `[fileIndex:u32][sequenceNumber:u32]` |
//! | ChunkNack | 0x06 | `[fileIndex:u32][sequenceNumber:u32]` |
//! | FinalAck | 0x07 | empty |
//! | Cancel | 0x08 | empty |
//! | Abort | 0x09 | `[reasonLength:u16][reason]` |
//!
//! The manifest itself is `[fileCount:u32]` followed by repeated
//! `[nameLength:u16][name bytes][size:u64]`.
//!
//! Chunk checksums are CRC-32 over the payload. Sequence numbers restart at
//! zero for every file; the file a chunk belongs to is implied by manifest
//! order.

use crate::session::SessionId;
use crate::transport::DuplexChannel;
use crate::{ProtocolError, Result};
use tracing::debug;

/// Largest chunk payload accepted from the wire (16 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Largest number of files in one manifest
pub const MAX_MANIFEST_FILES: u32 = 10_000;

/// Largest reject/abort reason in bytes
const MAX_REASON_LEN: usize = 1024;

const KIND_MANIFEST: u8 = 0x01;
const KIND_MANIFEST_ACCEPT: u8 = 0x02;
const KIND_MANIFEST_REJECT: u8 = 0x03;
const KIND_CHUNK: u8 = 0x04;
const KIND_CHUNK_ACK: u8 = 0x05;
const KIND_CHUNK_NACK: u8 = 0x06;
const KIND_FINAL_ACK: u8 = 0x07;
const KIND_CANCEL: u8 = 0x08;
const KIND_ABORT: u8 = 0x09;

/// Bytes requested from the channel per read
const READ_SIZE: usize = 64 * 1024;

/// Compute the checksum carried by a chunk
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// One file entry of a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
}

/// Ordered file list offered by the initiator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub session_id: SessionId,
    pub sender_id: String,
    pub sender_name: String,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Sum of all file sizes
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// A checksummed unit of file data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence_number: u32,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl Chunk {
    /// Build a chunk, computing the payload checksum
    pub fn new(sequence_number: u32, payload: Vec<u8>) -> Self {
        let checksum = checksum(&payload);
        Self {
            sequence_number,
            payload,
            checksum,
        }
    }

    /// Whether the payload matches its checksum
    pub fn verify(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }
}

/// A single message on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Manifest(Manifest),
    ManifestAccept,
    ManifestReject { reason: String },
    Chunk(Chunk),
    ChunkAck { file_index: u32, sequence_number: u32 },
    ChunkNack { file_index: u32, sequence_number: u32 },
    FinalAck,
    Cancel,
    Abort { reason: String },
}

impl Frame {
    /// Short name for logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Manifest(_) => "manifest",
            Frame::ManifestAccept => "manifest-accept",
            Frame::ManifestReject { .. } => "manifest-reject",
            Frame::Chunk(_) => "chunk",
            Frame::ChunkAck { .. } => "chunk-ack",
            Frame::ChunkNack { .. } => "chunk-nack",
            Frame::FinalAck => "final-ack",
            Frame::Cancel => "cancel",
            Frame::Abort { .. } => "abort",
        }
    }

    /// Serialize the frame into a single buffer
    ///
    /// # Errors
    ///
    /// Returns `PacketSizeExceeded` when a payload, name or file list does
    /// not fit its length field or the wire maximum.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Frame::Manifest(manifest) => {
                if manifest.files.len() > MAX_MANIFEST_FILES as usize {
                    return Err(ProtocolError::PacketSizeExceeded(
                        manifest.files.len(),
                        MAX_MANIFEST_FILES as usize,
                    ));
                }
                out.push(KIND_MANIFEST);
                out.extend_from_slice(manifest.session_id.as_bytes());
                put_str16(&mut out, &manifest.sender_id, u16::MAX as usize)?;
                put_str16(&mut out, &manifest.sender_name, u16::MAX as usize)?;
                out.extend_from_slice(&(manifest.files.len() as u32).to_be_bytes());
                for entry in &manifest.files {
                    put_str16(&mut out, &entry.name, u16::MAX as usize)?;
                    out.extend_from_slice(&entry.size.to_be_bytes());
                }
            }
            Frame::ManifestAccept => out.push(KIND_MANIFEST_ACCEPT),
            Frame::ManifestReject { reason } => {
                out.push(KIND_MANIFEST_REJECT);
                put_str16(&mut out, truncate(reason, MAX_REASON_LEN), MAX_REASON_LEN)?;
            }
            Frame::Chunk(chunk) => {
                if chunk.payload.len() > MAX_PAYLOAD_SIZE {
                    return Err(ProtocolError::PacketSizeExceeded(
                        chunk.payload.len(),
                        MAX_PAYLOAD_SIZE,
                    ));
                }
                out.reserve(13 + chunk.payload.len());
                out.push(KIND_CHUNK);
                out.extend_from_slice(&chunk.sequence_number.to_be_bytes());
                out.extend_from_slice(&(chunk.payload.len() as u32).to_be_bytes());
                out.extend_from_slice(&chunk.checksum.to_be_bytes());
                out.extend_from_slice(&chunk.payload);
            }
            Frame::ChunkAck {
                file_index,
                sequence_number,
            } => {
                out.push(KIND_CHUNK_ACK);
                out.extend_from_slice(&file_index.to_be_bytes());
                out.extend_from_slice(&sequence_number.to_be_bytes());
            }
            Frame::ChunkNack {
                file_index,
                sequence_number,
            } => {
                out.push(KIND_CHUNK_NACK);
                out.extend_from_slice(&file_index.to_be_bytes());
                out.extend_from_slice(&sequence_number.to_be_bytes());
            }
            Frame::FinalAck => out.push(KIND_FINAL_ACK),
            Frame::Cancel => out.push(KIND_CANCEL),
            Frame::Abort { reason } => {
                out.push(KIND_ABORT);
                put_str16(&mut out, truncate(reason, MAX_REASON_LEN), MAX_REASON_LEN)?;
            }
        }
        Ok(out)
    }

    /// Try to decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the frame
    /// and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPacket` for unknown kinds or malformed bodies and
    /// `PacketSizeExceeded` for oversized length fields.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        let mut cursor = Cursor::new(buf);
        let kind = match cursor.u8() {
            Some(kind) => kind,
            None => return Ok(None),
        };

        let frame = match kind {
            KIND_MANIFEST => match decode_manifest(&mut cursor)? {
                Some(manifest) => Frame::Manifest(manifest),
                None => return Ok(None),
            },
            KIND_MANIFEST_ACCEPT => Frame::ManifestAccept,
            KIND_MANIFEST_REJECT => match cursor.str16(MAX_REASON_LEN)? {
                Some(reason) => Frame::ManifestReject { reason },
                None => return Ok(None),
            },
            KIND_CHUNK => {
                let (sequence_number, length, checksum) =
                    match (cursor.u32(), cursor.u32(), cursor.u32()) {
                        (Some(seq), Some(len), Some(sum)) => (seq, len as usize, sum),
                        _ => return Ok(None),
                    };
                if length > MAX_PAYLOAD_SIZE {
                    return Err(ProtocolError::PacketSizeExceeded(length, MAX_PAYLOAD_SIZE));
                }
                match cursor.bytes(length) {
                    Some(payload) => Frame::Chunk(Chunk {
                        sequence_number,
                        payload: payload.to_vec(),
                        checksum,
                    }),
                    None => return Ok(None),
                }
            }
            KIND_CHUNK_ACK | KIND_CHUNK_NACK => {
                let (file_index, sequence_number) = match (cursor.u32(), cursor.u32()) {
                    (Some(file), Some(seq)) => (file, seq),
                    _ => return Ok(None),
                };
                if kind == KIND_CHUNK_ACK {
                    Frame::ChunkAck {
                        file_index,
                        sequence_number,
                    }
                } else {
                    Frame::ChunkNack {
                        file_index,
                        sequence_number,
                    }
                }
            }
            KIND_FINAL_ACK => Frame::FinalAck,
            KIND_CANCEL => Frame::Cancel,
            KIND_ABORT => match cursor.str16(MAX_REASON_LEN)? {
                Some(reason) => Frame::Abort { reason },
                None => return Ok(None),
            },
            other => {
                return Err(ProtocolError::InvalidPacket(format!(
                    "unknown frame kind 0x{:02x}",
                    other
                )))
            }
        };

        Ok(Some((frame, cursor.position())))
    }
}

fn decode_manifest(cursor: &mut Cursor<'_>) -> Result<Option<Manifest>> {
    let session_id = match cursor.bytes(16) {
        Some(bytes) => {
            let mut id = [0u8; 16];
            id.copy_from_slice(bytes);
            SessionId::from_bytes(id)
        }
        None => return Ok(None),
    };
    let sender_id = match cursor.str16(u16::MAX as usize)? {
        Some(id) => id,
        None => return Ok(None),
    };
    let sender_name = match cursor.str16(u16::MAX as usize)? {
        Some(name) => name,
        None => return Ok(None),
    };
    let file_count = match cursor.u32() {
        Some(count) => count,
        None => return Ok(None),
    };
    if file_count > MAX_MANIFEST_FILES {
        return Err(ProtocolError::PacketSizeExceeded(
            file_count as usize,
            MAX_MANIFEST_FILES as usize,
        ));
    }

    let mut files = Vec::with_capacity(file_count as usize);
    let mut total: u64 = 0;
    for _ in 0..file_count {
        let name = match cursor.str16(u16::MAX as usize)? {
            Some(name) => name,
            None => return Ok(None),
        };
        let size = match cursor.u64() {
            Some(size) => size,
            None => return Ok(None),
        };
        total = total.checked_add(size).ok_or_else(|| {
            ProtocolError::InvalidPacket("manifest total size overflows".to_string())
        })?;
        files.push(ManifestEntry { name, size });
    }

    Ok(Some(Manifest {
        session_id,
        sender_id,
        sender_name,
        files,
    }))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn put_str16(out: &mut Vec<u8>, s: &str, max: usize) -> Result<()> {
    if s.len() > max {
        return Err(ProtocolError::PacketSizeExceeded(s.len(), max));
    }
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Read position over a borrowed buffer; `None` means "not enough bytes yet"
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.bytes(8).map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            u64::from_be_bytes(raw)
        })
    }

    fn str16(&mut self, max: usize) -> Result<Option<String>> {
        let len = match self.u16() {
            Some(len) => len as usize,
            None => return Ok(None),
        };
        if len > max {
            return Err(ProtocolError::PacketSizeExceeded(len, max));
        }
        match self.bytes(len) {
            Some(raw) => String::from_utf8(raw.to_vec())
                .map(Some)
                .map_err(|_| ProtocolError::InvalidPacket("string is not valid UTF-8".to_string())),
            None => Ok(None),
        }
    }
}

/// Write one frame to the channel as a single `write` call
pub async fn send_frame(channel: &mut dyn DuplexChannel, frame: &Frame) -> Result<()> {
    let bytes = frame.encode()?;
    debug!("Sending {} frame ({} bytes)", frame.kind_name(), bytes.len());
    channel.write(&bytes).await
}

/// Reassembles frames from the channel's byte stream
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read until one complete frame is available
    ///
    /// Cancel safe: bytes are only consumed from the channel once a read
    /// completes, and they stay buffered until decoded.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the peer closes the channel mid-stream, or
    /// any decode error.
    pub async fn next_frame(&mut self, channel: &mut dyn DuplexChannel) -> Result<Frame> {
        loop {
            if let Some((frame, used)) = Frame::decode(&self.buffer)? {
                self.buffer.drain(..used);
                return Ok(frame);
            }

            let bytes = channel.read(READ_SIZE).await?;
            if bytes.is_empty() {
                return Err(ProtocolError::Transport(format!(
                    "channel closed by peer with {} bytes buffered",
                    self.buffer.len()
                )));
            }
            self.buffer.extend_from_slice(&bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            session_id: SessionId::new(),
            sender_id: "laptop".to_string(),
            sender_name: "Laptop".to_string(),
            files: vec![
                ManifestEntry {
                    name: "a.txt".to_string(),
                    size: 1000,
                },
                ManifestEntry {
                    name: "photo.jpg".to_string(),
                    size: 5 * 1024 * 1024,
                },
            ],
        }
    }

    #[test]
    fn test_chunk_layout_matches_documented_header() {
        let chunk = Chunk::new(7, b"hello".to_vec());
        let bytes = Frame::Chunk(chunk.clone()).encode().unwrap();

        assert_eq!(bytes[0], KIND_CHUNK);
        assert_eq!(&bytes[1..5], &7u32.to_be_bytes());
        assert_eq!(&bytes[5..9], &5u32.to_be_bytes());
        assert_eq!(&bytes[9..13], &crc32fast::hash(b"hello").to_be_bytes());
        assert_eq!(&bytes[13..], b"hello");
    }

    #[test]
    fn test_manifest_layout_after_header() {
        let manifest = sample_manifest();
        let bytes = Frame::Manifest(manifest.clone()).encode().unwrap();

        // kind + session id + "laptop" + "Laptop"
        let body = &bytes[1 + 16 + 2 + 6 + 2 + 6..];
        assert_eq!(&body[0..4], &2u32.to_be_bytes());
        assert_eq!(&body[4..6], &5u16.to_be_bytes());
        assert_eq!(&body[6..11], b"a.txt");
        assert_eq!(&body[11..19], &1000u64.to_be_bytes());

        let (decoded, used) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, Frame::Manifest(manifest));
    }

    #[test]
    fn test_partial_frames_need_more_bytes() {
        let bytes = Frame::Chunk(Chunk::new(1, vec![9u8; 100])).encode().unwrap();
        for cut in [0, 1, 12, 13, 50, bytes.len() - 1] {
            assert!(Frame::decode(&bytes[..cut]).unwrap().is_none(), "cut at {}", cut);
        }
        assert!(Frame::decode(&bytes).unwrap().is_some());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = Frame::ChunkAck {
            file_index: 1,
            sequence_number: 2,
        }
        .encode()
        .unwrap();
        bytes.extend(Frame::FinalAck.encode().unwrap());

        let (first, used) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(
            first,
            Frame::ChunkAck {
                file_index: 1,
                sequence_number: 2
            }
        );
        let (second, _) = Frame::decode(&bytes[used..]).unwrap().unwrap();
        assert_eq!(second, Frame::FinalAck);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(matches!(
            Frame::decode(&[0xff]),
            Err(ProtocolError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected_before_body_arrives() {
        let mut header = vec![KIND_CHUNK];
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(&((MAX_PAYLOAD_SIZE + 1) as u32).to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            Frame::decode(&header),
            Err(ProtocolError::PacketSizeExceeded(_, _))
        ));
    }

    #[test]
    fn test_chunk_verify_detects_corruption() {
        let mut chunk = Chunk::new(0, b"payload".to_vec());
        assert!(chunk.verify());
        chunk.payload[0] ^= 0xff;
        assert!(!chunk.verify());
    }

    #[test]
    fn test_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(MAX_REASON_LEN);
        let bytes = Frame::Abort { reason }.encode().unwrap();
        let (frame, _) = Frame::decode(&bytes).unwrap().unwrap();
        match frame {
            Frame::Abort { reason } => assert!(reason.len() <= MAX_REASON_LEN),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_manifest_total_size() {
        assert_eq!(sample_manifest().total_size(), 1000 + 5 * 1024 * 1024);
    }
}
