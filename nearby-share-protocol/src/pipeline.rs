//! Chunk Transfer Pipeline
//!
//! Streams the files of an agreed manifest as ordered, checksummed chunks
//! and reconstructs them on the receiving side.
//!
//! ## Flow Control
//!
//! The sender keeps at most `send_window` unacknowledged chunks in memory.
//! The receiver acknowledges every chunk it persists, in order. On a
//! checksum mismatch it requests the expected sequence number again with
//! a `ChunkNack` and drops later chunks still in flight; the sender rewinds
//! to that chunk and resends from its window (go-back-N).
//!
//! Each file has its own retransmission budget. When it is exhausted the
//! receiver sends an integrity `Abort` and both sides fail.
//!
//! ## Completion
//!
//! The receiver commits every file as soon as its last chunk is written and
//! sends a `FinalAck` after the last file. The sender reports success only
//! once that acknowledgement arrives.

use crate::config::TransferConfig;
use crate::session::{FileDescriptor, FileHandle};
use crate::storage::{ByteSink, ByteSource, FileStorage};
use crate::transport::DuplexChannel;
use crate::wire::{send_frame, Chunk, Frame, FrameReader};
use crate::{ProtocolError, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Abort reason sent when a file exhausts its retransmission budget
pub const INTEGRITY_ABORT_REASON: &str = "integrity";

/// Receives counter updates from a running transfer
pub trait TransferObserver: Send {
    /// `bytes` more file bytes were acknowledged (sender) or persisted (receiver)
    fn on_bytes(&mut self, bytes: u64);

    /// The file at `index` is fully transferred
    fn on_file_completed(&mut self, index: usize);
}

/// Moves the files of one session over an established channel
#[derive(Debug, Clone)]
pub struct ChunkPipeline {
    config: TransferConfig,
    storage: Arc<dyn FileStorage>,
    cancel: CancellationToken,
}

impl ChunkPipeline {
    pub fn new(config: TransferConfig, storage: Arc<dyn FileStorage>, cancel: CancellationToken) -> Self {
        Self {
            config,
            storage,
            cancel,
        }
    }

    /// Send every file in manifest order and wait for the final acknowledgement
    pub async fn send(
        &self,
        channel: &mut dyn DuplexChannel,
        reader: &mut FrameReader,
        files: &[FileDescriptor],
        observer: &mut dyn TransferObserver,
    ) -> Result<()> {
        for (i, file) in files.iter().enumerate() {
            let index = file_index(i)?;
            info!("Sending {} ({} bytes) to {}", file.name, file.byte_size, channel.peer_id());
            self.send_file(channel, reader, index, file, observer).await?;
            observer.on_file_completed(i);
        }

        match self.next_frame(channel, reader, "final acknowledgement").await? {
            Frame::FinalAck => {
                debug!("Final acknowledgement received");
                Ok(())
            }
            other => Err(unexpected_frame(other, files.len() as u32, 0)),
        }
    }

    async fn send_file(
        &self,
        channel: &mut dyn DuplexChannel,
        reader: &mut FrameReader,
        index: u32,
        file: &FileDescriptor,
        observer: &mut dyn TransferObserver,
    ) -> Result<()> {
        let chunk_size = self.config.chunk_size as u64;
        let chunk_count = file.byte_size / chunk_size + u64::from(file.byte_size % chunk_size != 0);
        let chunk_count = u32::try_from(chunk_count).map_err(|_| {
            ProtocolError::Configuration(format!(
                "{} needs {} chunks, more than a sequence number can count",
                file.name, chunk_count
            ))
        })?;

        let mut source = self.storage.open(&file.handle).await?;
        let mut window: VecDeque<Chunk> = VecDeque::with_capacity(self.config.send_window);
        let mut remaining = file.byte_size;
        let mut base: u32 = 0;
        let mut next_read: u32 = 0;
        let mut next_send: u32 = 0;
        let mut nacks: u32 = 0;

        while base < chunk_count {
            while window.len() < self.config.send_window && next_read < chunk_count {
                let want = remaining.min(chunk_size) as usize;
                let payload = read_exact(source.as_mut(), want).await?;
                if payload.len() != want {
                    return Err(ProtocolError::invalid_state(format!(
                        "{} changed size while being sent",
                        file.name
                    )));
                }
                remaining -= want as u64;
                window.push_back(Chunk::new(next_read, payload));
                next_read += 1;
            }

            while next_send < base + window.len() as u32 {
                let chunk = &window[(next_send - base) as usize];
                self.write(channel, &Frame::Chunk(chunk.clone())).await?;
                next_send += 1;
            }

            match self.next_frame(channel, reader, "chunk acknowledgement").await? {
                Frame::ChunkAck {
                    file_index,
                    sequence_number,
                } if file_index == index => {
                    if sequence_number < base || sequence_number >= next_send {
                        return Err(ProtocolError::InvalidPacket(format!(
                            "acknowledgement for chunk {} outside window {}..{}",
                            sequence_number, base, next_send
                        )));
                    }
                    while base <= sequence_number {
                        let chunk = window
                            .pop_front()
                            .ok_or_else(|| ProtocolError::invalid_state("send window underflow"))?;
                        observer.on_bytes(chunk.payload.len() as u64);
                        base += 1;
                    }
                }
                Frame::ChunkNack {
                    file_index,
                    sequence_number,
                } if file_index == index => {
                    if sequence_number != base {
                        return Err(ProtocolError::InvalidPacket(format!(
                            "retransmission request for chunk {} but oldest unacknowledged is {}",
                            sequence_number, base
                        )));
                    }
                    nacks += 1;
                    if nacks > self.config.retry_budget {
                        return Err(ProtocolError::Integrity {
                            file: index,
                            attempts: self.config.retry_budget,
                        });
                    }
                    warn!(
                        "Peer requested retransmission of chunk {} of {} ({}/{})",
                        sequence_number, file.name, nacks, self.config.retry_budget
                    );
                    next_send = base;
                }
                other => return Err(unexpected_frame(other, index, nacks)),
            }
        }

        debug!("Sent {} in {} chunks", file.name, chunk_count);
        Ok(())
    }

    /// Receive every file in manifest order and send the final acknowledgement
    ///
    /// Returns the handles the files were committed under. On any error the
    /// file in progress is discarded; files already committed are kept.
    pub async fn receive(
        &self,
        channel: &mut dyn DuplexChannel,
        reader: &mut FrameReader,
        files: &[FileDescriptor],
        observer: &mut dyn TransferObserver,
    ) -> Result<Vec<FileHandle>> {
        let mut saved = Vec::with_capacity(files.len());

        for (i, file) in files.iter().enumerate() {
            let index = file_index(i)?;
            let mut sink = self.storage.create(&file.name, file.byte_size).await?;

            match self
                .receive_file(channel, reader, index, file, sink.as_mut(), observer)
                .await
            {
                Ok(()) => {
                    let handle = sink.commit().await?;
                    info!("Received {} ({} bytes) as {}", file.name, file.byte_size, handle);
                    saved.push(handle);
                    observer.on_file_completed(i);
                }
                Err(e) => {
                    if let Err(discard_err) = sink.discard().await {
                        warn!("Failed to discard partial {}: {}", file.name, discard_err);
                    } else {
                        debug!("Discarded partial {}", file.name);
                    }
                    return Err(e);
                }
            }
        }

        self.write(channel, &Frame::FinalAck).await?;
        Ok(saved)
    }

    async fn receive_file(
        &self,
        channel: &mut dyn DuplexChannel,
        reader: &mut FrameReader,
        index: u32,
        file: &FileDescriptor,
        sink: &mut dyn ByteSink,
        observer: &mut dyn TransferObserver,
    ) -> Result<()> {
        let mut received: u64 = 0;
        let mut expected: u32 = 0;
        let mut retransmissions: u32 = 0;
        let mut awaiting_retransmission = false;

        while received < file.byte_size {
            let chunk = match self.next_frame(channel, reader, "chunk").await? {
                Frame::Chunk(chunk) => chunk,
                other => return Err(unexpected_frame(other, index, retransmissions)),
            };

            if chunk.sequence_number != expected {
                if awaiting_retransmission && chunk.sequence_number > expected {
                    debug!(
                        "Dropping chunk {} while waiting for retransmission of {}",
                        chunk.sequence_number, expected
                    );
                    continue;
                }
                return Err(ProtocolError::InvalidPacket(format!(
                    "{}: expected chunk {}, got {}",
                    file.name, expected, chunk.sequence_number
                )));
            }

            if !chunk.verify() {
                retransmissions += 1;
                if retransmissions > self.config.retry_budget {
                    warn!(
                        "Chunk {} of {} failed verification {} times, aborting",
                        expected, file.name, retransmissions
                    );
                    let abort = Frame::Abort {
                        reason: INTEGRITY_ABORT_REASON.to_string(),
                    };
                    if let Err(e) = self.write(channel, &abort).await {
                        debug!("Could not send abort: {}", e);
                    }
                    return Err(ProtocolError::Integrity {
                        file: index,
                        attempts: self.config.retry_budget,
                    });
                }
                warn!(
                    "Checksum mismatch on chunk {} of {}, requesting retransmission ({}/{})",
                    expected, file.name, retransmissions, self.config.retry_budget
                );
                self.write(
                    channel,
                    &Frame::ChunkNack {
                        file_index: index,
                        sequence_number: expected,
                    },
                )
                .await?;
                awaiting_retransmission = true;
                continue;
            }

            let length = chunk.payload.len() as u64;
            if length == 0 || received + length > file.byte_size {
                return Err(ProtocolError::InvalidPacket(format!(
                    "{}: chunk {} of {} bytes overruns the announced size {}",
                    file.name, expected, length, file.byte_size
                )));
            }

            awaiting_retransmission = false;
            sink.write_chunk(&chunk.payload).await?;
            received += length;
            expected += 1;

            self.write(
                channel,
                &Frame::ChunkAck {
                    file_index: index,
                    sequence_number: chunk.sequence_number,
                },
            )
            .await?;
            observer.on_bytes(length);
        }

        Ok(())
    }

    /// Wait for the next frame, honouring cancellation and the ack timeout
    async fn next_frame(
        &self,
        channel: &mut dyn DuplexChannel,
        reader: &mut FrameReader,
        waiting_for: &str,
    ) -> Result<Frame> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProtocolError::Cancelled("cancelled locally".to_string())),
            frame = timeout(self.config.ack_timeout, reader.next_frame(channel)) => match frame {
                Ok(frame) => frame,
                Err(_) => Err(ProtocolError::Timeout(format!(
                    "no {} within {:?}",
                    waiting_for, self.config.ack_timeout
                ))),
            },
        }
    }

    /// Write one frame; cancellation is checked before, never during, a write
    async fn write(&self, channel: &mut dyn DuplexChannel, frame: &Frame) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled("cancelled locally".to_string()));
        }
        match timeout(self.config.ack_timeout, send_frame(channel, frame)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "peer stopped reading ({} frame)",
                frame.kind_name()
            ))),
        }
    }
}

fn file_index(i: usize) -> Result<u32> {
    u32::try_from(i).map_err(|_| ProtocolError::invalid_state("too many files"))
}

/// Map a frame that has no place at this point of the transfer
fn unexpected_frame(frame: Frame, index: u32, retransmissions: u32) -> ProtocolError {
    match frame {
        Frame::Cancel => ProtocolError::Cancelled("cancelled by peer".to_string()),
        Frame::Abort { reason } if reason == INTEGRITY_ABORT_REASON => ProtocolError::Integrity {
            file: index,
            attempts: retransmissions,
        },
        Frame::Abort { reason } => ProtocolError::Transport(format!("peer aborted: {}", reason)),
        other => ProtocolError::InvalidPacket(format!(
            "unexpected {} frame during transfer",
            other.kind_name()
        )),
    }
}

async fn read_exact(source: &mut dyn ByteSource, want: usize) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(want);
    while payload.len() < want {
        let bytes = source.read_chunk(want - payload.len()).await?;
        if bytes.is_empty() {
            break;
        }
        payload.extend_from_slice(&bytes);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transport::{StreamChannel, TransportType};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Recorder {
        bytes: Vec<u64>,
        completed: Vec<usize>,
    }

    impl TransferObserver for Recorder {
        fn on_bytes(&mut self, bytes: u64) {
            self.bytes.push(bytes);
        }

        fn on_file_completed(&mut self, index: usize) {
            self.completed.push(index);
        }
    }

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: 100,
            send_window: 3,
            retry_budget: 2,
            ack_timeout: Duration::from_secs(5),
            ..TransferConfig::default()
        }
    }

    fn pipe() -> (
        StreamChannel<tokio::io::DuplexStream>,
        StreamChannel<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        (
            StreamChannel::new(a, "receiver", TransportType::Memory),
            StreamChannel::new(b, "sender", TransportType::Memory),
        )
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_multi_file_round_trip() {
        let source = MemoryStorage::new();
        source.insert("a.bin", pattern(250)).await;
        source.insert("empty", Vec::new()).await;
        source.insert("b.bin", pattern(1000)).await;
        let sink = MemoryStorage::new();

        let files = vec![
            FileDescriptor::new(FileHandle::new("a.bin"), "a.bin", 250),
            FileDescriptor::new(FileHandle::new("empty"), "empty", 0),
            FileDescriptor::new(FileHandle::new("b.bin"), "b.bin", 1000),
        ];

        let (mut tx, mut rx) = pipe();
        let sender = ChunkPipeline::new(config(), Arc::new(source), CancellationToken::new());
        let receiver = ChunkPipeline::new(config(), Arc::new(sink.clone()), CancellationToken::new());

        let send_files = files.clone();
        let send = tokio::spawn(async move {
            let mut recorder = Recorder::default();
            let mut reader = FrameReader::new();
            let result = sender
                .send(&mut tx, &mut reader, &send_files, &mut recorder)
                .await;
            result.map(|_| recorder)
        });

        let mut recorder = Recorder::default();
        let mut reader = FrameReader::new();
        let saved = receiver
            .receive(&mut rx, &mut reader, &files, &mut recorder)
            .await
            .unwrap();
        let sent = send.await.unwrap().unwrap();

        assert_eq!(saved.len(), 3);
        assert_eq!(sink.get("a.bin").await.unwrap(), pattern(250));
        assert_eq!(sink.get("empty").await.unwrap(), Vec::<u8>::new());
        assert_eq!(sink.get("b.bin").await.unwrap(), pattern(1000));

        assert_eq!(sent.bytes.iter().sum::<u64>(), 1250);
        assert_eq!(recorder.bytes.iter().sum::<u64>(), 1250);
        assert_eq!(sent.completed, vec![0, 1, 2]);
        assert_eq!(recorder.completed, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_fails_receiver() {
        let sink = MemoryStorage::new();
        let files = vec![FileDescriptor::new(FileHandle::new("a"), "a", 200)];
        let (mut tx, mut rx) = pipe();

        send_frame(&mut tx, &Frame::Chunk(Chunk::new(1, vec![0u8; 100])))
            .await
            .unwrap();

        let receiver = ChunkPipeline::new(config(), Arc::new(sink.clone()), CancellationToken::new());
        let mut reader = FrameReader::new();
        let result = receiver
            .receive(&mut rx, &mut reader, &files, &mut Recorder::default())
            .await;

        assert!(matches!(result, Err(ProtocolError::InvalidPacket(_))));
        assert!(!sink.contains("a").await, "partial output must be discarded");
    }

    #[tokio::test]
    async fn test_receiver_aborts_after_budget() {
        let sink = MemoryStorage::new();
        let files = vec![FileDescriptor::new(FileHandle::new("a"), "a", 100)];
        let (mut tx, mut rx) = pipe();

        let mut bad = Chunk::new(0, vec![1u8; 100]);
        bad.checksum ^= 1;
        // budget 2: two retransmissions, the third mismatch aborts
        for _ in 0..3 {
            send_frame(&mut tx, &Frame::Chunk(bad.clone())).await.unwrap();
        }

        let receiver = ChunkPipeline::new(config(), Arc::new(sink.clone()), CancellationToken::new());
        let mut reader = FrameReader::new();
        let result = receiver
            .receive(&mut rx, &mut reader, &files, &mut Recorder::default())
            .await;
        assert!(matches!(
            result,
            Err(ProtocolError::Integrity { file: 0, attempts: 2 })
        ));

        let mut sender_reader = FrameReader::new();
        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(sender_reader.next_frame(&mut tx).await.unwrap());
        }
        assert_eq!(
            frames[0],
            Frame::ChunkNack {
                file_index: 0,
                sequence_number: 0
            }
        );
        assert_eq!(
            frames[2],
            Frame::Abort {
                reason: INTEGRITY_ABORT_REASON.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_receiver_stops_waiting() {
        let sink = MemoryStorage::new();
        let files = vec![FileDescriptor::new(FileHandle::new("a"), "a", 100)];
        let (_tx, mut rx) = pipe();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let receiver = ChunkPipeline::new(config(), Arc::new(sink.clone()), cancel);
        let mut reader = FrameReader::new();
        let result = receiver
            .receive(&mut rx, &mut reader, &files, &mut Recorder::default())
            .await;
        assert!(matches!(result, Err(ProtocolError::Cancelled(_))));
        assert!(sink.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_sender_times_out_without_acks() {
        let source = MemoryStorage::new();
        source.insert("a", pattern(100)).await;
        let files = vec![FileDescriptor::new(FileHandle::new("a"), "a", 100)];
        let (mut tx, _rx) = pipe();

        let sender = ChunkPipeline::new(
            TransferConfig {
                ack_timeout: Duration::from_millis(50),
                ..config()
            },
            Arc::new(source),
            CancellationToken::new(),
        );
        let mut reader = FrameReader::new();
        let result = sender
            .send(&mut tx, &mut reader, &files, &mut Recorder::default())
            .await;
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
    }

    /// Acknowledge every chunk of a single 250 byte file, then hand the channel back
    fn ack_all_chunks(
        mut rx: StreamChannel<tokio::io::DuplexStream>,
    ) -> tokio::task::JoinHandle<StreamChannel<tokio::io::DuplexStream>> {
        tokio::spawn(async move {
            let mut reader = FrameReader::new();
            for _ in 0..3 {
                match reader.next_frame(&mut rx).await.unwrap() {
                    Frame::Chunk(chunk) => {
                        let ack = Frame::ChunkAck {
                            file_index: 0,
                            sequence_number: chunk.sequence_number,
                        };
                        send_frame(&mut rx, &ack).await.unwrap();
                    }
                    other => panic!("expected a chunk, got {}", other.kind_name()),
                }
            }
            rx
        })
    }

    #[tokio::test]
    async fn test_sender_fails_when_receiver_closes_before_final_ack() {
        let source = MemoryStorage::new();
        source.insert("a", pattern(250)).await;
        let files = vec![FileDescriptor::new(FileHandle::new("a"), "a", 250)];
        let (mut tx, rx) = pipe();

        let receiver = ack_all_chunks(rx);
        let closer = tokio::spawn(async move {
            let rx = receiver.await.unwrap();
            drop(rx);
        });

        let sender = ChunkPipeline::new(config(), Arc::new(source), CancellationToken::new());
        let mut reader = FrameReader::new();
        let mut recorder = Recorder::default();
        let result = sender.send(&mut tx, &mut reader, &files, &mut recorder).await;
        closer.await.unwrap();

        assert!(matches!(
            result,
            Err(ProtocolError::Transport(_) | ProtocolError::Timeout(_))
        ));
        // every chunk was acknowledged, yet the transfer is not reported done
        assert_eq!(recorder.bytes.iter().sum::<u64>(), 250);
        assert_eq!(recorder.completed, vec![0]);
    }

    #[tokio::test]
    async fn test_sender_times_out_without_final_ack() {
        let source = MemoryStorage::new();
        source.insert("a", pattern(250)).await;
        let files = vec![FileDescriptor::new(FileHandle::new("a"), "a", 250)];
        let (mut tx, rx) = pipe();

        let receiver = ack_all_chunks(rx);

        let sender = ChunkPipeline::new(
            TransferConfig {
                ack_timeout: Duration::from_millis(200),
                ..config()
            },
            Arc::new(source),
            CancellationToken::new(),
        );
        let mut reader = FrameReader::new();
        let mut recorder = Recorder::default();
        let result = sender.send(&mut tx, &mut reader, &files, &mut recorder).await;

        // the receiver stays connected but silent
        let _rx = receiver.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
        assert_eq!(recorder.bytes.iter().sum::<u64>(), 250);
    }

    #[test]
    fn test_unexpected_frame_mapping() {
        assert!(matches!(
            unexpected_frame(Frame::Cancel, 0, 0),
            ProtocolError::Cancelled(_)
        ));
        assert!(matches!(
            unexpected_frame(
                Frame::Abort {
                    reason: INTEGRITY_ABORT_REASON.to_string()
                },
                1,
                3
            ),
            ProtocolError::Integrity { file: 1, attempts: 3 }
        ));
        assert!(matches!(
            unexpected_frame(Frame::ManifestAccept, 0, 0),
            ProtocolError::InvalidPacket(_)
        ));
    }
}
