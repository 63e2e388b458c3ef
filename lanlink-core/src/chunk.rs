//! Chunk manager: split a payload into indexed chunks, track received chunks, reassemble.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use base64::Engine;

use crate::identity::{random_hex_id, PeerId};
use crate::protocol::Message;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Byte ranges of each chunk, in index order. `ceil(len / chunk_size)` entries; none for an empty payload.
pub fn split_into_chunks(total_len: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let mut out = Vec::with_capacity(total_len.div_ceil(size));
    let mut start = 0;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(start..end);
        start = end;
    }
    out
}

/// MIME type guessed from the file extension.
pub fn mime_type_for(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// An accepted outbound file, handed to the host to stream chunk by chunk.
#[derive(Debug, Clone)]
pub struct FileSendJob {
    pub file_id: String,
    pub to: PeerId,
    pub destination: SocketAddr,
    pub token: String,
    pub data: Arc<[u8]>,
    pub chunk_size: usize,
    /// Pause between chunks.
    pub delay_ms: u64,
}

impl FileSendJob {
    pub fn total_chunks(&self) -> usize {
        split_into_chunks(self.data.len(), self.chunk_size).len()
    }

    /// Build FILE_CHUNK number `index`, or `None` past the end.
    pub fn chunk_message(&self, from: &PeerId, index: usize) -> Option<Message> {
        let ranges = split_into_chunks(self.data.len(), self.chunk_size);
        let range = ranges.get(index)?.clone();
        Some(Message::FileChunk {
            message_id: random_hex_id(16),
            from: from.clone(),
            to: self.to.clone(),
            file_id: self.file_id.clone(),
            chunk_index: index,
            total_chunks: ranges.len(),
            chunk_size: range.len(),
            token: self.token.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(&self.data[range]),
        })
    }
}

/// Outcome of storing one received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInsert {
    Stored,
    /// Index already present; retransmission.
    Duplicate,
    OutOfRange,
}

/// Receive-side state: chunk map by index until every index up to the total is present.
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    pub file_id: String,
    pub from: PeerId,
    pub filename: String,
    pub filesize: u64,
    pub hash: Option<String>,
    /// Learned from the first chunk; zero-byte files are known complete up front.
    total_chunks: Option<usize>,
    received: BTreeMap<usize, Vec<u8>>,
    pub last_activity: f64,
}

impl IncomingTransfer {
    pub fn new(
        file_id: &str,
        from: &PeerId,
        filename: &str,
        filesize: u64,
        hash: Option<String>,
        now: f64,
    ) -> Self {
        Self {
            file_id: file_id.to_string(),
            from: from.clone(),
            filename: filename.to_string(),
            filesize,
            hash,
            total_chunks: (filesize == 0).then_some(0),
            received: BTreeMap::new(),
            last_activity: now,
        }
    }

    /// Store a chunk. Duplicates are a no-op.
    pub fn insert(
        &mut self,
        index: usize,
        total_chunks: usize,
        payload: Vec<u8>,
        now: f64,
    ) -> ChunkInsert {
        let total = *self.total_chunks.get_or_insert(total_chunks);
        if index >= total {
            return ChunkInsert::OutOfRange;
        }
        self.last_activity = now;
        if self.received.contains_key(&index) {
            return ChunkInsert::Duplicate;
        }
        self.received.insert(index, payload);
        ChunkInsert::Stored
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks == Some(self.received.len())
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn total_chunks(&self) -> Option<usize> {
        self.total_chunks
    }

    /// Concatenate chunks in index order. Call only when `is_complete()`.
    /// Sized from the bytes actually held; `filesize` is the sender's claim.
    pub fn reassemble_into_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.received.values().map(Vec::len).sum());
        for payload in self.received.values() {
            out.extend_from_slice(payload);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(size: u64) -> IncomingTransfer {
        IncomingTransfer::new("abcd1234", &PeerId::from("a@10.0.0.1"), "f.bin", size, None, 0.0)
    }

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(100, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], 0..30);
        assert_eq!(chunks[3], 90..100);
    }

    #[test]
    fn split_exact_multiple() {
        let chunks = split_into_chunks(90, 30);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].end, 90);
    }

    #[test]
    fn split_zero_length() {
        assert!(split_into_chunks(0, 30).is_empty());
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        assert_eq!(split_into_chunks(DEFAULT_CHUNK_SIZE * 2, 0).len(), 2);
    }

    #[test]
    fn mime_by_extension() {
        assert_eq!(mime_type_for("cat.JPG"), "image/jpeg");
        assert_eq!(mime_type_for("cat.jpeg"), "image/jpeg");
        assert_eq!(mime_type_for("a.png"), "image/png");
        assert_eq!(mime_type_for("notes.txt"), "text/plain");
        assert_eq!(mime_type_for("archive.tar.gz"), "application/octet-stream");
        assert_eq!(mime_type_for("README"), "application/octet-stream");
    }

    #[test]
    fn reassemble_out_of_order() {
        let data: Vec<u8> = (0..100u8).collect();
        let ranges = split_into_chunks(data.len(), 30);
        let mut t = transfer(100);
        for i in [2, 0, 3, 1] {
            assert!(!t.is_complete());
            assert_eq!(t.insert(i, ranges.len(), data[ranges[i].clone()].to_vec(), 1.0), ChunkInsert::Stored);
        }
        assert!(t.is_complete());
        assert_eq!(t.reassemble_into_bytes(), data);
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let mut t = transfer(60);
        t.insert(0, 2, vec![1; 30], 1.0);
        assert_eq!(t.insert(0, 2, vec![9; 30], 2.0), ChunkInsert::Duplicate);
        assert_eq!(t.received_count(), 1);
        assert!(!t.is_complete());
    }

    #[test]
    fn out_of_range_index_ignored() {
        let mut t = transfer(60);
        assert_eq!(t.insert(5, 2, vec![1], 1.0), ChunkInsert::OutOfRange);
        assert_eq!(t.received_count(), 0);
    }

    #[test]
    fn claimed_size_does_not_drive_allocation() {
        let mut t = transfer(u64::MAX);
        assert_eq!(t.insert(0, 1, b"hi".to_vec(), 1.0), ChunkInsert::Stored);
        assert!(t.is_complete());
        assert_eq!(t.reassemble_into_bytes(), b"hi");
    }

    #[test]
    fn empty_file_complete_without_chunks() {
        let t = transfer(0);
        assert!(t.is_complete());
        assert!(t.reassemble_into_bytes().is_empty());
    }

    #[test]
    fn job_builds_base64_chunks() {
        let job = FileSendJob {
            file_id: "abcd1234".into(),
            to: PeerId::from("b@10.0.0.2"),
            destination: "10.0.0.2:50999".parse().unwrap(),
            token: "a@10.0.0.1|9999999999|file".into(),
            data: Arc::from(&b"hello world"[..]),
            chunk_size: 4,
            delay_ms: 0,
        };
        assert_eq!(job.total_chunks(), 3);
        let Some(Message::FileChunk { data, chunk_index, total_chunks, chunk_size, .. }) =
            job.chunk_message(&PeerId::from("a@10.0.0.1"), 2)
        else {
            panic!("expected chunk");
        };
        assert_eq!((chunk_index, total_chunks, chunk_size), (2, 3, 3));
        assert_eq!(data, "cmxk");
        assert!(job.chunk_message(&PeerId::from("a@10.0.0.1"), 3).is_none());
    }
}
