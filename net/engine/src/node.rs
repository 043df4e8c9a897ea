//! Polymorphic egress chunks.
//!
//! The write queue of a connection holds [`BufferNode`]s in submission
//! order. Every variant answers the same small contract: how many bytes are
//! left, a readable window of the next bytes, and a cursor advance. File and
//! pull-stream nodes stage bytes into an internal buffer one chunk at a
//! time; async-stream nodes are fed by a producer handle and finish only on
//! an explicit `done`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use bytes::{Buf, BytesMut};
use tracing::{error, trace};

/// Chunk size for staging file and pull-stream bytes.
pub(crate) const STREAM_CHUNK: usize = 16 * 1024;

/// Caller-supplied pull producer; fills the window and returns the byte
/// count written, 0 meaning end of stream.
pub type StreamProducer = Box<dyn FnMut(&mut [u8]) -> usize + Send>;

/// One outbound chunk in a connection's egress queue.
pub enum BufferNode {
    /// Plain in-memory bytes, appendable while it is the queue tail.
    Memory(MemoryNode),
    /// A bounded region of an opened file.
    File(FileNode),
    /// A caller-driven pull stream.
    PullStream(PullStreamNode),
    /// A producer-driven push stream fed from any thread.
    AsyncStream(AsyncStreamNode),
}

/// In-memory byte buffer node.
pub struct MemoryNode {
    buf: BytesMut,
}

/// File-region node. Born done and unavailable when the file cannot be
/// opened or the requested region is out of bounds.
pub struct FileNode {
    file: Option<File>,
    to_send: u64,
    buf: BytesMut,
    done: bool,
}

/// Pull-stream node; the producer is invoked on demand to refill the
/// staging buffer.
pub struct PullStreamNode {
    producer: StreamProducer,
    buf: BytesMut,
    done: bool,
}

/// Async-stream node; bytes are appended by the producer handle and the
/// node finishes only on an explicit `done`.
pub struct AsyncStreamNode {
    id: u64,
    buf: BytesMut,
    done: bool,
}

impl BufferNode {
    /// A fresh, empty memory node.
    pub fn new_memory() -> Self {
        BufferNode::Memory(MemoryNode {
            buf: BytesMut::new(),
        })
    }

    /// A file-region node for `length` bytes starting at `offset`
    /// (`length == 0` means the rest of the file).
    ///
    /// Open, stat or seek failures and out-of-bounds regions produce an
    /// unavailable node that is already done; it is popped without I/O.
    pub fn new_file(path: &Path, offset: u64, length: u64) -> Self {
        let dead = || {
            BufferNode::File(FileNode {
                file: None,
                to_send: 0,
                buf: BytesMut::new(),
                done: true,
            })
        };

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                error!("{} open error: {}", path.display(), e);
                return dead();
            }
        };
        let size = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!("{} stat error: {}", path.display(), e);
                return dead();
            }
        };
        let to_send = if length == 0 {
            if offset >= size {
                error!(
                    "the file is {} bytes but offset {} and length {} were requested",
                    size, offset, length
                );
                return dead();
            }
            size - offset
        } else {
            match offset.checked_add(length) {
                Some(end) if end <= size => length,
                _ => {
                    error!(
                        "the file is {} bytes but offset {} and length {} were requested",
                        size, offset, length
                    );
                    return dead();
                }
            }
        };
        if let Err(e) = file.seek(SeekFrom::Start(offset)) {
            error!("{} seek error: {}", path.display(), e);
            return dead();
        }

        BufferNode::File(FileNode {
            file: Some(file),
            to_send,
            buf: BytesMut::new(),
            done: false,
        })
    }

    /// A pull-stream node around `producer`.
    pub fn new_pull_stream(producer: StreamProducer) -> Self {
        BufferNode::PullStream(PullStreamNode {
            producer,
            buf: BytesMut::new(),
            done: false,
        })
    }

    /// An async-stream node addressed by `id`.
    pub fn new_async(id: u64) -> Self {
        BufferNode::AsyncStream(AsyncStreamNode {
            id,
            buf: BytesMut::new(),
            done: false,
        })
    }

    /// Bytes still to send from this node.
    ///
    /// Unknown for a live pull stream, which reports at least 1 until its
    /// producer signals the end; a live async stream reports only what is
    /// currently buffered.
    pub fn remaining(&self) -> usize {
        match self {
            BufferNode::Memory(node) => node.buf.len(),
            BufferNode::File(node) => {
                if node.done {
                    0
                } else {
                    node.to_send as usize
                }
            }
            BufferNode::PullStream(node) => {
                if node.done {
                    node.buf.len()
                } else {
                    node.buf.len().max(1)
                }
            }
            BufferNode::AsyncStream(node) => node.buf.len(),
        }
    }

    /// The next readable window. File and pull-stream nodes refill their
    /// staging buffer here, one chunk at a time. An empty window from a
    /// node with bytes nominally remaining means the source is exhausted.
    pub fn window(&mut self) -> &[u8] {
        match self {
            BufferNode::Memory(node) => &node.buf,
            BufferNode::File(node) => {
                if node.buf.is_empty() && node.to_send > 0 && !node.done {
                    if let Some(file) = node.file.as_mut() {
                        let want = STREAM_CHUNK.min(node.to_send as usize);
                        node.buf.resize(want, 0);
                        match file.read(&mut node.buf[..]) {
                            Ok(0) => {
                                trace!("read to the end of the file");
                                node.buf.clear();
                            }
                            Ok(n) => node.buf.truncate(n),
                            Err(e) => {
                                error!("file read error: {}", e);
                                node.buf.clear();
                            }
                        }
                    }
                }
                &node.buf
            }
            BufferNode::PullStream(node) => {
                if node.buf.is_empty() && !node.done {
                    node.buf.resize(STREAM_CHUNK, 0);
                    let n = (node.producer)(&mut node.buf[..]);
                    node.buf.truncate(n);
                }
                &node.buf
            }
            BufferNode::AsyncStream(node) => &node.buf,
        }
    }

    /// Consume `n` bytes from the front of the current window.
    pub fn advance(&mut self, n: usize) {
        match self {
            BufferNode::Memory(node) => node.buf.advance(n),
            BufferNode::File(node) => {
                // sendfile() moves bytes without staging them, so only the
                // buffered prefix is dropped here.
                let buffered = n.min(node.buf.len());
                node.buf.advance(buffered);
                node.to_send = node.to_send.saturating_sub(n as u64);
            }
            BufferNode::PullStream(node) => node.buf.advance(n),
            BufferNode::AsyncStream(node) => node.buf.advance(n),
        }
    }

    /// Append bytes; meaningful only for memory and async-stream nodes.
    pub fn append(&mut self, data: &[u8]) {
        match self {
            BufferNode::Memory(node) => node.buf.extend_from_slice(data),
            BufferNode::AsyncStream(node) => node.buf.extend_from_slice(data),
            _ => debug_assert!(false, "append on a file or pull-stream node"),
        }
    }

    /// Mark the out-of-band end of the node's byte source.
    pub fn mark_done(&mut self) {
        match self {
            BufferNode::Memory(_) => {}
            BufferNode::File(node) => node.done = true,
            BufferNode::PullStream(node) => node.done = true,
            BufferNode::AsyncStream(node) => node.done = true,
        }
    }

    /// Whether this is a file node.
    pub fn is_file(&self) -> bool {
        matches!(self, BufferNode::File(_))
    }

    /// Whether this is a pull-stream node.
    pub fn is_stream(&self) -> bool {
        matches!(self, BufferNode::PullStream(_))
    }

    /// Whether this is an async-stream node.
    pub fn is_async(&self) -> bool {
        matches!(self, BufferNode::AsyncStream(_))
    }

    /// Whether the node's byte source is usable: an open file for file
    /// nodes, a producer that has not signalled `done` for async nodes.
    pub fn available(&self) -> bool {
        match self {
            BufferNode::File(node) => node.file.is_some(),
            BufferNode::AsyncStream(node) => !node.done,
            _ => true,
        }
    }

    /// The file descriptor backing a file node, for the zero-copy path.
    #[cfg(unix)]
    pub fn file_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        match self {
            BufferNode::File(node) => node.file.as_ref().map(|f| f.as_raw_fd()),
            _ => None,
        }
    }

    /// The id of an async-stream node.
    pub fn async_id(&self) -> Option<u64> {
        match self {
            BufferNode::AsyncStream(node) => Some(node.id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn temp_file(tag: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "strand-node-{}-{}",
            std::process::id(),
            tag
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_memory_append_and_advance() {
        let mut node = BufferNode::new_memory();
        assert_eq!(node.remaining(), 0);
        node.append(b"hello ");
        node.append(b"world");
        assert_eq!(node.remaining(), 11);
        assert_eq!(node.window(), b"hello world");
        node.advance(6);
        assert_eq!(node.window(), b"world");
        assert_eq!(node.remaining(), 5);
    }

    #[test]
    fn test_file_region_windows() {
        let path = temp_file("region", b"0123456789");
        let mut node = BufferNode::new_file(&path, 2, 5);
        assert!(node.available());
        assert!(node.is_file());
        assert_eq!(node.remaining(), 5);
        assert_eq!(node.window(), b"23456");
        node.advance(5);
        assert_eq!(node.remaining(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_file_rest_of_file() {
        let path = temp_file("rest", b"0123456789");
        let mut node = BufferNode::new_file(&path, 4, 0);
        assert_eq!(node.remaining(), 6);
        assert_eq!(node.window(), b"456789");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_file_invalid_regions_are_born_done() {
        let path = temp_file("bounds", b"0123456789");
        // offset past the end
        let node = BufferNode::new_file(&path, 20, 0);
        assert!(!node.available());
        assert_eq!(node.remaining(), 0);
        // offset at the end with a positive length
        let node = BufferNode::new_file(&path, 10, 1);
        assert!(!node.available());
        assert_eq!(node.remaining(), 0);
        // region sticking out past the end
        let node = BufferNode::new_file(&path, 5, 6);
        assert!(!node.available());
        // missing file
        let node = BufferNode::new_file(Path::new("/nonexistent/strand-test"), 0, 0);
        assert!(!node.available());
        assert_eq!(node.remaining(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_pull_stream_produces_until_zero() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut node = BufferNode::new_pull_stream(Box::new(move |dst| {
            match calls2.fetch_add(1, Ordering::AcqRel) {
                0 => {
                    dst[..3].copy_from_slice(b"abc");
                    3
                }
                _ => 0,
            }
        }));

        assert!(node.is_stream());
        // unknown length: a live stream reports at least one byte
        assert!(node.remaining() > 0);
        assert_eq!(node.window(), b"abc");
        node.advance(3);
        // source exhausted: the next window is empty and the caller marks it done
        assert!(node.window().is_empty());
        node.mark_done();
        assert_eq!(node.remaining(), 0);
        assert_eq!(calls.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_async_stream_buffers_and_finishes() {
        let mut node = BufferNode::new_async(7);
        assert_eq!(node.async_id(), Some(7));
        assert!(node.is_async());
        assert!(node.available());
        assert_eq!(node.remaining(), 0);

        node.append(b"data");
        assert_eq!(node.remaining(), 4);
        node.advance(4);
        assert_eq!(node.remaining(), 0);
        assert!(node.available());

        node.mark_done();
        assert!(!node.available());
        assert_eq!(node.remaining(), 0);
    }
}
