use std::collections::VecDeque;
use std::io;

pub(crate) const CHUNK_SIZE: usize = 8192;

/// A fixed-size linear byte slab. Consuming advances the start cursor,
/// writing advances the end cursor; when they meet the chunk resets to empty.
struct Chunk {
    data: Box<[u8; CHUNK_SIZE]>,
    start: usize,
    end: usize,
}

impl Chunk {
    #[inline]
    fn new() -> Chunk {
        Chunk {
            data: Box::new([0; CHUNK_SIZE]),
            start: 0,
            end: 0,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        CHUNK_SIZE - self.end
    }

    #[inline]
    fn remaining_data(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    fn readable_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    #[inline]
    fn writeable_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.end..CHUNK_SIZE]
    }

    #[inline]
    fn advance(&mut self, count: usize) {
        if self.start + count > self.end {
            panic!("Attempted to advance past chunk edge")
        }

        self.start += count;

        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    #[inline]
    fn expand(&mut self, count: usize) {
        if self.end + count > CHUNK_SIZE {
            panic!("Attempted to expand beyond chunk size")
        }

        self.end += count;
    }
}

/// Recycles chunks so steady-state I/O does not allocate.
struct ChunkPool {
    pool: Vec<Chunk>,
}

impl ChunkPool {
    fn new() -> ChunkPool {
        ChunkPool { pool: Vec::new() }
    }

    fn alloc(&mut self) -> Chunk {
        self.pool.pop().unwrap_or_else(Chunk::new)
    }

    fn reclaim(&mut self, chunk: Chunk) {
        self.pool.push(chunk)
    }
}

/// An unbounded, pool-backed FIFO byte queue. Data is appended at the tail
/// chunk and consumed from the head chunk; drained chunks return to the pool.
pub struct ByteQueue {
    chunks: VecDeque<Chunk>,
    pool: ChunkPool,
    len: usize,
}

impl ByteQueue {
    pub fn new() -> ByteQueue {
        let mut chunks = VecDeque::new();
        chunks.push_back(Chunk::new());

        ByteQueue {
            chunks,
            pool: ChunkPool::new(),
            len: 0,
        }
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a byte slice, growing by pool chunks as needed.
    pub fn push_slice(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.chunks.back().expect("Queue must keep one chunk").capacity() == 0 {
                let chunk = self.pool.alloc();
                self.chunks.push_back(chunk);
            }

            let tail = self.chunks.back_mut().expect("Queue must keep one chunk");
            let count = bytes.len().min(tail.capacity());

            tail.writeable_slice()[..count].copy_from_slice(&bytes[..count]);
            tail.expand(count);
            self.len += count;
            bytes = &bytes[count..];
        }
    }

    /// Copies exactly `buf.len()` bytes out of the queue, consuming them.
    /// Leaves the queue untouched and returns false when that much data is
    /// not buffered yet.
    pub fn pop_exact(&mut self, buf: &mut [u8]) -> bool {
        if self.len < buf.len() {
            return false;
        }

        let mut copied = 0;

        while copied < buf.len() {
            let head = self.chunks.front_mut().expect("Queue must keep one chunk");
            let count = (buf.len() - copied).min(head.remaining_data());

            buf[copied..copied + count].copy_from_slice(&head.readable_slice()[..count]);
            head.advance(count);
            copied += count;
            self.len -= count;

            if head.remaining_data() == 0 && self.chunks.len() > 1 {
                let drained = self.chunks.pop_front().expect("Queue must keep one chunk");
                self.pool.reclaim(drained);
            }
        }

        true
    }

    /// Drops all buffered data.
    pub fn clear(&mut self) {
        while self.chunks.len() > 1 {
            let drained = self.chunks.pop_front().expect("Queue must keep one chunk");
            self.pool.reclaim(drained);
        }

        let head = self.chunks.front_mut().expect("Queue must keep one chunk");
        let remaining = head.remaining_data();
        head.advance(remaining);
        self.len = 0;
    }

    /// Reads from `reader` until it would block or hits end of stream.
    /// Returns the byte count on clean progress; `Ok(0)` therefore also
    /// covers a reader with nothing available right now — callers detect a
    /// closed peer through `eof`.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<IngressOutcome> {
        let mut total = 0usize;

        loop {
            if self.chunks.back().expect("Queue must keep one chunk").capacity() == 0 {
                let chunk = self.pool.alloc();
                self.chunks.push_back(chunk);
            }

            let tail = self.chunks.back_mut().expect("Queue must keep one chunk");

            match reader.read(tail.writeable_slice()) {
                Ok(0) => {
                    return Ok(IngressOutcome {
                        received: total,
                        eof: true,
                    })
                }
                Ok(count) => {
                    tail.expand(count);
                    self.len += count;
                    total += count;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(IngressOutcome {
                        received: total,
                        eof: false,
                    })
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes buffered data to `writer` until the queue empties or the write
    /// would block. Returns the number of bytes written.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0usize;

        while self.len > 0 {
            let head = self.chunks.front_mut().expect("Queue must keep one chunk");

            match writer.write(head.readable_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    head.advance(count);
                    self.len -= count;
                    total += count;

                    if head.remaining_data() == 0 && self.chunks.len() > 1 {
                        let drained = self.chunks.pop_front().expect("Queue must keep one chunk");
                        self.pool.reclaim(drained);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }
}

/// Result of one ingress pass.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IngressOutcome {
    pub received: usize,
    pub eof: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Simulates a non-blocking peer delivering data in small slices.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() >= self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_push_pop_roundtrip_across_chunks() {
        let mut queue = ByteQueue::new();
        let data: Vec<u8> = (0..CHUNK_SIZE * 3 + 17).map(|i| i as u8).collect();

        queue.push_slice(&data);
        assert_eq!(queue.len(), data.len());

        let mut out = vec![0u8; data.len()];
        assert!(queue.pop_exact(&mut out));
        assert_eq!(out, data);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_exact_refuses_short_data() {
        let mut queue = ByteQueue::new();
        queue.push_slice(&[1, 2, 3]);

        let mut out = [0u8; 4];
        assert!(!queue.pop_exact(&mut out));

        // The data is still there
        let mut out = [0u8; 3];
        assert!(queue.pop_exact(&mut out));
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_ingress_stops_at_would_block() {
        let data: Vec<u8> = (0..1000).map(|i| i as u8).collect();
        let mut channel = MockChannel::new(data.clone(), 33, 0);
        let mut queue = ByteQueue::new();

        let outcome = queue.ingress(&mut channel).unwrap();

        assert_eq!(outcome, IngressOutcome { received: 1000, eof: false });
        assert_eq!(queue.len(), 1000);

        let mut out = vec![0u8; 1000];
        assert!(queue.pop_exact(&mut out));
        assert_eq!(out, data);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut cursor = io::Cursor::new(vec![1u8, 2, 3]);
        let mut queue = ByteQueue::new();

        let outcome = queue.ingress(&mut cursor).unwrap();

        assert_eq!(outcome, IngressOutcome { received: 3, eof: true });
    }

    #[test]
    fn test_egress_honors_partial_writes() {
        let mut queue = ByteQueue::new();
        let data: Vec<u8> = (0..500).map(|i| i as u8).collect();
        queue.push_slice(&data);

        // Peer accepts only 100 bytes before blocking
        let mut channel = MockChannel::new(Vec::new(), 7, 100);
        let written = queue.egress(&mut channel).unwrap();

        assert_eq!(written, 100);
        assert_eq!(queue.len(), 400);

        // Peer drains the rest
        channel.max_size = 1000;
        let written = queue.egress(&mut channel).unwrap();

        assert_eq!(written, 400);
        assert!(queue.is_empty());
        assert_eq!(channel.data, data);
    }

    #[test]
    fn test_clear_resets_queue() {
        let mut queue = ByteQueue::new();
        queue.push_slice(&vec![7u8; CHUNK_SIZE * 2]);

        queue.clear();

        assert!(queue.is_empty());
        queue.push_slice(&[1]);

        let mut out = [0u8; 1];
        assert!(queue.pop_exact(&mut out));
        assert_eq!(out, [1]);
    }
}
