use std::io;

/// A dynamically sized buffered FIFO byte queue. Data is appended at the
/// tail and consumed from the head. The storage is a flat vector; consumed
/// bytes are compacted away once the head outgrows half the capacity.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(size),
            head: 0,
            size,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.len()
    }

    /// Advance the head, consuming `count` bytes.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;
        self.compact();
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Append bytes at the tail.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.free_capacity());
        self.data.extend_from_slice(bytes);
    }

    /// Write the contents of the buffer to the supplied writer, advancing
    /// the head past everything accepted. Returns the number of bytes
    /// written; stops early on `WouldBlock`.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut written = 0;

        while self.len() > 0 {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.move_head(count);
                    written += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(written)
    }

    /// Read in data from the supplied reader until it would block, the
    /// buffer is full, or the stream reaches its end. Returns the number of
    /// bytes read and whether end-of-stream was observed.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, bool)> {
        let mut received = 0;

        while self.len() < self.size {
            let tail = self.data.len();
            let room = self.size - self.len();
            self.data.resize(tail + room, 0);

            match reader.read(&mut self.data[tail..]) {
                Ok(0) => {
                    self.data.truncate(tail);
                    return Ok((received, true));
                }
                Ok(count) => {
                    self.data.truncate(tail + count);
                    received += count;
                }
                Err(err) => {
                    self.data.truncate(tail);

                    return match err.kind() {
                        io::ErrorKind::WouldBlock => Ok((received, false)),
                        io::ErrorKind::Interrupted => continue,
                        _ => Err(err),
                    };
                }
            }
        }

        Ok((received, false))
    }

    #[inline]
    fn compact(&mut self) {
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > self.size / 2 {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}
