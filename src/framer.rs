use std::io::{self, Read, Seek, SeekFrom};

use bytes::{BufMut, BytesMut};

use crate::FilePosition;

/// Size of the I/O buffer each read pulls into.
pub const READ_BUFFER_SIZE: usize = 65_536;

/// Cuts a byte stream into lines at `\n`, `\r\n`, or bare `\r` boundaries.
///
/// A bare `\r` may be either a CR-only terminator or the first half of
/// `\r\n`, so the decision is deferred until the next byte arrives. That way
/// `\r\n` counts as a single separator while legacy CR-terminated input
/// still frames correctly.
///
/// Bytes past the last terminator in the stream, including a trailing `\r`
/// whose meaning is still open, are not emitted; the reader is rewound so
/// the next invocation re-reads them once more data has arrived.
pub struct LineFramer {
    line_buffer: BytesMut,
    read_buffer: Vec<u8>,
    has_cr: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        LineFramer::new()
    }
}

impl LineFramer {
    pub fn new() -> LineFramer {
        LineFramer::with_read_buffer_size(READ_BUFFER_SIZE)
    }

    fn with_read_buffer_size(size: usize) -> LineFramer {
        LineFramer {
            line_buffer: BytesMut::new(),
            read_buffer: vec![0u8; size],
            has_cr: false,
        }
    }

    /// Drain every complete line currently readable from `reader`.
    ///
    /// `position` must be the reader's current offset. Each completed line
    /// is handed to `sink` without its terminator, together with the offset
    /// of the byte just past that terminator. Once the reader runs dry it is
    /// rewound to the offset just past the last terminator crossed, never
    /// mid-line, and `position` is updated to match.
    ///
    /// Returns whether any byte at all was read, which is distinct from
    /// whether any line was produced: an unterminated trailing line reads
    /// bytes on every call without ever emitting.
    pub fn read_lines<R, F>(
        &mut self,
        reader: &mut R,
        position: &mut FilePosition,
        mut sink: F,
    ) -> io::Result<bool>
    where
        R: Read + Seek,
        F: FnMut(&[u8], FilePosition),
    {
        // Anything left over from the previous invocation sits past the
        // rewind point and is about to be read again.
        self.line_buffer.clear();
        self.has_cr = false;

        let mut pos = *position;
        let mut re_pos = *position;
        let mut had_data = false;

        loop {
            let n = match reader.read(&mut self.read_buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            had_data = true;

            for (i, &byte) in self.read_buffer[..n].iter().enumerate() {
                match byte {
                    b'\n' => {
                        self.has_cr = false;
                        re_pos = pos + i as u64 + 1;
                        sink(&self.line_buffer[..], re_pos);
                        self.line_buffer.clear();
                    }
                    b'\r' => {
                        if self.has_cr {
                            // \r\r: the first belongs to the line, the
                            // second is again an open question
                            self.line_buffer.put_u8(b'\r');
                        }
                        self.has_cr = true;
                    }
                    _ => {
                        if self.has_cr {
                            self.has_cr = false;
                            re_pos = pos + i as u64;
                            sink(&self.line_buffer[..], re_pos);
                            self.line_buffer.clear();
                        }
                        self.line_buffer.put_u8(byte);
                    }
                }
            }
            pos += n as u64;
        }

        reader.seek(SeekFrom::Start(re_pos))?;
        *position = re_pos;
        Ok(had_data)
    }
}
