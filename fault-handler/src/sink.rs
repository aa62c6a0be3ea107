use std::{
    io,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};

/// A writable destination for reports.
///
/// This is just a file descriptor, writes go straight to `write(2)` without any
/// buffering, locking, or allocation, so they can be done from a signal
/// handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputSink {
    fd: RawFd,
}

impl OutputSink {
    #[inline]
    pub const fn stderr() -> Self {
        Self {
            fd: libc::STDERR_FILENO,
        }
    }

    #[inline]
    pub const fn stdout() -> Self {
        Self {
            fd: libc::STDOUT_FILENO,
        }
    }

    /// Writes to an arbitrary file descriptor.
    ///
    /// # Safety
    ///
    /// The descriptor must stay open for as long as the fault handler is
    /// enabled with this sink.
    #[inline]
    pub const unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Takes ownership of the file. The descriptor is never closed, as a signal
    /// could be delivered at any point, so it stays open until the process exits.
    #[inline]
    pub fn from_file(file: std::fs::File) -> Self {
        Self {
            fd: file.into_raw_fd(),
        }
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Checks that the descriptor is open, and was opened for writing
    pub fn validate(&self) -> io::Result<()> {
        // SAFETY: syscall, querying only
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }

        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "output is not open for writing",
            ));
        }

        Ok(())
    }

    /// Writes the entire buffer, retrying on `EINTR` and partial writes.
    ///
    /// This is safe to be called from within a compromised context.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            // SAFETY: syscall
            let written = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };

            if written < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                return Err(err);
            } else if written == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            buf = &buf[written as usize..];
        }

        Ok(())
    }
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::stderr()
    }
}

impl AsRawFd for OutputSink {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// The size of the buffer a [`Report`] formats into, everything in the report
/// header fits comfortably, and it is well below `PIPE_BUF` so that a single
/// flush to a pipe is atomic
const REPORT_BUF_SIZE: usize = 1024;

/// A fixed size buffer used to format a report without allocating.
///
/// The buffer lives on the (alternate) stack of the signal handler, and is
/// written to the [`OutputSink`] with a single `write` when flushed, or when it
/// is full.
pub struct Report<'sink> {
    sink: &'sink OutputSink,
    buf: [u8; REPORT_BUF_SIZE],
    len: usize,
    failed: bool,
}

impl<'sink> Report<'sink> {
    #[inline]
    pub fn new(sink: &'sink OutputSink) -> Self {
        Self {
            sink,
            buf: [0; REPORT_BUF_SIZE],
            len: 0,
            failed: false,
        }
    }

    pub fn push_bytes(&mut self, mut bytes: &[u8]) -> &mut Self {
        while !bytes.is_empty() {
            if self.len == self.buf.len() {
                let _ = self.flush();
            }

            let count = bytes.len().min(self.buf.len() - self.len);
            self.buf[self.len..self.len + count].copy_from_slice(&bytes[..count]);
            self.len += count;
            bytes = &bytes[count..];
        }

        self
    }

    #[inline]
    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_bytes(s.as_bytes())
    }

    #[inline]
    pub fn newline(&mut self) -> &mut Self {
        self.push_bytes(b"\n")
    }

    /// Appends the decimal representation of the number
    pub fn push_dec(&mut self, mut value: u64) -> &mut Self {
        let mut digits = [0u8; 20];
        let mut i = digits.len();

        loop {
            i -= 1;
            digits[i] = b'0' + (value % 10) as u8;
            value /= 10;

            if value == 0 {
                break;
            }
        }

        self.push_bytes(&digits[i..])
    }

    pub fn push_signed(&mut self, value: i64) -> &mut Self {
        if value < 0 {
            self.push_bytes(b"-");
        }

        self.push_dec(value.unsigned_abs())
    }

    /// Appends the number as `0x` prefixed, zero padded, lowercase hex, padded
    /// to the width of a pointer
    pub fn push_hex(&mut self, value: usize) -> &mut Self {
        const NIBBLES: usize = std::mem::size_of::<usize>() * 2;
        const HEX: &[u8; 16] = b"0123456789abcdef";

        let mut digits = [0u8; NIBBLES + 2];
        digits[0] = b'0';
        digits[1] = b'x';

        for (i, digit) in digits[2..].iter_mut().enumerate() {
            let shift = (NIBBLES - 1 - i) * 4;
            *digit = HEX[(value >> shift) & 0xf];
        }

        self.push_bytes(&digits)
    }

    /// Writes everything buffered so far to the sink.
    ///
    /// A failed write discards the buffered contents, there is nothing useful
    /// that can be done about it inside a signal handler.
    pub fn flush(&mut self) -> std::io::Result<()> {
        let res = self.sink.write_all(&self.buf[..self.len]);
        self.len = 0;

        if res.is_err() {
            self.failed = true;
        }

        res
    }

    /// True if any flush of this report failed
    #[inline]
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    #[inline]
    pub fn buffered(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
