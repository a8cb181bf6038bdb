// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Stream port I/O
//!
//! Low-level access to the stream port character device. Every message
//! the agent exchanges with the server goes through [`read_all`] and
//! [`write_all`], which retry short transfers and interrupted calls until
//! the whole buffer has been moved.
//!
//! The port descriptor is owned by the caller; nothing here opens or
//! closes it.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use thiserror::Error;

/// Errors raised by stream port I/O.
#[derive(Debug, Error)]
pub enum PortError {
    /// The peer closed the port before the requested length was read.
    ///
    /// Bytes received by the failing call are not handed out as a result.
    #[error("Stream port closed after {received} of {expected} bytes")]
    UnexpectedEof { expected: usize, received: usize },

    /// Reading from the port failed.
    #[error("Failed to read from the stream port: {0}")]
    Read(#[source] io::Error),

    /// Writing to the port failed.
    #[error("Failed to write to the stream port: {0}")]
    Write(#[source] io::Error),

    /// Waiting for the port to become readable failed.
    #[error("Failed to poll the stream port: {0}")]
    Poll(#[source] io::Error),
}

impl PortError {
    /// True when the peer went away rather than the device failing.
    pub fn is_eof(&self) -> bool {
        matches!(self, PortError::UnexpectedEof { .. })
    }
}

/// `Read`/`Write` over a borrowed raw descriptor.
struct FdPort<'fd>(BorrowedFd<'fd>);

impl Read for FdPort<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes and the
        // descriptor stays open for the lifetime of the borrow.
        let ret = unsafe {
            libc::read(
                self.0.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}

impl Write for FdPort<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for reads of `buf.len()` bytes and the
        // descriptor stays open for the lifetime of the borrow.
        let ret = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read exactly `buf.len()` bytes from the port.
pub fn read_all(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<(), PortError> {
    read_all_from(&mut FdPort(fd), buf)
}

/// Write all of `buf` to the port.
pub fn write_all(fd: BorrowedFd<'_>, buf: &[u8]) -> Result<(), PortError> {
    write_all_to(&mut FdPort(fd), buf)
}

/// Fill `buf` from `reader`, retrying short and interrupted reads.
///
/// A read returning zero before the buffer is full is reported as
/// [`PortError::UnexpectedEof`].
pub fn read_all_from<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<(), PortError> {
    let mut received = 0;
    while received < buf.len() {
        match reader.read(&mut buf[received..]) {
            Ok(0) => {
                return Err(PortError::UnexpectedEof {
                    expected: buf.len(),
                    received,
                })
            }
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PortError::Read(e)),
        }
    }
    Ok(())
}

/// Push all of `buf` into `writer`, retrying short and interrupted writes.
pub fn write_all_to<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> Result<(), PortError> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(PortError::Write(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("port accepted {written} of {} bytes", buf.len()),
                )))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PortError::Write(e)),
        }
    }
    Ok(())
}

/// Wait up to `timeout` for the port to have something to read.
///
/// Hang-up and error conditions count as readable so the next read
/// surfaces them.
pub fn poll_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool, PortError> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    loop {
        // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(PortError::Poll(err));
        }
        return Ok(ret > 0 && pfd.revents != 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    /// Reader handing out at most `chunk` bytes per call, interrupting
    /// every other call.
    struct ChunkedReader {
        inner: Cursor<Vec<u8>>,
        chunk: usize,
        calls: usize,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            let len = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..len])
        }
    }

    struct ChunkedWriter {
        data: Vec<u8>,
        chunk: usize,
        calls: usize,
    }

    impl Write for ChunkedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 3 == 0 {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            let len = buf.len().min(self.chunk);
            self.data.extend_from_slice(&buf[..len]);
            Ok(len)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct StuckWriter;

    impl Write for StuckWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::ConnectionReset))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::ConnectionReset))
        }
    }

    #[test]
    fn test_read_all_reassembles_chunks() {
        let payload: Vec<u8> = (0..=255u8).collect();
        for chunk in [1, 3, 7, 64, 1000] {
            let mut reader = ChunkedReader {
                inner: Cursor::new(payload.clone()),
                chunk,
                calls: 0,
            };
            let mut buf = vec![0u8; payload.len()];
            read_all_from(&mut reader, &mut buf).unwrap();
            assert_eq!(buf, payload, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_write_all_reassembles_chunks() {
        let payload: Vec<u8> = (0..200u8).rev().collect();
        for chunk in [1, 2, 5, 199, 4096] {
            let mut writer = ChunkedWriter {
                data: Vec::new(),
                chunk,
                calls: 0,
            };
            write_all_to(&mut writer, &payload).unwrap();
            assert_eq!(writer.data, payload, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_read_all_eof_after_prefix() {
        let mut reader = ChunkedReader {
            inner: Cursor::new(b"abc".to_vec()),
            chunk: 2,
            calls: 0,
        };
        let mut buf = [0u8; 5];
        match read_all_from(&mut reader, &mut buf) {
            Err(PortError::UnexpectedEof { expected, received }) => {
                assert_eq!(expected, 5);
                assert_eq!(received, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_read_all_empty_buffer() {
        let mut reader = BrokenReader;
        assert!(read_all_from(&mut reader, &mut []).is_ok());
    }

    #[test]
    fn test_read_all_os_error() {
        let mut buf = [0u8; 4];
        let err = read_all_from(&mut BrokenReader, &mut buf).unwrap_err();
        assert!(!err.is_eof());
        match err {
            PortError::Read(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_write_all_no_progress() {
        let err = write_all_to(&mut StuckWriter, b"data").unwrap_err();
        match err {
            PortError::Write(e) => assert_eq!(e.kind(), io::ErrorKind::WriteZero),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_write_all_os_error() {
        let err = write_all_to(&mut BrokenWriter, b"data").unwrap_err();
        assert!(!err.is_eof());
        match err {
            PortError::Write(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_fd_write_after_peer_closed() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);

        // The test harness ignores SIGPIPE, so the write fails with EPIPE.
        let err = write_all(a.as_fd(), b"brekeke").unwrap_err();
        assert!(!err.is_eof());
        match err {
            PortError::Write(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_fd_write_and_read() {
        let (a, b) = UnixStream::pair().unwrap();
        write_all(a.as_fd(), b"brekeke").unwrap();

        let mut buf = [0u8; 7];
        read_all(b.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf, b"brekeke");
    }

    #[test]
    fn test_poll_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        assert!(!poll_readable(b.as_fd(), Duration::ZERO).unwrap());

        write_all(a.as_fd(), b"x").unwrap();
        assert!(poll_readable(b.as_fd(), Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn test_poll_readable_after_hangup() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(poll_readable(b.as_fd(), Duration::from_millis(100)).unwrap());

        let mut buf = [0u8; 1];
        assert!(read_all(b.as_fd(), &mut buf).unwrap_err().is_eof());
    }
}
