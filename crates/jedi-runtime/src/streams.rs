//! Shareable stdio handles returned by the process facade.
//!
//! Each handle is a cheap clone over one underlying stream, so repeated
//! accessor calls on a facade hand out the same stream instead of reopening.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use jedi_common::StdStream;
use parking_lot::Mutex;

/// Readable end of a child's stdout or stderr.
#[derive(Clone)]
pub struct ProcessReader {
    stream: StdStream,
    inner: Arc<Mutex<Box<dyn Read + Send>>>,
}

impl ProcessReader {
    pub(crate) fn new(stream: StdStream, reader: impl Read + Send + 'static) -> Self {
        Self {
            stream,
            inner: Arc::new(Mutex::new(Box::new(reader))),
        }
    }

    pub fn stream(&self) -> StdStream {
        self.stream
    }

    /// Read everything that remains into a string.
    pub fn read_all(&self) -> io::Result<String> {
        let mut out = String::new();
        self.inner.lock().read_to_string(&mut out)?;
        Ok(out)
    }

    /// True when both handles share the same underlying stream.
    pub fn same_stream(&self, other: &ProcessReader) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Read for ProcessReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().read(buf)
    }
}

impl fmt::Debug for ProcessReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessReader")
            .field("stream", &self.stream)
            .finish()
    }
}

/// Writable end of a child's stdin. [`ProcessWriter::close`] drops the
/// underlying stream so a piped child sees end-of-file.
#[derive(Clone)]
pub struct ProcessWriter {
    inner: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl ProcessWriter {
    pub(crate) fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
        }
    }

    pub fn close(&self) -> io::Result<()> {
        match self.inner.lock().take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    pub fn same_stream(&self, other: &ProcessWriter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stdin stream closed")
}

impl Write for ProcessWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.lock().as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(closed()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock().as_mut() {
            Some(writer) => writer.flush(),
            None => Err(closed()),
        }
    }
}

impl fmt::Debug for ProcessWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessWriter")
            .field("closed", &self.is_closed())
            .finish()
    }
}
