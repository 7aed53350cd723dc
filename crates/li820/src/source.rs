//! Byte sources and the instruments that open them

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open {address}: {source}")]
    Open {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Read error: {0}")]
    Io(#[from] io::Error),
    #[error("Source closed")]
    Closed,
}

/// Ordered, blocking, one-byte-at-a-time view of an instrument's output.
pub trait ByteSource: Send {
    /// Block until the next byte arrives.
    ///
    /// A finite source returns [`SourceError::Closed`] once exhausted.
    fn read_byte(&mut self) -> Result<u8, SourceError>;

    /// Release the underlying transport. Dropping the source does the same.
    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read_byte(&mut self) -> Result<u8, SourceError> {
        (**self).read_byte()
    }

    fn close(&mut self) -> Result<(), SourceError> {
        (**self).close()
    }
}

/// Something that can be opened into a [`ByteSource`] session.
pub trait Instrument: Send + 'static {
    type Source: ByteSource + 'static;

    /// Human readable address, used in logs and errors
    fn describe(&self) -> String;

    /// Acquire exclusive access to the instrument.
    fn open(&self) -> Result<Self::Source, SourceError>;
}

// ============ Reader-backed sources ============

/// Adapts any [`Read`] into a [`ByteSource`], one `read` call per byte.
///
/// No read-ahead is done, so bytes after a frame stay in the reader.
pub struct ReaderSource<R> {
    inner: R,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Send> ByteSource for ReaderSource<R> {
    fn read_byte(&mut self) -> Result<u8, SourceError> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Err(SourceError::Closed),
                Ok(_) => return Ok(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Instrument over a shared reader: every session continues the same stream,
/// the way a serial line keeps streaming between opens.
pub struct ReaderInstrument<R> {
    name: String,
    reader: Arc<Mutex<R>>,
    opened: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl<R: Read + Send + 'static> ReaderInstrument<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader: Arc::new(Mutex::new(reader)),
            opened: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total number of sessions opened so far
    pub fn sessions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Sessions currently open
    pub fn sessions_active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl<R> Clone for ReaderInstrument<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            reader: self.reader.clone(),
            opened: self.opened.clone(),
            active: self.active.clone(),
        }
    }
}

impl<R: Read + Send + 'static> Instrument for ReaderInstrument<R> {
    type Source = ReaderSource<SharedReader<R>>;

    fn describe(&self) -> String {
        self.name.clone()
    }

    fn open(&self) -> Result<Self::Source, SourceError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(ReaderSource::new(SharedReader {
            reader: self.reader.clone(),
            active: self.active.clone(),
        }))
    }
}

/// One session's handle on a [`ReaderInstrument`]'s reader.
pub struct SharedReader<R> {
    reader: Arc<Mutex<R>>,
    active: Arc<AtomicUsize>,
}

impl<R: Read> Read for SharedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read(buf)
    }
}

impl<R> Drop for SharedReader<R> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
