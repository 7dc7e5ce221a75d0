//! Scripted in-memory port used by the integration tests.
//!
//! A `MockPort` stands in for the OS serial port; the paired `MockHandle`
//! stays on the test side to feed incoming bytes, inject read errors and
//! inspect what the transport did to the port.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{RawPort, Result, SerialError};

pub struct MockPort {
    path: String,
    opened: bool,
    readable: bool,
    fail_open: Option<String>,
    fail_writes: bool,
    script: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    open_calls: Arc<AtomicUsize>,
    close_calls: Arc<AtomicUsize>,
    drain_calls: Arc<AtomicUsize>,
}

/// Test-side controls for one `MockPort`.
pub struct MockHandle {
    feed: Option<mpsc::UnboundedSender<Result<Vec<u8>>>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    open_calls: Arc<AtomicUsize>,
    close_calls: Arc<AtomicUsize>,
    drain_calls: Arc<AtomicUsize>,
}

impl MockPort {
    pub fn new(path: impl Into<String>) -> (Self, MockHandle) {
        let (feed, script) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let open_calls = Arc::new(AtomicUsize::new(0));
        let close_calls = Arc::new(AtomicUsize::new(0));
        let drain_calls = Arc::new(AtomicUsize::new(0));

        let port = Self {
            path: path.into(),
            opened: false,
            readable: true,
            fail_open: None,
            fail_writes: false,
            script,
            written: written.clone(),
            open_calls: open_calls.clone(),
            close_calls: close_calls.clone(),
            drain_calls: drain_calls.clone(),
        };
        let handle = MockHandle {
            feed: Some(feed),
            written,
            open_calls,
            close_calls,
            drain_calls,
        };

        (port, handle)
    }

    /// Make the next `open` fail with a connection error.
    pub fn fail_open_with(&mut self, message: &str) {
        self.fail_open = Some(message.to_string());
    }

    /// Control whether the port reports itself readable once open.
    pub fn set_readable(&mut self, readable: bool) {
        self.readable = readable;
    }

    /// Make every write fail with a broken pipe.
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }
}

#[async_trait]
impl RawPort for MockPort {
    fn path(&self) -> &str {
        &self.path
    }

    async fn open(&mut self) -> Result<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_open {
            return Err(SerialError::ConnectionFailed(message.clone()));
        }
        if self.opened {
            return Err(SerialError::AlreadyOpen);
        }
        self.opened = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.opened = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    fn is_readable(&self) -> bool {
        self.opened && self.readable
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.opened {
            return Err(not_open());
        }
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure").into());
        }
        self.written.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        self.drain_calls.fetch_add(1, Ordering::SeqCst);
        if !self.opened {
            return Err(not_open());
        }
        Ok(())
    }

    async fn read_chunk(&mut self, timeout_ms: u64) -> Result<Option<Vec<u8>>> {
        if !self.opened {
            return Err(not_open());
        }
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.script.recv()).await {
            Ok(Some(Ok(bytes))) => Ok(Some(bytes)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
            Err(_) => Err(SerialError::Timeout),
        }
    }
}

fn not_open() -> SerialError {
    SerialError::ConnectionFailed("port is not open".to_string())
}

impl MockHandle {
    /// Queue incoming bytes for the next read.
    pub fn feed_bytes(&self, bytes: &[u8]) {
        if let Some(feed) = &self.feed {
            let _ = feed.send(Ok(bytes.to_vec()));
        }
    }

    /// Queue a read error.
    pub fn feed_error(&self, error: SerialError) {
        if let Some(feed) = &self.feed {
            let _ = feed.send(Err(error));
        }
    }

    /// End the incoming stream; subsequent reads see end-of-stream.
    pub fn end(&mut self) {
        self.feed = None;
    }

    /// Every buffer the transport wrote, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn drain_calls(&self) -> usize {
        self.drain_calls.load(Ordering::SeqCst)
    }
}
