//! The persistent connection, as seen by the subscription controller.
//!
//! Socket implementations own reconnect/backoff. They report what happened by
//! sending [`TransportEvent`]s into the controller's channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// `attempts` is how many tries it took; `elapsed` how long they took.
    Connected { attempts: u32, elapsed: Duration },
    Disconnected,
    Message(String),
}

pub trait Transport: Send + Sync {
    /// Opens (or reopens) the connection. Calling it while a connect is
    /// already in progress must be harmless.
    fn connect(&self, url: &str);

    fn disconnect(&self);
}

/// Transport whose events are pushed by hand. It only records the calls it
/// receives, which is all replays and tests need.
#[derive(Debug, Default)]
pub struct ManualTransport {
    urls: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
}

impl ManualTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.urls.lock().len()
    }

    pub fn last_url(&self) -> Option<String> {
        self.urls.lock().last().cloned()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl Transport for ManualTransport {
    fn connect(&self, url: &str) {
        self.urls.lock().push(url.to_string());
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
