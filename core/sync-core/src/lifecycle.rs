//! Subscription lifecycle: connect on entry, watch server pings, feed
//! changes into the graph, tear everything down on exit.
//!
//! The server pings every few seconds. If no ping arrives within the timeout
//! the socket is assumed dead and one reconnect is requested; nothing else is
//! retried here because the transport runs its own backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::decoder::{Change, ChangeDecoder};
use crate::error::SyncError;
use crate::reconcile::{Pending, Reconciler};
use crate::store::Store;
use crate::transport::{Transport, TransportEvent};

pub const PROJECT_QUERY_PARAM: &str = "projectId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    PingTimeout,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub connects_requested: u64,
    pub last_attempts: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub frames_handled: u64,
    pub frames_ignored: u64,
    pub frames_dropped: u64,
    pub ping_timeouts: u64,
}

pub struct Subscription {
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    decoder: ChangeDecoder,
    reconciler: Reconciler,
    ws_endpoint: String,
    ping_timeout: Duration,
    url: Option<String>,
    state: ConnectionState,
    ping_deadline: Option<Instant>,
    in_flight: Pending,
    stats: ConnectionStats,
}

impl Subscription {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn Store>, config: &SyncConfig) -> Self {
        Self {
            transport,
            decoder: ChangeDecoder::new(Arc::clone(&store)),
            reconciler: Reconciler::new(Arc::clone(&store), config),
            store,
            ws_endpoint: config.ws_endpoint.clone(),
            ping_timeout: config.ping_timeout(),
            url: None,
            state: ConnectionState::Disconnected,
            ping_deadline: None,
            in_flight: Pending::default(),
            stats: ConnectionStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Opens the subscription, scoped to `project_id` when one is selected.
    pub fn enter(&mut self, project_id: Option<&str>) {
        let url = subscribe_url(&self.ws_endpoint, project_id);
        info!(url = %url, "Subscribe connecting");
        self.url = Some(url);
        self.request_connect();
    }

    /// Closes the subscription and forgets every cached resource. Reconcile
    /// steps still in flight are cancelled first so none of them repopulates
    /// the emptied cache.
    pub fn exit(&mut self) {
        info!(in_flight = self.in_flight.len(), "Subscribe exit");
        self.transport.disconnect();
        self.ping_deadline = None;
        self.state = ConnectionState::Disconnected;
        self.in_flight.abort();
        self.store.reset();
    }

    /// Drives the controller until the event channel closes.
    pub async fn run(&mut self, events: &mut mpsc::Receiver<TransportEvent>) {
        loop {
            let deadline = self.ping_deadline;
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = sleep_until(deadline) => self.ping_timed_out(),
            }
        }
    }

    /// Waits until every reconcile step started so far has landed.
    pub async fn settle(&mut self) {
        std::mem::take(&mut self.in_flight).settled().await;
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { attempts, elapsed } => {
                info!("{}", connected_message(attempts, elapsed));
                self.state = ConnectionState::Connected;
                self.stats.last_attempts = attempts;
                self.stats.last_connected_at = Some(Utc::now());
                self.arm_ping_timer();
            }
            TransportEvent::Disconnected => {
                info!(attempts = self.stats.last_attempts, "Subscribe disconnected");
                self.state = ConnectionState::Disconnected;
            }
            TransportEvent::Message(raw) => self.handle_frame(&raw),
        }
    }

    pub fn handle_frame(&mut self, raw: &str) {
        let change = match self.decoder.decode(raw) {
            Ok(change) => change,
            Err(err) => {
                let code = err.code.clone();
                let err = SyncError::from(err);
                warn!(code = %code, error = %err, "Dropping frame");
                self.stats.frames_dropped += 1;
                return;
            }
        };

        match change {
            Change::Ping => {
                debug!("Subscribe ping");
                self.stats.last_ping_at = Some(Utc::now());
                self.arm_ping_timer();
            }
            Change::Resource(change) => {
                debug!(change = %change.label, "Resource change");
                self.stats.frames_handled += 1;
                self.in_flight.prune();
                self.in_flight.extend(self.reconciler.apply(&change));
            }
            Change::Ignored(name) => {
                debug!(name = %name, "Ignoring frame");
                self.stats.frames_ignored += 1;
            }
        }
    }

    fn arm_ping_timer(&mut self) {
        self.ping_deadline = Some(Instant::now() + self.ping_timeout);
    }

    fn ping_timed_out(&mut self) {
        let timeout_ms = self.ping_timeout.as_millis();
        warn!(timeout_ms = %timeout_ms, "Subscribe missed 2 pings; reconnecting");
        self.ping_deadline = None;
        self.stats.ping_timeouts += 1;
        self.state = ConnectionState::PingTimeout;
        self.request_connect();
    }

    fn request_connect(&mut self) {
        let Some(url) = self.url.as_deref() else {
            debug!("Connect requested before enter; ignoring");
            return;
        };
        if self.state != ConnectionState::PingTimeout {
            self.state = ConnectionState::Connecting;
        }
        self.stats.connects_requested += 1;
        self.transport.connect(url);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Subscription URL, with the project appended as a query parameter.
pub fn subscribe_url(endpoint: &str, project_id: Option<&str>) -> String {
    match project_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(project_id) => {
            let separator = if endpoint.contains('?') { '&' } else { '?' };
            format!(
                "{}{}{}={}",
                endpoint, separator, PROJECT_QUERY_PARAM, project_id
            )
        }
        None => endpoint.to_string(),
    }
}

pub fn connected_message(attempts: u32, elapsed: Duration) -> String {
    let mut message = "Subscribe connected".to_string();
    if attempts > 0 {
        message.push_str(&format!(
            " (after {} {}",
            attempts,
            if attempts == 1 { "try" } else { "tries" }
        ));
        if !elapsed.is_zero() {
            message.push_str(&format!(", {} sec", elapsed.as_secs_f64()));
        }
        message.push(')');
    }
    message
}
