//! In-process bus with the transport's delivery semantics.
//!
//! [`InMemoryBus`] mirrors the real transport closely enough for
//! integration tests: envelopes round-trip through their wire form (so
//! malformed payloads are exercised), per-channel delivery order is
//! preserved by a dedicated dispatcher task per channel, and handlers
//! never run on the publisher's call stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::error;

use troupe_types::envelope::Envelope;

use crate::client::{Bus, BusError, Handler};

struct ChannelState {
    tx: mpsc::UnboundedSender<String>,
    handlers: Arc<Mutex<Vec<Handler>>>,
}

/// An in-process [`Bus`] for tests.
#[derive(Default)]
pub struct InMemoryBus {
    channels: Mutex<HashMap<String, ChannelState>>,
    closed: AtomicBool,
}

impl InMemoryBus {
    /// Fresh bus with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    async fn channel_state(&self, channel: &str) -> (mpsc::UnboundedSender<String>, Arc<Mutex<Vec<Handler>>>) {
        let mut channels = self.channels.lock().await;
        let state = channels.entry(channel.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let handlers: Arc<Mutex<Vec<Handler>>> = Arc::new(Mutex::new(Vec::new()));
            tokio::spawn(dispatch_loop(channel.to_string(), rx, handlers.clone()));
            ChannelState { tx, handlers }
        });
        (state.tx.clone(), state.handlers.clone())
    }
}

/// Per-channel dispatcher: awaits each handler in turn so the observed
/// invocation order matches publish order.
async fn dispatch_loop(
    channel: String,
    mut rx: mpsc::UnboundedReceiver<String>,
    handlers: Arc<Mutex<Vec<Handler>>>,
) {
    while let Some(wire) = rx.recv().await {
        let envelope = match Envelope::from_wire(&wire) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(channel = %channel, error = %e, "malformed envelope discarded");
                continue;
            }
        };
        let snapshot: Vec<Handler> = handlers.lock().await.clone();
        for h in snapshot {
            h(envelope.clone()).await;
        }
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let wire = envelope.to_wire()?;
        let (tx, _) = self.channel_state(channel).await;
        tx.send(wire).map_err(|_| BusError::Closed)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Handler) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let (_, handlers) = self.channel_state(channel).await;
        handlers.lock().await.push(handler);
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(Duration::from_micros(50))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channels.lock().await.clear();
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}
