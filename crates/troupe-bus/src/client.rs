//! Bus client over a channel-oriented pub/sub transport.
//!
//! [`RedisBus`] keeps two independent connections, as the transport
//! demands: a [`ConnectionManager`] for publishes and commands, and a
//! dedicated pub/sub connection owned by a background subscriber task.
//! A subscriber connection cannot issue unrelated commands, so `PING`
//! probes and publishes always go through the manager.
//!
//! # Reconnection
//!
//! The subscriber task reconnects forever on a `min(50·n, 2000)` ms
//! schedule and re-establishes the full channel set after every
//! reconnect. Publishes retry transient errors with exponential backoff
//! capped at two seconds before surfacing the failure to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use troupe_types::config::BusSettings;
use troupe_types::envelope::Envelope;

/// Cap on the reconnect delay schedule.
const RECONNECT_CEILING: Duration = Duration::from_millis(2000);

/// Per-attempt increment of the reconnect delay schedule.
const RECONNECT_STEP_MS: u64 = 50;

/// How many times a publish is attempted before the error surfaces.
const PUBLISH_ATTEMPTS: u32 = 4;

/// Cap on the publish retry backoff.
const PUBLISH_BACKOFF_CEILING: Duration = Duration::from_secs(2);

/// An inbound-envelope handler.
///
/// Handlers are spawned onto the runtime per envelope; they must not
/// assume they run on the subscriber task.
pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |envelope| Box::pin(f(envelope)))
}

/// Errors from bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The transport rejected or lost the operation.
    #[error("bus transport error: {0}")]
    Transport(String),

    /// An envelope could not be serialized for the wire.
    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The client has been closed.
    #[error("bus client closed")]
    Closed,
}

/// Agent-agnostic transport over a channel-oriented pub/sub service.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Serialize `envelope` and emit it on `channel`.
    ///
    /// Returns once the transport has accepted the message or a terminal
    /// error occurred; transient errors are retried with backoff first.
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), BusError>;

    /// Register `handler` for every inbound envelope on `channel`.
    ///
    /// Malformed payloads are reported to the error log and discarded
    /// before any handler runs.
    async fn subscribe(&self, channel: &str, handler: Handler) -> Result<(), BusError>;

    /// Round-trip liveness probe.
    async fn ping(&self) -> Result<Duration, BusError>;

    /// Release all connections.
    async fn close(&self);

    /// Whether the subscriber connection is currently established.
    fn is_connected(&self) -> bool;
}

type HandlerRegistry = Arc<Mutex<HashMap<String, Vec<Handler>>>>;

/// Redis-backed [`Bus`] implementation.
pub struct RedisBus {
    manager: ConnectionManager,
    registry: HandlerRegistry,
    control_tx: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl RedisBus {
    /// Connect both the publish and the subscriber connections.
    ///
    /// Fails fast when the transport is unreachable or the credentials
    /// are rejected; the subscriber task then maintains its connection
    /// independently for the life of the client.
    pub async fn connect(settings: &BusSettings) -> Result<Self, BusError> {
        use redis::IntoConnectionInfo;

        let mut info = settings
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| BusError::Transport(e.to_string()))?;
        if let Some(password) = &settings.password {
            let redis_settings = info.redis_settings().clone().set_password(password);
            info = info.set_redis_settings(redis_settings);
        }

        let client = redis::Client::open(info).map_err(|e| BusError::Transport(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        info!(url = %settings.url, "bus publish connection established");

        let registry: HandlerRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(subscriber_loop(
            client,
            registry.clone(),
            control_rx,
            connected.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            manager,
            registry,
            control_tx,
            connected,
            cancel,
            subscriber: Mutex::new(Some(task)),
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), BusError> {
        let wire = envelope.to_wire()?;
        let mut conn = self.manager.clone();
        let mut delay = Duration::from_millis(100);

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match conn.publish::<_, _, i64>(channel, &wire).await {
                Ok(receivers) => {
                    debug!(channel, receivers, id = %envelope.id, "published envelope");
                    return Ok(());
                }
                Err(e) if attempt < PUBLISH_ATTEMPTS => {
                    warn!(
                        channel,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(PUBLISH_BACKOFF_CEILING);
                }
                Err(e) => return Err(BusError::Transport(e.to_string())),
            }
        }
        Err(BusError::Transport("publish retries exhausted".into()))
    }

    async fn subscribe(&self, channel: &str, handler: Handler) -> Result<(), BusError> {
        let is_new = {
            let mut registry = self.registry.lock().await;
            let handlers = registry.entry(channel.to_string()).or_default();
            handlers.push(handler);
            handlers.len() == 1
        };
        if is_new {
            self.control_tx
                .send(channel.to_string())
                .map_err(|_| BusError::Closed)?;
        }
        debug!(channel, "handler registered");
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, BusError> {
        let mut conn = self.manager.clone();
        let start = Instant::now();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(start.elapsed())
    }

    async fn close(&self) {
        info!("bus client closing");
        self.cancel.cancel();
        if let Some(task) = self.subscriber.lock().await.take() {
            let _ = task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// `min(50·n, 2000)` ms.
fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_millis((RECONNECT_STEP_MS * u64::from(attempt)).min(RECONNECT_CEILING.as_millis() as u64))
}

enum SubscriberStep {
    Inbound(Option<redis::Msg>),
    Control(Option<String>),
    Stop,
}

/// Owns the dedicated pub/sub connection.
///
/// The outer loop (re)connects and re-establishes the channel set; the
/// inner loop multiplexes inbound messages with subscription requests
/// arriving over the control channel.
async fn subscriber_loop(
    client: redis::Client,
    registry: HandlerRegistry,
    mut control_rx: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    'reconnect: loop {
        if cancel.is_cancelled() {
            break;
        }

        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                attempt += 1;
                let delay = reconnect_delay(attempt);
                warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "bus subscriber connect failed, reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break 'reconnect,
                    _ = tokio::time::sleep(delay) => continue 'reconnect,
                }
            }
        };

        // Re-establish subscription state after every (re)connect.
        let channels: Vec<String> = registry.lock().await.keys().cloned().collect();
        for channel in &channels {
            if let Err(e) = pubsub.subscribe(channel).await {
                warn!(channel, error = %e, "resubscribe failed, reconnecting");
                attempt += 1;
                tokio::time::sleep(reconnect_delay(attempt)).await;
                continue 'reconnect;
            }
        }

        attempt = 0;
        connected.store(true, Ordering::SeqCst);
        info!(channels = channels.len(), "bus subscriber ready");

        loop {
            let step = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    _ = cancel.cancelled() => SubscriberStep::Stop,
                    channel = control_rx.recv() => SubscriberStep::Control(channel),
                    msg = stream.next() => SubscriberStep::Inbound(msg),
                }
            };

            match step {
                SubscriberStep::Stop => break 'reconnect,
                SubscriberStep::Control(Some(channel)) => {
                    if let Err(e) = pubsub.subscribe(&channel).await {
                        warn!(channel, error = %e, "subscribe failed, reconnecting");
                        continue 'reconnect;
                    }
                    debug!(channel, "subscribed");
                }
                SubscriberStep::Control(None) => break 'reconnect,
                SubscriberStep::Inbound(Some(msg)) => dispatch(&registry, msg).await,
                SubscriberStep::Inbound(None) => {
                    connected.store(false, Ordering::SeqCst);
                    attempt += 1;
                    let delay = reconnect_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "bus subscriber connection lost, reconnecting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break 'reconnect,
                        _ = tokio::time::sleep(delay) => continue 'reconnect,
                    }
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    info!("bus subscriber stopped");
}

/// Parse an inbound message and fan it out to the channel's handlers.
///
/// Handlers are spawned so a slow consumer never blocks the subscriber
/// connection.
async fn dispatch(registry: &HandlerRegistry, msg: redis::Msg) {
    let channel = msg.get_channel_name().to_string();
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            error!(channel, error = %e, "non-string payload discarded");
            return;
        }
    };

    let envelope = match Envelope::from_wire(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(channel, error = %e, "malformed envelope discarded");
            return;
        }
    };

    let handlers: Vec<Handler> = registry
        .lock()
        .await
        .get(&channel)
        .cloned()
        .unwrap_or_default();

    debug!(channel, id = %envelope.id, handlers = handlers.len(), "dispatching envelope");
    for h in handlers {
        let envelope = envelope.clone();
        tokio::spawn(async move { h(envelope).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_schedule_ramps_and_caps() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(50));
        assert_eq!(reconnect_delay(10), Duration::from_millis(500));
        assert_eq!(reconnect_delay(40), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(400), Duration::from_millis(2000));
    }

    #[test]
    fn handler_wraps_async_closure() {
        let h = handler(|_envelope| async {});
        // The wrapper must be callable and Send + Sync.
        fn assert_send_sync<T: Send + Sync>(_: &T) {}
        assert_send_sync(&h);
    }

    #[test]
    fn bus_error_display() {
        let err = BusError::Transport("connection refused".into());
        assert_eq!(err.to_string(), "bus transport error: connection refused");
        assert_eq!(BusError::Closed.to_string(), "bus client closed");
    }
}
