use crate::market::endpoint::{connect_quote_stream, control_message};
use crate::market::quotes::QuoteTable;
use crate::market::types::{
    parse_stream_frame, ConnectionEvent, ConnectionState, ControlAction, QuoteStreamConfig,
    QuoteStreamStatusSnapshot, ReconnectPolicy, StreamFrame,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATUS_ERROR_THROTTLE_MS: u64 = 500;
const DECODE_WARN_THROTTLE_MS: u64 = 500;
const BACKOFF_MAX_EXPONENT: u32 = 6;
const BACKOFF_JITTER_MS: u64 = 250;

/// Called once per decoded frame, in arrival order, on the stream task, with the
/// quote table the frame was applied to and the receive time in unix ms. The
/// table is locked for the duration of the call.
pub type FrameHandler = Arc<dyn Fn(&StreamFrame, &QuoteTable, i64) + Send + Sync>;

/// Called after every published status change.
pub type StatusHandler = Arc<dyn Fn(&QuoteStreamStatusSnapshot) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub reconnect_policy: ReconnectPolicy,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
}

impl From<&QuoteStreamConfig> for ConnectionSettings {
    fn from(config: &QuoteStreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            reconnect_policy: config.reconnect_policy,
            reconnect_delay_ms: config.reconnect_delay_ms,
            max_reconnect_delay_ms: config.max_reconnect_delay_ms,
        }
    }
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<ConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

struct ManagerShared {
    settings: ConnectionSettings,
    status: RwLock<QuoteStreamStatusSnapshot>,
    quotes: Mutex<QuoteTable>,
    frame_handlers: Mutex<Vec<FrameHandler>>,
    status_handlers: Mutex<Vec<StatusHandler>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    status_throttle: Mutex<StatusPublishThrottle>,
    last_decode_warn: Mutex<Option<Instant>>,
}

struct StreamTask {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// Owns one logical streaming session: connect, receive, detect loss and
/// reconnect without caller involvement.
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
    task: Mutex<Option<StreamTask>>,
}

enum StreamDirective {
    Continue,
    PeerClosed,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> Self {
        let status = QuoteStreamStatusSnapshot::disconnected(
            settings.url.clone(),
            Some("stream idle".to_string()),
        );

        Self {
            shared: Arc::new(ManagerShared {
                settings,
                status: RwLock::new(status),
                quotes: Mutex::new(QuoteTable::default()),
                frame_handlers: Mutex::new(Vec::new()),
                status_handlers: Mutex::new(Vec::new()),
                outbound: Mutex::new(None),
                status_throttle: Mutex::new(StatusPublishThrottle::default()),
                last_decode_warn: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.shared.settings
    }

    /// Starts the stream task unless one is already running. Must be called
    /// from within a tokio runtime. Returns whether a new task was spawned.
    pub fn connect(&self) -> bool {
        let mut slot = self.task.lock();
        if let Some(task) = slot.as_ref() {
            if !task.join_handle.is_finished() {
                return false;
            }
        }

        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let shared = Arc::clone(&self.shared);
        let join_handle = tokio::spawn(async move {
            run_quote_stream(shared, task_token).await;
        });

        *slot = Some(StreamTask {
            cancellation_token,
            join_handle,
        });
        true
    }

    /// Cancels any pending reconnect, closes the socket and detaches every
    /// handler. Returns whether a task was running.
    pub async fn shutdown(&self) -> bool {
        let existing = self.task.lock().take();
        let stopped = if let Some(task) = existing {
            task.cancellation_token.cancel();
            let _ = task.join_handle.await;
            true
        } else {
            false
        };

        self.shared.frame_handlers.lock().clear();
        self.shared.status_handlers.lock().clear();
        stopped
    }

    pub fn on_message(&self, handler: FrameHandler) {
        self.shared.frame_handlers.lock().push(handler);
    }

    pub fn on_status(&self, handler: StatusHandler) {
        self.shared.status_handlers.lock().push(handler);
    }

    /// Sends a subscribe control frame. A silent no-op unless connected; nothing
    /// is queued for a later connection.
    pub fn subscribe(&self, symbols: &[String]) -> bool {
        self.send_control(ControlAction::Subscribe, symbols)
    }

    /// Same contract as [`ConnectionManager::subscribe`].
    pub fn unsubscribe(&self, symbols: &[String]) -> bool {
        self.send_control(ControlAction::Unsubscribe, symbols)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status.read().connected
    }

    pub fn last_update(&self) -> Option<i64> {
        self.shared.status.read().last_update_ms
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.read().state
    }

    pub fn status(&self) -> QuoteStreamStatusSnapshot {
        self.shared.status.read().clone()
    }

    pub fn with_quote_table<R>(&self, read: impl FnOnce(&QuoteTable) -> R) -> R {
        read(&self.shared.quotes.lock())
    }

    fn send_control(&self, action: ControlAction, symbols: &[String]) -> bool {
        if symbols.is_empty() || !self.is_connected() {
            debug!(?action, "control frame skipped while disconnected");
            return false;
        }

        let Some(sender) = self.shared.outbound.lock().clone() else {
            return false;
        };
        match control_message(action, symbols) {
            Ok(message) => sender.send(message).is_ok(),
            Err(error) => {
                warn!(?action, "failed to encode control frame: {error}");
                false
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancellation_token.cancel();
        }
    }
}

async fn run_quote_stream(shared: Arc<ManagerShared>, cancel_token: CancellationToken) {
    let mut reconnect_attempt = 0_u32;
    let mut next_event = ConnectionEvent::ConnectRequested;

    while !cancel_token.is_cancelled() {
        let reason = if reconnect_attempt == 0 {
            "opening websocket stream".to_string()
        } else {
            format!("reconnect attempt {reconnect_attempt}")
        };
        apply_event(&shared, next_event, Some(reason));

        let connected = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = connect_quote_stream(&shared.settings.url) => result,
        };

        let loss_reason = match connected {
            Ok(websocket_stream) => {
                reconnect_attempt = 0;
                let (mut sink, mut stream) = websocket_stream.split();
                let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
                *shared.outbound.lock() = Some(outbound_tx);

                info!(url = %shared.settings.url, "quote stream connected");
                apply_event(
                    &shared,
                    ConnectionEvent::Opened,
                    Some("websocket connected".to_string()),
                );

                let reason = loop {
                    tokio::select! {
                        _ = cancel_token.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            break "stream stopped".to_string();
                        }
                        Some(outgoing) = outbound_rx.recv() => {
                            if let Err(error) = sink.send(outgoing).await {
                                break format!("websocket send error: {error}");
                            }
                        }
                        next_message = stream.next() => match next_message {
                            Some(Ok(message)) => match handle_message(message, &shared) {
                                StreamDirective::Continue => {}
                                StreamDirective::PeerClosed => {
                                    apply_event(
                                        &shared,
                                        ConnectionEvent::CloseReceived,
                                        Some("server closed the stream".to_string()),
                                    );
                                }
                            },
                            Some(Err(error)) => break format!("websocket frame error: {error}"),
                            None => break "websocket stream ended".to_string(),
                        }
                    }
                };

                *shared.outbound.lock() = None;
                reason
            }
            Err(error) => format!("websocket connect error: {error}"),
        };

        if cancel_token.is_cancelled() {
            break;
        }

        publish_loss(&shared, loss_reason);

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(&shared.settings, reconnect_attempt);
        shared.status.write().reconnect_attempt = reconnect_attempt;
        apply_event(
            &shared,
            ConnectionEvent::RetryScheduled,
            Some(format!(
                "reconnecting in {} ms (attempt {reconnect_attempt})",
                delay.as_millis()
            )),
        );

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        next_event = ConnectionEvent::RetryDue;
    }

    *shared.outbound.lock() = None;
    let snapshot = {
        let mut writable = shared.status.write();
        writable.state = ConnectionState::Disconnected;
        writable.connected = false;
        writable.reason = Some("stream stopped".to_string());
        writable.clone()
    };
    info!(url = %shared.settings.url, "quote stream stopped");
    notify_status(&shared, &snapshot);
}

fn handle_message(message: Message, shared: &ManagerShared) -> StreamDirective {
    let mut payload = match message {
        Message::Text(text_payload) => text_payload.into_bytes(),
        Message::Binary(binary_payload) => binary_payload,
        Message::Close(_) => return StreamDirective::PeerClosed,
        _ => return StreamDirective::Continue,
    };

    let received_at_ms = now_unix_ms();
    {
        let mut writable = shared.status.write();
        writable.last_update_ms = Some(received_at_ms);
        writable.frames_received = writable.frames_received.saturating_add(1);
    }

    let decoded = parse_stream_frame(payload.as_mut_slice())
        .and_then(|frame| frame.quotes().map(|quotes| (frame, quotes)));
    let (frame, quotes) = match decoded {
        Ok(decoded) => decoded,
        Err(error) => {
            {
                let mut writable = shared.status.write();
                writable.frames_dropped = writable.frames_dropped.saturating_add(1);
            }
            if allow_decode_warning(shared) {
                warn!("dropping malformed frame: {error}");
            }
            return StreamDirective::Continue;
        }
    };

    let handlers = shared.frame_handlers.lock().clone();
    let mut table = shared.quotes.lock();
    if frame.kind.carries_quotes() {
        table.upsert_batch(quotes);
    }

    for handler in &handlers {
        handler(&frame, &table, received_at_ms);
    }

    StreamDirective::Continue
}

fn apply_event(shared: &ManagerShared, event: ConnectionEvent, reason: Option<String>) {
    if let Some(snapshot) = transition(shared, event, reason) {
        notify_status(shared, &snapshot);
    }
}

/// Handlers always see the `Disconnected` edge; only the repeated log line is
/// collapsed.
fn publish_loss(shared: &ManagerShared, reason: String) {
    if allow_status_publish(shared, ConnectionState::Disconnected, &reason) {
        warn!(url = %shared.settings.url, "quote stream lost: {reason}");
    }
    apply_event(shared, ConnectionEvent::Lost, Some(reason));
}

fn transition(
    shared: &ManagerShared,
    event: ConnectionEvent,
    reason: Option<String>,
) -> Option<QuoteStreamStatusSnapshot> {
    let mut writable = shared.status.write();
    let Some(next) = writable.state.on_event(event) else {
        debug!(state = writable.state.as_str(), ?event, "ignoring connection event");
        return None;
    };

    writable.state = next;
    writable.connected = next.is_connected();
    writable.reason = reason;
    Some(writable.clone())
}

fn notify_status(shared: &ManagerShared, snapshot: &QuoteStreamStatusSnapshot) {
    debug!(state = snapshot.state.as_str(), reason = ?snapshot.reason, "quote stream status");
    let handlers = shared.status_handlers.lock().clone();
    for handler in &handlers {
        handler(snapshot);
    }
}

/// Collapses identical state/reason log lines within the throttle window.
fn allow_status_publish(shared: &ManagerShared, state: ConnectionState, reason: &str) -> bool {
    let mut writable = shared.status_throttle.lock();
    let now = Instant::now();

    if writable.last_state == Some(state)
        && writable.last_reason.as_deref() == Some(reason)
        && writable
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
            })
            .unwrap_or(false)
    {
        return false;
    }

    writable.last_state = Some(state);
    writable.last_reason = Some(reason.to_string());
    writable.last_emit = Some(now);
    true
}

fn allow_decode_warning(shared: &ManagerShared) -> bool {
    let mut last_warn = shared.last_decode_warn.lock();
    let now = Instant::now();
    let throttled = last_warn
        .map(|instant| {
            now.duration_since(instant) < Duration::from_millis(DECODE_WARN_THROTTLE_MS)
        })
        .unwrap_or(false);
    if !throttled {
        *last_warn = Some(now);
    }
    !throttled
}

pub fn reconnect_delay(settings: &ConnectionSettings, attempt: u32) -> Duration {
    match settings.reconnect_policy {
        ReconnectPolicy::Fixed => Duration::from_millis(settings.reconnect_delay_ms),
        ReconnectPolicy::Exponential => {
            let exponent = attempt.saturating_sub(1).min(BACKOFF_MAX_EXPONENT);
            let base_ms = settings
                .reconnect_delay_ms
                .saturating_mul(1_u64 << exponent);
            let jitter_ms = now_unix_ms().unsigned_abs() % BACKOFF_JITTER_MS;
            Duration::from_millis(
                base_ms
                    .saturating_add(jitter_ms)
                    .min(settings.max_reconnect_delay_ms),
            )
        }
    }
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
