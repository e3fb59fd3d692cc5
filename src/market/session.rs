use crate::audio::AudioCue;
use crate::error::AppError;
use crate::market::alerts::{AlertControls, AlertEngine};
use crate::market::pipeline::{ConnectionManager, ConnectionSettings};
use crate::market::quotes::QuoteTable;
use crate::market::types::{
    normalize_symbols, Alert, ConnectionState, QuoteStreamConfig, QuoteStreamStatusSnapshot,
    StreamFrame,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::debug;

pub const SESSION_EVENT_CAPACITY: usize = 256;

/// Fan-out to display collaborators. Slow receivers lag and lose events; the
/// stream task never waits on them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Status(QuoteStreamStatusSnapshot),
    Frame(StreamFrame),
    Alerts(Vec<Alert>),
}

/// Wires the connection manager to the alert engine for one viewer.
pub struct QuoteAlertSession {
    manager: Arc<ConnectionManager>,
    engine: Arc<Mutex<AlertEngine>>,
    controls: Arc<AlertControls>,
    watch_set: Arc<RwLock<Vec<String>>>,
}

impl QuoteAlertSession {
    pub fn new(
        config: &QuoteStreamConfig,
        controls: Arc<AlertControls>,
        audio: Arc<dyn AudioCue>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let manager = Arc::new(ConnectionManager::new(ConnectionSettings::from(config)));
        let engine = Arc::new(Mutex::new(AlertEngine::default()));
        let watch_set = Arc::new(RwLock::new(config.symbols.clone()));

        {
            let engine = Arc::clone(&engine);
            let controls = Arc::clone(&controls);
            let watch_set = Arc::clone(&watch_set);
            let events = events.clone();
            manager.on_message(Arc::new(
                move |frame: &StreamFrame, quotes: &QuoteTable, received_at_ms: i64| {
                    let _ = events.send(SessionEvent::Frame(frame.clone()));
                    if !frame.kind.carries_quotes() {
                        return;
                    }

                    let watched = watch_set.read().clone();
                    let emitted = engine.lock().run_pass(
                        quotes,
                        &watched,
                        &controls,
                        audio.as_ref(),
                        received_at_ms,
                    );
                    if !emitted.is_empty() {
                        let _ = events.send(SessionEvent::Alerts(emitted));
                    }
                },
            ));
        }

        {
            let weak_manager: Weak<ConnectionManager> = Arc::downgrade(&manager);
            let watch_set = Arc::clone(&watch_set);
            manager.on_status(Arc::new(move |snapshot: &QuoteStreamStatusSnapshot| {
                let _ = events.send(SessionEvent::Status(snapshot.clone()));
                if snapshot.state != ConnectionState::Connected {
                    return;
                }

                // Subscriptions do not survive a reconnect; replay the watch-set.
                let watched = watch_set.read().clone();
                if let Some(manager) = weak_manager.upgrade() {
                    if manager.subscribe(&watched) {
                        debug!(count = watched.len(), "watch-set subscribed");
                    }
                }
            }));
        }

        Self {
            manager,
            engine,
            controls,
            watch_set,
        }
    }

    pub fn start(&self) -> bool {
        self.manager.connect()
    }

    pub async fn stop(&self) -> bool {
        self.manager.shutdown().await
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn controls(&self) -> &Arc<AlertControls> {
        &self.controls
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn last_update(&self) -> Option<i64> {
        self.manager.last_update()
    }

    pub fn status(&self) -> QuoteStreamStatusSnapshot {
        self.manager.status()
    }

    pub fn watch_set(&self) -> Vec<String> {
        self.watch_set.read().clone()
    }

    /// Replaces the watch-set and, when connected, sends the difference as
    /// unsubscribe/subscribe control frames.
    pub fn set_watch_set<I, S>(&self, symbols: I) -> Result<Vec<String>, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next = normalize_symbols(symbols)?;
        let previous = std::mem::replace(&mut *self.watch_set.write(), next.clone());

        let removed: Vec<String> = previous
            .iter()
            .filter(|symbol| !next.contains(symbol))
            .cloned()
            .collect();
        let added: Vec<String> = next
            .iter()
            .filter(|symbol| !previous.contains(symbol))
            .cloned()
            .collect();

        self.manager.unsubscribe(&removed);
        self.manager.subscribe(&added);
        Ok(next)
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.engine.lock().feed().list()
    }

    pub fn unread_count(&self) -> usize {
        self.engine.lock().feed().unread_count()
    }

    pub fn dismiss_alert(&self, id: &str) -> bool {
        self.engine.lock().feed_mut().dismiss(id)
    }

    pub fn clear_alerts(&self) -> usize {
        self.engine.lock().feed_mut().clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{BufferSink, ToneSynthesizer};
    use crate::market::types::StartQuoteStreamArgs;

    fn session_for(symbols: Vec<&str>) -> (QuoteAlertSession, broadcast::Receiver<SessionEvent>) {
        let config = StartQuoteStreamArgs {
            url: Some("ws://127.0.0.1:1/ws".to_string()),
            symbols: Some(symbols.into_iter().map(str::to_string).collect()),
            ..Default::default()
        }
        .normalize()
        .expect("config should be valid");
        let controls = Arc::new(
            AlertControls::new(config.alert_threshold, config.audio_enabled)
                .expect("controls should be valid"),
        );
        let (events, receiver) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let audio: Arc<dyn AudioCue> = Arc::new(ToneSynthesizer::new(BufferSink::default()));
        (QuoteAlertSession::new(&config, controls, audio, events), receiver)
    }

    #[test]
    fn watch_set_updates_while_disconnected_only_change_local_state() {
        let (session, _events) = session_for(vec!["AAPL"]);
        let next = session
            .set_watch_set(["msft", "AAPL", "msft"])
            .expect("watch-set should normalize");

        assert_eq!(next, vec!["MSFT".to_string(), "AAPL".to_string()]);
        assert_eq!(session.watch_set(), next);
        assert!(!session.is_connected());
    }

    #[test]
    fn rejects_invalid_watch_set_without_mutation() {
        let (session, _events) = session_for(vec!["AAPL"]);
        assert!(session.set_watch_set(["not a symbol"]).is_err());
        assert_eq!(session.watch_set(), vec!["AAPL".to_string()]);
    }

    #[test]
    fn alert_feed_starts_empty() {
        let (session, _events) = session_for(vec![]);
        assert!(session.alerts().is_empty());
        assert_eq!(session.unread_count(), 0);
        assert!(!session.dismiss_alert("AAPL-1"));
        assert_eq!(session.clear_alerts(), 0);
    }
}
