use crate::audio::AudioCue;
use crate::error::AppError;
use crate::market::alerts::AlertControls;
use crate::market::session::{QuoteAlertSession, SessionEvent, SESSION_EVENT_CAPACITY};
use crate::market::types::{DEFAULT_ALERT_THRESHOLD, DEFAULT_AUDIO_ENABLED};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};

pub struct QuoteStreamHandle {
    pub session: Arc<QuoteAlertSession>,
}

pub struct AppState {
    pub started_at: Instant,
    pub audio: Arc<dyn AudioCue>,
    pub alert_controls: Arc<AlertControls>,
    pub events: broadcast::Sender<SessionEvent>,
    pub quote_stream: Mutex<Option<QuoteStreamHandle>>,
}

impl AppState {
    pub fn new(audio: Arc<dyn AudioCue>) -> Result<Self, AppError> {
        let alert_controls = Arc::new(AlertControls::new(
            DEFAULT_ALERT_THRESHOLD,
            DEFAULT_AUDIO_ENABLED,
        )?);
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        Ok(Self {
            started_at: Instant::now(),
            audio,
            alert_controls,
            events,
            quote_stream: Mutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn current_session(&self) -> Option<Arc<QuoteAlertSession>> {
        self.quote_stream
            .lock()
            .await
            .as_ref()
            .map(|handle| Arc::clone(&handle.session))
    }
}
