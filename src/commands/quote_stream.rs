use crate::error::AppError;
use crate::market::session::QuoteAlertSession;
use crate::market::types::{
    resolve_stream_url, QuoteStreamSession, QuoteStreamStatusSnapshot, QuoteStreamStopResult,
    StartQuoteStreamArgs,
};
use crate::state::{AppState, QuoteStreamHandle};
use std::sync::Arc;
use tracing::info;

pub async fn start_quote_stream(
    state: &AppState,
    args: Option<StartQuoteStreamArgs>,
) -> Result<QuoteStreamSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut stream_slot = state.quote_stream.lock().await;
        stream_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.session.stop().await;
    }

    state.alert_controls.set_threshold(config.alert_threshold)?;
    state.alert_controls.set_audio_enabled(config.audio_enabled);

    let session = Arc::new(QuoteAlertSession::new(
        &config,
        Arc::clone(&state.alert_controls),
        Arc::clone(&state.audio),
        state.events.clone(),
    ));
    session.start();
    info!(url = %config.url, symbols = config.symbols.len(), "quote stream started");

    {
        let mut stream_slot = state.quote_stream.lock().await;
        *stream_slot = Some(QuoteStreamHandle { session });
    }

    Ok(QuoteStreamSession::from_config(&config))
}

pub async fn stop_quote_stream(state: &AppState) -> Result<QuoteStreamStopResult, AppError> {
    let existing_handle = {
        let mut stream_slot = state.quote_stream.lock().await;
        stream_slot.take()
    };

    let stopped = match existing_handle {
        Some(handle) => handle.session.stop().await,
        None => false,
    };

    Ok(QuoteStreamStopResult { stopped })
}

pub async fn quote_stream_status(state: &AppState) -> Result<QuoteStreamStatusSnapshot, AppError> {
    let snapshot = match state.current_session().await {
        Some(session) => session.status(),
        None => QuoteStreamStatusSnapshot::disconnected(
            resolve_stream_url(),
            Some("stream idle".to_string()),
        ),
    };
    Ok(snapshot)
}

pub async fn watch_symbols_set(
    state: &AppState,
    symbols: Vec<String>,
) -> Result<Vec<String>, AppError> {
    let session = state
        .current_session()
        .await
        .ok_or(AppError::StreamNotRunning)?;
    session.set_watch_set(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioCue, BufferSink, ToneSynthesizer};
    use crate::market::types::ConnectionState;

    fn app_state() -> AppState {
        let audio: Arc<dyn AudioCue> = Arc::new(ToneSynthesizer::new(BufferSink::default()));
        AppState::new(audio).expect("state should initialize")
    }

    #[tokio::test]
    async fn status_is_idle_before_start() {
        let state = app_state();
        let status = quote_stream_status(&state).await.expect("status is infallible");
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.connected);
    }

    #[tokio::test]
    async fn stop_without_stream_reports_nothing_stopped() {
        let state = app_state();
        let result = stop_quote_stream(&state).await.expect("stop is infallible");
        assert!(!result.stopped);
    }

    #[tokio::test]
    async fn watch_symbols_require_a_running_stream() {
        let state = app_state();
        let result = watch_symbols_set(&state, vec!["AAPL".to_string()]).await;
        assert!(matches!(result, Err(AppError::StreamNotRunning)));
    }

    #[tokio::test]
    async fn start_applies_settings_and_stop_tears_down() {
        let state = app_state();
        let session = start_quote_stream(
            &state,
            Some(StartQuoteStreamArgs {
                url: Some("ws://127.0.0.1:9/ws".to_string()),
                symbols: Some(vec!["aapl".to_string()]),
                reconnect_delay_ms: Some(50),
                alert_threshold: Some(3.5),
                audio_enabled: Some(false),
                ..Default::default()
            }),
        )
        .await
        .expect("stream should start");

        assert!(session.running);
        assert_eq!(session.symbols, vec!["AAPL".to_string()]);
        assert_eq!(state.alert_controls.threshold(), 3.5);
        assert!(!state.alert_controls.audio_enabled());

        let result = stop_quote_stream(&state).await.expect("stop should succeed");
        assert!(result.stopped);
        assert!(state.current_session().await.is_none());
    }
}
