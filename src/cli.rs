//! Command-line entry for running the quote alert desk against a stream.
use crate::audio::{AudioCue, TerminalBellSink, ToneSynthesizer};
use crate::commands::alerts::alerts_list;
use crate::commands::health::health;
use crate::commands::quote_stream::{start_quote_stream, stop_quote_stream};
use crate::error::AppError;
use crate::market::session::SessionEvent;
use crate::market::types::{ReconnectPolicy, StartQuoteStreamArgs};
use crate::state::AppState;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Streams quotes and raises audible price alerts")]
pub struct Cli {
    /// Quote stream endpoint. Falls back to QUOTE_STREAM_URL, then the local default.
    #[arg(long)]
    pub url: Option<String>,

    /// Symbols to watch, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Percent move that raises an alert.
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Disable audio cues.
    #[arg(long)]
    pub no_audio: bool,

    /// Delay before reconnecting after a lost connection.
    #[arg(long)]
    pub reconnect_delay_ms: Option<u64>,

    /// Upper bound for exponential backoff.
    #[arg(long)]
    pub max_reconnect_delay_ms: Option<u64>,

    #[arg(long, value_enum)]
    pub backoff: Option<ReconnectPolicy>,
}

impl Cli {
    pub fn into_args(self) -> StartQuoteStreamArgs {
        StartQuoteStreamArgs {
            url: self.url,
            symbols: Some(self.symbols),
            reconnect_policy: self.backoff,
            reconnect_delay_ms: self.reconnect_delay_ms,
            max_reconnect_delay_ms: self.max_reconnect_delay_ms,
            alert_threshold: self.threshold,
            audio_enabled: self.no_audio.then_some(false),
        }
    }
}

pub async fn run_cli(cli: Cli) -> Result<(), AppError> {
    let audio: Arc<dyn AudioCue> = Arc::new(ToneSynthesizer::new(TerminalBellSink));
    let state = AppState::new(audio)?;
    let mut events = state.subscribe_events();

    let session = start_quote_stream(&state, Some(cli.into_args())).await?;
    info!(
        url = %session.url,
        symbols = ?session.symbols,
        threshold = session.alert_threshold,
        "watching quotes"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Alerts(alerts)) => {
                    for alert in alerts {
                        info!(
                            symbol = %alert.symbol,
                            severity = ?alert.severity,
                            "{}",
                            alert.message
                        );
                    }
                }
                Ok(SessionEvent::Status(status)) => {
                    info!(
                        state = status.state.as_str(),
                        attempt = status.reconnect_attempt,
                        reason = status.reason.as_deref().unwrap_or(""),
                        "stream status"
                    );
                }
                Ok(SessionEvent::Frame(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event receiver lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    let report = health(&state).await?;
    let raised = alerts_list(&state).await?;
    info!(
        uptime_ms = report.uptime_ms as u64,
        connection = report.connection.as_str(),
        alerts = raised.len(),
        "stopping quote stream"
    );

    stop_quote_stream(&state).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_into_start_args() {
        let cli = Cli::try_parse_from([
            "quote-alert-desk",
            "--url",
            "ws://127.0.0.1:9000/ws",
            "--symbols",
            "aapl,msft",
            "--threshold",
            "1.5",
            "--no-audio",
            "--backoff",
            "exponential",
        ])
        .expect("flags should parse");

        let config = cli.into_args().normalize().expect("args should normalize");
        assert_eq!(config.url, "ws://127.0.0.1:9000/ws");
        assert_eq!(config.symbols, vec!["AAPL".to_string(), "MSFT".to_string()]);
        assert_eq!(config.alert_threshold, 1.5);
        assert!(!config.audio_enabled);
        assert_eq!(config.reconnect_policy, ReconnectPolicy::Exponential);
    }

    #[test]
    fn audio_stays_enabled_without_flag() {
        let cli = Cli::try_parse_from(["quote-alert-desk"]).expect("no flags should parse");
        let args = cli.into_args();
        assert_eq!(args.audio_enabled, None);
        assert_eq!(args.symbols, Some(Vec::new()));
    }
}
