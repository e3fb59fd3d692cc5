use crate::error::AppError;
use serde::{Deserialize, Serialize};

pub const STREAM_URL_ENV: &str = "QUOTE_STREAM_URL";
pub const DEFAULT_STREAM_URL: &str = "ws://127.0.0.1:8000/ws/quotes";
pub const DEFAULT_ALERT_THRESHOLD: f64 = 2.0;
pub const DEFAULT_AUDIO_ENABLED: bool = true;
pub const DEFAULT_RECONNECT_POLICY: ReconnectPolicy = ReconnectPolicy::Fixed;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 30_000;
pub const MIN_RECONNECT_DELAY_MS: u64 = 10;
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;
pub const MAX_ALERT_THRESHOLD: f64 = 100.0;
pub const MAX_WATCH_SYMBOLS: usize = 500;
pub const MAX_SYMBOL_LEN: usize = 16;

pub const FRAME_TYPE_INITIAL: &str = "initial";
pub const FRAME_TYPE_QUOTES: &str = "quotes";

/// Lifecycle of the single streaming connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    ReconnectWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    Opened,
    CloseReceived,
    Lost,
    RetryScheduled,
    RetryDue,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::ReconnectWait => "reconnect_wait",
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns the next state, or `None` when the event does not apply to the
    /// current state.
    pub fn on_event(self, event: ConnectionEvent) -> Option<Self> {
        use ConnectionEvent as E;

        match (self, event) {
            (Self::Disconnected, E::ConnectRequested) => Some(Self::Connecting),
            (Self::Connecting, E::Opened) => Some(Self::Connected),
            (Self::Connected, E::CloseReceived) => Some(Self::Closing),
            (Self::Connecting | Self::Connected | Self::Closing, E::Lost) => {
                Some(Self::Disconnected)
            }
            (Self::Disconnected, E::RetryScheduled) => Some(Self::ReconnectWait),
            (Self::ReconnectWait, E::RetryDue) => Some(Self::Connecting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteStreamStatusSnapshot {
    pub state: ConnectionState,
    pub connected: bool,
    pub url: String,
    pub last_update_ms: Option<i64>,
    pub reconnect_attempt: u32,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub reason: Option<String>,
}

impl QuoteStreamStatusSnapshot {
    pub fn disconnected(url: String, reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connected: false,
            url,
            last_update_ms: None,
            reconnect_attempt: 0,
            frames_received: 0,
            frames_dropped: 0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartQuoteStreamArgs {
    pub url: Option<String>,
    pub symbols: Option<Vec<String>>,
    pub reconnect_policy: Option<ReconnectPolicy>,
    pub reconnect_delay_ms: Option<u64>,
    pub max_reconnect_delay_ms: Option<u64>,
    pub alert_threshold: Option<f64>,
    pub audio_enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct QuoteStreamConfig {
    pub url: String,
    pub symbols: Vec<String>,
    pub reconnect_policy: ReconnectPolicy,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub alert_threshold: f64,
    pub audio_enabled: bool,
}

pub fn resolve_stream_url() -> String {
    std::env::var(STREAM_URL_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string())
}

pub fn normalize_symbol(raw: &str) -> Result<String, AppError> {
    let symbol = raw.trim().to_ascii_uppercase();
    let valid = !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '.' || ch == '-');
    if !valid {
        return Err(AppError::InvalidArgument(format!(
            "symbol '{raw}' must be 1-{MAX_SYMBOL_LEN} alphanumeric ASCII characters"
        )));
    }
    Ok(symbol)
}

/// Uppercases, validates and de-duplicates symbols while keeping first-seen order.
pub fn normalize_symbols<I, S>(raw: I) -> Result<Vec<String>, AppError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut symbols: Vec<String> = Vec::new();
    for entry in raw {
        let symbol = normalize_symbol(entry.as_ref())?;
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    if symbols.len() > MAX_WATCH_SYMBOLS {
        return Err(AppError::InvalidArgument(format!(
            "at most {MAX_WATCH_SYMBOLS} symbols can be watched"
        )));
    }
    Ok(symbols)
}

pub fn validate_alert_threshold(threshold: f64) -> Result<f64, AppError> {
    if !threshold.is_finite() || threshold <= 0.0 || threshold > MAX_ALERT_THRESHOLD {
        return Err(AppError::InvalidArgument(format!(
            "alertThreshold must be a finite number in (0, {MAX_ALERT_THRESHOLD}]"
        )));
    }
    Ok(threshold)
}

impl StartQuoteStreamArgs {
    pub fn normalize(self) -> Result<QuoteStreamConfig, AppError> {
        let url = self
            .url
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(resolve_stream_url);
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "url must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let symbols = normalize_symbols(self.symbols.unwrap_or_default())?;

        let reconnect_policy = self.reconnect_policy.unwrap_or(DEFAULT_RECONNECT_POLICY);
        let reconnect_delay_ms = self
            .reconnect_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        if !(MIN_RECONNECT_DELAY_MS..=MAX_RECONNECT_DELAY_MS).contains(&reconnect_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "reconnectDelayMs must be between {MIN_RECONNECT_DELAY_MS} and {MAX_RECONNECT_DELAY_MS}"
            )));
        }

        let max_reconnect_delay_ms = self
            .max_reconnect_delay_ms
            .unwrap_or(DEFAULT_MAX_RECONNECT_DELAY_MS.max(reconnect_delay_ms));
        if !(reconnect_delay_ms..=MAX_RECONNECT_DELAY_MS).contains(&max_reconnect_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "maxReconnectDelayMs must be between reconnectDelayMs and {MAX_RECONNECT_DELAY_MS}"
            )));
        }

        let alert_threshold =
            validate_alert_threshold(self.alert_threshold.unwrap_or(DEFAULT_ALERT_THRESHOLD))?;
        let audio_enabled = self.audio_enabled.unwrap_or(DEFAULT_AUDIO_ENABLED);

        Ok(QuoteStreamConfig {
            url,
            symbols,
            reconnect_policy,
            reconnect_delay_ms,
            max_reconnect_delay_ms,
            alert_threshold,
            audio_enabled,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteStreamSession {
    pub running: bool,
    pub url: String,
    pub symbols: Vec<String>,
    pub reconnect_policy: ReconnectPolicy,
    pub reconnect_delay_ms: u64,
    pub alert_threshold: f64,
    pub audio_enabled: bool,
}

impl QuoteStreamSession {
    pub fn from_config(config: &QuoteStreamConfig) -> Self {
        Self {
            running: true,
            url: config.url.clone(),
            symbols: config.symbols.clone(),
            reconnect_policy: config.reconnect_policy,
            reconnect_delay_ms: config.reconnect_delay_ms,
            alert_threshold: config.alert_threshold,
            audio_enabled: config.audio_enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteStreamStopResult {
    pub stopped: bool,
}

#[derive(Debug, Deserialize)]
pub struct QuoteWire {
    pub symbol: String,
    #[serde(default, deserialize_with = "lenient_number")]
    pub price: Option<f64>,
    #[serde(default, alias = "changePercent", deserialize_with = "lenient_number")]
    pub change_percent: Option<f64>,
}

/// Any non-numeric value becomes `None` instead of failing the entry.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value.as_f64())
}

/// Inbound symbols are opaque keys: trimmed and uppercased, rejected only when empty.
pub fn normalize_feed_symbol(raw: &str) -> Result<String, AppError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() {
        return Err(AppError::InvalidArgument(
            "quote symbol must not be empty".to_string(),
        ));
    }
    Ok(symbol)
}

/// One immutable snapshot of a symbol. Unusable numeric fields are dropped to
/// `None` rather than rejecting the whole quote.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: String,
    pub price: Option<f64>,
    pub change_percent: Option<f64>,
}

impl Quote {
    pub fn new(symbol: &str, price: Option<f64>, change_percent: Option<f64>) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            change_percent,
        }
    }
}

impl TryFrom<QuoteWire> for Quote {
    type Error = AppError;

    fn try_from(value: QuoteWire) -> Result<Self, Self::Error> {
        let symbol = normalize_feed_symbol(&value.symbol)?;
        let price = value
            .price
            .filter(|price| price.is_finite() && *price > 0.0);
        let change_percent = value.change_percent.filter(|change| change.is_finite());

        Ok(Self {
            symbol,
            price,
            change_percent,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Initial,
    Quotes,
    Other(String),
}

impl FrameKind {
    pub fn parse_str(value: &str) -> Self {
        match value {
            FRAME_TYPE_INITIAL => Self::Initial,
            FRAME_TYPE_QUOTES => Self::Quotes,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Initial => FRAME_TYPE_INITIAL,
            Self::Quotes => FRAME_TYPE_QUOTES,
            Self::Other(value) => value,
        }
    }

    pub fn carries_quotes(&self) -> bool {
        matches!(self, Self::Initial | Self::Quotes)
    }
}

#[derive(Debug, Deserialize)]
struct StreamFrameWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// A decoded server frame. `data` is kept verbatim so unknown frame types reach
/// handlers unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub kind: FrameKind,
    pub data: serde_json::Value,
}

impl Serialize for StreamFrame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("StreamFrame", 2)?;
        state.serialize_field("type", self.kind.as_str())?;
        state.serialize_field("data", &self.data)?;
        state.end()
    }
}

impl StreamFrame {
    /// Decodes the quote batch of an `initial`/`quotes` frame entry by entry.
    /// Entries without a usable symbol are skipped and bad numeric fields become
    /// `None`; only a non-array batch is an error.
    pub fn quotes(&self) -> Result<Vec<Quote>, AppError> {
        if !self.kind.carries_quotes() {
            return Ok(Vec::new());
        }
        if self.data.is_null() {
            return Ok(Vec::new());
        }

        let Some(entries) = self.data.as_array() else {
            return Err(AppError::InvalidArgument(format!(
                "{} frame data must be an array",
                self.kind.as_str()
            )));
        };

        let mut quotes = Vec::with_capacity(entries.len());
        for entry in entries {
            let decoded = QuoteWire::deserialize(entry)
                .map_err(AppError::from)
                .and_then(Quote::try_from);
            match decoded {
                Ok(quote) => quotes.push(quote),
                Err(error) => tracing::debug!("skipping quote entry: {error}"),
            }
        }
        Ok(quotes)
    }
}

pub fn parse_stream_frame(payload: &mut [u8]) -> Result<StreamFrame, AppError> {
    let wire: StreamFrameWire = simd_json::serde::from_slice(payload)?;
    if wire.kind.trim().is_empty() {
        return Err(AppError::InvalidArgument(
            "frame type must be non-empty".to_string(),
        ));
    }

    Ok(StreamFrame {
        kind: FrameKind::parse_str(&wire.kind),
        data: wire.data,
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlFrame {
    pub action: ControlAction,
    pub symbols: Vec<String>,
}

impl ControlFrame {
    pub fn encode(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Bullish,
    Bearish,
    Info,
}

/// Which audio cue an emitted alert maps to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Bullish,
    Bearish,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub symbol: String,
    pub price: Option<f64>,
    pub change_percent: Option<f64>,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: i64,
    pub read: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertSettingsSnapshot {
    pub alert_threshold: f64,
    pub audio_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SaveAlertSettingsArgs {
    pub alert_threshold: Option<f64>,
    pub audio_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDismissResult {
    pub dismissed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertClearResult {
    pub cleared: usize,
}
