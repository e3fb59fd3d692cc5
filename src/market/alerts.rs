use crate::audio::AudioCue;
use crate::error::AppError;
use crate::market::quotes::QuoteTable;
use crate::market::types::{
    validate_alert_threshold, Alert, AlertKind, AlertSettingsSnapshot, AlertSeverity, Quote,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

pub const ALERT_FEED_CAPACITY: usize = 50;
pub const DEDUP_BUCKET_MS: i64 = 60_000;
pub const DEDUP_MAX_KEYS: usize = 100;
pub const DEDUP_RETAIN_KEYS: usize = 50;
const TICK_DELTA_SENSITIVITY: f64 = 0.5;
const URGENT_MULTIPLIER: f64 = 2.0;

/// Externally owned toggles, re-read on every pass.
#[derive(Debug)]
pub struct AlertControls {
    threshold_bits: AtomicU64,
    audio_enabled: AtomicBool,
}

impl AlertControls {
    pub fn new(threshold: f64, audio_enabled: bool) -> Result<Self, AppError> {
        let threshold = validate_alert_threshold(threshold)?;
        Ok(Self {
            threshold_bits: AtomicU64::new(threshold.to_bits()),
            audio_enabled: AtomicBool::new(audio_enabled),
        })
    }

    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    pub fn set_threshold(&self, threshold: f64) -> Result<(), AppError> {
        let threshold = validate_alert_threshold(threshold)?;
        self.threshold_bits
            .store(threshold.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AlertSettingsSnapshot {
        AlertSettingsSnapshot {
            alert_threshold: self.threshold(),
            audio_enabled: self.audio_enabled(),
        }
    }
}

pub fn dedup_key(symbol: &str, now_ms: i64) -> String {
    format!("{symbol}-{}", now_ms.div_euclid(DEDUP_BUCKET_MS))
}

/// Insertion-ordered key set. Once it grows past `DEDUP_MAX_KEYS` only the
/// `DEDUP_RETAIN_KEYS` most recently inserted keys survive.
#[derive(Debug, Default)]
pub struct DedupWindow {
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl DedupWindow {
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Returns `false` when the key was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if !self.keys.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);

        if self.order.len() > DEDUP_MAX_KEYS {
            let overflow = self.order.len() - DEDUP_RETAIN_KEYS;
            for evicted in self.order.drain(..overflow) {
                self.keys.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Newest-first alert list capped at `ALERT_FEED_CAPACITY`.
#[derive(Debug, Default)]
pub struct AlertFeed {
    alerts: VecDeque<Alert>,
}

impl AlertFeed {
    /// Prepends one pass worth of alerts, keeping their relative order.
    pub fn prepend_batch(&mut self, batch: Vec<Alert>) {
        for alert in batch.into_iter().rev() {
            self.alerts.push_front(alert);
        }
        self.alerts.truncate(ALERT_FEED_CAPACITY);
    }

    pub fn list(&self) -> Vec<Alert> {
        self.alerts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.alerts.iter().filter(|alert| !alert.read).count()
    }

    pub fn dismiss(&mut self, id: &str) -> bool {
        match self.alerts.iter_mut().find(|alert| alert.id == id) {
            Some(alert) => {
                alert.read = true;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.alerts.len();
        self.alerts.clear();
        cleared
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    ReportedChange,
    TickDelta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub source: TriggerSource,
    pub direction: f64,
    pub message: String,
}

fn reported_change_trigger(quote: &Quote, threshold: f64) -> Option<Trigger> {
    let change = quote.change_percent?;
    if change.abs() < threshold {
        return None;
    }

    let verb = if change >= 0.0 { "up" } else { "down" };
    Some(Trigger {
        source: TriggerSource::ReportedChange,
        direction: change,
        message: format!("{} {verb} {:.2}% on the session", quote.symbol, change.abs()),
    })
}

fn tick_delta_trigger(quote: &Quote, previous_price: Option<f64>, threshold: f64) -> Option<Trigger> {
    let price = quote.price?;
    let previous = previous_price.filter(|value| *value > 0.0)?;
    let delta = (price - previous) / previous * 100.0;
    if !delta.is_finite() || delta.abs() < threshold * TICK_DELTA_SENSITIVITY {
        return None;
    }

    let verb = if delta >= 0.0 { "jumped" } else { "dropped" };
    Some(Trigger {
        source: TriggerSource::TickDelta,
        direction: delta,
        message: format!(
            "{} {verb} {:.2}% since last tick ({previous:.2} -> {price:.2})",
            quote.symbol,
            delta.abs()
        ),
    })
}

/// Evaluates both trigger conditions. The tick-over-tick delta takes precedence
/// over the reported change when both fire.
pub fn evaluate_quote(quote: &Quote, previous_price: Option<f64>, threshold: f64) -> Option<Trigger> {
    let reported = reported_change_trigger(quote, threshold);
    let delta = tick_delta_trigger(quote, previous_price, threshold);
    delta.or(reported)
}

pub fn classify_severity(change_percent: Option<f64>, direction: f64, threshold: f64) -> AlertSeverity {
    let urgent = change_percent
        .map(|change| change.abs() >= threshold * URGENT_MULTIPLIER)
        .unwrap_or(false);
    if urgent {
        AlertSeverity::Urgent
    } else if direction < 0.0 {
        AlertSeverity::Bearish
    } else {
        AlertSeverity::Bullish
    }
}

fn alert_kind(direction: f64) -> AlertKind {
    if direction > 0.0 {
        AlertKind::Bullish
    } else if direction < 0.0 {
        AlertKind::Bearish
    } else {
        AlertKind::Info
    }
}

fn play_cue(audio: &dyn AudioCue, severity: AlertSeverity) {
    match severity {
        AlertSeverity::Bullish => audio.play_bullish(),
        AlertSeverity::Bearish => audio.play_bearish(),
        AlertSeverity::Urgent => audio.play_urgent(),
    }
}

/// Per-session detection state: previous prices, dedup keys and the alert feed.
#[derive(Debug, Default)]
pub struct AlertEngine {
    previous_prices: HashMap<String, f64>,
    dedup: DedupWindow,
    feed: AlertFeed,
}

impl AlertEngine {
    pub fn previous_price(&self, symbol: &str) -> Option<f64> {
        self.previous_prices.get(symbol).copied()
    }

    pub fn feed(&self) -> &AlertFeed {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut AlertFeed {
        &mut self.feed
    }

    pub fn dedup(&self) -> &DedupWindow {
        &self.dedup
    }

    /// Runs one detection pass and returns the alerts it emitted, in pass order.
    pub fn run_pass(
        &mut self,
        table: &QuoteTable,
        watch_set: &[String],
        controls: &AlertControls,
        audio: &dyn AudioCue,
        now_ms: i64,
    ) -> Vec<Alert> {
        if table.is_empty() {
            return Vec::new();
        }

        let threshold = controls.threshold();
        let audio_enabled = controls.audio_enabled();
        let symbols = if watch_set.is_empty() {
            table.symbols()
        } else {
            watch_set.to_vec()
        };

        let mut emitted = Vec::new();
        for symbol in &symbols {
            let Some(quote) = table.get(symbol) else {
                continue;
            };

            let previous_price = self.previous_prices.get(symbol).copied();
            if let Some(trigger) = evaluate_quote(quote, previous_price, threshold) {
                if self.dedup.insert(dedup_key(symbol, now_ms)) {
                    let severity = classify_severity(quote.change_percent, trigger.direction, threshold);
                    if audio_enabled {
                        play_cue(audio, severity);
                    }
                    info!(symbol = %symbol, ?severity, "{}", trigger.message);
                    emitted.push(Alert {
                        id: format!("{symbol}-{now_ms}"),
                        symbol: symbol.clone(),
                        price: quote.price,
                        change_percent: quote.change_percent,
                        kind: alert_kind(trigger.direction),
                        severity,
                        message: trigger.message,
                        timestamp: now_ms,
                        read: false,
                    });
                } else {
                    debug!(symbol = %symbol, "alert suppressed within dedup bucket");
                }
            }

            // The baseline is always the previous pass, even when that pass had no price.
            match quote.price {
                Some(price) => {
                    self.previous_prices.insert(symbol.clone(), price);
                }
                None => {
                    self.previous_prices.remove(symbol);
                }
            }
        }

        if !emitted.is_empty() {
            self.feed.prepend_batch(emitted.clone());
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{BufferSink, SuspendableSink, ToneSynthesizer};
    use parking_lot::Mutex;

    const MINUTE_START_MS: i64 = 1_700_000_040_000;

    #[derive(Default)]
    struct RecordingCue {
        played: Mutex<Vec<AlertSeverity>>,
    }

    impl RecordingCue {
        fn played(&self) -> Vec<AlertSeverity> {
            self.played.lock().clone()
        }
    }

    impl AudioCue for RecordingCue {
        fn play_bullish(&self) {
            self.played.lock().push(AlertSeverity::Bullish);
        }

        fn play_bearish(&self) {
            self.played.lock().push(AlertSeverity::Bearish);
        }

        fn play_urgent(&self) {
            self.played.lock().push(AlertSeverity::Urgent);
        }
    }

    fn controls(threshold: f64) -> AlertControls {
        AlertControls::new(threshold, true).expect("threshold should be valid")
    }

    fn table_with(quotes: Vec<Quote>) -> QuoteTable {
        let mut table = QuoteTable::default();
        table.upsert_batch(quotes);
        table
    }

    #[test]
    fn scenario_delta_trigger_then_dedup_suppression() {
        let mut engine = AlertEngine::default();
        let controls = controls(2.0);
        let cue = RecordingCue::default();
        let watch_set = vec!["AAPL".to_string()];

        let first = engine.run_pass(
            &table_with(vec![Quote::new("AAPL", Some(100.0), Some(0.0))]),
            &watch_set,
            &controls,
            &cue,
            MINUTE_START_MS,
        );
        assert!(first.is_empty());
        assert_eq!(engine.previous_price("AAPL"), Some(100.0));

        let second = engine.run_pass(
            &table_with(vec![Quote::new("AAPL", Some(102.0), Some(0.0))]),
            &watch_set,
            &controls,
            &cue,
            MINUTE_START_MS + 1_000,
        );
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind, AlertKind::Bullish);
        assert_eq!(second[0].severity, AlertSeverity::Bullish);
        assert!(second[0].message.contains("since last tick"));
        assert_eq!(engine.previous_price("AAPL"), Some(102.0));

        let third = engine.run_pass(
            &table_with(vec![Quote::new("AAPL", Some(104.0), Some(0.0))]),
            &watch_set,
            &controls,
            &cue,
            MINUTE_START_MS + 2_000,
        );
        assert!(third.is_empty());
        assert_eq!(engine.previous_price("AAPL"), Some(104.0));
        assert_eq!(engine.feed().len(), 1);
        assert_eq!(cue.played(), vec![AlertSeverity::Bullish]);
    }

    #[test]
    fn one_alert_per_symbol_per_minute_bucket() {
        let mut engine = AlertEngine::default();
        let controls = controls(2.0);
        let cue = RecordingCue::default();
        let table = table_with(vec![Quote::new("TSLA", Some(250.0), Some(3.0))]);

        let emitted: usize = (0..10)
            .map(|step| {
                engine
                    .run_pass(&table, &[], &controls, &cue, MINUTE_START_MS + step * 5_000)
                    .len()
            })
            .sum();
        assert_eq!(emitted, 1);

        let next_bucket = engine.run_pass(&table, &[], &controls, &cue, MINUTE_START_MS + DEDUP_BUCKET_MS);
        assert_eq!(next_bucket.len(), 1);
    }

    #[test]
    fn tick_delta_triggers_without_reported_change() {
        let mut engine = AlertEngine::default();
        let controls = controls(2.0);
        let cue = RecordingCue::default();

        engine.run_pass(
            &table_with(vec![Quote::new("NVDA", Some(100.0), Some(0.0))]),
            &[],
            &controls,
            &cue,
            MINUTE_START_MS,
        );
        let emitted = engine.run_pass(
            &table_with(vec![Quote::new("NVDA", Some(98.8), Some(0.0))]),
            &[],
            &controls,
            &cue,
            MINUTE_START_MS + 500,
        );

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, AlertKind::Bearish);
        assert_eq!(cue.played(), vec![AlertSeverity::Bearish]);
    }

    #[test]
    fn feed_keeps_fifty_newest_first() {
        let mut engine = AlertEngine::default();
        let controls = controls(2.0);
        let cue = RecordingCue::default();

        for index in 0..60 {
            let symbol = format!("SYM{index}");
            let table = table_with(vec![Quote::new(&symbol, Some(10.0), Some(2.5))]);
            let emitted = engine.run_pass(&table, &[], &controls, &cue, MINUTE_START_MS + index);
            assert_eq!(emitted.len(), 1);
        }

        let alerts = engine.feed().list();
        assert_eq!(alerts.len(), ALERT_FEED_CAPACITY);
        assert_eq!(alerts.first().map(|alert| alert.symbol.as_str()), Some("SYM59"));
        assert_eq!(alerts.last().map(|alert| alert.symbol.as_str()), Some("SYM10"));
    }

    #[test]
    fn large_reported_change_is_urgent() {
        let mut engine = AlertEngine::default();
        let controls = controls(2.0);
        let cue = RecordingCue::default();

        let emitted = engine.run_pass(
            &table_with(vec![Quote::new("AMD", Some(150.0), Some(5.0))]),
            &[],
            &controls,
            &cue,
            MINUTE_START_MS,
        );

        assert_eq!(emitted[0].severity, AlertSeverity::Urgent);
        assert_eq!(emitted[0].kind, AlertKind::Bullish);
        assert_eq!(cue.played(), vec![AlertSeverity::Urgent]);
    }

    #[test]
    fn tick_delta_message_wins_when_both_conditions_fire() {
        let quote = Quote::new("META", Some(110.0), Some(2.5));
        let trigger = evaluate_quote(&quote, Some(100.0), 2.0).expect("both conditions fire");
        assert_eq!(trigger.source, TriggerSource::TickDelta);

        let opposing = Quote::new("META", Some(98.0), Some(2.5));
        let trigger = evaluate_quote(&opposing, Some(100.0), 2.0).expect("both conditions fire");
        assert_eq!(trigger.source, TriggerSource::TickDelta);
        assert!(trigger.direction < 0.0);
    }

    #[test]
    fn missing_price_still_allows_reported_change() {
        let mut engine = AlertEngine::default();
        let controls = controls(2.0);
        let cue = RecordingCue::default();

        let emitted = engine.run_pass(
            &table_with(vec![Quote::new("IBM", None, Some(-2.2))]),
            &[],
            &controls,
            &cue,
            MINUTE_START_MS,
        );
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, AlertKind::Bearish);
        assert_eq!(engine.previous_price("IBM"), None);
    }

    #[test]
    fn missing_price_resets_the_tick_baseline() {
        let mut engine = AlertEngine::default();
        let controls = controls(2.0);
        let cue = RecordingCue::default();

        for (offset, price) in [(0, Some(100.0)), (1, None), (2, Some(102.0))] {
            let emitted = engine.run_pass(
                &table_with(vec![Quote::new("NVDA", price, Some(0.1))]),
                &[],
                &controls,
                &cue,
                MINUTE_START_MS + offset * DEDUP_BUCKET_MS,
            );
            assert!(emitted.is_empty(), "no alert expected at pass {offset}");
            if offset == 1 {
                assert_eq!(engine.previous_price("NVDA"), None);
            }
        }

        assert_eq!(engine.previous_price("NVDA"), Some(102.0));
        assert!(cue.played().is_empty());
    }

    #[test]
    fn empty_table_is_a_no_op() {
        let mut engine = AlertEngine::default();
        let emitted = engine.run_pass(
            &QuoteTable::default(),
            &["AAPL".to_string()],
            &controls(2.0),
            &RecordingCue::default(),
            MINUTE_START_MS,
        );
        assert!(emitted.is_empty());
        assert!(engine.dedup().is_empty());
        assert_eq!(engine.previous_price("AAPL"), None);
    }

    #[test]
    fn watch_set_limits_evaluated_symbols() {
        let mut engine = AlertEngine::default();
        let table = table_with(vec![
            Quote::new("AAPL", Some(100.0), Some(4.0)),
            Quote::new("MSFT", Some(300.0), Some(4.0)),
        ]);

        let emitted = engine.run_pass(
            &table,
            &["MSFT".to_string(), "GOOG".to_string()],
            &controls(2.0),
            &RecordingCue::default(),
            MINUTE_START_MS,
        );
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].symbol, "MSFT");
        assert_eq!(engine.previous_price("AAPL"), None);
    }

    #[test]
    fn threshold_and_audio_are_reread_every_pass() {
        let mut engine = AlertEngine::default();
        let controls = controls(5.0);
        let cue = RecordingCue::default();
        let table = table_with(vec![Quote::new("ORCL", Some(120.0), Some(3.0))]);

        assert!(engine.run_pass(&table, &[], &controls, &cue, MINUTE_START_MS).is_empty());

        controls.set_threshold(2.5).expect("threshold should be valid");
        controls.set_audio_enabled(false);
        let emitted = engine.run_pass(&table, &[], &controls, &cue, MINUTE_START_MS + 10);
        assert_eq!(emitted.len(), 1);
        assert!(cue.played().is_empty());
    }

    #[test]
    fn audio_failure_does_not_block_emission() {
        let mut engine = AlertEngine::default();
        let synth = ToneSynthesizer::new(SuspendableSink::new(BufferSink::default()));
        synth.sink().suspend();

        let emitted = engine.run_pass(
            &table_with(vec![Quote::new("NFLX", Some(500.0), Some(6.0))]),
            &[],
            &controls(2.0),
            &synth,
            MINUTE_START_MS,
        );
        assert_eq!(emitted.len(), 1);
        assert_eq!(engine.feed().len(), 1);
    }

    #[test]
    fn dismiss_and_clear_leave_dedup_untouched() {
        let mut engine = AlertEngine::default();
        let controls = controls(2.0);
        let cue = RecordingCue::default();
        let table = table_with(vec![Quote::new("AAPL", Some(100.0), Some(3.0))]);

        let emitted = engine.run_pass(&table, &[], &controls, &cue, MINUTE_START_MS);
        assert!(engine.feed_mut().dismiss(&emitted[0].id));
        assert_eq!(engine.feed().unread_count(), 0);
        assert!(!engine.feed_mut().dismiss("missing"));

        assert_eq!(engine.feed_mut().clear(), 1);
        assert!(engine
            .run_pass(&table, &[], &controls, &cue, MINUTE_START_MS + 1)
            .is_empty());
        assert_eq!(engine.previous_price("AAPL"), Some(100.0));
    }

    #[test]
    fn dedup_window_truncates_by_insertion_order() {
        let mut window = DedupWindow::default();
        for index in 0..=DEDUP_MAX_KEYS {
            assert!(window.insert(format!("SYM{index}-1")));
        }

        assert_eq!(window.len(), DEDUP_RETAIN_KEYS);
        assert!(!window.contains("SYM0-1"));
        assert!(!window.contains("SYM50-1"));
        assert!(window.contains("SYM51-1"));
        assert!(window.contains(&format!("SYM{DEDUP_MAX_KEYS}-1")));
        assert!(window.insert("SYM0-1".to_string()));
    }

    #[test]
    fn batch_prepend_preserves_intra_pass_order() {
        let mut engine = AlertEngine::default();
        let table = table_with(vec![
            Quote::new("AAA", Some(10.0), Some(3.0)),
            Quote::new("BBB", Some(10.0), Some(3.0)),
        ]);
        engine.run_pass(&table, &[], &controls(2.0), &RecordingCue::default(), MINUTE_START_MS);

        let symbols: Vec<String> = engine.feed().list().into_iter().map(|alert| alert.symbol).collect();
        assert_eq!(symbols, vec!["AAA".to_string(), "BBB".to_string()]);
    }

    #[test]
    fn rejects_invalid_threshold_updates() {
        let controls = controls(2.0);
        assert!(controls.set_threshold(0.0).is_err());
        assert!(controls.set_threshold(f64::INFINITY).is_err());
        assert_eq!(controls.threshold(), 2.0);
    }
}
