use crate::error::AppError;
use crate::market::types::{
    Alert, AlertClearResult, AlertDismissResult, AlertSettingsSnapshot, SaveAlertSettingsArgs,
};
use crate::state::AppState;

pub async fn alerts_list(state: &AppState) -> Result<Vec<Alert>, AppError> {
    Ok(state
        .current_session()
        .await
        .map(|session| session.alerts())
        .unwrap_or_default())
}

pub async fn dismiss_alert(state: &AppState, id: &str) -> Result<AlertDismissResult, AppError> {
    let dismissed = match state.current_session().await {
        Some(session) => session.dismiss_alert(id),
        None => false,
    };
    Ok(AlertDismissResult { dismissed })
}

pub async fn clear_alerts(state: &AppState) -> Result<AlertClearResult, AppError> {
    let cleared = match state.current_session().await {
        Some(session) => session.clear_alerts(),
        None => 0,
    };
    Ok(AlertClearResult { cleared })
}

pub fn alert_settings_get(state: &AppState) -> AlertSettingsSnapshot {
    state.alert_controls.snapshot()
}

pub fn alert_settings_save(
    state: &AppState,
    args: SaveAlertSettingsArgs,
) -> Result<AlertSettingsSnapshot, AppError> {
    if let Some(threshold) = args.alert_threshold {
        state.alert_controls.set_threshold(threshold)?;
    }
    if let Some(enabled) = args.audio_enabled {
        state.alert_controls.set_audio_enabled(enabled);
    }
    Ok(state.alert_controls.snapshot())
}
