use crate::error::AppError;
use crate::market::types::ConnectionState;
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub stream: &'static str,
    pub connection: ConnectionState,
    pub last_update_ms: Option<i64>,
}

pub fn build_health_response(
    started_at: Instant,
    stream_status: Option<(ConnectionState, Option<i64>)>,
) -> HealthResponse {
    let (stream, connection, last_update_ms) = match stream_status {
        Some((connection, last_update_ms)) => ("running", connection, last_update_ms),
        None => ("stopped", ConnectionState::Disconnected, None),
    };

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        stream,
        connection,
        last_update_ms,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let stream_status = state
        .current_session()
        .await
        .map(|session| (session.manager().state(), session.last_update()));
    Ok(build_health_response(state.started_at, stream_status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_reports_stopped_stream() {
        let response = build_health_response(Instant::now(), None);

        assert_eq!(response.status, "ok");
        assert_eq!(response.stream, "stopped");
        assert_eq!(response.connection, ConnectionState::Disconnected);
        assert!(response.uptime_ms <= 1_000);
    }

    #[test]
    fn health_reports_running_stream() {
        let response = build_health_response(
            Instant::now(),
            Some((ConnectionState::Connected, Some(1_700_000_000_000))),
        );

        assert_eq!(response.stream, "running");
        assert_eq!(response.connection, ConnectionState::Connected);
        assert_eq!(response.last_update_ms, Some(1_700_000_000_000));
    }
}
