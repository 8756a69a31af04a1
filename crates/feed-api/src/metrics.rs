//! Prometheus 메트릭 설정 및 유틸리티.
//!
//! WebSocket 연결, 캔들 수신, 브로드캐스트 메트릭을 수집하고
//! `/metrics` 엔드포인트로 노출합니다.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::broadcaster::DispatchOutcome;

/// Prometheus 메트릭 레코더를 설정하고 핸들을 반환합니다.
///
/// # 패닉
///
/// 레코더가 이미 설치되어 있으면 패닉합니다.
pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("Prometheus 레코더 설치 실패")
}

// ============================================================================
// WebSocket 메트릭
// ============================================================================

/// WebSocket 연결 수 증가.
pub fn increment_websocket_connections() {
    gauge!("websocket_connections_active").increment(1.0);
}

/// WebSocket 연결 수 감소.
pub fn decrement_websocket_connections() {
    gauge!("websocket_connections_active").decrement(1.0);
}

// ============================================================================
// 수신/브로드캐스트 메트릭
// ============================================================================

/// 수신된 캔들 카운터 증가.
pub fn record_candle_ingested(symbol: &str) {
    counter!("candles_ingested_total", "symbol" => symbol.to_string()).increment(1);
}

/// 거부된 캔들(순서 위반 등) 카운터 증가.
pub fn record_invalid_bar(symbol: &str) {
    counter!("candles_rejected_total", "symbol" => symbol.to_string()).increment(1);
}

/// 디스패치 틱 결과 기록.
pub fn record_dispatch(outcome: &DispatchOutcome) {
    if outcome.rooms_dispatched > 0 {
        counter!("broadcast_rooms_total").increment(outcome.rooms_dispatched as u64);
        counter!("broadcast_messages_total").increment(outcome.messages_sent as u64);
    }
    if outcome.send_failures > 0 {
        counter!("broadcast_send_failures_total").increment(outcome.send_failures as u64);
    }
}
