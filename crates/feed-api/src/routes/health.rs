//! 헬스 체크 및 통계 endpoint.
//!
//! 로드밸런서/오케스트레이션용 상태 확인과 내부 카운터의 읽기 전용
//! 스냅샷을 제공합니다. 부수 효과는 없습니다.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::broadcaster::RoomStats;
use crate::state::AppState;

/// 헬스 체크 응답 구조체.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// 전체 서비스 상태 ("OK" | "DEGRADED")
    pub status: String,

    /// 서비스 버전
    pub version: String,

    /// 서버 업타임(초)
    pub uptime_secs: i64,

    /// 개별 백엔드 상태
    pub services: HashMap<String, ServiceStatus>,
}

/// 개별 백엔드 상태.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// 상태 ("up" | "down" | "not_configured")
    pub status: String,
}

impl ServiceStatus {
    pub fn up() -> Self {
        Self {
            status: "up".to_string(),
        }
    }

    pub fn down() -> Self {
        Self {
            status: "down".to_string(),
        }
    }

    pub fn not_configured() -> Self {
        Self {
            status: "not_configured".to_string(),
        }
    }

    fn is_up(&self) -> bool {
        self.status == "up"
    }
}

/// WebSocket/어그리게이터 통계 응답.
#[derive(Debug, Serialize)]
pub struct WsStatsResponse {
    /// 연결된 세션 수
    pub connections: usize,
    /// 룸 수
    pub total_rooms: usize,
    /// 룸 멤버십 합계
    pub total_clients: usize,
    /// 룸별 상세
    pub rooms: Vec<RoomStats>,
    /// 심볼별 1분봉 윈도우 길이
    pub windows: HashMap<String, usize>,
}

/// 서비스 상태 확인.
///
/// 모든 백엔드가 정상이면 `OK`/200, 아니면 `DEGRADED`/503을 반환합니다.
/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = if state.db.is_some() {
        if state.is_db_healthy().await {
            ServiceStatus::up()
        } else {
            ServiceStatus::down()
        }
    } else {
        ServiceStatus::not_configured()
    };

    let redis = if state.redis.is_some() {
        if state.is_redis_healthy().await {
            ServiceStatus::up()
        } else {
            ServiceStatus::down()
        }
    } else {
        ServiceStatus::not_configured()
    };

    let all_up = database.is_up() && redis.is_up();
    let (status, status_code) = if all_up {
        ("OK", StatusCode::OK)
    } else {
        ("DEGRADED", StatusCode::SERVICE_UNAVAILABLE)
    };

    let mut services = HashMap::new();
    services.insert("database".to_string(), database);
    services.insert("redis".to_string(), redis);

    let response = HealthResponse {
        status: status.to_string(),
        version: state.version.clone(),
        uptime_secs: state.uptime_secs(),
        services,
    };

    (status_code, Json(response))
}

/// WebSocket 통계 스냅샷.
///
/// GET /health/ws-stats
pub async fn ws_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broadcast = state.broadcaster.stats().await;
    let windows = state.aggregator.read().await.window_lens();

    Json(WsStatsResponse {
        connections: state.sessions.count().await,
        total_rooms: broadcast.total_rooms,
        total_clients: broadcast.total_clients,
        rooms: broadcast.rooms,
        windows,
    })
}

/// 헬스 체크 라우터 생성.
pub fn health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(health_check))
        .route("/ws-stats", get(ws_stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::state::create_test_state;

    fn test_app() -> Router {
        Router::new()
            .nest("/health", health_router())
            .with_state(Arc::new(create_test_state()))
    }

    #[tokio::test]
    async fn test_health_degraded_without_backends() {
        let response = test_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        // 백엔드 미설정 상태는 DEGRADED/503
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "DEGRADED");
        assert_eq!(health["services"]["database"]["status"], "not_configured");
        assert_eq!(health["services"]["redis"]["status"], "not_configured");
    }

    #[tokio::test]
    async fn test_ws_stats_empty_snapshot() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/health/ws-stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["connections"], 0);
        assert_eq!(stats["total_rooms"], 0);
        assert_eq!(stats["rooms"].as_array().unwrap().len(), 0);
    }
}
