//! HTTP 라우트.
//!
//! # 라우트 구조
//!
//! - `/health` - 서비스 상태 (OK | DEGRADED)
//! - `/health/ws-stats` - 어그리게이터/브로드캐스터/세션 통계 스냅샷

pub mod health;

pub use health::{health_router, HealthResponse, ServiceStatus, WsStatsResponse};

use axum::Router;
use std::sync::Arc;

use crate::state::AppState;

/// 전체 API 라우터 생성.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new().nest("/health", health_router())
}
