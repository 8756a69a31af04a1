//! 실시간 캔들 팬아웃 서버.
//!
//! Axum 기반 서버를 시작합니다. 루트 경로의 WebSocket 업그레이드,
//! 헬스 체크, 통계, Prometheus 메트릭 엔드포인트를 제공하며,
//! 업스트림 pub/sub에서 1분봉을 수신해 룸 단위로 팬아웃합니다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use feed_api::broadcaster::start_dispatch_loop;
use feed_api::routes::create_api_router;
use feed_api::websocket::handler::websocket_router;
use feed_api::websocket::session::start_heartbeat_loop;
use feed_api::{setup_metrics_recorder, start_ingest, AppState, HistoryService};
use feed_core::logging::{init_logging, LogConfig};
use feed_core::{AppConfig, DatabaseConfig};
use feed_data::{CandleRepository, Database, RedisCache, TimescaleHistory};
use feed_stream::CandleSubscriber;

/// 수신 이벤트 채널 용량.
const INGEST_QUEUE_CAPACITY: usize = 1024;

/// TimescaleDB 연결 및 히스토리 초기화.
///
/// `[database]` 섹션이 없거나 연결에 실패하면 히스토리 없이 동작합니다
/// (헬스 체크는 DEGRADED, 구독의 초기 스냅샷은 에러 응답).
async fn init_history(state: AppState, database: Option<&DatabaseConfig>) -> AppState {
    let Some(config) = database else {
        warn!("Database not configured, history snapshots will be disabled");
        return state;
    };

    match Database::connect(config).await {
        Ok(db) => {
            info!("Connected to TimescaleDB");
            let repository = CandleRepository::new(db.clone());
            let history = Arc::new(HistoryService::new(
                Arc::new(TimescaleHistory::new(repository)),
                Duration::from_secs(state.market.history_timeout_secs),
            ));

            // 시작 warmup: 실패해도 서비스는 계속 (비치명적)
            history
                .warm_all(
                    &state.market.symbols,
                    &state.aggregator,
                    state.market.max_1m_window,
                )
                .await;

            state.with_db(db).with_history(history)
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database, continuing without history");
            state
        }
    }
}

/// Redis 연결 및 업스트림 수신 시작.
///
/// `[redis]` 섹션이 없으면 수신 없이 동작합니다 (룸에는 히스토리 기반
/// 봉만 남고 update는 흐르지 않음).
async fn init_upstream(
    state: AppState,
    app_config: &AppConfig,
    shutdown: CancellationToken,
) -> AppState {
    let Some(redis_config) = &app_config.redis else {
        warn!("Redis not configured, upstream ingest will be disabled");
        return state;
    };

    let state = match RedisCache::connect(redis_config).await {
        Ok(redis) => {
            info!("Connected to Redis");
            seed_from_cache(&redis, &state).await;
            state.with_redis(redis)
        }
        Err(e) => {
            // 구독자는 자체 재연결 루프를 가지므로 수신은 계속 시도
            error!(error = %e, "Redis health connection failed");
            state
        }
    };

    let subscriber = CandleSubscriber::new(
        redis_config.url.clone(),
        &state.market.symbols,
        app_config.stream.clone(),
    );
    let (tx, rx) = mpsc::channel(INGEST_QUEUE_CAPACITY);

    tokio::spawn(subscriber.run(tx, shutdown.clone()));
    start_ingest(
        rx,
        state.aggregator.clone(),
        state.broadcaster.clone(),
        state.redis.clone(),
        shutdown,
    );
    info!("Upstream ingest started");

    state
}

/// 캔들 스냅샷 cache로 빈 윈도우를 시드합니다.
///
/// 히스토리 warmup이 비어 있을 때(재시작 직후 또는 저장소 미설정),
/// 수신 루프가 기록해 둔 최신 1분봉으로 현재 봉을 즉시 제공합니다.
async fn seed_from_cache(redis: &RedisCache, state: &AppState) {
    for symbol in &state.market.symbols {
        if state.aggregator.read().await.window_len(symbol) > 0 {
            continue;
        }

        match redis.get_candle(symbol, "1m").await {
            Ok(Some(candle)) => {
                let mut aggregator = state.aggregator.write().await;
                if aggregator.ingest(symbol, candle).is_ok() {
                    info!(symbol = %symbol, "Seeded current bar from snapshot cache");
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "Snapshot cache read failed");
            }
        }
    }
}

/// CORS 미들웨어 구성.
///
/// `CORS_ORIGINS` 환경변수가 설정되어 있으면 해당 origin만 허용하고,
/// 없으면 개발 모드로 간주하여 모든 origin을 허용합니다.
fn cors_layer() -> CorsLayer {
    let allow_origin = match std::env::var("CORS_ORIGINS") {
        Ok(origins) if !origins.is_empty() => {
            let origins: Vec<_> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();

            if origins.is_empty() {
                warn!("CORS_ORIGINS is set but contains no valid origins, allowing any");
                AllowOrigin::any()
            } else {
                info!("CORS configured with {} allowed origins", origins.len());
                AllowOrigin::list(origins)
            }
        }
        _ => {
            warn!("CORS_ORIGINS not set, allowing any origin (development mode)");
            AllowOrigin::any()
        }
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([axum::http::Method::GET])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

/// /metrics 엔드포인트 핸들러.
async fn metrics_handler(
    axum::extract::State(handle): axum::extract::State<PrometheusHandle>,
) -> String {
    handle.render()
}

/// 전체 라우터 생성.
fn create_router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    let api_router = create_api_router().with_state(state.clone());

    // WebSocket 업그레이드는 루트 경로
    let ws_router = websocket_router().with_state(state);

    Router::new()
        .merge(metrics_router)
        .merge(api_router)
        .merge(ws_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env 파일 로드 (있는 경우)
    let _ = dotenvy::dotenv();

    // 설정 로드
    let config = AppConfig::load_default().map_err(|e| {
        eprintln!("Invalid configuration: {}", e);
        e
    })?;

    // tracing 초기화
    init_logging(LogConfig::from(&config.logging))?;

    info!("Starting quantfeed server...");

    // Prometheus 메트릭 레코더 설정
    let metrics_handle = setup_metrics_recorder();
    info!("Prometheus metrics recorder initialized");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| {
            error!(
                host = %config.server.host,
                port = config.server.port,
                error = %e,
                "Invalid listen address"
            );
            e
        })?;

    // 전역 종료 토큰 (백그라운드 태스크 전파용)
    let shutdown_token = CancellationToken::new();

    // 공유 상태 구성: 히스토리 warmup → 업스트림 수신
    let state = AppState::new(config.market.clone());
    let state = init_history(state, config.database.as_ref()).await;
    let state = Arc::new(init_upstream(state, &config, shutdown_token.clone()).await);

    info!(
        version = %state.version,
        symbols = ?state.market.symbols,
        has_db = state.db.is_some(),
        has_redis = state.redis.is_some(),
        has_history = state.history.is_some(),
        "Application state initialized"
    );

    // 디스패치 루프 (1초 틱, 단일 태스크)
    start_dispatch_loop(state.broadcaster.clone(), shutdown_token.clone());

    // 하트비트 루프 (30초 틱)
    start_heartbeat_loop(
        state.sessions.clone(),
        state.broadcaster.clone(),
        Duration::from_secs(state.market.heartbeat_period_secs),
        shutdown_token.clone(),
    );

    // 종료 시그널 수신 시 모든 세션을 정상 종료 코드로 닫음
    {
        let state = state.clone();
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            info!("Shutdown initiated, closing sessions...");
            state.sessions.close_all().await;
        });
    }

    // 라우터 생성 및 서버 시작
    let app = create_router(state.clone(), metrics_handle);

    info!(%addr, "Server listening");
    info!("WebSocket available at ws://{}/", addr);
    info!("Health check at http://{}/health", addr);
    info!("Metrics at http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(%addr, error = %e, "Failed to bind listen address");
        e
    })?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_token.clone()))
        .await?;

    // 정리 작업: 설정된 타임아웃 내에 완료하지 못하면 강제 종료
    info!("Server shutdown initiated, cleaning up...");
    shutdown_token.cancel();

    let cleanup_timeout = tokio::time::timeout(
        Duration::from_secs(state.market.shutdown_timeout_secs),
        async {
            // 진행 중인 연결 정리 대기
            tokio::time::sleep(Duration::from_millis(200)).await;
            info!("Cleanup completed");
        },
    )
    .await;

    if cleanup_timeout.is_err() {
        warn!("Cleanup timeout, forcing shutdown");
    }

    info!("Server stopped gracefully");

    Ok(())
}

/// Graceful shutdown 시그널 대기.
///
/// Ctrl+C 또는 SIGTERM 시그널을 수신하면 종료 토큰을 취소합니다.
async fn shutdown_signal(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    shutdown_token.cancel();
    info!("Shutdown signal propagated to background tasks");
}
