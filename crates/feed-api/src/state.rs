//! 모든 핸들러에서 공유되는 애플리케이션 상태.
//!
//! AppState는 시작 시 한 번 구성되어 Arc로 래핑된 뒤 모든 핸들러와
//! 백그라운드 태스크에 참조로 전달됩니다. 어그리게이터와 룸 레지스트리는
//! 각자의 단일 락으로 직렬화되며, 테스트에서는 독립적으로 생성할 수
//! 있습니다.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use feed_core::MarketConfig;
use feed_data::{Database, RedisCache};

use crate::aggregator::CandleAggregator;
use crate::broadcaster::RoomBroadcaster;
use crate::history::HistoryService;
use crate::websocket::session::SessionManager;

/// 애플리케이션 공유 상태.
pub struct AppState {
    /// 캔들 어그리게이터 - 심볼별 1분봉 윈도우
    pub aggregator: Arc<RwLock<CandleAggregator>>,

    /// 룸 브로드캐스터 - 룸 레지스트리와 디스패치
    pub broadcaster: Arc<RoomBroadcaster>,

    /// 세션 관리자 - 연결 수명과 하트비트
    pub sessions: Arc<SessionManager>,

    /// 히스토리 서비스 (시계열 저장소 미설정 시 None)
    pub history: Option<Arc<HistoryService>>,

    /// 데이터베이스 연결 (TimescaleDB, 헬스 체크용)
    pub db: Option<Database>,

    /// Redis 연결 (업스트림 버스 헬스 체크, 캔들 스냅샷 cache)
    pub redis: Option<RedisCache>,

    /// 시장 데이터 설정 (허용 심볼, 윈도우/주기 상수)
    pub market: MarketConfig,

    /// 서버 시작 시간 (업타임 계산용)
    pub started_at: chrono::DateTime<chrono::Utc>,

    /// 서비스 버전
    pub version: String,
}

impl AppState {
    /// 새로운 AppState 생성.
    pub fn new(market: MarketConfig) -> Self {
        let aggregator = Arc::new(RwLock::new(CandleAggregator::new(market.max_1m_window)));
        let broadcaster = Arc::new(RoomBroadcaster::new(Duration::from_millis(
            market.broadcast_period_ms,
        )));

        Self {
            aggregator,
            broadcaster,
            sessions: Arc::new(SessionManager::new()),
            history: None,
            db: None,
            redis: None,
            market,
            started_at: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// 히스토리 서비스 설정.
    pub fn with_history(mut self, history: Arc<HistoryService>) -> Self {
        self.history = Some(history);
        self
    }

    /// 데이터베이스 연결 설정.
    pub fn with_db(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Redis 연결 설정.
    pub fn with_redis(mut self, redis: RedisCache) -> Self {
        self.redis = Some(redis);
        self
    }

    /// 서버 업타임(초) 반환.
    pub fn uptime_secs(&self) -> i64 {
        chrono::Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds()
    }

    /// 데이터베이스 연결 상태 확인.
    pub async fn is_db_healthy(&self) -> bool {
        match &self.db {
            Some(db) => db.health_check().await.unwrap_or(false),
            None => false,
        }
    }

    /// Redis 연결 상태 확인.
    pub async fn is_redis_healthy(&self) -> bool {
        match &self.redis {
            Some(redis) => redis.health_check().await.unwrap_or(false),
            None => false,
        }
    }
}

/// 테스트용 AppState 생성 헬퍼.
///
/// 외부 의존성 없이 테스트할 수 있는 최소한의 상태를 생성합니다.
pub fn create_test_state() -> AppState {
    AppState::new(MarketConfig::default())
}
