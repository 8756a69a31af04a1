//! 실시간 캔들 팬아웃 서버.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - 1분봉 롤링 윈도우와 상위 타임프레임 파생 (어그리게이터)
//! - (심볼, 인터벌) 룸 단위의 스로틀링된 브로드캐스트
//! - WebSocket 구독 프로토콜 및 세션 수명 관리
//! - 업스트림 수신 어댑터와 히스토리 warmup
//! - 헬스 체크 / 통계 / Prometheus 메트릭 HTTP 엔드포인트
//!
//! # 모듈 구성
//!
//! - [`aggregator`]: 심볼별 1분봉 윈도우 및 타임프레임 집계
//! - [`broadcaster`]: 룸 레지스트리와 1초 디스패치 루프
//! - [`websocket`]: 메시지 타입, 세션 관리, 연결 핸들러
//! - [`ingest`]: 업스트림 캔들 이벤트 소비 루프
//! - [`history`]: 초기 스냅샷 조회 및 warmup
//! - [`routes`]: HTTP 엔드포인트
//! - [`state`]: 애플리케이션 공유 상태
//! - [`metrics`]: Prometheus 메트릭 수집

pub mod aggregator;
pub mod broadcaster;
pub mod history;
pub mod ingest;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod websocket;

pub use aggregator::CandleAggregator;
pub use broadcaster::{BroadcastStats, RoomBroadcaster, RoomKey, RoomStats};
pub use history::HistoryService;
pub use ingest::start_ingest;
pub use metrics::setup_metrics_recorder;
pub use state::AppState;
pub use websocket::{
    handler::websocket_router, messages::Outbound, messages::ClientMessage,
    messages::ServerMessage, messages::WsError, session::SessionManager,
};
