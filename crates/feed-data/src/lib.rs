//! # Feed Data
//!
//! 피드 서비스의 스토리지 레이어를 제공합니다.
//!
//! - TimescaleDB(PostgreSQL + TimescaleDB 확장) 기반 캔들 저장소
//! - Redis 연결 (업스트림 pub/sub, 캔들 스냅샷 cache, 헬스 체크)
//! - 히스토리 소스 추상화 (`HistorySource`)

pub mod error;
pub mod history;
pub mod storage;

pub use error::{DataError, Result};
pub use history::{HistorySource, TimescaleHistory};
pub use storage::redis::RedisCache;
pub use storage::timescale::{CandleRecord, CandleRepository, Database};
