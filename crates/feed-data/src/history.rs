//! 히스토리 소스 추상화.
//!
//! 시계열 저장소에서 과거 캔들을 조회하는 seam을 정의합니다.
//! 세션의 초기 스냅샷과 어그리게이터 warmup이 모두 이 trait을 통해
//! 수행되며, 테스트에서는 인메모리 구현으로 대체합니다.

use async_trait::async_trait;
use feed_core::{Candle, FeedResult, Interval, Symbol};
use tracing::instrument;

use crate::storage::timescale::CandleRepository;

/// 과거 캔들 조회 인터페이스.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// `(symbol, interval)`의 최근 캔들 `limit`개를 시간 오름차순으로
    /// 반환합니다.
    async fn fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: usize,
    ) -> FeedResult<Vec<Candle>>;
}

/// TimescaleDB 기반 히스토리 소스.
pub struct TimescaleHistory {
    repository: CandleRepository,
}

impl TimescaleHistory {
    pub fn new(repository: CandleRepository) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl HistorySource for TimescaleHistory {
    #[instrument(skip(self))]
    async fn fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: usize,
    ) -> FeedResult<Vec<Candle>> {
        let records = self
            .repository
            .fetch_latest(&symbol.to_string(), interval, limit as i64)
            .await?;

        Ok(records.into_iter().map(|r| r.into_candle()).collect())
    }
}
