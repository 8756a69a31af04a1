//! 히스토리 조회 및 어그리게이터 warmup.
//!
//! 시계열 저장소 조회를 타임아웃으로 감싸고, 서비스 시작 시와
//! 빈 윈도우에 대한 구독 시점에 어그리게이터를 1분봉으로 예열합니다.
//! warmup 실패는 치명적이지 않으며, 로그만 남기고 서비스는 계속합니다.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use feed_core::{Candle, FeedError, FeedResult, Interval, Symbol};
use feed_data::HistorySource;

use crate::aggregator::CandleAggregator;

/// 히스토리 서비스.
pub struct HistoryService {
    source: Arc<dyn HistorySource>,
    timeout: Duration,
}

impl HistoryService {
    /// 새 히스토리 서비스를 생성합니다.
    pub fn new(source: Arc<dyn HistorySource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// 초기 스냅샷 봉을 조회합니다 (시간 오름차순).
    ///
    /// 조회가 타임아웃 내에 끝나지 않으면 `Timeout` 에러를 반환합니다.
    pub async fn fetch_initial(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: i64,
    ) -> FeedResult<Vec<Candle>> {
        match tokio::time::timeout(
            self.timeout,
            self.source.fetch(symbol, interval, limit as usize),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout(format!(
                "history fetch for {}:{}",
                symbol, interval
            ))),
        }
    }

    /// 심볼의 1분봉으로 어그리게이터를 예열합니다.
    pub async fn warm(
        &self,
        symbol: &Symbol,
        aggregator: &RwLock<CandleAggregator>,
        window: usize,
    ) -> FeedResult<usize> {
        let candles = self
            .fetch_initial(symbol, Interval::M1, window as i64)
            .await?;
        let count = candles.len();

        aggregator
            .write()
            .await
            .initialize(&symbol.to_string(), candles);

        Ok(count)
    }

    /// 허용 목록의 모든 심볼을 예열합니다 (시작 시 1회).
    pub async fn warm_all(
        &self,
        symbols: &[String],
        aggregator: &RwLock<CandleAggregator>,
        window: usize,
    ) {
        for raw in symbols {
            let Some(symbol) = Symbol::from_string(raw) else {
                warn!(symbol = %raw, "Skipping malformed symbol in allow-list");
                continue;
            };

            match self.warm(&symbol, aggregator, window).await {
                Ok(count) => {
                    info!(symbol = %symbol, count, "Aggregator warmed up");
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Warmup failed, continuing without history");
                }
            }
        }
    }
}
