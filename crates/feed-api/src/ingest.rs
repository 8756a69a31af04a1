//! 업스트림 캔들 수신 루프.
//!
//! feed-stream 구독자가 전달한 1분봉 이벤트를 도착 순서대로 소비합니다.
//! 이벤트마다 어그리게이터에 반영하고 최신 1분봉 스냅샷을 cache에 기록한
//! 뒤 해당 심볼의 룸들을 갱신하므로, `refresh`는 항상 직전 `ingest`의
//! 효과를 관찰합니다. 순서 위반 봉은 로그 후 폐기되며 네트워크로
//! 전파되지 않습니다.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use feed_data::RedisCache;
use feed_stream::CandleEvent;

use crate::aggregator::CandleAggregator;
use crate::broadcaster::RoomBroadcaster;
use crate::metrics::{record_candle_ingested, record_invalid_bar};

/// 수신 루프를 시작합니다.
pub fn start_ingest(
    mut rx: mpsc::Receiver<CandleEvent>,
    aggregator: Arc<RwLock<CandleAggregator>>,
    broadcaster: Arc<RoomBroadcaster>,
    redis: Option<RedisCache>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    handle_event(event, &aggregator, &broadcaster, redis.as_ref()).await;
                }
            }
        }

        info!("Ingest loop stopped");
    })
}

/// 단일 캔들 이벤트를 처리합니다.
pub async fn handle_event(
    event: CandleEvent,
    aggregator: &RwLock<CandleAggregator>,
    broadcaster: &RoomBroadcaster,
    redis: Option<&RedisCache>,
) {
    let symbol_str = event.symbol.to_string();
    let snapshot = redis.map(|_| event.candle.clone());

    {
        let mut aggregator = aggregator.write().await;
        if let Err(e) = aggregator.ingest(&symbol_str, event.candle) {
            warn!(symbol = %symbol_str, error = %e, "Dropping rejected candle");
            record_invalid_bar(&symbol_str);
            return;
        }
    }
    record_candle_ingested(&symbol_str);
    debug!(symbol = %symbol_str, "Candle ingested");

    // 최신 1분봉 스냅샷 write-through (실패는 수신에 영향 없음)
    if let (Some(redis), Some(candle)) = (redis, snapshot) {
        if let Err(e) = redis.set_candle(&symbol_str, "1m", &candle).await {
            debug!(symbol = %symbol_str, error = %e, "Snapshot cache write failed");
        }
    }

    let aggregator = aggregator.read().await;
    broadcaster
        .refresh(&event.symbol, &aggregator, Utc::now())
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone};
    use feed_core::{Candle, Interval, Symbol};
    use rust_decimal_macros::dec;

    use crate::broadcaster::RoomKey;

    fn event(time: DateTime<chrono::Utc>, close: rust_decimal::Decimal) -> CandleEvent {
        CandleEvent {
            symbol: Symbol::new("BTC", "USDT"),
            candle: Candle::new(time, dec!(1), close, dec!(1), close, dec!(1)),
        }
    }

    #[tokio::test]
    async fn test_handle_event_updates_window_and_room() {
        let aggregator = RwLock::new(CandleAggregator::default());
        let broadcaster = RoomBroadcaster::new(std::time::Duration::from_secs(1));
        let key = RoomKey::new(Symbol::new("BTC", "USDT"), Interval::M1);
        let (tx, _rx) = mpsc::channel(16);
        broadcaster.join("s1", tx, key.clone()).await;

        // 현재 시각의 분에 속하는 봉을 수신해야 refresh가 봉을 관찰
        let now = chrono::Utc::now();
        let minute = Interval::M1.bucket_start(now);
        handle_event(event(minute, dec!(5)), &aggregator, &broadcaster, None).await;

        assert_eq!(aggregator.read().await.window_len("BTC/USDT"), 1);
        let stats = broadcaster.stats().await;
        assert!(stats.rooms[0].has_candle);
    }

    #[tokio::test]
    async fn test_handle_event_drops_out_of_order() {
        let aggregator = RwLock::new(CandleAggregator::default());
        let broadcaster = RoomBroadcaster::new(std::time::Duration::from_secs(1));
        let base = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 10, 1, 0).unwrap();

        handle_event(event(base, dec!(2)), &aggregator, &broadcaster, None).await;
        // 과거 봉은 폐기되고 윈도우는 그대로
        handle_event(
            event(base - Duration::minutes(1), dec!(9)),
            &aggregator,
            &broadcaster,
            None,
        )
        .await;

        let window = aggregator.read().await.window("BTC/USDT");
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].close, dec!(2));
    }
}
