//! 구독-팬아웃 시나리오 통합 테스트.
//!
//! 어그리게이터, 브로드캐스터, 세션 프로토콜을 실제 네트워크 없이
//! 구성 요소 수준에서 연결해 end-to-end 동작을 검증합니다.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use feed_api::broadcaster::RoomKey;
use feed_api::websocket::handler::process_client_message;
use feed_api::websocket::messages::{ClientMessage, Outbound, ServerMessage};
use feed_api::{AppState, HistoryService};
use feed_core::{Candle, FeedResult, Interval, MarketConfig, Symbol};
use feed_data::HistorySource;

/// 어그리게이터 윈도우를 그대로 돌려주는 히스토리 소스.
struct WindowHistory {
    candles: Vec<Candle>,
}

#[async_trait]
impl HistorySource for WindowHistory {
    async fn fetch(
        &self,
        _symbol: &Symbol,
        _interval: Interval,
        limit: usize,
    ) -> FeedResult<Vec<Candle>> {
        let skip = self.candles.len().saturating_sub(limit);
        Ok(self.candles[skip..].to_vec())
    }
}

fn bar(
    time: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
) -> Candle {
    Candle::new(time, open, high, low, close, volume)
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

/// 히스토리가 설정된 테스트 상태를 생성하고 어그리게이터를 예열합니다.
async fn state_with_window(candles: Vec<Candle>) -> AppState {
    let state = AppState::new(MarketConfig::default());
    state
        .aggregator
        .write()
        .await
        .initialize("BTC/USDT", candles.clone());

    state.with_history(Arc::new(HistoryService::new(
        Arc::new(WindowHistory { candles }),
        Duration::from_secs(1),
    )))
}

async fn subscribe(
    state: &AppState,
    session_id: &str,
    outbound: &mpsc::Sender<Outbound>,
    interval: &str,
    initial_bars: Option<i64>,
) {
    let message = ClientMessage::Subscribe {
        symbol: "BTC/USDT".to_string(),
        interval: interval.to_string(),
        initial_bars,
    };
    assert!(process_client_message(session_id, message, state, outbound).await);
}

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(outbound) = rx.try_recv() {
        if let Outbound::Message(message) = outbound {
            messages.push(message);
        }
    }
    messages
}

// ============================================================================
// S1: 구독 후 업데이트
// ============================================================================

#[tokio::test]
async fn test_subscribe_then_update() {
    let base = base_time();
    let window = vec![
        bar(base, dec!(1), dec!(2), dec!(1), dec!(2), dec!(1)),
        bar(
            base + chrono::Duration::minutes(1),
            dec!(2),
            dec!(3),
            dec!(2),
            dec!(3),
            dec!(1),
        ),
        bar(
            base + chrono::Duration::minutes(2),
            dec!(3),
            dec!(4),
            dec!(3),
            dec!(4),
            dec!(1),
        ),
    ];
    let state = state_with_window(window).await;
    let (tx, mut rx) = mpsc::channel(64);
    state
        .sessions
        .register("s1", tx.clone(), CancellationToken::new())
        .await;

    subscribe(&state, "s1", &tx, "1m", Some(3)).await;

    // initial: 정확히 3개의 봉, 시간 오름차순
    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        ServerMessage::Initial { bars, interval, .. } => {
            assert_eq!(*interval, Interval::M1);
            assert_eq!(bars.len(), 3);
            assert!(bars.windows(2).all(|pair| pair[0].time < pair[1].time));
        }
        other => panic!("Expected initial, got {:?}", other),
    }

    // 현재 봉(10:02) 업데이트 수신 후 디스패치
    let updated = bar(
        base + chrono::Duration::minutes(2),
        dec!(3),
        dec!(5),
        dec!(3),
        dec!(5),
        dec!(2),
    );
    {
        let mut aggregator = state.aggregator.write().await;
        aggregator.ingest("BTC/USDT", updated).unwrap();
    }
    {
        let aggregator = state.aggregator.read().await;
        let now = base + chrono::Duration::minutes(2) + chrono::Duration::seconds(30);
        state
            .broadcaster
            .refresh(&Symbol::new("BTC", "USDT"), &aggregator, now)
            .await;
    }
    state.broadcaster.dispatch().await;

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        ServerMessage::Update { bar, .. } => {
            assert_eq!(bar.time, base + chrono::Duration::minutes(2));
            assert_eq!(bar.close, dec!(5));
            assert_eq!(bar.volume, dec!(2));
        }
        other => panic!("Expected update, got {:?}", other),
    }
}

// ============================================================================
// S2: 상위 타임프레임 집계
// ============================================================================

#[tokio::test]
async fn test_higher_timeframe_aggregation() {
    let base = base_time();
    let state = state_with_window(vec![
        bar(base, dec!(10), dec!(12), dec!(9), dec!(11), dec!(5)),
        bar(
            base + chrono::Duration::minutes(1),
            dec!(11),
            dec!(15),
            dec!(10),
            dec!(14),
            dec!(3),
        ),
    ])
    .await;

    let aggregator = state.aggregator.read().await;
    let now = base + chrono::Duration::minutes(2);
    let current = aggregator.current("BTC/USDT", Interval::M5, now).unwrap();

    assert_eq!(current.time, base);
    assert_eq!(current.open, dec!(10));
    assert_eq!(current.high, dec!(15));
    assert_eq!(current.low, dec!(9));
    assert_eq!(current.close, dec!(14));
    assert_eq!(current.volume, dec!(8));
}

// ============================================================================
// S3: 스로틀
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_throttle_bounds_updates_per_client() {
    let base = base_time();
    let window = vec![bar(base, dec!(1), dec!(2), dec!(1), dec!(2), dec!(1))];
    let state = state_with_window(window).await;

    let (tx1, mut rx1) = mpsc::channel(64);
    let (tx2, mut rx2) = mpsc::channel(64);
    state
        .sessions
        .register("s1", tx1.clone(), CancellationToken::new())
        .await;
    state
        .sessions
        .register("s2", tx2.clone(), CancellationToken::new())
        .await;

    subscribe(&state, "s1", &tx1, "1m", Some(1)).await;
    subscribe(&state, "s2", &tx2, "1m", Some(1)).await;
    // initial 소비
    assert_eq!(drain(&mut rx1).len(), 1);
    assert_eq!(drain(&mut rx2).len(), 1);

    let symbol = Symbol::new("BTC", "USDT");
    let mut last_close = dec!(0);

    // 500ms 동안 같은 봉에 10회 업데이트, 1.5초 창에서 디스패치 시도
    for i in 0..10u32 {
        let close = Decimal::from(2 + i);
        last_close = close;
        let candle = bar(base, dec!(1), close.max(dec!(2)), dec!(1), close, dec!(1));
        {
            let mut aggregator = state.aggregator.write().await;
            aggregator.ingest("BTC/USDT", candle).unwrap();
        }
        {
            let aggregator = state.aggregator.read().await;
            state
                .broadcaster
                .refresh(&symbol, &aggregator, base + chrono::Duration::seconds(30))
                .await;
        }
        state.broadcaster.dispatch().await;
        tokio::time::advance(Duration::from_millis(50)).await;
    }

    // 잔여 창에서 추가 틱
    for _ in 0..10 {
        state.broadcaster.dispatch().await;
        tokio::time::advance(Duration::from_millis(100)).await;
    }

    for rx in [&mut rx1, &mut rx2] {
        let updates: Vec<_> = drain(rx)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Update { bar, .. } => Some(bar),
                _ => None,
            })
            .collect();

        // 1.5초 창에서 클라이언트당 최대 2회
        assert!(
            updates.len() <= 2,
            "expected at most 2 updates, got {}",
            updates.len()
        );
        assert!(!updates.is_empty());
        // 마지막 수신 봉의 close는 마지막 수신 값
        assert_eq!(updates.last().unwrap().close, last_close);
    }
}

// ============================================================================
// S4: 연결 종료 정리
// ============================================================================

#[tokio::test]
async fn test_disconnect_cleanup() {
    let base = base_time();
    let window = vec![bar(base, dec!(1), dec!(2), dec!(1), dec!(2), dec!(1))];
    let state = state_with_window(window).await;
    let (tx, mut rx) = mpsc::channel(64);
    state
        .sessions
        .register("s1", tx.clone(), CancellationToken::new())
        .await;

    for interval in ["1m", "5m", "1h"] {
        subscribe(&state, "s1", &tx, interval, Some(1)).await;
    }
    drain(&mut rx);

    let stats = state.broadcaster.stats().await;
    assert_eq!(stats.total_rooms, 3);

    // 전송 계층 종료와 동일한 정리 경로
    state.broadcaster.leave_all("s1").await;
    state.sessions.unregister("s1").await;

    let stats = state.broadcaster.stats().await;
    assert_eq!(stats.total_rooms, 0);
    assert!(stats.rooms.is_empty());
    assert_eq!(state.sessions.count().await, 0);
}

// ============================================================================
// S5: 하트비트 타임아웃
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_releases_memberships() {
    use feed_api::websocket::session::start_heartbeat_loop;

    let base = base_time();
    let window = vec![bar(base, dec!(1), dec!(2), dec!(1), dec!(2), dec!(1))];
    let state = Arc::new(state_with_window(window).await);
    let (tx, _rx) = mpsc::channel(64);
    let kill = CancellationToken::new();
    state.sessions.register("s1", tx.clone(), kill.clone()).await;
    subscribe(&state, "s1", &tx, "1m", Some(1)).await;

    let shutdown = CancellationToken::new();
    start_heartbeat_loop(
        state.sessions.clone(),
        state.broadcaster.clone(),
        Duration::from_secs(30),
        shutdown.clone(),
    );

    // Pong에 응답하지 않는 세션은 2 × HEARTBEAT_PERIOD 내에 종료됨
    tokio::time::advance(Duration::from_secs(31)).await;
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_secs(31)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    assert!(kill.is_cancelled());
    assert_eq!(state.sessions.count().await, 0);
    assert_eq!(state.broadcaster.room_count().await, 0);

    shutdown.cancel();
}

// ============================================================================
// S6: 프로토콜 에러
// ============================================================================

#[tokio::test]
async fn test_protocol_error_then_valid_subscribe() {
    let base = base_time();
    let window = vec![bar(base, dec!(1), dec!(2), dec!(1), dec!(2), dec!(1))];
    let state = state_with_window(window).await;
    let (tx, mut rx) = mpsc::channel(64);
    state
        .sessions
        .register("s1", tx.clone(), CancellationToken::new())
        .await;

    subscribe(&state, "s1", &tx, "10m", None).await;

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].to_json().unwrap(),
        r#"{"type":"error","message":"Invalid interval: 10m. Valid: 1m, 5m, 15m, 1h, 4h, 1D, 1W"}"#
    );

    // 연결은 유지되며 이어지는 유효한 구독은 성공
    subscribe(&state, "s1", &tx, "1m", Some(1)).await;
    let messages = drain(&mut rx);
    assert!(matches!(messages[0], ServerMessage::Initial { .. }));
    assert!(
        state
            .broadcaster
            .is_member("s1", &RoomKey::new(Symbol::new("BTC", "USDT"), Interval::M1))
            .await
    );
}

// ============================================================================
// 불변식 4: update 이전에 정확히 한 번의 initial
// ============================================================================

#[tokio::test]
async fn test_initial_precedes_update() {
    let base = base_time();
    let window = vec![bar(base, dec!(1), dec!(2), dec!(1), dec!(2), dec!(1))];
    let state = state_with_window(window).await;
    let (tx, mut rx) = mpsc::channel(64);
    state
        .sessions
        .register("s1", tx.clone(), CancellationToken::new())
        .await;

    subscribe(&state, "s1", &tx, "1m", Some(1)).await;

    // 룸에 봉을 채우고 디스패치
    {
        let aggregator = state.aggregator.read().await;
        state
            .broadcaster
            .refresh(
                &Symbol::new("BTC", "USDT"),
                &aggregator,
                base + chrono::Duration::seconds(30),
            )
            .await;
    }
    state.broadcaster.dispatch().await;

    let messages = drain(&mut rx);
    let initial_count = messages
        .iter()
        .filter(|m| matches!(m, ServerMessage::Initial { .. }))
        .count();
    assert_eq!(initial_count, 1);
    assert!(matches!(messages[0], ServerMessage::Initial { .. }));
    assert!(messages
        .iter()
        .skip(1)
        .all(|m| matches!(m, ServerMessage::Update { .. })));
}

// ============================================================================
// initialBars 클램프
// ============================================================================

#[tokio::test]
async fn test_initial_bars_clamped() {
    let base = base_time();
    let window: Vec<Candle> = (0..5)
        .map(|i| {
            bar(
                base + chrono::Duration::minutes(i),
                dec!(1),
                dec!(2),
                dec!(1),
                dec!(2),
                dec!(1),
            )
        })
        .collect();
    let state = state_with_window(window).await;
    let (tx, mut rx) = mpsc::channel(64);
    state
        .sessions
        .register("s1", tx.clone(), CancellationToken::new())
        .await;

    // 음수 요청은 1로 클램프
    subscribe(&state, "s1", &tx, "1m", Some(-5)).await;
    match &drain(&mut rx)[0] {
        ServerMessage::Initial { bars, .. } => assert_eq!(bars.len(), 1),
        other => panic!("Expected initial, got {:?}", other),
    }
}
