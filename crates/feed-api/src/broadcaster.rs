//! 룸 브로드캐스터.
//!
//! (심볼, 인터벌) 룸 단위로 클라이언트를 묶고, 1초 주기의 단일 디스패치
//! 루프에서 각 룸의 현재 봉을 멤버들에게 전송합니다. 스로틀은 룸 단위로
//! 적용되며, 마지막 전송 후 `BROADCAST_PERIOD`가 지나지 않은 룸은
//! 건너뜁니다.
//!
//! 레지스트리 불변식: 멤버가 0명인 룸은 존재하지 않습니다. 룸은 첫
//! 구독에서 생성되고 마지막 멤버가 떠날 때 제거됩니다. 레지스트리 전체가
//! 단일 락으로 보호됩니다 (`leave_all`과 디스패치가 전체를 순회하므로
//! 룸별 락은 사용하지 않습니다).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use feed_core::{Candle, Interval, Symbol};

use crate::aggregator::CandleAggregator;
use crate::websocket::messages::{Outbound, ServerMessage};

/// 룸 식별자: (심볼, 인터벌) 쌍.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub symbol: Symbol,
    pub interval: Interval,
}

impl RoomKey {
    pub fn new(symbol: Symbol, interval: Interval) -> Self {
        Self { symbol, interval }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.interval)
    }
}

/// 룸 멤버 슬롯.
///
/// `ready`는 초기 스냅샷 응답이 송신 큐에 적재된 뒤에 true가 됩니다.
/// 디스패치는 ready가 아닌 멤버를 건너뛰므로, 같은 구독에서 `update`가
/// `initial`보다 먼저 전달되는 일이 없습니다.
struct ClientSlot {
    sender: mpsc::Sender<Outbound>,
    ready: bool,
}

/// 단일 룸 상태.
struct Room {
    /// 세션 ID → 멤버 슬롯
    clients: HashMap<String, ClientSlot>,
    /// 이 룸 타임프레임의 최신 집계 봉
    current_candle: Option<Candle>,
    /// 마지막 전송 시각 (한 번도 전송하지 않았으면 None)
    last_broadcast_at: Option<Instant>,
}

impl Room {
    fn new() -> Self {
        Self {
            clients: HashMap::new(),
            current_candle: None,
            last_broadcast_at: None,
        }
    }
}

/// 디스패치 한 틱의 결과.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// 전송을 수행한 룸 수
    pub rooms_dispatched: usize,
    /// 큐에 적재된 메시지 수
    pub messages_sent: usize,
    /// 송신 큐 적재 실패 수 (가득 참 또는 닫힘)
    pub send_failures: usize,
}

/// 룸별 통계 스냅샷.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub key: String,
    pub client_count: usize,
    pub has_candle: bool,
    /// 마지막 전송 후 경과 시간 (밀리초, 전송 전이면 None)
    pub last_broadcast_ms_ago: Option<u64>,
}

/// 브로드캐스터 전체 통계 스냅샷.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    pub total_rooms: usize,
    /// 룸 멤버십 합계 (같은 세션도 룸마다 1회씩 집계)
    pub total_clients: usize,
    pub rooms: Vec<RoomStats>,
}

/// 룸 레지스트리와 스로틀링된 디스패치.
pub struct RoomBroadcaster {
    rooms: RwLock<HashMap<RoomKey, Room>>,
    period: Duration,
}

impl RoomBroadcaster {
    /// 새 브로드캐스터를 생성합니다.
    pub fn new(period: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            period,
        }
    }

    /// 브로드캐스트 주기를 반환합니다.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// 세션을 룸에 추가합니다. 룸이 없으면 생성합니다.
    ///
    /// 같은 세션의 반복 join에 대해 멱등합니다. 새 멤버는 초기 스냅샷이
    /// 적재될 때까지 디스패치 대상이 아닙니다 ([`Self::mark_ready`] 참고).
    pub async fn join(&self, session_id: &str, sender: mpsc::Sender<Outbound>, key: RoomKey) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(key.clone()).or_insert_with(Room::new);
        room.clients
            .entry(session_id.to_string())
            .or_insert(ClientSlot {
                sender,
                ready: false,
            });
        debug!(room = %key, session = %session_id, clients = room.clients.len(), "Session joined room");
    }

    /// 멤버를 디스패치 대상으로 전환합니다.
    ///
    /// 구독 처리에서 `initial`(또는 에러 응답)이 송신 큐에 적재된 직후
    /// 호출됩니다.
    pub async fn mark_ready(&self, session_id: &str, key: &RoomKey) {
        let mut rooms = self.rooms.write().await;
        if let Some(slot) = rooms.get_mut(key).and_then(|r| r.clients.get_mut(session_id)) {
            slot.ready = true;
        }
    }

    /// 세션을 룸에서 제거합니다. 비게 되면 룸을 삭제합니다.
    ///
    /// 멤버가 아니면 아무 일도 하지 않습니다.
    pub async fn leave(&self, session_id: &str, key: &RoomKey) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(key) {
            room.clients.remove(session_id);
            if room.clients.is_empty() {
                rooms.remove(key);
                debug!(room = %key, "Room removed (empty)");
            }
        }
    }

    /// 세션을 모든 룸에서 제거하고, 비게 된 룸을 삭제합니다.
    pub async fn leave_all(&self, session_id: &str) {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|key, room| {
            if room.clients.remove(session_id).is_some() && room.clients.is_empty() {
                debug!(room = %key, "Room removed (empty)");
                return false;
            }
            true
        });
    }

    /// 심볼에 해당하는 모든 룸의 현재 봉을 갱신합니다.
    ///
    /// 어그리게이터가 봉을 반환하지 않는 룸은 기존 봉을 유지합니다.
    pub async fn refresh(&self, symbol: &Symbol, aggregator: &CandleAggregator, now: DateTime<Utc>) {
        let symbol_str = symbol.to_string();
        let mut rooms = self.rooms.write().await;
        for (key, room) in rooms.iter_mut() {
            if key.symbol == *symbol {
                if let Some(candle) = aggregator.current(&symbol_str, key.interval, now) {
                    room.current_candle = Some(candle);
                }
            }
        }
    }

    /// 디스패치 한 틱을 수행합니다.
    ///
    /// 멤버와 현재 봉이 있고 스로틀 조건을 만족하는 룸마다 `update`
    /// 메시지를 모든 멤버의 송신 큐에 적재합니다. 개별 적재 실패는
    /// 집계만 하고 멤버를 제거하지 않습니다 (연결 종료는 세션 계층이
    /// 감지합니다). 전송 패스 후 `last_broadcast_at`을 갱신합니다.
    pub async fn dispatch(&self) -> DispatchOutcome {
        let now = Instant::now();
        let mut outcome = DispatchOutcome::default();
        let mut rooms = self.rooms.write().await;

        for (key, room) in rooms.iter_mut() {
            if !room.clients.values().any(|slot| slot.ready) {
                continue;
            }
            let Some(candle) = room.current_candle.clone() else {
                continue;
            };
            let due = room
                .last_broadcast_at
                .map_or(true, |at| now.duration_since(at) >= self.period);
            if !due {
                continue;
            }

            let message = ServerMessage::Update {
                symbol: key.symbol.to_string(),
                interval: key.interval,
                bar: candle,
            };

            for slot in room.clients.values().filter(|slot| slot.ready) {
                match slot.sender.try_send(Outbound::Message(message.clone())) {
                    Ok(()) => outcome.messages_sent += 1,
                    Err(_) => outcome.send_failures += 1,
                }
            }

            room.last_broadcast_at = Some(now);
            outcome.rooms_dispatched += 1;
        }

        outcome
    }

    /// 통계 스냅샷을 반환합니다.
    pub async fn stats(&self) -> BroadcastStats {
        let now = Instant::now();
        let rooms = self.rooms.read().await;

        let mut room_stats: Vec<RoomStats> = rooms
            .iter()
            .map(|(key, room)| RoomStats {
                key: key.to_string(),
                client_count: room.clients.len(),
                has_candle: room.current_candle.is_some(),
                last_broadcast_ms_ago: room
                    .last_broadcast_at
                    .map(|at| now.duration_since(at).as_millis() as u64),
            })
            .collect();
        room_stats.sort_by(|a, b| a.key.cmp(&b.key));

        BroadcastStats {
            total_rooms: rooms.len(),
            total_clients: rooms.values().map(|r| r.clients.len()).sum(),
            rooms: room_stats,
        }
    }

    /// 룸 수를 반환합니다.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// 세션이 룸의 멤버인지 확인합니다 (테스트용).
    pub async fn is_member(&self, session_id: &str, key: &RoomKey) -> bool {
        self.rooms
            .read()
            .await
            .get(key)
            .is_some_and(|room| room.clients.contains_key(session_id))
    }
}

/// 1초 주기 디스패치 루프를 시작합니다.
///
/// 룸별 타이머가 아닌 단일 반복 태스크입니다.
pub fn start_dispatch_loop(
    broadcaster: Arc<RoomBroadcaster>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(broadcaster.period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = broadcaster.dispatch().await;
                    if outcome.send_failures > 0 {
                        warn!(failures = outcome.send_failures, "Broadcast send failures");
                    }
                    crate::metrics::record_dispatch(&outcome);
                }
            }
        }

        info!("Dispatch loop stopped");
    })
}
