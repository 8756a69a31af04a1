//! WebSocket 세션 관리.
//!
//! 연결별 세션 상태(생존 플래그, 가입한 룸 목록, 송신 큐)와 하트비트
//! 수명 관리를 담당합니다. 세션의 가변 상태는 모두 이 관리자가
//! 소유하며, 룸 레지스트리에는 송신 큐 핸들만 전달됩니다.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcaster::{RoomBroadcaster, RoomKey};
use crate::websocket::messages::Outbound;

/// 단일 세션 상태.
struct SessionEntry {
    /// 세션 송신 큐
    outbound: mpsc::Sender<Outbound>,
    /// 연결 태스크를 강제 종료시키는 토큰
    kill: CancellationToken,
    /// 하트비트 생존 플래그
    alive: bool,
    /// 이 세션이 가입한 룸 키 집합
    rooms: HashSet<RoomKey>,
}

/// 세션 레지스트리.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    /// 새 세션 관리자를 생성합니다.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// 새 세션을 등록합니다. 생존 플래그는 true로 시작합니다.
    pub async fn register(
        &self,
        session_id: &str,
        outbound: mpsc::Sender<Outbound>,
        kill: CancellationToken,
    ) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                outbound,
                kill,
                alive: true,
                rooms: HashSet::new(),
            },
        );
    }

    /// 세션을 제거합니다.
    pub async fn unregister(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
    }

    /// 생존 플래그를 true로 설정합니다.
    ///
    /// WebSocket Pong 프레임 또는 애플리케이션 `ping` 수신 시 호출됩니다.
    pub async fn mark_alive(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.alive = true;
        }
    }

    /// 세션의 룸 집합에 키를 추가합니다.
    pub async fn add_room(&self, session_id: &str, key: RoomKey) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.rooms.insert(key);
        }
    }

    /// 세션의 룸 집합에서 키를 제거합니다.
    pub async fn remove_room(&self, session_id: &str, key: &RoomKey) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.rooms.remove(key);
        }
    }

    /// 세션이 가입한 룸 키 사본을 반환합니다.
    pub async fn rooms_of(&self, session_id: &str) -> HashSet<RoomKey> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.rooms.clone())
            .unwrap_or_default()
    }

    /// 연결된 세션 수.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 하트비트 한 패스를 수행합니다.
    ///
    /// 생존 플래그가 false인 세션은 종료 대상입니다: 연결을 하드 종료하고
    /// (종료 프레임 없이), 모든 룸에서 제거한 뒤 레지스트리에서 삭제합니다.
    /// 나머지 세션은 플래그를 false로 내리고 Ping 프레임을 큐에 넣습니다.
    /// 한 주기만 응답이 없어도 다음 패스에서 종료됩니다.
    ///
    /// 종료된 세션 ID 목록을 반환합니다.
    pub async fn heartbeat_pass(&self, broadcaster: &RoomBroadcaster) -> Vec<String> {
        let mut sessions = self.sessions.write().await;

        let dead: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| !s.alive)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &dead {
            if let Some(session) = sessions.remove(id) {
                warn!(session = %id, "Heartbeat timeout, terminating session");
                session.kill.cancel();
                broadcaster.leave_all(id).await;
            }
        }

        for (id, session) in sessions.iter_mut() {
            session.alive = false;
            if session.outbound.try_send(Outbound::Ping).is_err() {
                debug!(session = %id, "Failed to enqueue heartbeat ping");
            }
        }

        dead
    }

    /// 모든 세션에 정상 종료를 요청합니다 (shutdown 경로).
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (id, session) in sessions.iter() {
            if session.outbound.try_send(Outbound::Close).is_err() {
                // 큐가 막혀 있으면 강제 종료로 대체
                session.kill.cancel();
            }
            debug!(session = %id, "Session close requested");
        }
        sessions.clear();
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 하트비트 루프를 시작합니다.
///
/// `HEARTBEAT_PERIOD`마다 모든 세션을 순회합니다.
pub fn start_heartbeat_loop(
    sessions: Arc<SessionManager>,
    broadcaster: Arc<RoomBroadcaster>,
    period: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 시작 직후 즉시 한 번 실행되는 첫 틱은 건너뜀
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let dead = sessions.heartbeat_pass(&broadcaster).await;
                    if !dead.is_empty() {
                        info!(count = dead.len(), "Terminated unresponsive sessions");
                    }
                }
            }
        }

        info!("Heartbeat loop stopped");
    })
}
