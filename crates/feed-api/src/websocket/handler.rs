//! WebSocket 연결 handler.
//!
//! Axum WebSocket 엔드포인트 및 메시지 처리. 연결마다 송신 태스크와
//! 수신 태스크를 분리해 실행하며, 송신은 세션별 유한 큐를 통해서만
//! 이루어집니다 (브로드캐스터의 비블로킹 전송 전제).

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use feed_core::{Interval, Symbol};

use crate::broadcaster::RoomKey;
use crate::metrics::{decrement_websocket_connections, increment_websocket_connections};
use crate::state::AppState;
use crate::websocket::messages::{ClientMessage, Outbound, ServerMessage};

/// 세션 송신 큐 용량.
///
/// 큐가 가득 차면 해당 디스패치 패스에서 전송 실패로 집계됩니다.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// WebSocket 업그레이드 핸들러.
///
/// 루트 경로의 HTTP 연결을 WebSocket으로 업그레이드합니다.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// WebSocket 연결 처리.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = uuid::Uuid::new_v4().to_string();
    info!(session = %session_id, "WebSocket connected");

    increment_websocket_connections();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_CAPACITY);
    let kill = CancellationToken::new();
    state
        .sessions
        .register(&session_id, outbound_tx.clone(), kill.clone())
        .await;

    let (mut sender, mut receiver) = socket.split();

    // 송신 태스크: 세션 큐를 소켓으로 배출
    let send_session_id = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Message(message) => match message.to_json() {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(session = %send_session_id, error = %e, "Failed to serialize message");
                    }
                },
                Outbound::Ping => {
                    if sender
                        .send(Message::Ping(axum::body::Bytes::new()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: Utf8Bytes::from_static("server shutdown"),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // 수신 태스크: 클라이언트 프레임 처리
    let recv_session_id = session_id.clone();
    let recv_state = state.clone();
    let recv_outbound = outbound_tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(frame) => {
                    if !handle_frame(&recv_session_id, frame, &recv_state, &recv_outbound).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(session = %recv_session_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    // 어느 한쪽이 끝나거나 하트비트가 세션을 강제 종료하면 정리
    tokio::select! {
        _ = &mut send_task => {
            debug!(session = %session_id, "Send task ended");
        }
        _ = &mut recv_task => {
            debug!(session = %session_id, "Receive task ended");
        }
        _ = kill.cancelled() => {
            debug!(session = %session_id, "Session killed");
        }
    }
    send_task.abort();
    recv_task.abort();

    // 세션 정리: 모든 룸에서 제거 후 등록 해제
    state.broadcaster.leave_all(&session_id).await;
    state.sessions.unregister(&session_id).await;

    decrement_websocket_connections();
    info!(session = %session_id, "WebSocket disconnected");
}

/// 수신 프레임 처리.
///
/// # Returns
///
/// `true`면 연결 유지, `false`면 연결 종료
async fn handle_frame(
    session_id: &str,
    frame: Message,
    state: &AppState,
    outbound: &mpsc::Sender<Outbound>,
) -> bool {
    match frame {
        Message::Text(text) => {
            match ClientMessage::from_json(text.as_str()) {
                Ok(message) => {
                    process_client_message(session_id, message, state, outbound).await
                }
                Err(e) => {
                    debug!(session = %session_id, error = %e, "Invalid client message");
                    send(outbound, ServerMessage::error(format!("Invalid message: {}", e))).await;
                    true
                }
            }
        }
        Message::Binary(_) => {
            warn!(session = %session_id, "Binary messages not supported");
            true
        }
        Message::Ping(_) => {
            // Pong 응답은 전송 계층이 처리
            state.sessions.mark_alive(session_id).await;
            true
        }
        Message::Pong(_) => {
            state.sessions.mark_alive(session_id).await;
            true
        }
        Message::Close(_) => {
            debug!(session = %session_id, "Close frame received");
            false
        }
    }
}

/// 파싱된 클라이언트 메시지 처리.
///
/// # Returns
///
/// `true`면 연결 유지, `false`면 연결 종료
pub async fn process_client_message(
    session_id: &str,
    message: ClientMessage,
    state: &AppState,
    outbound: &mpsc::Sender<Outbound>,
) -> bool {
    match message {
        ClientMessage::Subscribe {
            symbol,
            interval,
            initial_bars,
        } => {
            handle_subscribe(session_id, &symbol, &interval, initial_bars, state, outbound).await;
            true
        }

        ClientMessage::Unsubscribe { symbol, interval } => {
            let Ok(interval) = Interval::from_str(&interval) else {
                send(outbound, ServerMessage::invalid_interval(&interval)).await;
                return true;
            };
            let Some(symbol) = Symbol::from_string(&symbol) else {
                // 허용 목록에 없는 심볼의 룸은 존재하지 않으므로 조용히 성공
                return true;
            };

            let key = RoomKey::new(symbol, interval);
            state.broadcaster.leave(session_id, &key).await;
            state.sessions.remove_room(session_id, &key).await;
            debug!(session = %session_id, room = %key, "Session unsubscribed");
            // 성공 시 응답 없음
            true
        }

        ClientMessage::Ping => {
            // 애플리케이션 레벨 ping도 하트비트 생존 신호로 취급
            state.sessions.mark_alive(session_id).await;
            send(outbound, ServerMessage::Pong).await;
            true
        }
    }
}

/// 구독 요청 처리.
///
/// 검증 → 룸 가입 → (필요 시) 지연 warmup → 히스토리 조회 → `initial`
/// 응답 순서로 진행합니다. 히스토리 조회가 실패해도 룸 멤버십은
/// 유지되어 다음 틱부터 update를 수신할 수 있습니다.
async fn handle_subscribe(
    session_id: &str,
    symbol: &str,
    interval: &str,
    initial_bars: Option<i64>,
    state: &AppState,
    outbound: &mpsc::Sender<Outbound>,
) {
    let parsed_interval = match Interval::from_str(interval) {
        Ok(i) => i,
        Err(_) => {
            send(outbound, ServerMessage::invalid_interval(interval)).await;
            return;
        }
    };

    if !state.market.is_supported(symbol) {
        send(
            outbound,
            ServerMessage::invalid_symbol(symbol, &state.market.supported_list()),
        )
        .await;
        return;
    }
    let Some(parsed_symbol) = Symbol::from_string(symbol) else {
        send(
            outbound,
            ServerMessage::invalid_symbol(symbol, &state.market.supported_list()),
        )
        .await;
        return;
    };

    // 범위를 벗어난 값은 [1, max]로 클램프
    let limit = initial_bars
        .map(|n| n.clamp(1, state.market.max_initial_bars))
        .unwrap_or(state.market.default_initial_bars);

    let key = RoomKey::new(parsed_symbol.clone(), parsed_interval);
    state
        .broadcaster
        .join(session_id, outbound.clone(), key.clone())
        .await;
    state.sessions.add_room(session_id, key.clone()).await;
    debug!(session = %session_id, room = %key, limit, "Session subscribed");

    let reply = match &state.history {
        Some(history) => {
            // 1분봉 외 타임프레임에서 윈도우가 비어 있으면 지연 warmup
            if parsed_interval != Interval::M1 {
                let window_empty =
                    state.aggregator.read().await.window_len(symbol) == 0;
                if window_empty {
                    if let Err(e) = history
                        .warm(&parsed_symbol, &state.aggregator, state.market.max_1m_window)
                        .await
                    {
                        warn!(symbol = %symbol, error = %e, "Lazy warmup failed");
                    }
                }
            }

            match history.fetch_initial(&parsed_symbol, parsed_interval, limit).await {
                Ok(bars) => ServerMessage::Initial {
                    symbol: symbol.to_string(),
                    interval: parsed_interval,
                    bars,
                },
                Err(e) => {
                    warn!(session = %session_id, room = %key, error = %e, "History fetch failed");
                    ServerMessage::error("Failed to subscribe to candles")
                }
            }
        }
        None => {
            warn!(session = %session_id, room = %key, "History source not configured");
            ServerMessage::error("Failed to subscribe to candles")
        }
    };

    send(outbound, reply).await;
    // initial(또는 에러)이 큐에 적재된 뒤부터 update 디스패치 대상
    state.broadcaster.mark_ready(session_id, &key).await;
}

/// 세션 송신 큐에 메시지를 적재합니다.
async fn send(outbound: &mpsc::Sender<Outbound>, message: ServerMessage) {
    if outbound.send(Outbound::Message(message)).await.is_err() {
        debug!("Outbound queue closed");
    }
}

/// WebSocket 라우터 생성.
pub fn websocket_router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(websocket_handler))
}
