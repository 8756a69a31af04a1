//! 실시간 캔들 스트리밍을 위한 WebSocket 서버.
//!
//! 클라이언트는 (심볼, 인터벌) 쌍을 구독하고, 해당 룸의 현재 봉을
//! 초당 최대 1회 수신합니다.
//!
//! # 메시지 형식
//!
//! 모든 메시지는 JSON 형식으로 교환됩니다.
//!
//! ## 클라이언트 → 서버
//!
//! ```json
//! {"type": "subscribe", "symbol": "BTC/USDT", "interval": "1m", "initialBars": 100}
//! {"type": "unsubscribe", "symbol": "BTC/USDT", "interval": "1m"}
//! {"type": "ping"}
//! ```
//!
//! ## 서버 → 클라이언트
//!
//! ```json
//! {"type": "initial", "symbol": "BTC/USDT", "interval": "1m", "bars": [...]}
//! {"type": "update", "symbol": "BTC/USDT", "interval": "1m", "bar": {...}}
//! {"type": "error", "message": "..."}
//! {"type": "pong"}
//! ```

pub mod handler;
pub mod messages;
pub mod session;

pub use handler::{websocket_handler, websocket_router};
pub use messages::{ClientMessage, Outbound, ServerMessage, WsError};
pub use session::SessionManager;
