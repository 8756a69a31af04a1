//! WebSocket 메시지 타입.
//!
//! 클라이언트-서버 간 교환되는 메시지 정의.
//! 모든 메시지는 `type` 필드로 구분되는 태그드 유니온이며,
//! 필드 접근 전에 반드시 타입 판별이 이루어집니다.

use serde::{Deserialize, Serialize};

use feed_core::{Candle, Interval};

/// WebSocket 에러.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("잘못된 메시지 형식: {0}")]
    InvalidMessage(String),
    #[error("직렬화 실패: {0}")]
    SerializationError(#[from] serde_json::Error),
}

// ==================== 클라이언트 → 서버 메시지 ====================

/// 클라이언트에서 서버로 보내는 메시지.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// (심볼, 인터벌) 구독
    Subscribe {
        /// 거래 심볼 (예: "BTC/USDT")
        symbol: String,
        /// 타임프레임 문자열 (검증 전이므로 자유 형식)
        interval: String,
        /// 초기 스냅샷 봉 개수 (기본 100, [1, 1000]으로 클램프)
        #[serde(rename = "initialBars", default)]
        initial_bars: Option<i64>,
    },
    /// 구독 해제
    Unsubscribe {
        symbol: String,
        interval: String,
    },
    /// 핑 (연결 유지)
    Ping,
}

impl ClientMessage {
    /// JSON 문자열에서 파싱.
    pub fn from_json(json: &str) -> Result<Self, WsError> {
        serde_json::from_str(json).map_err(|e| WsError::InvalidMessage(e.to_string()))
    }
}

// ==================== 서버 → 클라이언트 메시지 ====================

/// 서버에서 클라이언트로 보내는 메시지.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// 구독 직후의 초기 히스토리 스냅샷 (시간 오름차순)
    Initial {
        symbol: String,
        interval: Interval,
        bars: Vec<Candle>,
    },
    /// 룸의 현재 봉 업데이트
    Update {
        symbol: String,
        interval: Interval,
        bar: Candle,
    },
    /// 에러
    Error {
        message: String,
    },
    /// 퐁 응답
    Pong,
}

impl ServerMessage {
    /// JSON 문자열로 직렬화.
    pub fn to_json(&self) -> Result<String, WsError> {
        serde_json::to_string(self).map_err(WsError::from)
    }

    /// 에러 메시지 생성 헬퍼.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// 잘못된 인터벌에 대한 에러 메시지.
    pub fn invalid_interval(given: &str) -> Self {
        Self::error(format!(
            "Invalid interval: {}. Valid: {}",
            given,
            Interval::valid_list()
        ))
    }

    /// 허용 목록에 없는 심볼에 대한 에러 메시지.
    pub fn invalid_symbol(given: &str, supported: &str) -> Self {
        Self::error(format!(
            "Invalid symbol: {}. Only {} is supported.",
            given, supported
        ))
    }
}

// ==================== 세션 송신 큐 항목 ====================

/// 세션별 송신 큐에 들어가는 항목.
///
/// 애플리케이션 메시지 외에 하트비트 Ping 프레임과 정상 종료 요청을
/// 구분하기 위해 사용합니다.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// JSON 텍스트 프레임으로 전송할 메시지
    Message(ServerMessage),
    /// WebSocket Ping 제어 프레임
    Ping,
    /// 정상 종료 코드로 연결 종료
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn test_client_message_subscribe() {
        let json = r#"{"type":"subscribe","symbol":"BTC/USDT","interval":"1m","initialBars":3}"#;
        let msg = ClientMessage::from_json(json).unwrap();

        match msg {
            ClientMessage::Subscribe {
                symbol,
                interval,
                initial_bars,
            } => {
                assert_eq!(symbol, "BTC/USDT");
                assert_eq!(interval, "1m");
                assert_eq!(initial_bars, Some(3));
            }
            _ => panic!("Expected Subscribe message"),
        }
    }

    #[test]
    fn test_client_message_subscribe_without_initial_bars() {
        let json = r#"{"type":"subscribe","symbol":"BTC/USDT","interval":"5m"}"#;
        let msg = ClientMessage::from_json(json).unwrap();

        assert!(matches!(
            msg,
            ClientMessage::Subscribe {
                initial_bars: None,
                ..
            }
        ));
    }

    #[test]
    fn test_client_message_ping() {
        let msg = ClientMessage::from_json(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_client_message_rejects_unknown_type() {
        assert!(ClientMessage::from_json(r#"{"type":"hello"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"symbol":"BTC/USDT"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_pong_serialization() {
        let json = ServerMessage::Pong.to_json().unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_invalid_interval_message_text() {
        let msg = ServerMessage::invalid_interval("10m");
        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","message":"Invalid interval: 10m. Valid: 1m, 5m, 15m, 1h, 4h, 1D, 1W"}"#
        );
    }

    #[test]
    fn test_invalid_symbol_message_text() {
        let msg = ServerMessage::invalid_symbol("DOGE/USDT", "BTC/USDT");
        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","message":"Invalid symbol: DOGE/USDT. Only BTC/USDT is supported."}"#
        );
    }

    #[test]
    fn test_update_serialization() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 10, 2, 0).unwrap();
        let bar = Candle::new(time, dec!(1), dec!(5), dec!(1), dec!(5), dec!(2));
        let msg = ServerMessage::Update {
            symbol: "BTC/USDT".to_string(),
            interval: Interval::M1,
            bar,
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"update""#));
        assert!(json.contains(r#""interval":"1m""#));
        assert!(json.contains(r#""time":"2024-03-01T10:02:00.000Z""#));
    }

    #[test]
    fn test_initial_serialization() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let msg = ServerMessage::Initial {
            symbol: "BTC/USDT".to_string(),
            interval: Interval::H4,
            bars: vec![Candle::new(time, dec!(1), dec!(2), dec!(1), dec!(2), dec!(1))],
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"initial""#));
        assert!(json.contains(r#""interval":"4h""#));
        assert!(json.contains(r#""bars":[{"#));
    }
}
