//! 스트림 에러 타입.

use thiserror::Error;

/// 업스트림 구독 관련 에러.
#[derive(Debug, Error)]
pub enum StreamError {
    /// 연결 에러
    #[error("Connection error: {0}")]
    Connection(String),

    /// 연결 끊김
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// 구독 실패
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    Parse(String),

    /// 이벤트 채널 닫힘
    #[error("Event channel closed")]
    ChannelClosed,
}

impl StreamError {
    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::Connection(_) | StreamError::Disconnected(_) | StreamError::Subscribe(_)
        )
    }
}

impl From<redis::RedisError> for StreamError {
    fn from(err: redis::RedisError) -> Self {
        StreamError::Connection(err.to_string())
    }
}
