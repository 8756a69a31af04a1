//! 피드 서비스의 에러 타입.
//!
//! 이 모듈은 서비스 전반에서 사용되는 에러 타입을 정의합니다.
//! 에러는 처리 정책에 따라 분류됩니다:
//! - 프로토콜 에러: 클라이언트에 `error` 응답, 세션 유지
//! - 백엔드 에러: 일시적 장애, 재시도 대상
//! - 무결성 에러: 잘못된 캔들 입력, 로그 후 폐기
//! - 치명적 에러: 프로세스 종료 대상

use thiserror::Error;

/// 핵심 피드 에러.
#[derive(Debug, Error)]
pub enum FeedError {
    /// 프로토콜 에러 (잘못된 메시지, 인터벌, 심볼)
    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    /// 일시적 백엔드 에러 (히스토리 조회, 업스트림 장애)
    #[error("백엔드 에러: {0}")]
    Backend(String),

    /// 무결성 에러 (순서 위반 또는 잘못된 캔들)
    #[error("잘못된 캔들: {0}")]
    InvalidBar(String),

    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 직렬화 에러
    #[error("직렬화 에러: {0}")]
    Serialization(String),

    /// 네트워크 에러
    #[error("네트워크 에러: {0}")]
    Network(String),

    /// 타임아웃
    #[error("타임아웃: {0}")]
    Timeout(String),

    /// 치명적 에러 (복구 불가능한 시작 실패)
    #[error("치명적 에러: {0}")]
    Fatal(String),
}

/// 피드 작업을 위한 Result 타입.
pub type FeedResult<T> = Result<T, FeedError>;

impl FeedError {
    /// 재시도 가능한 에러인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::Backend(_) | FeedError::Network(_) | FeedError::Timeout(_)
        )
    }

    /// 치명적인 에러인지 확인합니다.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Fatal(_))
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Serialization(err.to_string())
    }
}
