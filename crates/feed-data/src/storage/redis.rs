//! Redis cache 구현.
//!
//! 업스트림 pub/sub 버스 연결, 헬스 체크, 그리고 (심볼, 타임프레임)별
//! 최신 봉을 보관하는 캔들 스냅샷 cache를 제공합니다. 실시간 수신 루프가
//! 1분봉 스냅샷을 기록하고, 재시작 직후 빈 윈도우를 시드할 때 읽습니다.

use crate::error::{DataError, Result};
use feed_core::{Candle, RedisConfig};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Redis 연결 래퍼.
#[derive(Clone)]
pub struct RedisCache {
    client: Client,
    connection: Arc<RwLock<MultiplexedConnection>>,
    config: RedisConfig,
}

impl RedisCache {
    /// 새로운 Redis 연결을 생성합니다.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        info!("Connecting to Redis...");

        let client =
            Client::open(config.url.as_str()).map_err(|e| DataError::CacheError(e.to_string()))?;

        let connection = tokio::time::timeout(
            std::time::Duration::from_secs(config.connect_timeout_secs),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| DataError::Timeout("redis connect".to_string()))?
        .map_err(|e| DataError::CacheError(e.to_string()))?;

        info!("Redis connection established");

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(connection)),
            config: config.clone(),
        })
    }

    /// Redis 상태를 확인합니다.
    pub async fn health_check(&self) -> Result<bool> {
        let mut conn = self.connection.write().await;
        let result: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| DataError::CacheError(e.to_string()))?;

        Ok(result == "PONG")
    }

    // =========================================================================
    // 일반 Cache 작업
    // =========================================================================

    /// cache에서 값을 가져옵니다.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.connection.write().await;
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| DataError::CacheError(e.to_string()))?;

        match value {
            Some(json) => {
                let parsed = serde_json::from_str(&json)
                    .map_err(|e| DataError::SerializationError(e.to_string()))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    /// 기본 TTL로 cache에 값을 설정합니다.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, self.config.default_ttl_secs)
            .await
    }

    /// 사용자 정의 TTL로 cache에 값을 설정합니다.
    pub async fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| DataError::SerializationError(e.to_string()))?;

        let mut conn = self.connection.write().await;
        let _: () = conn
            .set_ex(key, json, ttl_secs)
            .await
            .map_err(|e| DataError::CacheError(e.to_string()))?;

        Ok(())
    }

    // =========================================================================
    // 캔들 스냅샷 Cache
    // =========================================================================

    /// 캔들 스냅샷용 cache 키.
    fn candle_key(symbol: &str, timeframe: &str) -> String {
        format!("candle:{}:{}", symbol, timeframe)
    }

    /// (심볼, 타임프레임)의 최신 봉 스냅샷을 저장합니다.
    pub async fn set_candle(&self, symbol: &str, timeframe: &str, candle: &Candle) -> Result<()> {
        let key = Self::candle_key(symbol, timeframe);
        self.set(&key, candle).await
    }

    /// cache된 최신 봉 스냅샷을 가져옵니다.
    pub async fn get_candle(&self, symbol: &str, timeframe: &str) -> Result<Option<Candle>> {
        let key = Self::candle_key(symbol, timeframe);
        self.get(&key).await
    }

    // =========================================================================
    // 실시간 데이터용 Pub/Sub
    // =========================================================================

    /// 채널에 메시지를 발행합니다.
    pub async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| DataError::SerializationError(e.to_string()))?;

        let mut conn = self.connection.write().await;
        let _: () = conn
            .publish(channel, json)
            .await
            .map_err(|e| DataError::CacheError(e.to_string()))?;

        Ok(())
    }

    /// 구독용 pubsub 연결을 가져옵니다.
    pub async fn get_pubsub(&self) -> Result<redis::aio::PubSub> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| DataError::CacheError(e.to_string()))?;

        Ok(pubsub)
    }
}
