//! 업스트림 캔들 구독자.
//!
//! `candles:{symbol}:1m` 채널을 구독하여 수신한 캔들을 mpsc 채널로
//! 전달합니다. 전송 계층 장애 시 지수 백오프(초기 500ms, 상한 30s,
//! 지터 포함)로 재연결하며, 재연결 후 모든 채널을 다시 구독합니다.
//! 파싱/검증 실패는 로그 후 폐기합니다.

use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use feed_core::{Candle, StreamConfig, Symbol};

use crate::error::StreamError;

/// 업스트림에서 수신한 1분봉 이벤트.
#[derive(Debug, Clone)]
pub struct CandleEvent {
    /// 거래 심볼
    pub symbol: Symbol,
    /// 1분봉 캔들
    pub candle: Candle,
}

/// 업스트림 pub/sub 캔들 구독자.
pub struct CandleSubscriber {
    redis_url: String,
    channels: Vec<String>,
    config: StreamConfig,
}

impl CandleSubscriber {
    /// 새로운 구독자를 생성합니다.
    ///
    /// `symbols`의 각 심볼에 대해 `candles:{symbol}:1m` 채널을 추적합니다.
    pub fn new(redis_url: impl Into<String>, symbols: &[String], config: StreamConfig) -> Self {
        let channels = symbols.iter().map(|s| Self::channel_for(s)).collect();
        Self {
            redis_url: redis_url.into(),
            channels,
            config,
        }
    }

    /// 심볼의 1분봉 채널 이름을 반환합니다.
    pub fn channel_for(symbol: &str) -> String {
        format!("candles:{}:1m", symbol)
    }

    /// 추적 중인 채널 목록.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// 구독 루프를 실행합니다.
    ///
    /// 연결이 끊어지면 백오프 후 재연결을 반복하며, `shutdown`이
    /// 취소되거나 이벤트 수신자가 닫히면 종료합니다.
    pub async fn run(self, tx: mpsc::Sender<CandleEvent>, shutdown: CancellationToken) {
        let initial = Duration::from_millis(self.config.reconnect_initial_ms);
        let max = Duration::from_secs(self.config.reconnect_max_secs);
        let mut backoff = initial;

        loop {
            if shutdown.is_cancelled() {
                info!("Upstream subscriber stopped");
                return;
            }

            match self.connect().await {
                Ok(mut pubsub) => {
                    info!(
                        channels = self.channels.len(),
                        "Subscribed to upstream candle channels"
                    );
                    // 연결에 성공했으므로 백오프 초기화
                    backoff = initial;

                    match self.consume(&mut pubsub, &tx, &shutdown).await {
                        Ok(()) => {
                            info!("Upstream subscriber stopped");
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "Upstream connection lost, reconnecting");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to upstream, retrying");
                }
            }

            let delay = with_jitter(backoff);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnect backoff");
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Upstream subscriber stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = next_backoff(backoff, max);
        }
    }

    /// pub/sub 연결을 생성하고 모든 채널을 구독합니다.
    async fn connect(&self) -> Result<redis::aio::PubSub, StreamError> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;

        for channel in &self.channels {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| StreamError::Subscribe(e.to_string()))?;
        }

        Ok(pubsub)
    }

    /// 메시지 수신 루프.
    ///
    /// `Ok(())`은 정상 종료(취소 또는 수신자 닫힘), `Err`은 전송 계층
    /// 장애를 의미합니다.
    async fn consume(
        &self,
        pubsub: &mut redis::aio::PubSub,
        tx: &mpsc::Sender<CandleEvent>,
        shutdown: &CancellationToken,
    ) -> Result<(), StreamError> {
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(StreamError::Disconnected("pubsub stream ended".to_string()));
                    };

                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Invalid upstream payload encoding");
                            continue;
                        }
                    };

                    match parse_event(&channel, &payload) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                // 소비자가 사라졌으므로 더 수신할 이유가 없음
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Discarding unparsable candle message");
                        }
                    }
                }
            }
        }
    }
}

/// 채널 이름과 페이로드에서 캔들 이벤트를 파싱합니다.
fn parse_event(channel: &str, payload: &str) -> Result<CandleEvent, StreamError> {
    let parts: Vec<&str> = channel.splitn(3, ':').collect();
    let symbol = match parts.as_slice() {
        ["candles", symbol, "1m"] => Symbol::from_string(symbol)
            .ok_or_else(|| StreamError::Parse(format!("invalid symbol in channel: {}", channel)))?,
        _ => {
            return Err(StreamError::Parse(format!(
                "unexpected channel: {}",
                channel
            )))
        }
    };

    let candle: Candle =
        serde_json::from_str(payload).map_err(|e| StreamError::Parse(e.to_string()))?;
    candle
        .validate()
        .map_err(|e| StreamError::Parse(e.to_string()))?;

    Ok(CandleEvent { symbol, candle })
}

/// 다음 백오프 간격을 계산합니다 (2배 증가, 상한 적용).
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// 백오프 간격에 지터를 더합니다 (최대 +25%).
fn with_jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 4);
    Duration::from_millis(base_ms + jitter)
}
