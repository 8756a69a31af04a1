//! OHLCV 캔들 타입.
//!
//! 이 모듈은 서비스 전반에서 사용되는 불변 캔들 레코드를 정의합니다.
//! `time` 필드는 해당 봉의 시작 시각이며 타임프레임 경계에 정렬됩니다.
//! 와이어 형식에서는 ISO-8601 문자열로 출력하고, 수신 시에는
//! ISO-8601 또는 epoch 밀리초 정수를 모두 허용합니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};

/// OHLCV 캔들 데이터.
///
/// 와이어 형식에서 가격/수량 필드는 JSON 숫자로 표현됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// 봉 시작 시각 (타임프레임 경계에 정렬)
    #[serde(with = "candle_time")]
    pub time: DateTime<Utc>,
    /// 시가
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    /// 고가
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    /// 저가
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    /// 종가
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    /// 거래량 (기준 자산 단위)
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    /// 거래대금 (호가 자산 단위)
    #[serde(
        rename = "quoteVolume",
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub quote_volume: Option<Decimal>,
}

impl Candle {
    /// 새 캔들을 생성합니다.
    pub fn new(
        time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: None,
        }
    }

    /// 거래대금을 설정합니다.
    pub fn with_quote_volume(mut self, quote_volume: Decimal) -> Self {
        self.quote_volume = Some(quote_volume);
        self
    }

    /// 캔들 필드의 정합성을 검증합니다.
    ///
    /// 모든 값은 음수가 아니어야 하며 `low ≤ open,close ≤ high`를
    /// 만족해야 합니다.
    pub fn validate(&self) -> FeedResult<()> {
        let prices = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ];
        for (name, value) in prices {
            if value.is_sign_negative() {
                return Err(FeedError::InvalidBar(format!(
                    "{} must be non-negative: {}",
                    name, value
                )));
            }
        }
        if let Some(qv) = self.quote_volume {
            if qv.is_sign_negative() {
                return Err(FeedError::InvalidBar(format!(
                    "quoteVolume must be non-negative: {}",
                    qv
                )));
            }
        }
        if self.low > self.high {
            return Err(FeedError::InvalidBar(format!(
                "low {} exceeds high {}",
                self.low, self.high
            )));
        }
        if self.open < self.low || self.open > self.high {
            return Err(FeedError::InvalidBar(format!(
                "open {} outside [{}, {}]",
                self.open, self.low, self.high
            )));
        }
        if self.close < self.low || self.close > self.high {
            return Err(FeedError::InvalidBar(format!(
                "close {} outside [{}, {}]",
                self.close, self.low, self.high
            )));
        }
        Ok(())
    }

    /// 캔들 범위(고가 - 저가)를 반환합니다.
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// 양봉(종가 > 시가)인지 확인합니다.
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// `time` 필드의 와이어 직렬화.
///
/// 출력: RFC 3339 UTC (밀리초 정밀도). 입력: RFC 3339 문자열 또는
/// epoch 밀리초 정수.
mod candle_time {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TimeRepr {
        Millis(i64),
        Text(String),
    }

    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match TimeRepr::deserialize(deserializer)? {
            TimeRepr::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", ms))),
            TimeRepr::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| de::Error::custom(format!("invalid ISO-8601 time: {}", e))),
        }
    }
}
