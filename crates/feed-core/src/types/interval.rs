//! 캔들 데이터를 위한 타임프레임(인터벌) 정의.
//!
//! 이 모듈은 지원되는 시간 간격과 버킷 정렬 산술을 정의합니다.
//! 버킷 시작 시각은 UTC epoch 밀리초를 인터벌 길이로 내림하여 계산합니다.
//! `1W` 버킷 역시 동일한 epoch 모듈러 산술을 사용합니다 (ISO 주 아님).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};

/// 캔들 타임프레임.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    /// 1분봉
    #[serde(rename = "1m")]
    M1,
    /// 5분봉
    #[serde(rename = "5m")]
    M5,
    /// 15분봉
    #[serde(rename = "15m")]
    M15,
    /// 1시간봉
    #[serde(rename = "1h")]
    H1,
    /// 4시간봉
    #[serde(rename = "4h")]
    H4,
    /// 일봉
    #[serde(rename = "1D")]
    D1,
    /// 주봉
    #[serde(rename = "1W")]
    W1,
}

impl Interval {
    /// 지원되는 모든 인터벌 (정규 표기 순서).
    pub const ALL: [Interval; 7] = [
        Interval::M1,
        Interval::M5,
        Interval::M15,
        Interval::H1,
        Interval::H4,
        Interval::D1,
        Interval::W1,
    ];

    /// 이 인터벌의 길이를 밀리초로 반환합니다.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Interval::M1 => 60_000,
            Interval::M5 => 300_000,
            Interval::M15 => 900_000,
            Interval::H1 => 3_600_000,
            Interval::H4 => 14_400_000,
            Interval::D1 => 86_400_000,
            Interval::W1 => 604_800_000,
        }
    }

    /// 이 인터벌의 길이를 초 단위로 반환합니다.
    pub fn as_secs(&self) -> i64 {
        self.duration_ms() / 1000
    }

    /// 정규 인터벌 문자열을 반환합니다.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::H1 => "1h",
            Interval::H4 => "4h",
            Interval::D1 => "1D",
            Interval::W1 => "1W",
        }
    }

    /// 정규 표기 목록을 쉼표로 이어 반환합니다 (에러 메시지용).
    pub fn valid_list() -> String {
        Self::ALL
            .iter()
            .map(|i| i.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `t`가 속한 버킷의 시작 시각을 반환합니다.
    ///
    /// `⌊epoch_ms / ΔMs⌋ * ΔMs` 산술을 모든 인터벌에 동일하게 적용합니다.
    /// `1W`는 epoch 기준 모듈러이므로 주의 시작 요일이 목요일입니다.
    pub fn bucket_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let delta = self.duration_ms();
        let ms = t.timestamp_millis().div_euclid(delta) * delta;
        // div_euclid 결과는 항상 표현 가능한 범위 내에 있음
        Utc.timestamp_millis_opt(ms).single().unwrap_or(t)
    }

    /// `t`가 속한 버킷의 (시작, 끝) 반개구간을 반환합니다.
    pub fn bucket_range(&self, t: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.bucket_start(t);
        let end = start + chrono::Duration::milliseconds(self.duration_ms());
        (start, end)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::M1),
            "5m" => Ok(Interval::M5),
            "15m" => Ok(Interval::M15),
            "1h" => Ok(Interval::H1),
            "4h" => Ok(Interval::H4),
            "1D" => Ok(Interval::D1),
            "1W" => Ok(Interval::W1),
            _ => Err(format!(
                "Invalid interval: {}. Valid: {}",
                s,
                Interval::valid_list()
            )),
        }
    }
}
