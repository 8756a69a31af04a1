//! 캔들 어그리게이터.
//!
//! 심볼별 1분봉 롤링 윈도우를 유지하고, 요청된 타임프레임의 현재 봉을
//! 윈도우에서 파생합니다. 순수 인메모리 구조이며 블로킹하지 않습니다.
//! 동시성 제어(락)는 소유자 측에서 수행합니다.
//!
//! 윈도우 불변식:
//! - 길이는 `max_window` 이하
//! - `time`은 엄격히 증가 (동일 시각 수신은 말단 봉 덮어쓰기)

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use feed_core::{Candle, FeedError, FeedResult, Interval};

/// 심볼당 유지하는 1분봉 기본 개수 (24시간).
pub const MAX_1M_WINDOW: usize = 1440;

/// 심볼별 1분봉 윈도우와 타임프레임 집계.
pub struct CandleAggregator {
    windows: HashMap<String, VecDeque<Candle>>,
    max_window: usize,
}

impl CandleAggregator {
    /// 새 어그리게이터를 생성합니다.
    pub fn new(max_window: usize) -> Self {
        Self {
            windows: HashMap::new(),
            max_window,
        }
    }

    /// 1분봉을 수신합니다.
    ///
    /// 말단 봉과 같은 `time`이면 덮어쓰고, 더 새로우면 추가합니다.
    /// 추가 후 윈도우가 `max_window`를 넘으면 머리를 제거합니다.
    /// 말단보다 오래된 봉은 `InvalidBar`로 거부합니다.
    pub fn ingest(&mut self, symbol: &str, candle: Candle) -> FeedResult<()> {
        let window = self.windows.entry(symbol.to_string()).or_default();

        if let Some(tail) = window.back_mut() {
            if candle.time < tail.time {
                return Err(FeedError::InvalidBar(format!(
                    "out-of-order candle for {}: {} < {}",
                    symbol, candle.time, tail.time
                )));
            }
            if candle.time == tail.time {
                *tail = candle;
                return Ok(());
            }
        }

        window.push_back(candle);
        if window.len() > self.max_window {
            window.pop_front();
        }
        Ok(())
    }

    /// 윈도우를 주어진 캔들로 교체합니다.
    ///
    /// 입력을 시간순으로 정렬하고 동일 시각 봉은 마지막 것만 유지한 뒤,
    /// 최근 `max_window`개로 잘라 저장합니다. 내용에 대해 멱등합니다.
    pub fn initialize(&mut self, symbol: &str, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.time);

        let mut window: VecDeque<Candle> = VecDeque::with_capacity(candles.len());
        for candle in candles {
            match window.back_mut() {
                Some(tail) if tail.time == candle.time => *tail = candle,
                _ => window.push_back(candle),
            }
        }
        while window.len() > self.max_window {
            window.pop_front();
        }

        self.windows.insert(symbol.to_string(), window);
    }

    /// `now`가 속한 봉의 집계를 반환합니다.
    ///
    /// 해당 버킷에 1분봉이 하나도 없으면 `None`을 반환합니다.
    /// 집계 봉의 `time`은 버킷 시작 시각으로 재기준됩니다.
    /// `quoteVolume`은 모든 구성 봉에 값이 없을 때에만 생략되며,
    /// 일부만 있는 경우 누락분은 0으로 간주합니다.
    pub fn current(&self, symbol: &str, interval: Interval, now: DateTime<Utc>) -> Option<Candle> {
        let window = self.windows.get(symbol)?;
        let (start, end) = interval.bucket_range(now);

        if interval == Interval::M1 {
            // 1분봉은 말단 봉을 그대로 반환
            let tail = window.back()?;
            return (tail.time >= start && tail.time < end).then(|| tail.clone());
        }

        let mut aggregate: Option<Candle> = None;
        let mut quote_sum = Decimal::ZERO;
        let mut quote_present = false;

        for candle in window.iter().filter(|c| c.time >= start && c.time < end) {
            match aggregate.as_mut() {
                None => {
                    let mut first = candle.clone();
                    first.time = start;
                    first.quote_volume = None;
                    aggregate = Some(first);
                }
                Some(agg) => {
                    if candle.high > agg.high {
                        agg.high = candle.high;
                    }
                    if candle.low < agg.low {
                        agg.low = candle.low;
                    }
                    agg.close = candle.close;
                    agg.volume += candle.volume;
                }
            }
            if let Some(qv) = candle.quote_volume {
                quote_present = true;
                quote_sum += qv;
            }
        }

        let mut aggregate = aggregate?;
        if quote_present {
            aggregate.quote_volume = Some(quote_sum);
        }
        Some(aggregate)
    }

    /// 심볼의 1분봉 윈도우 사본을 반환합니다 (테스트/통계용).
    pub fn window(&self, symbol: &str) -> Vec<Candle> {
        self.windows
            .get(symbol)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 심볼의 윈도우 길이를 반환합니다.
    pub fn window_len(&self, symbol: &str) -> usize {
        self.windows.get(symbol).map_or(0, |w| w.len())
    }

    /// 심볼별 윈도우 길이 스냅샷을 반환합니다.
    pub fn window_lens(&self) -> HashMap<String, usize> {
        self.windows
            .iter()
            .map(|(symbol, window)| (symbol.clone(), window.len()))
            .collect()
    }
}

impl Default for CandleAggregator {
    fn default() -> Self {
        Self::new(MAX_1M_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    const SYMBOL: &str = "BTC/USDT";

    fn minute(base: DateTime<Utc>, offset: i64) -> DateTime<Utc> {
        base + Duration::minutes(offset)
    }

    fn candle(time: DateTime<Utc>, close: Decimal, volume: Decimal) -> Candle {
        Candle::new(time, dec!(1), dec!(100), dec!(1), close, volume)
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_ingest_appends_in_order() {
        let mut agg = CandleAggregator::default();
        let base = base_time();

        for i in 0..3 {
            agg.ingest(SYMBOL, candle(minute(base, i), dec!(2), dec!(1)))
                .unwrap();
        }

        let window = agg.window(SYMBOL);
        assert_eq!(window.len(), 3);
        assert!(window.windows(2).all(|pair| pair[0].time < pair[1].time));
    }

    #[test]
    fn test_ingest_overwrites_same_time() {
        let mut agg = CandleAggregator::default();
        let base = base_time();

        agg.ingest(SYMBOL, candle(base, dec!(2), dec!(1))).unwrap();
        agg.ingest(SYMBOL, candle(base, dec!(5), dec!(2))).unwrap();

        let window = agg.window(SYMBOL);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].close, dec!(5));
        assert_eq!(window[0].volume, dec!(2));
    }

    #[test]
    fn test_ingest_rejects_out_of_order() {
        let mut agg = CandleAggregator::default();
        let base = base_time();

        agg.ingest(SYMBOL, candle(minute(base, 1), dec!(2), dec!(1)))
            .unwrap();
        let result = agg.ingest(SYMBOL, candle(base, dec!(2), dec!(1)));

        assert!(matches!(result, Err(FeedError::InvalidBar(_))));
        // 거부된 봉은 윈도우에 반영되지 않음
        assert_eq!(agg.window_len(SYMBOL), 1);
    }

    #[test]
    fn test_ingest_evicts_beyond_cap() {
        let mut agg = CandleAggregator::new(3);
        let base = base_time();

        for i in 0..5 {
            agg.ingest(SYMBOL, candle(minute(base, i), dec!(2), dec!(1)))
                .unwrap();
        }

        let window = agg.window(SYMBOL);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].time, minute(base, 2));
        assert_eq!(window[2].time, minute(base, 4));
    }

    #[test]
    fn test_initialize_sorts_and_truncates() {
        let mut agg = CandleAggregator::new(2);
        let base = base_time();

        // 역순 입력도 정렬되어 마지막 2개만 유지
        let candles = vec![
            candle(minute(base, 2), dec!(4), dec!(1)),
            candle(base, dec!(2), dec!(1)),
            candle(minute(base, 1), dec!(3), dec!(1)),
        ];
        agg.initialize(SYMBOL, candles);

        let window = agg.window(SYMBOL);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].time, minute(base, 1));
        assert_eq!(window[1].time, minute(base, 2));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let mut agg = CandleAggregator::default();
        let base = base_time();
        let candles = vec![
            candle(base, dec!(2), dec!(1)),
            candle(minute(base, 1), dec!(3), dec!(1)),
        ];

        agg.initialize(SYMBOL, candles.clone());
        let first = agg.window(SYMBOL);
        agg.initialize(SYMBOL, candles);
        assert_eq!(agg.window(SYMBOL), first);
    }

    #[test]
    fn test_ingest_same_time_twice_equals_last() {
        let mut agg_a = CandleAggregator::default();
        let mut agg_b = CandleAggregator::default();
        let base = base_time();

        agg_a.ingest(SYMBOL, candle(base, dec!(2), dec!(1))).unwrap();
        agg_a.ingest(SYMBOL, candle(base, dec!(7), dec!(3))).unwrap();
        agg_b.ingest(SYMBOL, candle(base, dec!(7), dec!(3))).unwrap();

        assert_eq!(agg_a.window(SYMBOL), agg_b.window(SYMBOL));
    }

    #[test]
    fn test_current_1m_returns_tail() {
        let mut agg = CandleAggregator::default();
        let base = base_time();

        agg.ingest(SYMBOL, candle(base, dec!(2), dec!(1))).unwrap();
        agg.ingest(SYMBOL, candle(minute(base, 1), dec!(3), dec!(2)))
            .unwrap();

        let now = minute(base, 1) + Duration::seconds(30);
        let current = agg.current(SYMBOL, Interval::M1, now).unwrap();
        assert_eq!(current.time, minute(base, 1));
        assert_eq!(current.close, dec!(3));

        // 현재 분에 봉이 없으면 None
        let now = minute(base, 2);
        assert!(agg.current(SYMBOL, Interval::M1, now).is_none());
    }

    #[test]
    fn test_current_5m_aggregates_bucket() {
        let mut agg = CandleAggregator::default();
        let base = base_time();

        agg.ingest(
            SYMBOL,
            Candle::new(base, dec!(10), dec!(12), dec!(9), dec!(11), dec!(5)),
        )
        .unwrap();
        agg.ingest(
            SYMBOL,
            Candle::new(minute(base, 1), dec!(11), dec!(15), dec!(10), dec!(14), dec!(3)),
        )
        .unwrap();

        let now = minute(base, 2);
        let current = agg.current(SYMBOL, Interval::M5, now).unwrap();
        assert_eq!(current.time, base);
        assert_eq!(current.open, dec!(10));
        assert_eq!(current.high, dec!(15));
        assert_eq!(current.low, dec!(9));
        assert_eq!(current.close, dec!(14));
        assert_eq!(current.volume, dec!(8));
        assert!(current.quote_volume.is_none());
    }

    #[test]
    fn test_current_5m_bucket_boundary() {
        let mut agg = CandleAggregator::default();
        let base = base_time();

        agg.ingest(SYMBOL, candle(base, dec!(2), dec!(1))).unwrap();

        // 10:04:59.999는 아직 [10:00, 10:05) 버킷
        let now = minute(base, 4) + Duration::seconds(59) + Duration::milliseconds(999);
        assert!(agg.current(SYMBOL, Interval::M5, now).is_some());

        // 10:05:00.000부터는 [10:05, 10:10) 버킷이며 봉이 없음
        let now = minute(base, 5);
        assert!(agg.current(SYMBOL, Interval::M5, now).is_none());
    }

    #[test]
    fn test_current_single_in_progress_candle_rebased() {
        let mut agg = CandleAggregator::default();
        let base = base_time();
        let in_progress = minute(base, 3);

        agg.ingest(SYMBOL, candle(in_progress, dec!(2), dec!(1)))
            .unwrap();

        let current = agg
            .current(SYMBOL, Interval::M5, in_progress + Duration::seconds(10))
            .unwrap();
        // 단일 구성 봉의 집계는 그 봉과 같고, time만 버킷 시작으로 재기준
        assert_eq!(current.time, base);
        assert_eq!(current.close, dec!(2));
        assert_eq!(current.volume, dec!(1));
    }

    #[test]
    fn test_current_quote_volume_partial_contributors() {
        let mut agg = CandleAggregator::default();
        let base = base_time();

        agg.ingest(SYMBOL, candle(base, dec!(2), dec!(1))).unwrap();
        agg.ingest(
            SYMBOL,
            candle(minute(base, 1), dec!(3), dec!(1)).with_quote_volume(dec!(40)),
        )
        .unwrap();

        // 일부 봉에만 quoteVolume이 있으면 누락분은 0으로 합산
        let current = agg.current(SYMBOL, Interval::M5, minute(base, 2)).unwrap();
        assert_eq!(current.quote_volume, Some(dec!(40)));
    }

    #[test]
    fn test_current_unknown_symbol() {
        let agg = CandleAggregator::default();
        assert!(agg.current("ETH/USDT", Interval::M5, base_time()).is_none());
        assert_eq!(agg.window_len("ETH/USDT"), 0);
    }

    #[test]
    fn test_window_cap_invariant() {
        let mut agg = CandleAggregator::default();
        let base = base_time();

        for i in 0..(MAX_1M_WINDOW as i64 + 100) {
            agg.ingest(SYMBOL, candle(minute(base, i), dec!(2), dec!(1)))
                .unwrap();
        }

        assert_eq!(agg.window_len(SYMBOL), MAX_1M_WINDOW);
    }
}
