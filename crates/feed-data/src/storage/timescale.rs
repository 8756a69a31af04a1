//! TimescaleDB 스토리지 구현.
//!
//! TimescaleDB(PostgreSQL + TimescaleDB 확장)의 1분봉 하이퍼테이블에 대한
//! repository 패턴 구현을 제공합니다. 상위 타임프레임 조회는 `time_bucket`
//! 집계로 정렬된 봉을 반환하며, 삽입 경로는 운영 도구와 테스트 픽스처
//! 적재에 사용됩니다.

use crate::error::{DataError, Result};
use chrono::{DateTime, Duration, Utc};
use feed_core::{Candle, DatabaseConfig, Interval};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};

/// 데이터베이스 연결 풀 래퍼.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 새로운 데이터베이스 연결 풀을 생성합니다.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| DataError::ConnectionError(e.to_string()))?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// 기존 연결 풀에서 Database 인스턴스를 생성합니다.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 내부 연결 풀을 반환합니다.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 데이터베이스 상태를 확인합니다.
    pub async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| DataError::QueryError(e.to_string()))?;
        Ok(true)
    }
}

/// 캔들 데이터베이스 레코드.
#[derive(Debug, Clone, FromRow)]
pub struct CandleRecord {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Option<Decimal>,
}

impl CandleRecord {
    /// 도메인 Candle로 변환합니다.
    pub fn into_candle(self) -> Candle {
        Candle {
            time: self.time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: self.quote_volume,
        }
    }
}

/// OHLCV 캔들 데이터 repository.
///
/// 1분봉 하이퍼테이블 `candles_1m`을 원본으로 하며, 요청 타임프레임에
/// 맞춰 `time_bucket` 집계를 수행합니다.
pub struct CandleRepository {
    db: Database,
}

impl CandleRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 심볼과 타임프레임에 대한 최근 캔들을 시간 오름차순으로 조회합니다.
    ///
    /// 조회 범위는 `limit × interval` 구간으로 제한되며, 각 봉은
    /// `time_bucket` 경계에 정렬됩니다. `sum(quote_volume)`은 모든
    /// 구성 봉에 값이 없을 때에만 NULL이 됩니다.
    #[instrument(skip(self))]
    pub async fn fetch_latest(
        &self,
        symbol: &str,
        interval: Interval,
        limit: i64,
    ) -> Result<Vec<CandleRecord>> {
        let bucket = format!("{} milliseconds", interval.duration_ms());
        let horizon = Utc::now() - Duration::milliseconds(limit * interval.duration_ms());

        let mut records: Vec<CandleRecord> = sqlx::query_as(
            r#"
            SELECT time_bucket($2::interval, time) AS time,
                   first(open, time) AS open,
                   max(high) AS high,
                   min(low) AS low,
                   last(close, time) AS close,
                   sum(volume) AS volume,
                   sum(quote_volume) AS quote_volume
            FROM candles_1m
            WHERE symbol = $1 AND time >= $3
            GROUP BY 1
            ORDER BY 1 DESC
            LIMIT $4
            "#,
        )
        .bind(symbol)
        .bind(&bucket)
        .bind(horizon)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        // 오름차순으로 정렬하기 위해 역순 처리
        records.reverse();

        debug!(
            symbol = %symbol,
            interval = %interval,
            count = records.len(),
            "Fetched candles"
        );
        Ok(records)
    }

    /// 단일 1분봉을 삽입합니다.
    ///
    /// 같은 봉이 이미 있으면 최신 값으로 덮어씁니다. 운영 도구와
    /// 테스트 픽스처 적재용 경로이며, 실시간 수신 경로에서는 호출되지
    /// 않습니다.
    #[instrument(skip(self, candle))]
    pub async fn insert(&self, symbol: &str, candle: &Candle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO candles_1m (symbol, time, open, high, low, close, volume, quote_volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (symbol, time) DO UPDATE SET
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume,
                quote_volume = EXCLUDED.quote_volume
            "#,
        )
        .bind(symbol)
        .bind(candle.time)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .bind(candle.quote_volume)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// 여러 1분봉을 일괄 삽입합니다.
    #[instrument(skip(self, candles), fields(count = candles.len()))]
    pub async fn insert_batch(&self, symbol: &str, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0;

        // 성능 향상을 위해 청크 단위 삽입 사용
        for chunk in candles.chunks(1000) {
            let mut query_builder = String::from(
                r#"
                INSERT INTO candles_1m (symbol, time, open, high, low, close, volume, quote_volume)
                VALUES
                "#,
            );

            for (i, _candle) in chunk.iter().enumerate() {
                if i > 0 {
                    query_builder.push_str(", ");
                }
                let base = i * 8;
                query_builder.push_str(&format!(
                    "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5,
                    base + 6,
                    base + 7,
                    base + 8
                ));
            }

            query_builder.push_str(
                r#"
                ON CONFLICT (symbol, time) DO UPDATE SET
                    open = EXCLUDED.open,
                    high = EXCLUDED.high,
                    low = EXCLUDED.low,
                    close = EXCLUDED.close,
                    volume = EXCLUDED.volume,
                    quote_volume = EXCLUDED.quote_volume
                "#,
            );

            let mut query = sqlx::query(&query_builder);

            for candle in chunk {
                query = query
                    .bind(symbol)
                    .bind(candle.time)
                    .bind(candle.open)
                    .bind(candle.high)
                    .bind(candle.low)
                    .bind(candle.close)
                    .bind(candle.volume)
                    .bind(candle.quote_volume);
            }

            let result = query.execute(self.db.pool()).await?;
            inserted += result.rows_affected() as usize;
        }

        debug!(inserted = inserted, "Inserted candles");
        Ok(inserted)
    }
}
