//! PostgreSQL store backend
//!
//! Amounts and prices are persisted as NUMERIC(78,0) scaled integers; the
//! conversion to and from [`U256`] is lexical. Schema migration runs
//! inline at startup.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use ethers::types::U256;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{Store, StoreError, StoreResult};
use crate::config::DatabaseConfig;
use crate::model::{
    ChainHealth, ChainStatusRecord, ExecutionRecord, Htlc, HtlcStatus, Order, OrderStatus,
    PricePoint,
};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run schema migration
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .acquire_timeout(Duration::from_secs(config.statement_timeout_secs))
            .connect(&config.url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id VARCHAR(66) PRIMARY KEY,
                user_address VARCHAR(100) NOT NULL,
                source_chain VARCHAR(20) NOT NULL,
                target_chain VARCHAR(20) NOT NULL,
                source_token VARCHAR(64) NOT NULL,
                source_amount NUMERIC(78, 0) NOT NULL,
                target_token VARCHAR(64) NOT NULL,
                target_recipient TEXT NOT NULL,
                min_received NUMERIC(78, 0) NOT NULL,
                window_minutes INTEGER NOT NULL,
                execution_intervals INTEGER NOT NULL,
                max_slippage_bps INTEGER NOT NULL,
                min_fill_size NUMERIC(78, 0) NOT NULL,
                mev_protection BOOLEAN NOT NULL DEFAULT true,
                hashed_secret VARCHAR(66) NOT NULL,
                timeout_height BIGINT NOT NULL,
                timeout_timestamp BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                executed_amount NUMERIC(78, 0) NOT NULL DEFAULT 0,
                last_execution TIMESTAMPTZ,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                average_price NUMERIC(78, 0) NOT NULL DEFAULT 0,
                metadata JSONB
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_history (
                id BIGSERIAL PRIMARY KEY,
                order_id VARCHAR(66) NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                interval_number INTEGER NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                amount NUMERIC(78, 0) NOT NULL,
                price NUMERIC(78, 0) NOT NULL,
                gas_used BIGINT,
                slippage_bps INTEGER,
                tx_hash VARCHAR(66),
                chain_id VARCHAR(20) NOT NULL,
                UNIQUE (order_id, interval_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_points (
                id BIGSERIAL PRIMARY KEY,
                token_pair VARCHAR(100) NOT NULL,
                source VARCHAR(50) NOT NULL,
                price NUMERIC(78, 0) NOT NULL,
                volume NUMERIC(78, 0),
                timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                chain_id VARCHAR(20)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS htlcs (
                address VARCHAR(100) PRIMARY KEY,
                order_id VARCHAR(66) NOT NULL,
                hashed_secret VARCHAR(66) NOT NULL,
                amount NUMERIC(78, 0) NOT NULL,
                token VARCHAR(64) NOT NULL,
                sender VARCHAR(100) NOT NULL,
                receiver VARCHAR(100) NOT NULL,
                timeout_height BIGINT NOT NULL,
                timeout_timestamp BIGINT NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'active',
                chain_id VARCHAR(20) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                claimed_at TIMESTAMPTZ,
                secret VARCHAR(66)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_status (
                chain_id VARCHAR(20) PRIMARY KEY,
                name VARCHAR(50) NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT true,
                last_block_height BIGINT,
                last_block_time TIMESTAMPTZ,
                avg_block_time VARCHAR(20),
                gas_price NUMERIC(78, 0),
                health_status VARCHAR(20) NOT NULL DEFAULT 'unknown',
                last_health_check TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_orders_user_status ON orders (user_address, status)",
            "CREATE INDEX IF NOT EXISTS idx_orders_status_last_execution ON orders (status, last_execution)",
            "CREATE INDEX IF NOT EXISTS idx_orders_timeout ON orders (timeout_timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_execution_history_order ON execution_history (order_id, interval_number)",
            "CREATE INDEX IF NOT EXISTS idx_price_points_pair_time ON price_points (token_pair, timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_htlcs_order_id ON htlcs (order_id)",
            "CREATE INDEX IF NOT EXISTS idx_htlcs_status ON htlcs (status)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        info!("Database migrations complete");
        Ok(())
    }
}

const ORDER_COLUMNS: &str = "id, user_address, source_chain, target_chain, source_token, \
     source_amount, target_token, target_recipient, min_received, window_minutes, \
     execution_intervals, max_slippage_bps, min_fill_size, mev_protection, hashed_secret, \
     timeout_height, timeout_timestamp, created_at, updated_at, executed_amount, \
     last_execution, status, average_price, metadata";

#[async_trait]
impl Store for PostgresStore {
    async fn create_order(&self, order: &Order) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (
                id, user_address, source_chain, target_chain, source_token,
                source_amount, target_token, target_recipient, min_received,
                window_minutes, execution_intervals, max_slippage_bps, min_fill_size,
                mev_protection, hashed_secret, timeout_height, timeout_timestamp,
                created_at, updated_at, executed_amount, last_execution, status,
                average_price, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                      $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&order.id)
        .bind(&order.user_address)
        .bind(&order.source_chain)
        .bind(&order.target_chain)
        .bind(&order.source_token)
        .bind(numeric(order.source_amount))
        .bind(&order.target_token)
        .bind(&order.target_recipient)
        .bind(numeric(order.min_received))
        .bind(order.window_minutes as i32)
        .bind(order.execution_intervals as i32)
        .bind(order.max_slippage_bps as i32)
        .bind(numeric(order.min_fill_size))
        .bind(order.mev_protection)
        .bind(&order.hashed_secret)
        .bind(order.timeout_height as i64)
        .bind(order.timeout_timestamp)
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(numeric(order.executed_amount))
        .bind(order.last_execution)
        .bind(order.status.as_str())
        .bind(numeric(order.average_price))
        .bind(serde_json::Value::Object(order.metadata.clone()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(order.id.clone()));
        }
        debug!(order_id = %order.id, "order created");
        Ok(())
    }

    async fn order(&self, order_id: &str) -> StoreResult<Order> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        order_from_row(&row)
    }

    async fn orders_by_user(
        &self,
        user_address: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE user_address = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_address)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn update_order(
        &self,
        order: &Order,
        expected_version: DateTime<Utc>,
    ) -> StoreResult<Order> {
        let row = sqlx::query(
            r#"
            UPDATE orders SET
                executed_amount = $3,
                last_execution = $4,
                status = $5,
                average_price = $6,
                metadata = $7,
                updated_at = NOW()
            WHERE id = $1 AND updated_at = $2
            RETURNING updated_at
            "#,
        )
        .bind(&order.id)
        .bind(expected_version)
        .bind(numeric(order.executed_amount))
        .bind(order.last_execution)
        .bind(order.status.as_str())
        .bind(numeric(order.average_price))
        .bind(serde_json::Value::Object(order.metadata.clone()))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut updated = order.clone();
                updated.updated_at = row.get("updated_at");
                Ok(updated)
            }
            None => {
                // Distinguish a missing row from a lost race
                let exists = sqlx::query("SELECT 1 FROM orders WHERE id = $1")
                    .bind(&order.id)
                    .fetch_optional(&self.pool)
                    .await?
                    .is_some();
                if exists {
                    Err(StoreError::Conflict(order.id.clone()))
                } else {
                    Err(StoreError::NotFound)
                }
            }
        }
    }

    async fn executable_orders(&self, now: DateTime<Utc>) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status IN ('pending', 'executing') \
             AND (last_execution IS NULL \
                  OR last_execution + make_interval(secs => \
                      (window_minutes * 60 / execution_intervals)::double precision) <= $1) \
             ORDER BY created_at ASC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn record_execution(
        &self,
        order: &Order,
        record: &ExecutionRecord,
        expected_version: DateTime<Utc>,
    ) -> StoreResult<Order> {
        let mut tx = self.pool.begin().await?;

        // Lock the order row for the duration of the commit
        let locked = sqlx::query("SELECT updated_at FROM orders WHERE id = $1 FOR UPDATE")
            .bind(&order.id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;
        let stored_version: DateTime<Utc> = locked.get("updated_at");
        if stored_version != expected_version {
            return Err(StoreError::Conflict(order.id.clone()));
        }

        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM execution_history WHERE order_id = $1")
                .bind(&order.id)
                .fetch_one(&mut *tx)
                .await?
                .get("n");
        if record.interval_number as i64 != count {
            return Err(StoreError::Conflict(format!(
                "{}: interval {} != next {}",
                order.id, record.interval_number, count
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO execution_history (
                order_id, interval_number, timestamp, amount, price,
                gas_used, slippage_bps, tx_hash, chain_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.order_id)
        .bind(record.interval_number as i32)
        .bind(record.timestamp)
        .bind(numeric(record.amount))
        .bind(numeric(record.price))
        .bind(record.gas_used.map(|g| g as i64))
        .bind(record.slippage_bps.map(|s| s as i32))
        .bind(&record.tx_hash)
        .bind(&record.chain_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            UPDATE orders SET
                executed_amount = $2,
                last_execution = $3,
                status = $4,
                average_price = $5,
                metadata = $6,
                updated_at = NOW()
            WHERE id = $1
            RETURNING updated_at
            "#,
        )
        .bind(&order.id)
        .bind(numeric(order.executed_amount))
        .bind(order.last_execution)
        .bind(order.status.as_str())
        .bind(numeric(order.average_price))
        .bind(serde_json::Value::Object(order.metadata.clone()))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut updated = order.clone();
        updated.updated_at = row.get("updated_at");
        Ok(updated)
    }

    async fn execution_history(&self, order_id: &str) -> StoreResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, interval_number, timestamp, amount, price,
                   gas_used, slippage_bps, tx_hash, chain_id
            FROM execution_history
            WHERE order_id = $1
            ORDER BY interval_number ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn store_price_point(&self, point: &PricePoint) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO price_points (token_pair, source, price, volume, timestamp, chain_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&point.token_pair)
        .bind(&point.source)
        .bind(numeric(point.price))
        .bind(point.volume.map(numeric))
        .bind(point.timestamp)
        .bind(&point.chain_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn price_points_since(
        &self,
        token_pair: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<PricePoint>> {
        let rows = sqlx::query(
            r#"
            SELECT token_pair, source, price, volume, timestamp, chain_id
            FROM price_points
            WHERE token_pair = $1 AND timestamp >= $2
            ORDER BY timestamp ASC
            "#,
        )
        .bind(token_pair)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(price_from_row).collect()
    }

    async fn latest_price(
        &self,
        token_pair: &str,
        source: &str,
    ) -> StoreResult<Option<PricePoint>> {
        let row = sqlx::query(
            r#"
            SELECT token_pair, source, price, volume, timestamp, chain_id
            FROM price_points
            WHERE token_pair = $1 AND source = $2
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(token_pair)
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(price_from_row).transpose()
    }

    async fn prune_price_points(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM price_points WHERE timestamp < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            debug!(removed = result.rows_affected(), "pruned old price points");
        }
        Ok(result.rows_affected())
    }

    async fn create_htlc(&self, htlc: &Htlc) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO htlcs (
                address, order_id, hashed_secret, amount, token, sender, receiver,
                timeout_height, timeout_timestamp, status, chain_id, created_at,
                claimed_at, secret
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (address) DO NOTHING
            "#,
        )
        .bind(&htlc.address)
        .bind(&htlc.order_id)
        .bind(&htlc.hashed_secret)
        .bind(numeric(htlc.amount))
        .bind(&htlc.token)
        .bind(&htlc.sender)
        .bind(&htlc.receiver)
        .bind(htlc.timeout_height as i64)
        .bind(htlc.timeout_timestamp)
        .bind(htlc.status.as_str())
        .bind(&htlc.chain_id)
        .bind(htlc.created_at)
        .bind(htlc.claimed_at)
        .bind(&htlc.revealed_secret)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn htlc(&self, address: &str) -> StoreResult<Htlc> {
        let row = sqlx::query(
            r#"
            SELECT address, order_id, hashed_secret, amount, token, sender, receiver,
                   timeout_height, timeout_timestamp, status, chain_id, created_at,
                   claimed_at, secret
            FROM htlcs WHERE address = $1
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        htlc_from_row(&row)
    }

    async fn update_htlc(&self, htlc: &Htlc) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE htlcs SET status = $2, claimed_at = $3, secret = $4
            WHERE address = $1
            "#,
        )
        .bind(&htlc.address)
        .bind(htlc.status.as_str())
        .bind(htlc.claimed_at)
        .bind(&htlc.revealed_secret)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn htlcs_by_status(&self, status: HtlcStatus) -> StoreResult<Vec<Htlc>> {
        let rows = sqlx::query(
            r#"
            SELECT address, order_id, hashed_secret, amount, token, sender, receiver,
                   timeout_height, timeout_timestamp, status, chain_id, created_at,
                   claimed_at, secret
            FROM htlcs WHERE status = $1
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(htlc_from_row).collect()
    }

    async fn upsert_chain_status(&self, status: &ChainStatusRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_status (
                chain_id, name, enabled, last_block_height, last_block_time,
                avg_block_time, gas_price, health_status, last_health_check
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (chain_id) DO UPDATE SET
                name = EXCLUDED.name,
                enabled = EXCLUDED.enabled,
                last_block_height = EXCLUDED.last_block_height,
                last_block_time = EXCLUDED.last_block_time,
                avg_block_time = EXCLUDED.avg_block_time,
                gas_price = EXCLUDED.gas_price,
                health_status = EXCLUDED.health_status,
                last_health_check = EXCLUDED.last_health_check
            "#,
        )
        .bind(&status.chain_id)
        .bind(&status.name)
        .bind(status.enabled)
        .bind(status.last_block_height.map(|h| h as i64))
        .bind(status.last_block_time)
        .bind(&status.avg_block_time)
        .bind(status.gas_price.map(numeric))
        .bind(status.health.as_str())
        .bind(status.last_health_check)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn chain_status(&self, chain_id: &str) -> StoreResult<ChainStatusRecord> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, name, enabled, last_block_height, last_block_time,
                   avg_block_time, gas_price, health_status, last_health_check
            FROM chain_status WHERE chain_id = $1
            "#,
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        Ok(ChainStatusRecord {
            chain_id: row.get("chain_id"),
            name: row.get("name"),
            enabled: row.get("enabled"),
            last_block_height: row.get::<Option<i64>, _>("last_block_height").map(|h| h as u64),
            last_block_time: row.get("last_block_time"),
            avg_block_time: row.get("avg_block_time"),
            gas_price: row
                .get::<Option<BigDecimal>, _>("gas_price")
                .map(|bd| u256_from_numeric(&bd, "gas_price"))
                .transpose()?,
            health: ChainHealth::parse(row.get::<String, _>("health_status").as_str()),
            last_health_check: row.get("last_health_check"),
        })
    }

    async fn health(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// U256 -> NUMERIC(78,0)
fn numeric(value: U256) -> BigDecimal {
    // U256 decimal strings are always valid BigDecimal input
    BigDecimal::from_str(&value.to_string()).expect("decimal from U256")
}

/// NUMERIC(78,0) -> U256; the column never carries a fraction
fn u256_from_numeric(bd: &BigDecimal, column: &str) -> StoreResult<U256> {
    let text = bd.normalized().to_string();
    let digits = match text.split_once('.') {
        Some((int_part, frac)) if frac.chars().all(|c| c == '0') => int_part,
        Some(_) => {
            return Err(StoreError::Corrupt(format!(
                "{} holds a fractional value: {}",
                column, text
            )))
        }
        None => text.as_str(),
    };
    U256::from_dec_str(digits)
        .map_err(|e| StoreError::Corrupt(format!("{}: {} ({})", column, text, e)))
}

fn order_from_row(row: &PgRow) -> StoreResult<Order> {
    let status_text: String = row.get("status");
    let status = OrderStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Corrupt(format!("order status {:?}", status_text)))?;
    let metadata = row
        .get::<Option<serde_json::Value>, _>("metadata")
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();

    Ok(Order {
        id: row.get("id"),
        user_address: row.get("user_address"),
        source_chain: row.get("source_chain"),
        target_chain: row.get("target_chain"),
        source_token: row.get("source_token"),
        source_amount: u256_from_numeric(&row.get::<BigDecimal, _>("source_amount"), "source_amount")?,
        target_token: row.get("target_token"),
        target_recipient: row.get("target_recipient"),
        min_received: u256_from_numeric(&row.get::<BigDecimal, _>("min_received"), "min_received")?,
        window_minutes: row.get::<i32, _>("window_minutes") as u32,
        execution_intervals: row.get::<i32, _>("execution_intervals") as u32,
        max_slippage_bps: row.get::<i32, _>("max_slippage_bps") as u32,
        min_fill_size: u256_from_numeric(&row.get::<BigDecimal, _>("min_fill_size"), "min_fill_size")?,
        mev_protection: row.get("mev_protection"),
        hashed_secret: row.get("hashed_secret"),
        timeout_height: row.get::<i64, _>("timeout_height") as u64,
        timeout_timestamp: row.get("timeout_timestamp"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        executed_amount: u256_from_numeric(
            &row.get::<BigDecimal, _>("executed_amount"),
            "executed_amount",
        )?,
        last_execution: row.get("last_execution"),
        status,
        average_price: u256_from_numeric(&row.get::<BigDecimal, _>("average_price"), "average_price")?,
        metadata,
    })
}

fn execution_from_row(row: &PgRow) -> StoreResult<ExecutionRecord> {
    Ok(ExecutionRecord {
        order_id: row.get("order_id"),
        interval_number: row.get::<i32, _>("interval_number") as u32,
        timestamp: row.get("timestamp"),
        amount: u256_from_numeric(&row.get::<BigDecimal, _>("amount"), "amount")?,
        price: u256_from_numeric(&row.get::<BigDecimal, _>("price"), "price")?,
        gas_used: row.get::<Option<i64>, _>("gas_used").map(|g| g as u64),
        slippage_bps: row.get::<Option<i32>, _>("slippage_bps").map(|s| s as u32),
        tx_hash: row.get("tx_hash"),
        chain_id: row.get("chain_id"),
    })
}

fn price_from_row(row: &PgRow) -> StoreResult<PricePoint> {
    Ok(PricePoint {
        token_pair: row.get("token_pair"),
        source: row.get("source"),
        price: u256_from_numeric(&row.get::<BigDecimal, _>("price"), "price")?,
        volume: row
            .get::<Option<BigDecimal>, _>("volume")
            .map(|bd| u256_from_numeric(&bd, "volume"))
            .transpose()?,
        timestamp: row.get("timestamp"),
        chain_id: row.get("chain_id"),
    })
}

fn htlc_from_row(row: &PgRow) -> StoreResult<Htlc> {
    let status_text: String = row.get("status");
    let status = HtlcStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Corrupt(format!("htlc status {:?}", status_text)))?;
    Ok(Htlc {
        address: row.get("address"),
        order_id: row.get("order_id"),
        hashed_secret: row.get("hashed_secret"),
        amount: u256_from_numeric(&row.get::<BigDecimal, _>("amount"), "amount")?,
        token: row.get("token"),
        sender: row.get("sender"),
        receiver: row.get("receiver"),
        timeout_height: row.get::<i64, _>("timeout_height") as u64,
        timeout_timestamp: row.get("timeout_timestamp"),
        status,
        chain_id: row.get("chain_id"),
        created_at: row.get("created_at"),
        claimed_at: row.get("claimed_at"),
        revealed_secret: row.get("secret"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_round_trip_preserves_wide_values() {
        for value in [
            U256::zero(),
            U256::from(1u64),
            U256::from_dec_str("2000000000000000000000").unwrap(),
            U256::MAX,
        ] {
            let bd = numeric(value);
            assert_eq!(u256_from_numeric(&bd, "test").unwrap(), value);
        }
    }

    #[test]
    fn fractional_numeric_is_rejected() {
        let bd = BigDecimal::from_str("10.5").unwrap();
        assert!(matches!(
            u256_from_numeric(&bd, "test"),
            Err(StoreError::Corrupt(_))
        ));
    }
}
