use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    ManagedPosition, NewPosition, OperationLogEntry, PositionStatus, Regime, StrategyParams,
    Timeframe, VenueAccount,
};
use crate::store::{validate_stop, CommitResult, OperationLog, PositionStore, StopCommit};
use crate::Result;

const POSITION_COLUMNS: &str = r#"
    id, venue, account_id, symbol, side, timeframe, params, status,
    entry_time, entry_bar_index, current_stop, last_evaluated_bar,
    last_regime, last_calculated_stop, manual_adjusted_at, version, updated_at
"#;

/// Postgres position store and operation log
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

fn to_decimal(value: Option<f64>) -> std::result::Result<Option<Decimal>, StoreError> {
    value
        .map(|v| {
            Decimal::from_f64(v)
                .ok_or_else(|| StoreError::Corrupt(format!("unrepresentable price {}", v)))
        })
        .transpose()
}

fn to_f64(value: Option<Decimal>) -> Option<f64> {
    value.and_then(|d| d.to_f64())
}

fn position_from_row(row: &PgRow) -> std::result::Result<ManagedPosition, StoreError> {
    let side: String = row.try_get("side")?;
    let timeframe: String = row.try_get("timeframe")?;
    let status: String = row.try_get("status")?;
    let params: Json<StrategyParams> = row.try_get("params")?;
    let version: i64 = row.try_get("version")?;
    let regime: i16 = row.try_get("last_regime")?;

    Ok(ManagedPosition {
        id: row.try_get("id")?,
        account: VenueAccount {
            venue: row.try_get("venue")?,
            account_id: row.try_get("account_id")?,
        },
        symbol: row.try_get("symbol")?,
        side: side.parse().map_err(StoreError::Corrupt)?,
        timeframe: timeframe.parse::<Timeframe>().map_err(StoreError::Corrupt)?,
        params: params.0,
        status: status.parse().map_err(StoreError::Corrupt)?,
        entry_time: row.try_get("entry_time")?,
        entry_bar_index: row.try_get("entry_bar_index")?,
        current_stop: to_f64(row.try_get("current_stop")?),
        last_evaluated_bar: row.try_get("last_evaluated_bar")?,
        last_regime: Regime::from_i16(regime),
        last_calculated_stop: to_f64(row.try_get("last_calculated_stop")?),
        manual_adjusted_at: row.try_get("manual_adjusted_at")?,
        version: u64::try_from(version)
            .map_err(|_| StoreError::Corrupt(format!("negative version {}", version)))?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> std::result::Result<OperationLogEntry, StoreError> {
    let outcome: String = row.try_get("outcome")?;
    Ok(OperationLogEntry {
        id: row.try_get("id")?,
        position_id: row.try_get("position_id")?,
        symbol: row.try_get("symbol")?,
        previous_stop: to_f64(row.try_get("previous_stop")?),
        proposed_stop: to_f64(row.try_get("proposed_stop")?),
        outcome: outcome.parse().map_err(StoreError::Corrupt)?,
        reason: row.try_get("reason")?,
        bar_timestamp: row.try_get("bar_timestamp")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

impl PostgresStore {
    /// Connect to Postgres and run migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    /// * `max_connections` - Pool size
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    async fn update_returning(
        &self,
        id: Uuid,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> std::result::Result<ManagedPosition, StoreError> {
        let row = query
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        position_from_row(&row)
    }
}

#[async_trait]
impl PositionStore for PostgresStore {
    async fn create(&self, new: NewPosition) -> std::result::Result<ManagedPosition, StoreError> {
        new.params.validate()?;
        let position = new.into_position(Uuid::new_v4(), Utc::now());

        let sql = format!(
            r#"
            INSERT INTO managed_positions (
                id, venue, account_id, symbol, side, timeframe, params, status,
                entry_time, entry_bar_index, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0)
            RETURNING {}
            "#,
            POSITION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(position.id)
            .bind(&position.account.venue)
            .bind(&position.account.account_id)
            .bind(&position.symbol)
            .bind(position.side.as_str())
            .bind(position.timeframe.as_str())
            .bind(Json(&position.params))
            .bind(position.status.as_str())
            .bind(position.entry_time)
            .bind(position.entry_bar_index)
            .fetch_one(&self.pool)
            .await?;

        tracing::debug!(
            "Created managed position {} for {} to Postgres",
            position.id,
            position.symbol
        );

        position_from_row(&row)
    }

    async fn read(&self, id: Uuid) -> std::result::Result<ManagedPosition, StoreError> {
        let sql = format!("SELECT {} FROM managed_positions WHERE id = $1", POSITION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        position_from_row(&row)
    }

    async fn list_active(
        &self,
        timeframe: Timeframe,
    ) -> std::result::Result<Vec<ManagedPosition>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM managed_positions
            WHERE status = 'active' AND timeframe = $1
            ORDER BY entry_time ASC
            "#,
            POSITION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(timeframe.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(position_from_row).collect()
    }

    async fn commit_if_version(
        &self,
        id: Uuid,
        expected_version: u64,
        commit: &StopCommit,
    ) -> std::result::Result<CommitResult, StoreError> {
        validate_stop(commit.stop)?;

        let row = sqlx::query(
            r#"
            UPDATE managed_positions SET
                current_stop = COALESCE($3, current_stop),
                last_evaluated_bar = $4,
                last_regime = $5,
                last_calculated_stop = $6,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(id)
        .bind(expected_version as i64)
        .bind(to_decimal(commit.stop)?)
        .bind(commit.last_evaluated_bar)
        .bind(commit.regime.as_i16())
        .bind(to_decimal(commit.calculated_stop)?)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let version: i64 = row.try_get("version")?;
            return Ok(CommitResult::Committed {
                version: version as u64,
            });
        }

        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM managed_positions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            Some(version) => Ok(CommitResult::VersionConflict {
                current: version as u64,
            }),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: PositionStatus,
    ) -> std::result::Result<ManagedPosition, StoreError> {
        let sql = format!(
            r#"
            UPDATE managed_positions
            SET status = $2, version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            POSITION_COLUMNS
        );
        self.update_returning(id, sqlx::query(&sql).bind(id).bind(status.as_str()))
            .await
    }

    async fn adjust_stop(
        &self,
        id: Uuid,
        stop: Option<f64>,
    ) -> std::result::Result<ManagedPosition, StoreError> {
        validate_stop(stop)?;
        let sql = format!(
            r#"
            UPDATE managed_positions
            SET current_stop = $2, manual_adjusted_at = NOW(),
                version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            POSITION_COLUMNS
        );
        self.update_returning(id, sqlx::query(&sql).bind(id).bind(to_decimal(stop)?))
            .await
    }

    async fn replace_params(
        &self,
        id: Uuid,
        params: StrategyParams,
    ) -> std::result::Result<ManagedPosition, StoreError> {
        params.validate()?;
        let sql = format!(
            r#"
            UPDATE managed_positions
            SET params = $2, version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            POSITION_COLUMNS
        );
        self.update_returning(id, sqlx::query(&sql).bind(id).bind(Json(params)))
            .await
    }
}

#[async_trait]
impl OperationLog for PostgresStore {
    async fn append(&self, entry: &OperationLogEntry) -> std::result::Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO operation_log (
                id, position_id, symbol, previous_stop, proposed_stop,
                outcome, reason, bar_timestamp, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.position_id)
        .bind(&entry.symbol)
        .bind(to_decimal(entry.previous_stop)?)
        .bind(to_decimal(entry.proposed_stop)?)
        .bind(entry.outcome.as_str())
        .bind(&entry.reason)
        .bind(entry.bar_timestamp)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent(
        &self,
        position_id: Uuid,
        limit: usize,
    ) -> std::result::Result<Vec<OperationLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, position_id, symbol, previous_stop, proposed_stop,
                   outcome, reason, bar_timestamp, recorded_at
            FROM operation_log
            WHERE position_id = $1
            ORDER BY recorded_at DESC
            LIMIT $2
            "#,
        )
        .bind(position_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }
}
