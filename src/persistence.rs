use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::account::Account;
use crate::model::{ExitReason, Position};

#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub position_id: Uuid,
    pub ticker: String,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    pub realized_pnl: Decimal,
    pub exit_reason: ExitReason,
    pub entered_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub current_balance: Decimal,
    pub total_exposure: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub daily_pnl: Decimal,
    pub taken_at: DateTime<Utc>,
}

/// External store for trades, account_snapshots, and logs (§6). The core
/// emits write intents and tolerates transient failure — a dropped write
/// never blocks trading, it only logs and moves on.
pub struct Persistence {
    pool: Option<PgPool>,
}

impl Persistence {
    /// Connects lazily; an empty `database_url` disables persistence
    /// entirely (useful for paper-mode runs without a database).
    pub async fn connect(database_url: &str) -> Self {
        if database_url.is_empty() {
            info!("no database_url configured; persistence disabled");
            return Self { pool: None };
        }
        match PgPoolOptions::new().max_connections(5).connect(database_url).await {
            Ok(pool) => Self { pool: Some(pool) },
            Err(e) => {
                error!("failed to connect to database: {}; persistence disabled for this run", e);
                Self { pool: None }
            }
        }
    }

    pub async fn migrate(&self) {
        let Some(pool) = &self.pool else { return };
        let statements = [
            "CREATE TABLE IF NOT EXISTS trades (
                position_id UUID PRIMARY KEY,
                ticker TEXT NOT NULL,
                entry_price NUMERIC NOT NULL,
                exit_price NUMERIC NOT NULL,
                size NUMERIC NOT NULL,
                realized_pnl NUMERIC NOT NULL,
                exit_reason TEXT NOT NULL,
                entered_at TIMESTAMPTZ NOT NULL,
                closed_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS account_snapshots (
                id BIGSERIAL PRIMARY KEY,
                current_balance NUMERIC NOT NULL,
                total_exposure NUMERIC NOT NULL,
                realized_pnl NUMERIC NOT NULL,
                unrealized_pnl NUMERIC NOT NULL,
                daily_pnl NUMERIC NOT NULL,
                taken_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS logs (
                id BIGSERIAL PRIMARY KEY,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                logged_at TIMESTAMPTZ NOT NULL
            )",
        ];
        for stmt in statements {
            if let Err(e) = sqlx::query(stmt).execute(pool).await {
                warn!("persistence migration step failed: {}", e);
            }
        }
    }

    pub async fn record_trade(&self, trade: &TradeRecord) {
        let Some(pool) = &self.pool else { return };
        let result = sqlx::query(
            "INSERT INTO trades (position_id, ticker, entry_price, exit_price, size, realized_pnl, exit_reason, entered_at, closed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (position_id) DO NOTHING",
        )
        .bind(trade.position_id)
        .bind(&trade.ticker)
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.size)
        .bind(trade.realized_pnl)
        .bind(trade.exit_reason.as_str())
        .bind(trade.entered_at)
        .bind(trade.closed_at)
        .execute(pool)
        .await;

        if let Err(e) = result {
            warn!("dropping trade record write for {}: {}", trade.position_id, e);
        }
    }

    pub async fn snapshot_account(&self, account: &Account) {
        let Some(pool) = &self.pool else { return };
        let snapshot = AccountSnapshot {
            current_balance: account.current_balance,
            total_exposure: account.total_exposure,
            realized_pnl: account.realized_pnl,
            unrealized_pnl: account.unrealized_pnl,
            daily_pnl: account.daily_pnl,
            taken_at: Utc::now(),
        };
        let result = sqlx::query(
            "INSERT INTO account_snapshots (current_balance, total_exposure, realized_pnl, unrealized_pnl, daily_pnl, taken_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(snapshot.current_balance)
        .bind(snapshot.total_exposure)
        .bind(snapshot.realized_pnl)
        .bind(snapshot.unrealized_pnl)
        .bind(snapshot.daily_pnl)
        .bind(snapshot.taken_at)
        .execute(pool)
        .await;

        if let Err(e) = result {
            warn!("dropping account snapshot write: {}", e);
        }
    }

    pub async fn log_event(&self, level: &str, message: &str) {
        let Some(pool) = &self.pool else { return };
        let result = sqlx::query("INSERT INTO logs (level, message, logged_at) VALUES ($1, $2, $3)")
            .bind(level)
            .bind(message)
            .bind(Utc::now())
            .execute(pool)
            .await;
        if let Err(e) = result {
            warn!("dropping log write: {}", e);
        }
    }
}

pub fn trade_record_from_position(position: &Position) -> Option<TradeRecord> {
    Some(TradeRecord {
        position_id: position.id,
        ticker: position.ticker.clone(),
        entry_price: position.entry_price,
        exit_price: position.exit_price?,
        size: position.size,
        realized_pnl: position.realized_pnl?,
        exit_reason: position.exit_reason?,
        entered_at: position.entered_at,
        closed_at: position.closed_at?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_url_disables_persistence_without_connecting() {
        let persistence = Persistence::connect("").await;
        assert!(persistence.pool.is_none());
        // These are no-ops, not panics, when disabled.
        persistence.log_event("info", "test").await;
    }

    #[test]
    fn trade_record_requires_terminal_fields() {
        use crate::model::PositionStatus;
        let position = Position {
            id: Uuid::new_v4(),
            ticker: "T".into(),
            entry_price: Decimal::ZERO,
            size: Decimal::ZERO,
            status: PositionStatus::Entered,
            entry_order_id: Uuid::new_v4(),
            stop_loss_order_id: None,
            take_profit_order_id: None,
            stop_loss_price: Decimal::ZERO,
            take_profit_price: Decimal::ZERO,
            max_hold: chrono::Duration::hours(2),
            entered_at: Utc::now(),
            closed_at: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
        };
        assert!(trade_record_from_position(&position).is_none());
    }
}
