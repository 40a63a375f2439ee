use crate::{
    config::DatabaseConfig,
    dispute::EvidenceBundle,
    error::{Result, TradeError},
    interfaces::Mediator,
    model::*,
    store::TradeStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub struct Database {
    pool: SqlitePool,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Maker => "maker",
        Role::Taker => "taker",
    }
}

fn parse_role(value: &str) -> Result<Role> {
    match value {
        "maker" => Ok(Role::Maker),
        "taker" => Ok(Role::Taker),
        other => Err(TradeError::Persistence(format!("Invalid role: {}", other))),
    }
}

fn direction_str(direction: MessageDirection) -> &'static str {
    match direction {
        MessageDirection::Inbound => "inbound",
        MessageDirection::Outbound => "outbound",
    }
}

fn parse_direction(value: &str) -> Result<MessageDirection> {
    match value {
        "inbound" => Ok(MessageDirection::Inbound),
        "outbound" => Ok(MessageDirection::Outbound),
        other => Err(TradeError::Persistence(format!("Invalid message direction: {}", other))),
    }
}

fn parse_kind(value: &str) -> Result<DeadlineKind> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| TradeError::Persistence(format!("Invalid deadline kind: {}", value)))
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(&DatabaseConfig {
            url: database_url.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(5))
            .min_connections(config.min_connections.unwrap_or(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds.unwrap_or(30)))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!(url = %config.url, "Trade database ready");
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                offer_id TEXT NOT NULL,
                role TEXT NOT NULL,
                me TEXT NOT NULL,
                peer TEXT NOT NULL,
                state TEXT NOT NULL,
                terms TEXT NOT NULL,
                origin TEXT NOT NULL,
                journal TEXT NOT NULL,
                dispute_flag BOOLEAN NOT NULL DEFAULT 0,
                dispute TEXT,
                payment_account TEXT,
                btc_address TEXT,
                settlement_txid TEXT,
                mutual_cancel_requested_by TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trade_messages (
                trade_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                direction TEXT NOT NULL,
                message TEXT NOT NULL,
                accepted_at DATETIME NOT NULL,
                delivered BOOLEAN NOT NULL DEFAULT 0,
                PRIMARY KEY (trade_id, seq),
                FOREIGN KEY (trade_id) REFERENCES trades(trade_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS trade_deadlines (
                trade_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                expires_at DATETIME NOT NULL,
                PRIMARY KEY (trade_id, kind),
                FOREIGN KEY (trade_id) REFERENCES trades(trade_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS mediation_cases (
                case_id TEXT PRIMARY KEY,
                trade_id TEXT NOT NULL UNIQUE,
                reason TEXT,
                evidence TEXT NOT NULL,
                opened_at DATETIME NOT NULL,
                resolution TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_trades_state ON trades(state);
            CREATE INDEX IF NOT EXISTS idx_trades_created ON trades(created_at);
            CREATE INDEX IF NOT EXISTS idx_deadlines_expiry ON trade_deadlines(expires_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_messages(&self, trade_id: &TradeId) -> Result<Vec<LoggedMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, direction, message, accepted_at, delivered
            FROM trade_messages WHERE trade_id = ? ORDER BY seq ASC
            "#,
        )
        .bind(trade_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let message: ProtocolMessage = serde_json::from_str(&row.try_get::<String, _>(2)?)?;
            let seq: i64 = row.try_get(0)?;
            if message.seq != seq as u64 {
                return Err(TradeError::Persistence(format!(
                    "Message row {} of trade {} holds seq {}",
                    seq, trade_id, message.seq
                )));
            }
            messages.push(LoggedMessage {
                message,
                direction: parse_direction(&row.try_get::<String, _>(1)?)?,
                accepted_at: row.try_get(3)?,
                delivered: row.try_get(4)?,
            });
        }
        Ok(messages)
    }

    async fn load_deadlines(&self, trade_id: &TradeId) -> Result<BTreeMap<DeadlineKind, DateTime<Utc>>> {
        let rows = sqlx::query(
            r#"
            SELECT kind, expires_at FROM trade_deadlines WHERE trade_id = ?
            "#,
        )
        .bind(trade_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut deadlines = BTreeMap::new();
        for row in rows {
            let kind = parse_kind(&row.try_get::<String, _>(0)?)?;
            deadlines.insert(kind, row.try_get::<DateTime<Utc>, _>(1)?);
        }
        Ok(deadlines)
    }

    async fn entry_from_row(&self, row: SqliteRow) -> Result<TradeEntry> {
        let trade_id = TradeId::parse(&row.try_get::<String, _>("trade_id")?)?;
        let offer_id = uuid::Uuid::parse_str(&row.try_get::<String, _>("offer_id")?)
            .map_err(|e| TradeError::Persistence(format!("Invalid offer id: {}", e)))?;
        let dispute: Option<String> = row.try_get("dispute")?;
        let settlement_txid: Option<String> = row.try_get("settlement_txid")?;
        let mutual_cancel: Option<String> = row.try_get("mutual_cancel_requested_by")?;

        Ok(TradeEntry {
            offer_id,
            role: parse_role(&row.try_get::<String, _>("role")?)?,
            me: PeerId::new(row.try_get::<String, _>("me")?),
            peer: PeerId::new(row.try_get::<String, _>("peer")?),
            terms: serde_json::from_str(&row.try_get::<String, _>("terms")?)?,
            origin: serde_json::from_str(&row.try_get::<String, _>("origin")?)?,
            state: TradeState::from_str(&row.try_get::<String, _>("state")?)?,
            message_log: self.load_messages(&trade_id).await?,
            journal: serde_json::from_str(&row.try_get::<String, _>("journal")?)?,
            deadlines: self.load_deadlines(&trade_id).await?,
            dispute_flag: row.try_get("dispute_flag")?,
            dispute: dispute.map(|d| serde_json::from_str(&d)).transpose()?,
            payment_account: row.try_get("payment_account")?,
            btc_address: row.try_get("btc_address")?,
            settlement_tx: settlement_txid.map(|txid| TxHandle { txid }),
            mutual_cancel_requested_by: mutual_cancel.map(PeerId::new),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            trade_id,
        })
    }

    async fn load_where(&self, filter: &str) -> Result<Vec<TradeEntry>> {
        let sql = format!("SELECT * FROM trades {} ORDER BY created_at ASC", filter);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(self.entry_from_row(row).await?);
        }
        Ok(entries)
    }

    pub async fn get_case(&self, trade_id: &TradeId) -> Result<Option<(MediationCaseHandle, Option<MediationOutcome>)>> {
        let row = sqlx::query(
            r#"
            SELECT case_id, opened_at, resolution FROM mediation_cases WHERE trade_id = ?
            "#,
        )
        .bind(trade_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let handle = MediationCaseHandle {
                    case_id: row.try_get(0)?,
                    opened_at: row.try_get(1)?,
                };
                let resolution: Option<String> = row.try_get(2)?;
                let resolution = resolution
                    .map(|r| serde_json::from_value(serde_json::Value::String(r)))
                    .transpose()?;
                Ok(Some((handle, resolution)))
            }
            None => Ok(None),
        }
    }

    pub async fn resolve_case(&self, trade_id: &TradeId, outcome: MediationOutcome) -> Result<()> {
        let resolution = match outcome {
            MediationOutcome::Completed => "completed",
            MediationOutcome::Cancelled => "cancelled",
        };
        let updated = sqlx::query(
            r#"
            UPDATE mediation_cases SET resolution = ? WHERE trade_id = ?
            "#,
        )
        .bind(resolution)
        .bind(trade_id.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(TradeError::UnknownTrade(trade_id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl TradeStore for Database {
    async fn save(&self, entry: &TradeEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let trade_id = entry.trade_id.as_str();

        sqlx::query(
            r#"
            INSERT INTO trades (trade_id, offer_id, role, me, peer, state, terms, origin, journal, dispute_flag, dispute,
                                payment_account, btc_address, settlement_txid, mutual_cancel_requested_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(trade_id) DO UPDATE SET
                state = excluded.state,
                journal = excluded.journal,
                dispute_flag = excluded.dispute_flag,
                dispute = excluded.dispute,
                payment_account = excluded.payment_account,
                btc_address = excluded.btc_address,
                settlement_txid = excluded.settlement_txid,
                mutual_cancel_requested_by = excluded.mutual_cancel_requested_by,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(trade_id)
        .bind(entry.offer_id.to_string())
        .bind(role_str(entry.role))
        .bind(entry.me.as_str())
        .bind(entry.peer.as_str())
        .bind(entry.state.as_str())
        .bind(serde_json::to_string(&entry.terms)?)
        .bind(serde_json::to_string(&entry.origin)?)
        .bind(serde_json::to_string(&entry.journal)?)
        .bind(entry.dispute_flag)
        .bind(entry.dispute.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&entry.payment_account)
        .bind(&entry.btc_address)
        .bind(entry.settlement_tx.as_ref().map(|tx| tx.txid.clone()))
        .bind(entry.mutual_cancel_requested_by.as_ref().map(|p| p.as_str().to_string()))
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut *tx)
        .await?;

        for logged in &entry.message_log {
            sqlx::query(
                r#"
                INSERT INTO trade_messages (trade_id, seq, direction, message, accepted_at, delivered)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(trade_id, seq) DO UPDATE SET delivered = excluded.delivered
                "#,
            )
            .bind(trade_id)
            .bind(logged.message.seq as i64)
            .bind(direction_str(logged.direction))
            .bind(serde_json::to_string(&logged.message)?)
            .bind(logged.accepted_at)
            .bind(logged.delivered)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM trade_deadlines WHERE trade_id = ?")
            .bind(trade_id)
            .execute(&mut *tx)
            .await?;
        for (kind, expires_at) in &entry.deadlines {
            sqlx::query(
                r#"
                INSERT INTO trade_deadlines (trade_id, kind, expires_at) VALUES (?, ?, ?)
                "#,
            )
            .bind(trade_id)
            .bind(kind.to_string())
            .bind(*expires_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, trade_id: &TradeId) -> Result<Option<TradeEntry>> {
        let row = sqlx::query("SELECT * FROM trades WHERE trade_id = ?")
            .bind(trade_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.entry_from_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_non_terminal(&self) -> Result<Vec<TradeEntry>> {
        self.load_where("WHERE state NOT IN ('completed', 'cancelled')").await
    }

    async fn list_all(&self) -> Result<Vec<TradeEntry>> {
        self.load_where("").await
    }
}

/// Local case book: cases are recorded here for an operator to mediate.
#[async_trait]
impl Mediator for Database {
    async fn open_case(&self, trade_id: &TradeId, evidence: &EvidenceBundle) -> Result<MediationCaseHandle> {
        if let Some((existing, _)) = self.get_case(trade_id).await? {
            return Ok(existing);
        }

        let handle = MediationCaseHandle {
            case_id: format!("case-{}", uuid::Uuid::new_v4()),
            opened_at: evidence.exported_at,
        };
        sqlx::query(
            r#"
            INSERT INTO mediation_cases (case_id, trade_id, reason, evidence, opened_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(trade_id) DO NOTHING
            "#,
        )
        .bind(&handle.case_id)
        .bind(trade_id.as_str())
        .bind(evidence.reason.as_ref().map(|reason| reason.to_string()))
        .bind(serde_json::to_string(evidence)?)
        .bind(handle.opened_at)
        .execute(&self.pool)
        .await?;

        // A concurrent insert may have won the race.
        match self.get_case(trade_id).await? {
            Some((stored, _)) => Ok(stored),
            None => Err(TradeError::Persistence(format!("Case for trade {} was not stored", trade_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LocalAction, TradeEngine, TradeEvent};
    use tempfile::TempDir;

    async fn open() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("trades.db").display());
        let db = Database::new(&url).await.unwrap();
        (dir, db)
    }

    fn progressed_entry() -> TradeEntry {
        let now = Utc::now();
        let engine = TradeEngine::default();
        let mut entry = fixtures::entry(Role::Maker, Direction::Sell, now);
        engine.initialize(&mut entry);
        let entry = engine
            .apply(&entry, TradeEvent::Local(LocalAction::AcceptTerms), now)
            .unwrap()
            .entry;
        let account = LocalAction::SendPaymentAccountData {
            account: "IBAN DE89 3704".to_string(),
        };
        engine.apply(&entry, TradeEvent::Local(account), now).unwrap().entry
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let (_dir, db) = open().await;
        let entry = progressed_entry();

        db.save(&entry).await.unwrap();
        let loaded = db.load(&entry.trade_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TradeState::PaymentAccountDataExchanged);
        assert_eq!(loaded.message_log.len(), 2);
        assert_eq!(loaded.deadlines, entry.deadlines);
        assert_eq!(loaded.terms, entry.terms);
        assert_eq!(loaded.payment_account, entry.payment_account);
        assert_eq!(loaded.origin, entry.origin);
    }

    #[tokio::test]
    async fn test_resave_updates_state_and_delivery() {
        let (_dir, db) = open().await;
        let mut entry = progressed_entry();
        db.save(&entry).await.unwrap();

        entry.message_log[0].delivered = true;
        entry.state = TradeState::Cancelled;
        entry.deadlines.clear();
        db.save(&entry).await.unwrap();

        let loaded = db.load(&entry.trade_id).await.unwrap().unwrap();
        assert!(loaded.message_log[0].delivered);
        assert!(loaded.deadlines.is_empty());
        assert!(db.list_non_terminal().await.unwrap().is_empty());
        assert_eq!(db.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_case_book_opens_one_case_per_trade() {
        let (_dir, db) = open().await;
        let entry = progressed_entry();
        let evidence = EvidenceBundle::from_entry(&entry, Utc::now());

        let first = db.open_case(&entry.trade_id, &evidence).await.unwrap();
        let second = db.open_case(&entry.trade_id, &evidence).await.unwrap();
        assert_eq!(first, second);

        db.resolve_case(&entry.trade_id, MediationOutcome::Cancelled).await.unwrap();
        let (_, resolution) = db.get_case(&entry.trade_id).await.unwrap().unwrap();
        assert_eq!(resolution, Some(MediationOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_trade_loads_none() {
        let (_dir, db) = open().await;
        let trade_id = TradeId::parse(&"ef".repeat(32)).unwrap();
        assert!(db.load(&trade_id).await.unwrap().is_none());
    }
}
