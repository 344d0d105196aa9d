//! SQLite Persistent Storage
//!
//! Durable storage for deposits, withdrawals and wallets. The same pool is
//! shared with the SQLite lock manager and event bus so that one database
//! file backs a whole deployment.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use super::traits::{DepositStore, StorageError, StorageResult, WalletStore, WithdrawalStore};
use crate::types::{
    DepositTransaction, Network, Wallet, WithdrawalStatus, WithdrawalTransaction,
};

pub type SqlitePool = Pool<SqliteConnectionManager>;

/// SQLite-backed record store with connection pooling
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            c.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        // A single connection, so every caller sees the same database
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Open from config: `:memory:` selects the in-memory database
    pub fn open(db_path: &str) -> Result<Self, StorageError> {
        if db_path == ":memory:" {
            Self::in_memory()
        } else {
            Self::new(db_path)
        }
    }

    /// Shared pool for the lock manager and event bus
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deposits (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                network TEXT NOT NULL,
                external_id TEXT NOT NULL,
                address TEXT NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'initiated',
                confirmations INTEGER NOT NULL DEFAULT 0,
                block_number INTEGER,
                block_hash TEXT,
                reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (network, external_id)
            );

            CREATE INDEX IF NOT EXISTS idx_deposits_status ON deposits(status);
            CREATE INDEX IF NOT EXISTS idx_deposits_user ON deposits(user_id);

            CREATE TABLE IF NOT EXISTS withdrawals (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                network TEXT NOT NULL,
                destination_address TEXT NOT NULL,
                destination_tag INTEGER,
                amount TEXT NOT NULL,
                fee TEXT,
                status TEXT NOT NULL DEFAULT 'waiting',
                external_id TEXT,
                retries INTEGER NOT NULL DEFAULT 0,
                debited INTEGER NOT NULL DEFAULT 0,
                reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_withdrawals_status ON withdrawals(status);

            CREATE TABLE IF NOT EXISTS wallets (
                wallet_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                network TEXT NOT NULL,
                address TEXT NOT NULL,
                destination_tag INTEGER,
                created_at INTEGER NOT NULL,
                UNIQUE (user_id, network)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_wallets_address
                ON wallets(network, address, IFNULL(destination_tag, -1));
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    fn row_to_deposit(row: &rusqlite::Row) -> rusqlite::Result<DepositTransaction> {
        Ok(DepositTransaction {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            network: parse_col(row, "network")?,
            external_id: row.get("external_id")?,
            address: row.get("address")?,
            amount: parse_col(row, "amount")?,
            status: parse_col(row, "status")?,
            confirmations: row.get::<_, i64>("confirmations")? as u32,
            block_number: row.get::<_, Option<i64>>("block_number")?.map(|v| v as u64),
            block_hash: row.get("block_hash")?,
            reason: row.get("reason")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
            updated_at: row.get::<_, i64>("updated_at")? as u64,
        })
    }

    fn row_to_withdrawal(row: &rusqlite::Row) -> rusqlite::Result<WithdrawalTransaction> {
        let fee: Option<String> = row.get("fee")?;
        let fee = fee
            .map(|f| f.parse().map_err(|e| conversion_error("fee", e)))
            .transpose()?;

        Ok(WithdrawalTransaction {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            network: parse_col(row, "network")?,
            destination_address: row.get("destination_address")?,
            destination_tag: row.get::<_, Option<i64>>("destination_tag")?.map(|v| v as u32),
            amount: parse_col(row, "amount")?,
            fee,
            status: parse_col(row, "status")?,
            external_id: row.get("external_id")?,
            retries: row.get::<_, i64>("retries")? as u32,
            debited: row.get::<_, i64>("debited")? != 0,
            reason: row.get("reason")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
            updated_at: row.get::<_, i64>("updated_at")? as u64,
        })
    }

    fn row_to_wallet(row: &rusqlite::Row) -> rusqlite::Result<Wallet> {
        Ok(Wallet {
            wallet_id: row.get("wallet_id")?,
            user_id: row.get("user_id")?,
            network: parse_col(row, "network")?,
            address: row.get("address")?,
            destination_tag: row.get::<_, Option<i64>>("destination_tag")?.map(|v| v as u32),
            created_at: row.get::<_, i64>("created_at")? as u64,
        })
    }

    // Synchronous helpers for the trait implementations

    fn insert_deposit_sync(&self, record: &DepositTransaction) -> StorageResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO deposits (
                id, user_id, network, external_id, address, amount, status,
                confirmations, block_number, block_hash, reason, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                record.id,
                record.user_id,
                record.network.as_str(),
                record.external_id,
                record.address,
                record.amount.to_string(),
                record.status.to_string(),
                record.confirmations as i64,
                record.block_number.map(|v| v as i64),
                record.block_hash,
                record.reason,
                record.created_at as i64,
                record.updated_at as i64,
            ],
        )
        .map_err(|e| map_insert_error(e, || format!("{}:{}", record.network, record.external_id)))?;

        Ok(())
    }

    fn update_deposit_sync(&self, record: &DepositTransaction) -> StorageResult<()> {
        let conn = self.conn()?;

        let rows_affected = conn
            .execute(
                r#"
            UPDATE deposits SET
                status = ?2,
                confirmations = ?3,
                block_number = ?4,
                block_hash = ?5,
                reason = ?6,
                updated_at = ?7
            WHERE id = ?1
            "#,
                params![
                    record.id,
                    record.status.to_string(),
                    record.confirmations as i64,
                    record.block_number.map(|v| v as i64),
                    record.block_hash,
                    record.reason,
                    record.updated_at as i64,
                ],
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        if rows_affected == 0 {
            return Err(StorageError::NotFound(record.id.clone()));
        }

        Ok(())
    }

    fn query_deposits(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<DepositTransaction>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let records = stmt
            .query_map(args, |row| Self::row_to_deposit(row))
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        Ok(records)
    }

    fn insert_withdrawal_sync(&self, record: &WithdrawalTransaction) -> StorageResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO withdrawals (
                id, user_id, network, destination_address, destination_tag, amount, fee,
                status, external_id, retries, debited, reason, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                record.id,
                record.user_id,
                record.network.as_str(),
                record.destination_address,
                record.destination_tag.map(i64::from),
                record.amount.to_string(),
                record.fee.map(|f| f.to_string()),
                record.status.to_string(),
                record.external_id,
                record.retries as i64,
                record.debited as i64,
                record.reason,
                record.created_at as i64,
                record.updated_at as i64,
            ],
        )
        .map_err(|e| map_insert_error(e, || record.id.clone()))?;

        Ok(())
    }

    fn update_withdrawal_sync(&self, record: &WithdrawalTransaction) -> StorageResult<()> {
        let conn = self.conn()?;

        let rows_affected = conn
            .execute(
                r#"
            UPDATE withdrawals SET
                fee = ?2,
                status = ?3,
                external_id = ?4,
                retries = ?5,
                debited = ?6,
                reason = ?7,
                updated_at = ?8
            WHERE id = ?1
            "#,
                params![
                    record.id,
                    record.fee.map(|f| f.to_string()),
                    record.status.to_string(),
                    record.external_id,
                    record.retries as i64,
                    record.debited as i64,
                    record.reason,
                    record.updated_at as i64,
                ],
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        if rows_affected == 0 {
            return Err(StorageError::NotFound(record.id.clone()));
        }

        Ok(())
    }

    fn query_withdrawals(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<WithdrawalTransaction>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let records = stmt
            .query_map(args, |row| Self::row_to_withdrawal(row))
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        Ok(records)
    }

    fn insert_wallet_sync(&self, wallet: &Wallet) -> StorageResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO wallets (wallet_id, user_id, network, address, destination_tag, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                wallet.wallet_id,
                wallet.user_id,
                wallet.network.as_str(),
                wallet.address,
                wallet.destination_tag.map(i64::from),
                wallet.created_at as i64,
            ],
        )
        .map_err(|e| map_insert_error(e, || format!("{}:{}", wallet.network, wallet.user_id)))?;

        Ok(())
    }

    fn query_wallets(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> StorageResult<Vec<Wallet>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let wallets = stmt
            .query_map(args, |row| Self::row_to_wallet(row))
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        Ok(wallets)
    }

    fn count_by_status_sync(&self, table: &str) -> StorageResult<HashMap<String, u64>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(&format!("SELECT status, COUNT(*) FROM {} GROUP BY status", table))
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut counts = HashMap::new();
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| StorageError::Database(e.to_string()))?;

        for row in rows {
            let (status, count) = row.map_err(|e| StorageError::Database(e.to_string()))?;
            counts.insert(status, count as u64);
        }

        Ok(counts)
    }
}

fn conversion_error(col: &str, e: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{}: {}", col, e).into(),
    )
}

fn parse_col<T>(row: &rusqlite::Row, col: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(col)?;
    raw.parse().map_err(|e| conversion_error(col, e))
}

/// Unique and primary key violations become `Duplicate`
fn map_insert_error(e: rusqlite::Error, key: impl FnOnce() -> String) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.extended_code == 1555 || err.extended_code == 2067 {
            return StorageError::Duplicate(key());
        }
    }
    StorageError::Database(e.to_string())
}

#[async_trait]
impl DepositStore for SqliteStore {
    async fn insert(&self, record: &DepositTransaction) -> StorageResult<()> {
        self.insert_deposit_sync(record)
    }

    async fn update(&self, record: &DepositTransaction) -> StorageResult<()> {
        self.update_deposit_sync(record)
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<DepositTransaction>> {
        Ok(self
            .query_deposits("SELECT * FROM deposits WHERE id = ?1", &[&id])?
            .pop())
    }

    async fn get_by_external_id(
        &self,
        network: Network,
        external_id: &str,
    ) -> StorageResult<Option<DepositTransaction>> {
        Ok(self
            .query_deposits(
                "SELECT * FROM deposits WHERE network = ?1 AND external_id = ?2",
                &[&network.as_str(), &external_id],
            )?
            .pop())
    }

    async fn get_active(&self, network: Option<Network>) -> StorageResult<Vec<DepositTransaction>> {
        match network {
            Some(n) => self.query_deposits(
                r#"
                SELECT * FROM deposits
                WHERE status IN ('initiated', 'pending') AND network = ?1
                ORDER BY created_at ASC
                "#,
                &[&n.as_str()],
            ),
            None => self.query_deposits(
                r#"
                SELECT * FROM deposits
                WHERE status IN ('initiated', 'pending')
                ORDER BY created_at ASC
                "#,
                &[],
            ),
        }
    }

    async fn count_by_status(&self) -> StorageResult<HashMap<String, u64>> {
        self.count_by_status_sync("deposits")
    }
}

#[async_trait]
impl WithdrawalStore for SqliteStore {
    async fn insert(&self, record: &WithdrawalTransaction) -> StorageResult<()> {
        self.insert_withdrawal_sync(record)
    }

    async fn update(&self, record: &WithdrawalTransaction) -> StorageResult<()> {
        self.update_withdrawal_sync(record)
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<WithdrawalTransaction>> {
        Ok(self
            .query_withdrawals("SELECT * FROM withdrawals WHERE id = ?1", &[&id])?
            .pop())
    }

    async fn get_by_status(&self, status: WithdrawalStatus) -> StorageResult<Vec<WithdrawalTransaction>> {
        self.query_withdrawals(
            "SELECT * FROM withdrawals WHERE status = ?1 ORDER BY created_at ASC",
            &[&status.to_string()],
        )
    }

    async fn count_by_status(&self) -> StorageResult<HashMap<String, u64>> {
        self.count_by_status_sync("withdrawals")
    }
}

#[async_trait]
impl WalletStore for SqliteStore {
    async fn insert(&self, wallet: &Wallet) -> StorageResult<()> {
        self.insert_wallet_sync(wallet)
    }

    async fn get_for_user(&self, user_id: &str, network: Network) -> StorageResult<Option<Wallet>> {
        Ok(self
            .query_wallets(
                "SELECT * FROM wallets WHERE user_id = ?1 AND network = ?2",
                &[&user_id, &network.as_str()],
            )?
            .pop())
    }

    async fn find_owner(
        &self,
        network: Network,
        address: &str,
        destination_tag: Option<u32>,
    ) -> StorageResult<Option<Wallet>> {
        let tag = destination_tag.map(i64::from).unwrap_or(-1);
        Ok(self
            .query_wallets(
                r#"
                SELECT * FROM wallets
                WHERE network = ?1 AND address = ?2 AND IFNULL(destination_tag, -1) = ?3
                "#,
                &[&network.as_str(), &address, &tag],
            )?
            .pop())
    }

    async fn list_by_network(&self, network: Network) -> StorageResult<Vec<Wallet>> {
        self.query_wallets(
            "SELECT * FROM wallets WHERE network = ?1 ORDER BY created_at ASC",
            &[&network.as_str()],
        )
    }
}
