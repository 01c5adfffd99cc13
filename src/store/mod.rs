//! Embedded relational store.
//!
//! A single SQLite file in WAL mode behind an async pool (~20 connections,
//! 30s busy timeout). The schema is applied by numbered DDL scripts at
//! startup, each inside its own transaction.
//!
//! Every query is scoped to the network fixed at process startup: mutating
//! queries write the `network` column, reads filter on it. Two rows for the
//! same (chain, index) on different networks are distinct and never mix.

mod migrations;
mod types;

pub use types::*;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::chain::{Chain, Network, RawAmount, Token, UnixTimestamp};

/// Rows per transaction for bulk address inserts.
const INSERT_BATCH: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
    #[error("migration {version} failed: {source}")]
    Migration {
        version: usize,
        source: sqlx::Error,
    },
}

/// Handle to the SQLite store. Cheap to clone; all clones share the pool.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
    network: Network,
}

impl Store {
    /// Opens (creating if missing) the database file, applies pending
    /// migrations, and returns the handle.
    pub async fn open(path: &Path, network: Network) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(20)
            .connect_with(options)
            .await?;
        let store = Self { pool, network };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests. Single connection, since each `:memory:`
    /// connection is its own database.
    pub async fn open_in_memory(network: Network) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("static connection string")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool, network };
        store.migrate().await?;
        Ok(store)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn net(&self) -> &'static str {
        self.network.as_str()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let row = sqlx::query("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        let applied: i64 = row.try_get(0)?;
        for (i, script) in migrations::MIGRATIONS.iter().enumerate() {
            let version = i as i64 + 1;
            if version <= applied {
                continue;
            }
            let mut tx = self.pool.begin().await.map_err(|source| {
                StoreError::Migration {
                    version: version as usize,
                    source,
                }
            })?;
            let apply = async {
                sqlx::raw_sql(script).execute(&mut *tx).await?;
                sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                    .bind(version)
                    .bind(UnixTimestamp::now().0)
                    .execute(&mut *tx)
                    .await?;
                sqlx::raw_sql(&format!("PRAGMA user_version = {version}"))
                    .execute(&mut *tx)
                    .await?;
                Ok::<_, sqlx::Error>(())
            };
            match apply.await {
                Ok(()) => tx.commit().await.map_err(|source| StoreError::Migration {
                    version: version as usize,
                    source,
                })?,
                Err(source) => {
                    return Err(StoreError::Migration {
                        version: version as usize,
                        source,
                    });
                }
            }
            tracing::info!(version, "applied schema migration");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    /// Bulk-inserts derived addresses, batched ~10k rows per transaction.
    /// Existing (network, chain, idx) rows are left untouched, which makes
    /// repeated init runs no-ops.
    pub async fn insert_addresses(
        &self,
        chain: Chain,
        rows: &[(u32, String)],
    ) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for batch in rows.chunks(INSERT_BATCH) {
            let mut tx = self.pool.begin().await?;
            for (index, address) in batch {
                let result = sqlx::query(
                    "INSERT OR IGNORE INTO addresses (network, chain, idx, address) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(self.net())
                .bind(chain.as_str())
                .bind(*index as i64)
                .bind(address)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected();
            }
            tx.commit().await?;
        }
        Ok(inserted)
    }

    pub async fn address_count(&self, chain: Chain) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM addresses WHERE network = ? AND chain = ?")
            .bind(self.net())
            .bind(chain.as_str())
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    /// Addresses with index in `[0, max_id]`, in index order.
    pub async fn addresses_in_range(
        &self,
        chain: Chain,
        max_id: u32,
    ) -> Result<Vec<AddressRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT idx, address FROM addresses \
             WHERE network = ? AND chain = ? AND idx <= ? ORDER BY idx",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .bind(max_id as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| address_row(chain, r)).collect()
    }

    pub async fn address_by_index(
        &self,
        chain: Chain,
        index: u32,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT address FROM addresses WHERE network = ? AND chain = ? AND idx = ?",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .bind(index as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(r) => Some(r.try_get("address")?),
            None => None,
        })
    }

    /// One page of addresses with their balances attached.
    pub async fn addresses_page(
        &self,
        chain: Chain,
        page: u32,
        page_size: u32,
        has_balance: Option<bool>,
        token: Option<Token>,
    ) -> Result<(Vec<(AddressRow, Vec<BalanceRow>)>, u64), StoreError> {
        let token_filter = token.map(|t| t.as_str().to_string());
        let mut filter = String::from("network = ? AND chain = ?");
        if has_balance == Some(true) {
            filter.push_str(
                " AND idx IN (SELECT idx FROM balances \
                 WHERE network = ? AND chain = ? AND amount != '0'",
            );
            if token_filter.is_some() {
                filter.push_str(" AND token = ?");
            }
            filter.push(')');
        } else if has_balance == Some(false) {
            filter.push_str(
                " AND idx NOT IN (SELECT idx FROM balances \
                 WHERE network = ? AND chain = ? AND amount != '0'",
            );
            if token_filter.is_some() {
                filter.push_str(" AND token = ?");
            }
            filter.push(')');
        }

        let bind_subquery = has_balance.is_some();
        let count_sql = format!("SELECT COUNT(*) FROM addresses WHERE {filter}");
        let mut count_query = sqlx::query(&count_sql)
            .bind(self.net())
            .bind(chain.as_str());
        if bind_subquery {
            count_query = count_query.bind(self.net()).bind(chain.as_str());
            if let Some(t) = &token_filter {
                count_query = count_query.bind(t.clone());
            }
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get(0)?;

        let page_sql = format!(
            "SELECT idx, address FROM addresses WHERE {filter} ORDER BY idx LIMIT ? OFFSET ?"
        );
        let mut page_query = sqlx::query(&page_sql)
            .bind(self.net())
            .bind(chain.as_str());
        if bind_subquery {
            page_query = page_query.bind(self.net()).bind(chain.as_str());
            if let Some(t) = &token_filter {
                page_query = page_query.bind(t.clone());
            }
        }
        let offset = page.saturating_sub(1) as i64 * page_size as i64;
        let rows = page_query
            .bind(page_size as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let addresses: Vec<AddressRow> = rows
            .iter()
            .map(|r| address_row(chain, r))
            .collect::<Result<_, _>>()?;
        let balances = self
            .balances_for(chain, addresses.iter().map(|a| a.index))
            .await?;
        let hydrated = addresses
            .into_iter()
            .map(|a| {
                let b = balances.get(&a.index).cloned().unwrap_or_default();
                (a, b)
            })
            .collect();
        Ok((hydrated, total as u64))
    }

    /// Every address of a chain with balances, in index order, for export.
    pub async fn addresses_export(
        &self,
        chain: Chain,
    ) -> Result<Vec<(AddressRow, Vec<BalanceRow>)>, StoreError> {
        let rows = sqlx::query(
            "SELECT idx, address FROM addresses WHERE network = ? AND chain = ? ORDER BY idx",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .fetch_all(&self.pool)
        .await?;
        let addresses: Vec<AddressRow> = rows
            .iter()
            .map(|r| address_row(chain, r))
            .collect::<Result<_, _>>()?;
        let balances = self
            .balances_for(chain, addresses.iter().map(|a| a.index))
            .await?;
        Ok(addresses
            .into_iter()
            .map(|a| {
                let b = balances.get(&a.index).cloned().unwrap_or_default();
                (a, b)
            })
            .collect())
    }

    async fn balances_for(
        &self,
        chain: Chain,
        indexes: impl Iterator<Item = u32>,
    ) -> Result<HashMap<u32, Vec<BalanceRow>>, StoreError> {
        let indexes: Vec<u32> = indexes.collect();
        let mut out: HashMap<u32, Vec<BalanceRow>> = HashMap::new();
        if indexes.is_empty() {
            return Ok(out);
        }
        // SQLite has no array binds; build the placeholder list per chunk.
        for chunk in indexes.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT idx, token, amount, last_scanned_at FROM balances \
                 WHERE network = ? AND chain = ? AND idx IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(self.net()).bind(chain.as_str());
            for idx in chunk {
                query = query.bind(*idx as i64);
            }
            for row in query.fetch_all(&self.pool).await? {
                let balance = balance_row(chain, &row)?;
                out.entry(balance.index).or_default().push(balance);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Balances + scan cursor
    // ------------------------------------------------------------------

    /// Writes a batch of balances and advances the scan cursor in one
    /// transaction, so a crash never loses progress or reports unscanned
    /// addresses as scanned.
    pub async fn upsert_balances_and_cursor(
        &self,
        chain: Chain,
        balances: &[BalanceRow],
        cursor: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for b in balances {
            sqlx::query(
                "INSERT INTO balances (network, chain, idx, token, amount, last_scanned_at) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (network, chain, idx, token) \
                 DO UPDATE SET amount = excluded.amount, last_scanned_at = excluded.last_scanned_at",
            )
            .bind(self.net())
            .bind(chain.as_str())
            .bind(b.index as i64)
            .bind(b.token.as_str())
            .bind(b.amount.to_string())
            .bind(b.last_scanned_at.0)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "UPDATE scan_state SET last_scanned_index = ?, updated_at = ? \
             WHERE network = ? AND chain = ?",
        )
        .bind(cursor)
        .bind(UnixTimestamp::now().0)
        .bind(self.net())
        .bind(chain.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Funded addresses for (chain, token), in index order.
    pub async fn funded_addresses(
        &self,
        chain: Chain,
        token: Token,
    ) -> Result<Vec<(AddressRow, RawAmount)>, StoreError> {
        let rows = sqlx::query(
            "SELECT b.idx, a.address, b.amount FROM balances b \
             JOIN addresses a ON a.network = b.network AND a.chain = b.chain AND a.idx = b.idx \
             WHERE b.network = ? AND b.chain = ? AND b.token = ? AND b.amount != '0' \
             ORDER BY b.idx",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .bind(token.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let address = address_row(chain, r)?;
                let amount = parse_amount(r.try_get("amount")?)?;
                Ok((address, amount))
            })
            .collect()
    }

    /// Balance of one (chain, index, token), zero if never scanned.
    pub async fn balance_of(
        &self,
        chain: Chain,
        index: u32,
        token: Token,
    ) -> Result<RawAmount, StoreError> {
        let row = sqlx::query(
            "SELECT amount FROM balances \
             WHERE network = ? AND chain = ? AND idx = ? AND token = ?",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .bind(index as i64)
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => parse_amount(r.try_get("amount")?),
            None => Ok(RawAmount::ZERO),
        }
    }

    pub async fn funded_count(&self, chain: Chain) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT idx) FROM balances \
             WHERE network = ? AND chain = ? AND amount != '0'",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    /// Deletes all balances for the current network.
    pub async fn reset_balances(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM balances WHERE network = ?")
            .bind(self.net())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes addresses, balances, scan state, transactions, and tx-states
    /// for the current network. The other network's rows are untouched.
    pub async fn reset_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "balances",
            "addresses",
            "scan_state",
            "transactions",
            "tx_states",
        ] {
            sqlx::raw_sql(&format!("DELETE FROM {table} WHERE network = '{}'", self.net()))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scan state
    // ------------------------------------------------------------------

    pub async fn scan_state(&self, chain: Chain) -> Result<Option<ScanStateRow>, StoreError> {
        let row = sqlx::query(
            "SELECT chain, last_scanned_index, max_scan_id, status, started_at, updated_at \
             FROM scan_state WHERE network = ? AND chain = ?",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(scan_state_row).transpose()
    }

    pub async fn all_scan_states(&self) -> Result<Vec<ScanStateRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT chain, last_scanned_index, max_scan_id, status, started_at, updated_at \
             FROM scan_state WHERE network = ? ORDER BY chain",
        )
        .bind(self.net())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scan_state_row).collect()
    }

    /// Marks a scan started: resets the cursor, records the requested upper
    /// bound, and stamps started_at.
    pub async fn begin_scan(&self, chain: Chain, max_scan_id: i64) -> Result<(), StoreError> {
        let now = UnixTimestamp::now().0;
        sqlx::query(
            "INSERT INTO scan_state \
             (network, chain, last_scanned_index, max_scan_id, status, started_at, updated_at) \
             VALUES (?, ?, -1, ?, 'scanning', ?, ?) \
             ON CONFLICT (network, chain) DO UPDATE SET \
             last_scanned_index = -1, max_scan_id = excluded.max_scan_id, \
             status = 'scanning', started_at = excluded.started_at, updated_at = excluded.updated_at",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .bind(max_scan_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_scan_status(&self, chain: Chain, status: ScanStatus) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE scan_state SET status = ?, updated_at = ? WHERE network = ? AND chain = ?",
        )
        .bind(status.as_str())
        .bind(UnixTimestamp::now().0)
        .bind(self.net())
        .bind(chain.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Inserts a transaction record, or advances the status of an existing
    /// one. Status moves monotonically; a stored `confirmed` never changes.
    pub async fn record_transaction(&self, record: &TxRecord) -> Result<bool, StoreError> {
        let existing = sqlx::query(
            "SELECT status FROM transactions \
             WHERE network = ? AND chain = ? AND tx_hash = ? AND direction = ?",
        )
        .bind(self.net())
        .bind(record.chain.as_str())
        .bind(&record.tx_hash)
        .bind(record.direction.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let stored: TxStatus = parse_field(row.try_get("status")?)?;
            if !stored.may_advance_to(record.status) {
                return Ok(false);
            }
            sqlx::query(
                "UPDATE transactions SET status = ?, block_number = COALESCE(?, block_number), \
                 block_time = COALESCE(?, block_time), gas = COALESCE(?, gas) \
                 WHERE network = ? AND chain = ? AND tx_hash = ? AND direction = ?",
            )
            .bind(record.status.as_str())
            .bind(record.block_number)
            .bind(record.block_time.map(|t| t.0))
            .bind(record.gas.map(|g| g.to_string()))
            .bind(self.net())
            .bind(record.chain.as_str())
            .bind(&record.tx_hash)
            .bind(record.direction.as_str())
            .execute(&self.pool)
            .await?;
            return Ok(true);
        }

        sqlx::query(
            "INSERT INTO transactions (network, chain, tx_hash, direction, token, amount, \
             from_addr, to_addr, block_number, block_time, gas, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.net())
        .bind(record.chain.as_str())
        .bind(&record.tx_hash)
        .bind(record.direction.as_str())
        .bind(record.token.as_str())
        .bind(record.amount.to_string())
        .bind(&record.from_addr)
        .bind(&record.to_addr)
        .bind(record.block_number)
        .bind(record.block_time.map(|t| t.0))
        .bind(record.gas.map(|g| g.to_string()))
        .bind(record.status.as_str())
        .bind(record.created_at.0)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    pub async fn transaction_status(
        &self,
        chain: Chain,
        tx_hash: &str,
        direction: Direction,
    ) -> Result<Option<TxStatus>, StoreError> {
        let row = sqlx::query(
            "SELECT status FROM transactions \
             WHERE network = ? AND chain = ? AND tx_hash = ? AND direction = ?",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .bind(tx_hash)
        .bind(direction.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse_field(r.try_get("status")?)).transpose()
    }

    /// Pending inbound transactions to an address, for confirmation re-polls.
    pub async fn pending_incoming(
        &self,
        chain: Chain,
        to_addr: &str,
    ) -> Result<Vec<TxRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT chain, tx_hash, direction, token, amount, from_addr, to_addr, block_number, \
             block_time, gas, status, created_at FROM transactions \
             WHERE network = ? AND chain = ? AND to_addr = ? AND direction = 'in' \
             AND status = 'pending' ORDER BY created_at",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .bind(to_addr)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tx_record_row).collect()
    }

    /// Latest recorded inbound block time for an address, for the poller
    /// cutoff.
    pub async fn latest_incoming_time(
        &self,
        chain: Chain,
        to_addr: &str,
    ) -> Result<Option<UnixTimestamp>, StoreError> {
        let row = sqlx::query(
            "SELECT MAX(block_time) AS t FROM transactions \
             WHERE network = ? AND chain = ? AND to_addr = ? AND direction = 'in'",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .bind(to_addr)
        .fetch_one(&self.pool)
        .await?;
        let t: Option<i64> = row.try_get("t")?;
        Ok(t.map(UnixTimestamp))
    }

    pub async fn transactions_page(
        &self,
        chain: Option<Chain>,
        direction: Option<Direction>,
        token: Option<Token>,
        status: Option<TxStatus>,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<TxRecord>, u64), StoreError> {
        let mut filter = String::from("network = ?");
        if chain.is_some() {
            filter.push_str(" AND chain = ?");
        }
        if direction.is_some() {
            filter.push_str(" AND direction = ?");
        }
        if token.is_some() {
            filter.push_str(" AND token = ?");
        }
        if status.is_some() {
            filter.push_str(" AND status = ?");
        }

        let count_sql = format!("SELECT COUNT(*) FROM transactions WHERE {filter}");
        let mut count_query = sqlx::query(&count_sql).bind(self.net());
        if let Some(c) = chain {
            count_query = count_query.bind(c.as_str());
        }
        if let Some(d) = direction {
            count_query = count_query.bind(d.as_str());
        }
        if let Some(t) = token {
            count_query = count_query.bind(t.as_str());
        }
        if let Some(s) = status {
            count_query = count_query.bind(s.as_str());
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get(0)?;

        let page_sql = format!(
            "SELECT chain, tx_hash, direction, token, amount, from_addr, to_addr, block_number, \
             block_time, gas, status, created_at FROM transactions WHERE {filter} \
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );
        let mut page_query = sqlx::query(&page_sql).bind(self.net());
        if let Some(c) = chain {
            page_query = page_query.bind(c.as_str());
        }
        if let Some(d) = direction {
            page_query = page_query.bind(d.as_str());
        }
        if let Some(t) = token {
            page_query = page_query.bind(t.as_str());
        }
        if let Some(s) = status {
            page_query = page_query.bind(s.as_str());
        }
        let rows = page_query
            .bind(page_size as i64)
            .bind(page.saturating_sub(1) as i64 * page_size as i64)
            .fetch_all(&self.pool)
            .await?;
        let records = rows.iter().map(tx_record_row).collect::<Result<_, _>>()?;
        Ok((records, total as u64))
    }

    // ------------------------------------------------------------------
    // TX-state (in-flight sweeps)
    // ------------------------------------------------------------------

    pub async fn insert_tx_state(&self, row: &TxStateRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tx_states (sweep_id, network, chain, address_index, kind, nonce, \
             tx_hash, status, attempt, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (sweep_id, address_index, kind) DO UPDATE SET \
             nonce = excluded.nonce, tx_hash = excluded.tx_hash, status = excluded.status, \
             attempt = excluded.attempt, updated_at = excluded.updated_at",
        )
        .bind(&row.sweep_id)
        .bind(self.net())
        .bind(row.chain.as_str())
        .bind(row.address_index as i64)
        .bind(row.kind.as_str())
        .bind(row.nonce)
        .bind(&row.tx_hash)
        .bind(row.status.as_str())
        .bind(row.attempt)
        .bind(row.created_at.0)
        .bind(row.updated_at.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_tx_state(
        &self,
        sweep_id: &str,
        address_index: u32,
        kind: TxStateKind,
        status: TxStateStatus,
        tx_hash: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tx_states SET status = ?, tx_hash = COALESCE(?, tx_hash), updated_at = ? \
             WHERE sweep_id = ? AND address_index = ? AND kind = ?",
        )
        .bind(status.as_str())
        .bind(tx_hash)
        .bind(UnixTimestamp::now().0)
        .bind(sweep_id)
        .bind(address_index as i64)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn tx_states_for_sweep(&self, sweep_id: &str) -> Result<Vec<TxStateRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT sweep_id, chain, address_index, kind, nonce, tx_hash, status, attempt, \
             created_at, updated_at FROM tx_states \
             WHERE network = ? AND sweep_id = ? ORDER BY address_index",
        )
        .bind(self.net())
        .bind(sweep_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tx_state_row).collect()
    }

    /// TX-state rows that a restarted process must reconcile.
    pub async fn non_terminal_tx_states(&self) -> Result<Vec<TxStateRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT sweep_id, chain, address_index, kind, nonce, tx_hash, status, attempt, \
             created_at, updated_at FROM tx_states \
             WHERE network = ? AND status IN ('building', 'signed', 'broadcast') \
             ORDER BY created_at",
        )
        .bind(self.net())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tx_state_row).collect()
    }

    /// Whether a gas pre-seed to this target has ever confirmed; used to make
    /// retried pre-seed runs idempotent.
    pub async fn has_confirmed_preseed(
        &self,
        chain: Chain,
        target_index: u32,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM tx_states \
             WHERE network = ? AND chain = ? AND address_index = ? AND kind = 'preseed' \
             AND status = 'confirmed'",
        )
        .bind(self.net())
        .bind(chain.as_str())
        .bind(target_index as i64)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count > 0)
    }

    pub async fn dismiss_sweep(&self, sweep_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE tx_states SET status = 'dismissed', updated_at = ? \
             WHERE network = ? AND sweep_id = ? AND status IN ('building', 'signed', 'broadcast')",
        )
        .bind(UnixTimestamp::now().0)
        .bind(self.net())
        .bind(sweep_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Provider health
    // ------------------------------------------------------------------

    pub async fn upsert_provider_health(&self, row: &ProviderHealthRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO provider_health (provider, chain, circuit_state, consecutive_failures, \
             last_success_at, last_failure_at, status) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (provider, chain) DO UPDATE SET \
             circuit_state = excluded.circuit_state, \
             consecutive_failures = excluded.consecutive_failures, \
             last_success_at = COALESCE(excluded.last_success_at, provider_health.last_success_at), \
             last_failure_at = COALESCE(excluded.last_failure_at, provider_health.last_failure_at), \
             status = excluded.status",
        )
        .bind(&row.provider)
        .bind(row.chain.as_str())
        .bind(row.circuit_state.as_str())
        .bind(row.consecutive_failures)
        .bind(row.last_success_at.map(|t| t.0))
        .bind(row.last_failure_at.map(|t| t.0))
        .bind(row.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn provider_health_snapshot(&self) -> Result<Vec<ProviderHealthRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT provider, chain, circuit_state, consecutive_failures, last_success_at, \
             last_failure_at, status FROM provider_health ORDER BY chain, provider",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(provider_health_row).collect()
    }

    // ------------------------------------------------------------------
    // Watches
    // ------------------------------------------------------------------

    pub async fn insert_watch(&self, row: &WatchRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO watches (watch_id, chain, address, status, started_at, expires_at, \
             completed_at, poll_count, last_poll_at, last_poll_result) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.watch_id)
        .bind(row.chain.as_str())
        .bind(&row.address)
        .bind(row.status.as_str())
        .bind(row.started_at.0)
        .bind(row.expires_at.0)
        .bind(row.completed_at.map(|t| t.0))
        .bind(row.poll_count)
        .bind(row.last_poll_at.map(|t| t.0))
        .bind(&row.last_poll_result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn watch_by_id(&self, watch_id: &str) -> Result<Option<WatchRow>, StoreError> {
        let row = sqlx::query(
            "SELECT watch_id, chain, address, status, started_at, expires_at, completed_at, \
             poll_count, last_poll_at, last_poll_result FROM watches WHERE watch_id = ?",
        )
        .bind(watch_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(watch_row).transpose()
    }

    pub async fn watches(&self, active_only: bool) -> Result<Vec<WatchRow>, StoreError> {
        let sql = if active_only {
            "SELECT watch_id, chain, address, status, started_at, expires_at, completed_at, \
             poll_count, last_poll_at, last_poll_result FROM watches WHERE status = 'active' \
             ORDER BY started_at DESC"
        } else {
            "SELECT watch_id, chain, address, status, started_at, expires_at, completed_at, \
             poll_count, last_poll_at, last_poll_result FROM watches ORDER BY started_at DESC"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(watch_row).collect()
    }

    /// Whether a non-terminal watch already exists for (chain, address).
    pub async fn has_active_watch(&self, chain: Chain, address: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM watches WHERE chain = ? AND address = ? AND status = 'active'",
        )
        .bind(chain.as_str())
        .bind(address)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count > 0)
    }

    pub async fn finish_watch(
        &self,
        watch_id: &str,
        status: WatchStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE watches SET status = ?, completed_at = ? WHERE watch_id = ?")
            .bind(status.as_str())
            .bind(UnixTimestamp::now().0)
            .bind(watch_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_watch(&self, watch_id: &str, result: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE watches SET poll_count = poll_count + 1, last_poll_at = ?, \
             last_poll_result = ? WHERE watch_id = ?",
        )
        .bind(UnixTimestamp::now().0)
        .bind(result)
        .bind(watch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Points
    // ------------------------------------------------------------------

    pub async fn points_account(
        &self,
        chain: Chain,
        address: &str,
    ) -> Result<PointsRow, StoreError> {
        let row = sqlx::query(
            "SELECT chain, address, unclaimed, pending, total FROM points \
             WHERE chain = ? AND address = ?",
        )
        .bind(chain.as_str())
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => points_row(&r),
            None => Ok(PointsRow {
                chain,
                address: address.to_string(),
                unclaimed: 0,
                pending: 0,
                total: 0,
            }),
        }
    }

    pub async fn all_points(&self) -> Result<Vec<PointsRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT chain, address, unclaimed, pending, total FROM points ORDER BY chain, address",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(points_row).collect()
    }

    /// Adds informational pending points for a detected-but-unconfirmed
    /// transaction.
    pub async fn add_pending_points(
        &self,
        chain: Chain,
        address: &str,
        points: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO points (chain, address, unclaimed, pending, total) VALUES (?, ?, 0, ?, 0) \
             ON CONFLICT (chain, address) DO UPDATE SET pending = pending + excluded.pending",
        )
        .bind(chain.as_str())
        .bind(address)
        .bind(points)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Credits confirmed points: moves the pending amount out (bounded at
    /// zero) and adds to both unclaimed and total in one transaction.
    pub async fn confirm_points(
        &self,
        chain: Chain,
        address: &str,
        points: i64,
        pending_consumed: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO points (chain, address, unclaimed, pending, total) VALUES (?, ?, ?, 0, ?) \
             ON CONFLICT (chain, address) DO UPDATE SET \
             unclaimed = unclaimed + excluded.unclaimed, \
             pending = MAX(0, pending - ?), \
             total = total + excluded.total",
        )
        .bind(chain.as_str())
        .bind(address)
        .bind(points)
        .bind(points)
        .bind(pending_consumed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Zeroes `unclaimed` for the given addresses. `pending` and `total` are
    /// untouched; `total` never decreases.
    pub async fn claim_points(&self, claims: &[(Chain, String)]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;
        for (chain, address) in claims {
            let result =
                sqlx::query("UPDATE points SET unclaimed = 0 WHERE chain = ? AND address = ?")
                    .bind(chain.as_str())
                    .bind(address)
                    .execute(&mut *tx)
                    .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // System errors & settings
    // ------------------------------------------------------------------

    pub async fn log_system_error(&self, source: &str, message: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO system_errors (source, message, created_at) VALUES (?, ?, ?)")
            .bind(source)
            .bind(message)
            .bind(UnixTimestamp::now().0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn system_errors_page(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<(String, String, UnixTimestamp)>, StoreError> {
        let rows = sqlx::query(
            "SELECT source, message, created_at FROM system_errors \
             ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(page_size as i64)
        .bind(page.saturating_sub(1) as i64 * page_size as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok((
                    r.try_get("source")?,
                    r.try_get("message")?,
                    UnixTimestamp(r.try_get("created_at")?),
                ))
            })
            .collect()
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE network = ? AND key = ?")
            .bind(self.net())
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => Some(r.try_get("value")?),
            None => None,
        })
    }

    pub async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (network, key, value) VALUES (?, ?, ?) \
             ON CONFLICT (network, key) DO UPDATE SET value = excluded.value",
        )
        .bind(self.net())
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_settings(&self) -> Result<HashMap<String, String>, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM settings WHERE network = ?")
            .bind(self.net())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("key")?, r.try_get("value")?)))
            .collect()
    }
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn parse_field<T: FromStr>(raw: String) -> Result<T, StoreError>
where
    T::Err: Display,
{
    raw.parse()
        .map_err(|e: T::Err| StoreError::Corrupt(e.to_string()))
}

fn parse_amount(raw: String) -> Result<RawAmount, StoreError> {
    raw.parse().map_err(|_| {
        StoreError::Corrupt(format!("amount {raw:?} is not a decimal integer string"))
    })
}

fn address_row(chain: Chain, row: &SqliteRow) -> Result<AddressRow, StoreError> {
    let index: i64 = row.try_get("idx")?;
    Ok(AddressRow {
        chain,
        index: index as u32,
        address: row.try_get("address")?,
    })
}

fn balance_row(chain: Chain, row: &SqliteRow) -> Result<BalanceRow, StoreError> {
    let index: i64 = row.try_get("idx")?;
    Ok(BalanceRow {
        chain,
        index: index as u32,
        token: parse_field(row.try_get("token")?)?,
        amount: parse_amount(row.try_get("amount")?)?,
        last_scanned_at: UnixTimestamp(row.try_get("last_scanned_at")?),
    })
}

fn scan_state_row(row: &SqliteRow) -> Result<ScanStateRow, StoreError> {
    Ok(ScanStateRow {
        chain: parse_field(row.try_get("chain")?)?,
        last_scanned_index: row.try_get("last_scanned_index")?,
        max_scan_id: row.try_get("max_scan_id")?,
        status: parse_field(row.try_get("status")?)?,
        started_at: row
            .try_get::<Option<i64>, _>("started_at")?
            .map(UnixTimestamp),
        updated_at: UnixTimestamp(row.try_get("updated_at")?),
    })
}

fn tx_record_row(row: &SqliteRow) -> Result<TxRecord, StoreError> {
    let gas: Option<String> = row.try_get("gas")?;
    Ok(TxRecord {
        chain: parse_field(row.try_get("chain")?)?,
        tx_hash: row.try_get("tx_hash")?,
        direction: parse_field(row.try_get("direction")?)?,
        token: parse_field(row.try_get("token")?)?,
        amount: parse_amount(row.try_get("amount")?)?,
        from_addr: row.try_get("from_addr")?,
        to_addr: row.try_get("to_addr")?,
        block_number: row.try_get("block_number")?,
        block_time: row
            .try_get::<Option<i64>, _>("block_time")?
            .map(UnixTimestamp),
        gas: gas.map(parse_amount).transpose()?,
        status: parse_field(row.try_get("status")?)?,
        created_at: UnixTimestamp(row.try_get("created_at")?),
    })
}

fn tx_state_row(row: &SqliteRow) -> Result<TxStateRow, StoreError> {
    let index: i64 = row.try_get("address_index")?;
    Ok(TxStateRow {
        sweep_id: row.try_get("sweep_id")?,
        chain: parse_field(row.try_get("chain")?)?,
        address_index: index as u32,
        kind: parse_field(row.try_get("kind")?)?,
        nonce: row.try_get("nonce")?,
        tx_hash: row.try_get("tx_hash")?,
        status: parse_field(row.try_get("status")?)?,
        attempt: row.try_get("attempt")?,
        created_at: UnixTimestamp(row.try_get("created_at")?),
        updated_at: UnixTimestamp(row.try_get("updated_at")?),
    })
}

fn provider_health_row(row: &SqliteRow) -> Result<ProviderHealthRow, StoreError> {
    Ok(ProviderHealthRow {
        provider: row.try_get("provider")?,
        chain: parse_field(row.try_get("chain")?)?,
        circuit_state: parse_field(row.try_get("circuit_state")?)?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        last_success_at: row
            .try_get::<Option<i64>, _>("last_success_at")?
            .map(UnixTimestamp),
        last_failure_at: row
            .try_get::<Option<i64>, _>("last_failure_at")?
            .map(UnixTimestamp),
        status: parse_field(row.try_get("status")?)?,
    })
}

fn watch_row(row: &SqliteRow) -> Result<WatchRow, StoreError> {
    Ok(WatchRow {
        watch_id: row.try_get("watch_id")?,
        chain: parse_field(row.try_get("chain")?)?,
        address: row.try_get("address")?,
        status: parse_field(row.try_get("status")?)?,
        started_at: UnixTimestamp(row.try_get("started_at")?),
        expires_at: UnixTimestamp(row.try_get("expires_at")?),
        completed_at: row
            .try_get::<Option<i64>, _>("completed_at")?
            .map(UnixTimestamp),
        poll_count: row.try_get("poll_count")?,
        last_poll_at: row
            .try_get::<Option<i64>, _>("last_poll_at")?
            .map(UnixTimestamp),
        last_poll_result: row.try_get("last_poll_result")?,
    })
}

fn points_row(row: &SqliteRow) -> Result<PointsRow, StoreError> {
    Ok(PointsRow {
        chain: parse_field(row.try_get("chain")?)?,
        address: row.try_get("address")?,
        unclaimed: row.try_get("unclaimed")?,
        pending: row.try_get("pending")?,
        total: row.try_get("total")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::open_in_memory(Network::Mainnet).await.unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let s = store().await;
        // Re-running against the same pool applies nothing further.
        s.migrate().await.unwrap();
        assert_eq!(s.address_count(Chain::Btc).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn address_insert_is_idempotent() {
        let s = store().await;
        let rows = vec![(0, "addr0".to_string()), (1, "addr1".to_string())];
        assert_eq!(s.insert_addresses(Chain::Btc, &rows).await.unwrap(), 2);
        assert_eq!(s.insert_addresses(Chain::Btc, &rows).await.unwrap(), 0);
        assert_eq!(s.address_count(Chain::Btc).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn balances_and_cursor_advance_together() {
        let s = store().await;
        s.insert_addresses(Chain::Bsc, &[(0, "a".into()), (1, "b".into())])
            .await
            .unwrap();
        s.begin_scan(Chain::Bsc, 1).await.unwrap();
        let batch = vec![
            BalanceRow {
                chain: Chain::Bsc,
                index: 0,
                token: Token::Native,
                amount: "5000000000000000000".parse().unwrap(),
                last_scanned_at: UnixTimestamp::now(),
            },
            BalanceRow {
                chain: Chain::Bsc,
                index: 1,
                token: Token::Native,
                amount: RawAmount::ZERO,
                last_scanned_at: UnixTimestamp::now(),
            },
        ];
        s.upsert_balances_and_cursor(Chain::Bsc, &batch, 1)
            .await
            .unwrap();
        let state = s.scan_state(Chain::Bsc).await.unwrap().unwrap();
        assert_eq!(state.last_scanned_index, 1);
        let funded = s.funded_addresses(Chain::Bsc, Token::Native).await.unwrap();
        assert_eq!(funded.len(), 1);
        assert_eq!(funded[0].0.index, 0);
        assert_eq!(funded[0].1.to_string(), "5000000000000000000");
    }

    #[tokio::test]
    async fn confirmed_transactions_never_degrade() {
        let s = store().await;
        let mut record = TxRecord {
            chain: Chain::Btc,
            tx_hash: "deadbeef".into(),
            direction: Direction::In,
            token: Token::Native,
            amount: RawAmount::from_u64(1000),
            from_addr: "x".into(),
            to_addr: "y".into(),
            block_number: None,
            block_time: None,
            gas: None,
            status: TxStatus::Pending,
            created_at: UnixTimestamp::now(),
        };
        assert!(s.record_transaction(&record).await.unwrap());
        record.status = TxStatus::Confirmed;
        assert!(s.record_transaction(&record).await.unwrap());
        record.status = TxStatus::Uncertain;
        assert!(!s.record_transaction(&record).await.unwrap());
        assert_eq!(
            s.transaction_status(Chain::Btc, "deadbeef", Direction::In)
                .await
                .unwrap(),
            Some(TxStatus::Confirmed)
        );
    }

    #[tokio::test]
    async fn points_invariants_hold_through_claim() {
        let s = store().await;
        s.add_pending_points(Chain::Bsc, "A", 2200).await.unwrap();
        s.confirm_points(Chain::Bsc, "A", 500, 0).await.unwrap();
        s.confirm_points(Chain::Bsc, "A", 6000, 0).await.unwrap();
        let account = s.points_account(Chain::Bsc, "A").await.unwrap();
        assert_eq!(account.unclaimed, 6500);
        assert_eq!(account.total, 6500);
        assert_eq!(account.pending, 2200);

        s.claim_points(&[(Chain::Bsc, "A".to_string())])
            .await
            .unwrap();
        let account = s.points_account(Chain::Bsc, "A").await.unwrap();
        assert_eq!(account.unclaimed, 0);
        assert_eq!(account.total, 6500);
        assert_eq!(account.pending, 2200);

        s.confirm_points(Chain::Bsc, "A", 2200, 2200).await.unwrap();
        let account = s.points_account(Chain::Bsc, "A").await.unwrap();
        assert_eq!(account.unclaimed, 2200);
        assert_eq!(account.pending, 0);
        assert_eq!(account.total, 8700);
        assert!(account.unclaimed <= account.total);
    }

    #[tokio::test]
    async fn reset_all_is_network_scoped() {
        let s = store().await;
        s.insert_addresses(Chain::Btc, &[(0, "a".into())])
            .await
            .unwrap();
        s.reset_all().await.unwrap();
        assert_eq!(s.address_count(Chain::Btc).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn preseed_idempotency_lookup() {
        let s = store().await;
        let now = UnixTimestamp::now();
        s.insert_tx_state(&TxStateRow {
            sweep_id: "sweep-1".into(),
            chain: Chain::Bsc,
            address_index: 142,
            kind: TxStateKind::Preseed,
            nonce: Some(7),
            tx_hash: Some("0xabc".into()),
            status: TxStateStatus::Confirmed,
            attempt: 1,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
        assert!(s.has_confirmed_preseed(Chain::Bsc, 142).await.unwrap());
        assert!(!s.has_confirmed_preseed(Chain::Bsc, 287).await.unwrap());
    }
}
