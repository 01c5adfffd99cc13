//! Versioned schema, applied in ascending order at startup.
//!
//! Each entry is one DDL script; the store wraps each application in a
//! transaction and bumps `PRAGMA user_version` together with the DDL, so a
//! crash mid-migration leaves the previous version intact.

pub const MIGRATIONS: &[&str] = &[
    // 1: base schema
    r#"
    CREATE TABLE schema_migrations (
        version    INTEGER PRIMARY KEY,
        applied_at INTEGER NOT NULL
    );

    CREATE TABLE addresses (
        network  TEXT NOT NULL,
        chain    TEXT NOT NULL,
        idx      INTEGER NOT NULL CHECK (idx >= 0),
        address  TEXT NOT NULL,
        PRIMARY KEY (network, chain, idx),
        UNIQUE (network, chain, address)
    );

    CREATE TABLE balances (
        network         TEXT NOT NULL,
        chain           TEXT NOT NULL,
        idx             INTEGER NOT NULL,
        token           TEXT NOT NULL,
        amount          TEXT NOT NULL,
        last_scanned_at INTEGER NOT NULL,
        PRIMARY KEY (network, chain, idx, token)
    );
    CREATE INDEX balances_funded ON balances (network, chain, token) WHERE amount != '0';

    CREATE TABLE scan_state (
        network            TEXT NOT NULL,
        chain              TEXT NOT NULL,
        last_scanned_index INTEGER NOT NULL DEFAULT -1,
        max_scan_id        INTEGER NOT NULL DEFAULT 0,
        status             TEXT NOT NULL DEFAULT 'idle',
        started_at         INTEGER,
        updated_at         INTEGER NOT NULL,
        PRIMARY KEY (network, chain)
    );

    CREATE TABLE transactions (
        network      TEXT NOT NULL,
        chain        TEXT NOT NULL,
        tx_hash      TEXT NOT NULL,
        direction    TEXT NOT NULL,
        token        TEXT NOT NULL,
        amount       TEXT NOT NULL,
        from_addr    TEXT NOT NULL,
        to_addr      TEXT NOT NULL,
        block_number INTEGER,
        block_time   INTEGER,
        gas          TEXT,
        status       TEXT NOT NULL,
        created_at   INTEGER NOT NULL,
        PRIMARY KEY (network, chain, tx_hash, direction)
    );
    CREATE INDEX transactions_to_addr ON transactions (network, chain, to_addr, block_time);

    CREATE TABLE tx_states (
        sweep_id      TEXT NOT NULL,
        network       TEXT NOT NULL,
        chain         TEXT NOT NULL,
        address_index INTEGER NOT NULL,
        kind          TEXT NOT NULL DEFAULT 'sweep',
        nonce         INTEGER,
        tx_hash       TEXT,
        status        TEXT NOT NULL,
        attempt       INTEGER NOT NULL DEFAULT 1,
        created_at    INTEGER NOT NULL,
        updated_at    INTEGER NOT NULL,
        PRIMARY KEY (sweep_id, address_index, kind)
    );
    CREATE INDEX tx_states_open ON tx_states (network, status)
        WHERE status IN ('building', 'signed', 'broadcast');

    CREATE TABLE provider_health (
        provider             TEXT NOT NULL,
        chain                TEXT NOT NULL,
        circuit_state        TEXT NOT NULL,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        last_success_at      INTEGER,
        last_failure_at      INTEGER,
        status               TEXT NOT NULL,
        PRIMARY KEY (provider, chain)
    );

    CREATE TABLE settings (
        network TEXT NOT NULL,
        key     TEXT NOT NULL,
        value   TEXT NOT NULL,
        PRIMARY KEY (network, key)
    );
    "#,
    // 2: poller
    r#"
    CREATE TABLE watches (
        watch_id         TEXT PRIMARY KEY,
        chain            TEXT NOT NULL,
        address          TEXT NOT NULL,
        status           TEXT NOT NULL DEFAULT 'active',
        started_at       INTEGER NOT NULL,
        expires_at       INTEGER NOT NULL,
        completed_at     INTEGER,
        poll_count       INTEGER NOT NULL DEFAULT 0,
        last_poll_at     INTEGER,
        last_poll_result TEXT
    );
    CREATE INDEX watches_address ON watches (chain, address, status);

    CREATE TABLE points (
        chain     TEXT NOT NULL,
        address   TEXT NOT NULL,
        unclaimed INTEGER NOT NULL DEFAULT 0 CHECK (unclaimed >= 0),
        pending   INTEGER NOT NULL DEFAULT 0 CHECK (pending >= 0),
        total     INTEGER NOT NULL DEFAULT 0 CHECK (total >= unclaimed),
        PRIMARY KEY (chain, address)
    );

    CREATE TABLE system_errors (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        source     TEXT NOT NULL,
        message    TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    "#,
];
