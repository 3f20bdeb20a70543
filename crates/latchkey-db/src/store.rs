//! Client Store (component C): auth-token lookup, by-id lookup, and
//! sequence-state persistence, backed by SQLite.
//!
//! `get_by_auth_token` is the one place in the crate that must not branch on
//! secret-dependent timing (§4.C, §9): every row is hashed-compared in full,
//! and the loop never exits early on a match.

use crate::pool::DbPool;
use latchkey_types::ClientRecord;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("no matching client record")]
    NotFound,
    #[error("database connection failed: {0}")]
    Connection(#[from] r2d2::Error),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored nonce cache is not valid JSON: {0}")]
    MalformedNonceCache(#[from] serde_json::Error),
}

/// Read/write contract the Auth Pipeline depends on (§4.C). Expressed as a
/// trait so an alternate store — or a fake that blocks per-client, per the
/// concurrency tests named in §8 — can stand in during tests.
pub trait ClientStore: Send + Sync {
    fn get_by_auth_token(&self, token: &str) -> Result<ClientRecord, DbError>;
    fn get_by_id(&self, client_id: &str) -> Result<ClientRecord, DbError>;
    fn update_sequence(
        &self,
        client_id: &str,
        current_seq: u64,
        seq_window: &[u8],
        nonce_cache: &[String],
    ) -> Result<(), DbError>;
}

/// SQLite-backed `ClientStore`. Holds a pooled connection handle rather than
/// a single connection so it can be cloned freely into request handlers.
#[derive(Clone)]
pub struct SqliteClientStore {
    pool: DbPool,
}

impl SqliteClientStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

/// Constant-time byte comparison via `subtle`. Mismatched lengths are
/// rejected up front since hex-encoded SHA-256 digests are a fixed 64
/// bytes; that length check alone reveals nothing an attacker doesn't
/// already know about the hash function.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

fn row_to_record(row: &Row) -> rusqlite::Result<(ClientRecord, String)> {
    let secret_blob: Vec<u8> = row.get("shared_secret")?;
    let mut shared_secret = [0u8; 32];
    if secret_blob.len() == 32 {
        shared_secret.copy_from_slice(&secret_blob);
    }

    let nonce_cache_json: String = row.get("nonce_cache")?;
    let nonce_cache: Vec<String> = serde_json::from_str(&nonce_cache_json).unwrap_or_default();

    let current_seq_raw: i64 = row.get("current_seq")?;

    let record = ClientRecord {
        client_id: row.get("client_id")?,
        client_name: row.get("client_name")?,
        auth_token_hash: row.get("auth_token_hash")?,
        shared_secret,
        current_seq: current_seq_raw as u64,
        seq_window: row.get("seq_window")?,
        nonce_cache,
        created_at: row.get("created_at")?,
        last_seen: row.get("last_seen")?,
    };
    let auth_token_hash: String = row.get("auth_token_hash")?;
    Ok((record, auth_token_hash))
}

impl ClientStore for SqliteClientStore {
    fn get_by_auth_token(&self, token: &str) -> Result<ClientRecord, DbError> {
        let conn = self.pool.get()?;
        let presented_hash = sha256_hex(token);

        let mut stmt = conn.prepare(
            "SELECT client_id, client_name, auth_token_hash, shared_secret, current_seq,
                    seq_window, nonce_cache, created_at, last_seen
             FROM clients",
        )?;
        let rows = stmt.query_map([], |row| row_to_record(row))?;

        let mut matched: Option<ClientRecord> = None;
        for row in rows {
            let (record, stored_hash) = row?;
            let is_match = constant_time_eq(presented_hash.as_bytes(), stored_hash.as_bytes());
            if is_match {
                matched = Some(record);
            }
        }

        matched.ok_or(DbError::NotFound)
    }

    fn get_by_id(&self, client_id: &str) -> Result<ClientRecord, DbError> {
        let conn = self.pool.get()?;
        let result = conn
            .query_row(
                "SELECT client_id, client_name, auth_token_hash, shared_secret, current_seq,
                        seq_window, nonce_cache, created_at, last_seen
                 FROM clients WHERE client_id = ?1",
                params![client_id],
                |row| row_to_record(row),
            )
            .optional()?;

        result.map(|(record, _)| record).ok_or(DbError::NotFound)
    }

    fn update_sequence(
        &self,
        client_id: &str,
        current_seq: u64,
        seq_window: &[u8],
        nonce_cache: &[String],
    ) -> Result<(), DbError> {
        let conn = self.pool.get()?;
        let nonce_cache_json = serde_json::to_string(nonce_cache)?;

        let changed = conn.execute(
            "UPDATE clients SET current_seq = ?1, seq_window = ?2, nonce_cache = ?3,
                last_seen = strftime('%s', 'now')
             WHERE client_id = ?4",
            params![current_seq as i64, seq_window, nonce_cache_json, client_id],
        )?;

        if changed == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }
}

/// Registers a new client, generating a fresh bearer token and AES-256-GCM
/// shared secret. Returns `(client_id, plaintext_token)` — the plaintext
/// token is returned exactly once and is never persisted.
///
/// Out of the pipeline's runtime scope (§1), but kept here as the minimal
/// operator tooling named in §10.P: test fixtures and the server binary's
/// `--register` path both call through this.
pub fn insert_client(
    conn: &Connection,
    client_name: &str,
) -> Result<(String, String), DbError> {
    let client_id = uuid::Uuid::new_v4().to_string();

    let mut token_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token_bytes);
    let token = hex::encode(token_bytes);
    let auth_token_hash = sha256_hex(&token);

    let mut shared_secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut shared_secret);

    conn.execute(
        "INSERT INTO clients (
            client_id, client_name, auth_token_hash, shared_secret,
            current_seq, seq_window, nonce_cache, created_at, last_seen
        ) VALUES (?1, ?2, ?3, ?4, 0, x'', '[]', strftime('%s','now'), strftime('%s','now'))",
        params![client_id, client_name, auth_token_hash, shared_secret.as_slice()],
    )?;

    Ok((client_id, token))
}
