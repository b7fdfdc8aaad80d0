use chrono::{DateTime, Utc};
use rollcall_core::types::validate_vector;
use rollcall_core::{EmbeddingError, EmbeddingRecord, EmbeddingSource, SourceError, EMBEDDING_DIM};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error(transparent)]
    InvalidEmbedding(#[from] EmbeddingError),
    #[error("invalid enrollment timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("identity id must not be empty")]
    EmptyIdentity,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed embedding storage with AES-256-GCM encryption at rest.
///
/// This is the persistence collaborator behind the embedding cache. A
/// per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600).
pub struct EmbeddingStore {
    conn: Mutex<Connection>,
    enc_key: [u8; 32],
}

/// Enrolled identity summary (no embedding data).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct IdentityInfo {
    pub identity_id: String,
    pub display_name: String,
    pub embedding_count: u64,
    pub last_enrolled_at: String,
}

impl EmbeddingStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed key
            [0u8; 32]
        } else {
            let dir = match db_path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => std::env::current_dir().map_err(StoreError::KeyIo)?,
            };
            std::fs::create_dir_all(&dir).map_err(StoreError::KeyIo)?;
            load_or_generate_key(&dir.join(".key"))?
        };

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS embeddings (
                 id TEXT PRIMARY KEY,
                 identity_id TEXT NOT NULL,
                 display_name TEXT NOT NULL,
                 embedding BLOB NOT NULL,
                 enrolled_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_embeddings_identity ON embeddings(identity_id);",
        )?;
        tracing::debug!(path = %db_path.display(), "embedding store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            enc_key,
        })
    }

    /// Insert one reference embedding. Returns the generated row id.
    pub fn insert(&self, record: &EmbeddingRecord) -> Result<String, StoreError> {
        if record.identity_id.trim().is_empty() {
            return Err(StoreError::EmptyIdentity);
        }
        validate_vector(&record.values)?;
        let blob = self.encrypt_embedding(&record.values)?;
        let id = uuid::Uuid::new_v4().to_string();

        self.conn().execute(
            "INSERT INTO embeddings (id, identity_id, display_name, embedding, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id,
                record.identity_id,
                record.display_name,
                blob,
                record.enrolled_at.to_rfc3339()
            ],
        )?;
        tracing::debug!(identity = %record.identity_id, id = %id, "embedding stored");
        Ok(id)
    }

    /// Enrolled identities with their embedding counts, ordered by id.
    pub fn list_identities(&self) -> Result<Vec<IdentityInfo>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT identity_id, MAX(display_name), COUNT(*), MAX(enrolled_at)
             FROM embeddings GROUP BY identity_id ORDER BY identity_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IdentityInfo {
                identity_id: row.get(0)?,
                display_name: row.get(1)?,
                embedding_count: row.get(2)?,
                last_enrolled_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Remove every embedding of an identity. Returns how many were deleted.
    pub fn remove_identity(&self, identity_id: &str) -> Result<usize, StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM embeddings WHERE identity_id = ?1", [identity_id])?;
        Ok(affected)
    }

    /// Count stored embeddings across all identities.
    pub fn count_all(&self) -> Result<u64, StoreError> {
        let count: u64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Decrypted embeddings for the given identities.
    ///
    /// A row that fails to decrypt or decode is skipped with a warning; the
    /// other rows of the same identity are still returned.
    pub fn records_for(&self, identity_ids: &[String]) -> Result<HashMap<String, Vec<EmbeddingRecord>>, StoreError> {
        let mut out: HashMap<String, Vec<EmbeddingRecord>> = HashMap::new();
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, display_name, embedding, enrolled_at
             FROM embeddings WHERE identity_id = ?1 ORDER BY enrolled_at",
        )?;

        for identity in identity_ids {
            let rows = stmt.query_map([identity], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            for row in rows {
                let (id, identity_id, display_name, blob, enrolled_at) = row?;
                match self.decode_row(&blob, &enrolled_at) {
                    Ok((values, enrolled_at)) => out.entry(identity_id.clone()).or_default().push(EmbeddingRecord {
                        identity_id,
                        display_name,
                        values,
                        enrolled_at,
                    }),
                    Err(e) => tracing::warn!(identity = %identity_id, id = %id, error = %e, "skipping unreadable embedding"),
                }
            }
        }
        Ok(out)
    }

    fn decode_row(&self, blob: &[u8], enrolled_at: &str) -> Result<(Vec<f32>, DateTime<Utc>), StoreError> {
        let values = self.decrypt_embedding(blob)?;
        let enrolled_at = DateTime::parse_from_rfc3339(enrolled_at)
            .map_err(|_| StoreError::InvalidTimestamp(enrolled_at.to_string()))?
            .with_timezone(&Utc);
        Ok((values, enrolled_at))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_vector(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding_strict(&plaintext)
    }
}

impl EmbeddingSource for EmbeddingStore {
    fn fetch_embeddings(
        &self,
        identity_ids: &[String],
    ) -> Result<HashMap<String, Vec<EmbeddingRecord>>, SourceError> {
        self.records_for(identity_ids)
            .map_err(|e| SourceError::Backend(Box::new(e)))
    }

    fn identity_ids(&self) -> Result<Vec<String>, SourceError> {
        let conn = self.conn();
        let ids = conn
            .prepare("SELECT DISTINCT identity_id FROM embeddings ORDER BY identity_id")
            .and_then(|mut stmt| {
                stmt.query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()
            })
            .map_err(|e| SourceError::Backend(Box::new(StoreError::from(e))))?;
        Ok(ids)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one
/// with mode 0600.
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_embedding_strict(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    validate_vector(&values)?;
    Ok(values)
}
