//! Record store — registered clients and the files they have uploaded.
//!
//! The DashMaps are the in-process source of truth. When opened against a
//! database file, every mutation is written to SQLite first and the cache
//! only changes once that write has succeeded; on open the cache is
//! hydrated from the database.
//!
//! Handles are cheap to clone and safe to share across connection tasks.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::RngCore;
use rusqlite::{params, Connection};

use cask_core::crypto::SessionKey;
use cask_core::wire::{ClientId, PublicKeyField, AES_KEY_SIZE};

/// A registered client.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    pub name: String,
    /// Raw public-key field from the last key exchange.
    pub public_key: Option<PublicKeyField>,
    /// Symmetric upload key. Present only after a key exchange.
    pub session_key: Option<SessionKey>,
    /// Unix seconds.
    pub last_seen: u64,
}

/// An uploaded file. At most one per (client, file name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub client_id: ClientId,
    pub file_name: String,
    pub path: PathBuf,
    pub verified: bool,
}

type FileKey = (ClientId, String);

#[derive(Clone, Default)]
pub struct RecordStore {
    clients: Arc<DashMap<ClientId, ClientRecord>>,
    names: Arc<DashMap<String, ClientId>>,
    files: Arc<DashMap<FileKey, FileRecord>>,
    db: Option<Arc<Mutex<Connection>>>,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
    id          BLOB PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    public_key  BLOB,
    session_key BLOB,
    last_seen   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    client_id   BLOB NOT NULL,
    file_name   TEXT NOT NULL,
    path        TEXT NOT NULL,
    verified    INTEGER NOT NULL,
    PRIMARY KEY (client_id, file_name)
);
"#;

impl RecordStore {
    /// A store with no backing database. Records live as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) the database at `path` and load every record into
    /// the cache.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let store = Self {
            db: Some(Arc::new(Mutex::new(conn))),
            ..Self::default()
        };
        store.hydrate()?;
        tracing::info!(
            path = %path.display(),
            clients = store.client_count(),
            files = store.file_count(),
            "record store opened"
        );
        Ok(store)
    }

    fn hydrate(&self) -> Result<(), StoreError> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let conn = db.lock().map_err(|_| StoreError::Poisoned)?;

        let mut stmt =
            conn.prepare("SELECT id, name, public_key, session_key, last_seen FROM clients")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        for row in rows {
            let (id, name, public_key, session_key, last_seen) = row?;
            let Ok(id) = ClientId::try_from(id.as_slice()) else {
                tracing::warn!(name = %name, "skipping client row with malformed id");
                continue;
            };
            let record = ClientRecord {
                id,
                name: name.clone(),
                public_key: public_key.and_then(|k| PublicKeyField::try_from(k.as_slice()).ok()),
                session_key: session_key
                    .and_then(|k| <[u8; AES_KEY_SIZE]>::try_from(k.as_slice()).ok())
                    .map(SessionKey::from_bytes),
                last_seen: last_seen.max(0) as u64,
            };
            self.names.insert(name, id);
            self.clients.insert(id, record);
        }

        let mut stmt = conn.prepare("SELECT client_id, file_name, path, verified FROM files")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?;
        for row in rows {
            let (client_id, file_name, path, verified) = row?;
            let Ok(client_id) = ClientId::try_from(client_id.as_slice()) else {
                tracing::warn!(file = %file_name, "skipping file row with malformed client id");
                continue;
            };
            self.files.insert(
                (client_id, file_name.clone()),
                FileRecord {
                    client_id,
                    file_name,
                    path: PathBuf::from(path),
                    verified,
                },
            );
        }
        Ok(())
    }

    /// Run `f` against the database, if there is one.
    fn write<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<Option<T>, StoreError> {
        match &self.db {
            Some(db) => {
                let conn = db.lock().map_err(|_| StoreError::Poisoned)?;
                Ok(Some(f(&conn)?))
            }
            None => Ok(None),
        }
    }

    // ── Clients ───────────────────────────────────────────────────────────────

    /// Register `name` under a fresh random id.
    ///
    /// Returns `None` if the name is already taken. The check and the insert
    /// are atomic with respect to concurrent registrations.
    pub fn register(&self, name: &str) -> Result<Option<ClientRecord>, StoreError> {
        let slot = match self.names.entry(name.to_owned()) {
            Entry::Occupied(_) => return Ok(None),
            Entry::Vacant(slot) => slot,
        };

        let id = self.fresh_id();
        let record = ClientRecord {
            id,
            name: name.to_owned(),
            public_key: None,
            session_key: None,
            last_seen: now_secs(),
        };
        self.write(|conn| {
            conn.execute(
                "INSERT INTO clients (id, name, public_key, session_key, last_seen)
                 VALUES (?1, ?2, NULL, NULL, ?3)",
                params![&record.id[..], record.name, record.last_seen as i64],
            )
        })?;

        self.clients.insert(id, record.clone());
        slot.insert(id);
        Ok(Some(record))
    }

    fn fresh_id(&self) -> ClientId {
        let mut rng = rand::thread_rng();
        loop {
            let mut id = [0u8; 16];
            rng.fill_bytes(&mut id);
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn client(&self, id: &ClientId) -> Option<ClientRecord> {
        self.clients.get(id).map(|r| r.value().clone())
    }

    pub fn client_by_name(&self, name: &str) -> Option<ClientRecord> {
        let id = *self.names.get(name)?;
        self.client(&id)
    }

    /// Update last-seen to now. Returns false for an unknown client.
    pub fn touch(&self, id: &ClientId) -> Result<bool, StoreError> {
        if !self.clients.contains_key(id) {
            return Ok(false);
        }
        let now = now_secs();
        self.write(|conn| {
            conn.execute(
                "UPDATE clients SET last_seen = ?1 WHERE id = ?2",
                params![now as i64, &id[..]],
            )
        })?;
        Ok(match self.clients.get_mut(id) {
            Some(mut r) => {
                r.last_seen = now;
                true
            }
            None => false,
        })
    }

    /// Store the client's public key and replace its session key.
    /// Returns false for an unknown client.
    pub fn set_keys(
        &self,
        id: &ClientId,
        public_key: PublicKeyField,
        session_key: SessionKey,
    ) -> Result<bool, StoreError> {
        if !self.clients.contains_key(id) {
            return Ok(false);
        }
        self.write(|conn| {
            conn.execute(
                "UPDATE clients SET public_key = ?1, session_key = ?2 WHERE id = ?3",
                params![&public_key[..], &session_key.as_bytes()[..], &id[..]],
            )
        })?;
        Ok(match self.clients.get_mut(id) {
            Some(mut r) => {
                r.public_key = Some(public_key);
                r.session_key = Some(session_key);
                true
            }
            None => false,
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    /// Insert or replace the record for (client, file name).
    /// Returns the record it replaced.
    pub fn upsert_file(&self, record: FileRecord) -> Result<Option<FileRecord>, StoreError> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO files (client_id, file_name, path, verified)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (client_id, file_name)
                 DO UPDATE SET path = excluded.path, verified = excluded.verified",
                params![
                    &record.client_id[..],
                    record.file_name,
                    record.path.to_string_lossy(),
                    record.verified
                ],
            )
        })?;
        let key = (record.client_id, record.file_name.clone());
        Ok(self.files.insert(key, record))
    }

    pub fn file(&self, client_id: &ClientId, file_name: &str) -> Option<FileRecord> {
        self.files
            .get(&(*client_id, file_name.to_owned()))
            .map(|r| r.value().clone())
    }

    /// Flip the verified flag. Returns false if there is no such record.
    pub fn mark_verified(&self, client_id: &ClientId, file_name: &str) -> Result<bool, StoreError> {
        let key = (*client_id, file_name.to_owned());
        if !self.files.contains_key(&key) {
            return Ok(false);
        }
        self.write(|conn| {
            conn.execute(
                "UPDATE files SET verified = 1 WHERE client_id = ?1 AND file_name = ?2",
                params![&client_id[..], file_name],
            )
        })?;
        Ok(match self.files.get_mut(&key) {
            Some(mut r) => {
                r.verified = true;
                true
            }
            None => false,
        })
    }

    /// Delete the record for (client, file name), returning it.
    pub fn remove_file(
        &self,
        client_id: &ClientId,
        file_name: &str,
    ) -> Result<Option<FileRecord>, StoreError> {
        let key = (*client_id, file_name.to_owned());
        if !self.files.contains_key(&key) {
            return Ok(None);
        }
        self.write(|conn| {
            conn.execute(
                "DELETE FROM files WHERE client_id = ?1 AND file_name = ?2",
                params![&client_id[..], file_name],
            )
        })?;
        Ok(self.files.remove(&key).map(|(_, r)| r))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Whether writes reach a database.
    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database directory: {0}")]
    Io(std::io::Error),

    #[error("database lock poisoned")]
    Poisoned,
}
