use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use voicebot_contracts::{ActivityRecord, Identity, IdentityKind, CONTRACT_VERSION};
use voicebot_kernel::parse_rfc3339;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{path}: {message}")]
    Io { path: String, message: String },
    #[error("{path} is malformed: {message}")]
    Malformed { path: String, message: String },
    #[error("sqlite: {0}")]
    Sqlite(String),
}

impl StorageError {
    pub(crate) fn io(path: &Path, err: impl std::fmt::Display) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn malformed(path: &Path, message: impl Into<String>) -> Self {
        StorageError::Malformed {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Sqlite(err.to_string())
    }
}

/// Writes through a temp file + rename so readers never observe partial data.
pub(crate) fn write_text_atomic(path: &Path, content: &str) -> Result<(), StorageError> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir).map_err(|e| StorageError::io(parent_dir, e))?;

    let temp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("voicebot"),
        std::process::id()
    );
    let temp_path = parent_dir.join(temp_name);
    std::fs::write(&temp_path, content).map_err(|e| StorageError::io(&temp_path, e))?;
    std::fs::rename(&temp_path, path).map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct DataFile {
    v: u32,
    #[serde(default)]
    nicknames: BTreeMap<String, StoredActivity>,
    #[serde(default)]
    accounts: BTreeMap<String, StoredActivity>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredActivity {
    last_active: DateTime<Utc>,
    voiced: bool,
}

enum StoreBackend {
    Memory,
    Json(PathBuf),
    Sqlite(Connection),
}

/// Durable identity -> activity mapping. Reads are served from memory; every
/// mutation is written through before it returns.
pub struct ActivityStore {
    records: BTreeMap<Identity, ActivityRecord>,
    backend: StoreBackend,
}

impl ActivityStore {
    pub fn open(cfg: &voicebot_config::Store) -> Result<Self, StorageError> {
        match cfg.kind.as_str() {
            "sqlite" => {
                let path = cfg.sqlite_path.as_deref().unwrap_or_default();
                Self::open_sqlite(Path::new(path))
            }
            "json" => Self::open_json(Path::new(&cfg.data_path)),
            _ => Ok(Self::memory()),
        }
    }

    pub fn memory() -> Self {
        Self {
            records: BTreeMap::new(),
            backend: StoreBackend::Memory,
        }
    }

    pub fn open_json(path: &Path) -> Result<Self, StorageError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(StorageError::io(path, e)),
        };

        let mut records = BTreeMap::new();
        if !text.trim().is_empty() {
            let data: DataFile = serde_json::from_str(&text)
                .map_err(|e| StorageError::malformed(path, e.to_string()))?;
            if data.v != CONTRACT_VERSION {
                return Err(StorageError::malformed(
                    path,
                    format!("unsupported version {}", data.v),
                ));
            }
            for (kind, section) in [
                (IdentityKind::Nickname, data.nicknames),
                (IdentityKind::Account, data.accounts),
            ] {
                for (value, stored) in section {
                    let identity = Identity { kind, value };
                    records.insert(
                        identity.clone(),
                        ActivityRecord {
                            identity,
                            last_active: stored.last_active,
                            voiced: stored.voiced,
                        },
                    );
                }
            }
        }

        Ok(Self {
            records,
            backend: StoreBackend::Json(path.to_path_buf()),
        })
    }

    pub fn open_sqlite(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS activity (
                kind TEXT NOT NULL,
                identity TEXT NOT NULL,
                last_active TEXT NOT NULL,
                voiced INTEGER NOT NULL,
                PRIMARY KEY (kind, identity)
            );
            ",
        )?;

        let mut records = BTreeMap::new();
        {
            let mut stmt = conn.prepare("SELECT kind, identity, last_active, voiced FROM activity")?;
            let rows = stmt.query_map([], |row| {
                let kind: String = row.get(0)?;
                let identity: String = row.get(1)?;
                let last_active: String = row.get(2)?;
                let voiced: i64 = row.get(3)?;
                Ok((kind, identity, last_active, voiced))
            })?;
            for row in rows {
                let (kind, value, last_active, voiced) = row?;
                let kind = match kind.as_str() {
                    "nickname" => IdentityKind::Nickname,
                    "account" => IdentityKind::Account,
                    other => {
                        return Err(StorageError::malformed(
                            path,
                            format!("unknown identity kind {other}"),
                        ))
                    }
                };
                let last_active = parse_rfc3339(&last_active).ok_or_else(|| {
                    StorageError::malformed(path, format!("bad timestamp for {value}"))
                })?;
                let identity = Identity { kind, value };
                records.insert(
                    identity.clone(),
                    ActivityRecord {
                        identity,
                        last_active,
                        voiced: voiced != 0,
                    },
                );
            }
        }

        Ok(Self {
            records,
            backend: StoreBackend::Sqlite(conn),
        })
    }

    pub fn get(&self, identity: &Identity) -> Option<&ActivityRecord> {
        self.records.get(identity)
    }

    pub fn all(&self) -> impl Iterator<Item = &ActivityRecord> + '_ {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_activity(
        &mut self,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let record = self
            .records
            .entry(identity.clone())
            .or_insert_with(|| ActivityRecord::new(identity.clone(), at));
        record.last_active = at;
        self.persist_upsert(identity)
    }

    /// Returns the record, creating it with `last_active = at` if absent.
    pub fn ensure(
        &mut self,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<ActivityRecord, StorageError> {
        if let Some(existing) = self.records.get(identity) {
            return Ok(existing.clone());
        }
        let record = ActivityRecord::new(identity.clone(), at);
        self.records.insert(identity.clone(), record.clone());
        self.persist_upsert(identity)?;
        Ok(record)
    }

    /// No-op for identities without a record.
    pub fn set_voiced(&mut self, identity: &Identity, voiced: bool) -> Result<(), StorageError> {
        match self.records.get_mut(identity) {
            Some(record) if record.voiced != voiced => {
                record.voiced = voiced;
                self.persist_upsert(identity)
            }
            _ => Ok(()),
        }
    }

    pub fn remove(&mut self, identity: &Identity) -> Result<bool, StorageError> {
        if self.records.remove(identity).is_none() {
            return Ok(false);
        }
        self.persist_delete(std::slice::from_ref(identity))?;
        Ok(true)
    }

    /// Drops every record the predicate rejects; returns how many went.
    pub fn retain<F>(&mut self, mut keep: F) -> Result<usize, StorageError>
    where
        F: FnMut(&ActivityRecord) -> bool,
    {
        let doomed: Vec<Identity> = self
            .records
            .values()
            .filter(|r| !keep(r))
            .map(|r| r.identity.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        for identity in &doomed {
            self.records.remove(identity);
        }
        self.persist_delete(&doomed)?;
        Ok(doomed.len())
    }

    /// Rewrites the full durable image.
    pub fn flush(&self) -> Result<(), StorageError> {
        match &self.backend {
            StoreBackend::Memory => Ok(()),
            StoreBackend::Json(path) => write_json(path, &self.records),
            StoreBackend::Sqlite(conn) => {
                for record in self.records.values() {
                    upsert_row(conn, record)?;
                }
                Ok(())
            }
        }
    }

    fn persist_upsert(&self, identity: &Identity) -> Result<(), StorageError> {
        match &self.backend {
            StoreBackend::Memory => Ok(()),
            StoreBackend::Json(path) => write_json(path, &self.records),
            StoreBackend::Sqlite(conn) => match self.records.get(identity) {
                Some(record) => upsert_row(conn, record),
                None => Ok(()),
            },
        }
    }

    fn persist_delete(&self, identities: &[Identity]) -> Result<(), StorageError> {
        match &self.backend {
            StoreBackend::Memory => Ok(()),
            StoreBackend::Json(path) => write_json(path, &self.records),
            StoreBackend::Sqlite(conn) => {
                for identity in identities {
                    conn.execute(
                        "DELETE FROM activity WHERE kind = ?1 AND identity = ?2",
                        params![identity.kind.as_str(), identity.value],
                    )?;
                }
                Ok(())
            }
        }
    }
}

fn write_json(path: &Path, records: &BTreeMap<Identity, ActivityRecord>) -> Result<(), StorageError> {
    let mut data = DataFile {
        v: CONTRACT_VERSION,
        nicknames: BTreeMap::new(),
        accounts: BTreeMap::new(),
    };
    for record in records.values() {
        let section = match record.identity.kind {
            IdentityKind::Nickname => &mut data.nicknames,
            IdentityKind::Account => &mut data.accounts,
        };
        section.insert(
            record.identity.value.clone(),
            StoredActivity {
                last_active: record.last_active,
                voiced: record.voiced,
            },
        );
    }
    let text = serde_json::to_string_pretty(&data).map_err(|e| StorageError::io(path, e))?;
    write_text_atomic(path, &text)
}

fn upsert_row(conn: &Connection, record: &ActivityRecord) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO activity (kind, identity, last_active, voiced)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(kind, identity) DO UPDATE SET
            last_active=excluded.last_active,
            voiced=excluded.voiced
        ",
        params![
            record.identity.kind.as_str(),
            record.identity.value,
            record
                .last_active
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            if record.voiced { 1 } else { 0 }
        ],
    )?;
    Ok(())
}
