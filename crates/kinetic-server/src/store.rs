//! In-memory drive used by the server binary.
//!
//! A sorted map of versioned entries behind a `RwLock`. It plays every
//! collaborator role the pipeline needs: it runs single commands, applies
//! committed batches atomically, validates batch members and gates writes
//! while the drive is read-only.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use bytes::Bytes;
use kinetic_core::{
    AtomicWrite, Command, CommandProcessor, DriveLifecycle, OpKind, Outcome, PooledValue, Status,
    StatusCode, StorageWrite, Validator, WriteOp,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    value: Bytes,
    version: Bytes,
}

/// What one user may do. An empty prefix covers every key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Access {
    pub id: i64,
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub prefix: String,
}

impl Access {
    fn allows(&self, op: OpKind, key: &[u8]) -> bool {
        let op_ok = match op {
            OpKind::Get | OpKind::GetVersion | OpKind::GetNext | OpKind::GetPrevious => self.read,
            OpKind::Put => self.write,
            OpKind::Delete => self.delete,
            _ => true,
        };
        op_ok && key.starts_with(self.prefix.as_bytes())
    }
}

pub struct MemoryStore {
    entries: RwLock<BTreeMap<Bytes, Entry>>,
    cluster_version: AtomicI64,
    /// `None` lets every user do everything.
    users: Option<HashMap<i64, Access>>,
    read_only: AtomicBool,
    flushes: AtomicU64,
}

impl MemoryStore {
    pub fn new(cluster_version: i64, users: Vec<Access>) -> Self {
        let users = if users.is_empty() {
            None
        } else {
            Some(users.into_iter().map(|a| (a.id, a)).collect())
        };
        Self {
            entries: RwLock::new(BTreeMap::new()),
            cluster_version: AtomicI64::new(cluster_version),
            users,
            read_only: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Cluster version, authorization and key checks shared by single
    /// commands and batch members.
    fn admit(&self, command: &Command) -> Result<(), Status> {
        self.validate_cluster_version(command.cluster_version)?;
        self.authorize(command.user_id, command.op, &command.key)?;
        if command.op.is_write() {
            self.validate_key(&command.key)?;
        }
        Ok(())
    }

    fn get(&self, command: &Command) -> Outcome {
        let entries = self.entries.read();
        let found = match command.op {
            OpKind::GetNext => entries
                .range::<[u8], _>((Bound::Excluded(&command.key[..]), Bound::Unbounded))
                .next(),
            OpKind::GetPrevious => entries
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(&command.key[..])))
                .next_back(),
            _ => entries.get_key_value(&command.key[..]),
        };
        let Some((key, entry)) = found else {
            return Outcome::status(Status::new(StatusCode::NotFound, "Key not found"));
        };
        let value = match command.op {
            OpKind::Get => Some(entry.value.clone()),
            OpKind::GetVersion => None,
            // neighbours answer with the key they landed on
            _ => Some(key.clone()),
        };
        Outcome {
            status: Status::success(),
            value,
            db_version: Some(entry.version.clone()),
        }
    }

    fn put(&self, command: &Command, value: Option<&PooledValue>) -> Outcome {
        let mut entries = self.entries.write();
        if !command.force {
            if let Err(status) = check_version(entries.get(&command.key[..]), command.db_version.as_deref()) {
                return Outcome::status(status);
            }
        }
        entries.insert(
            command.key.clone(),
            Entry {
                value: value.map(PooledValue::bytes).unwrap_or_default(),
                version: command.new_version.clone().unwrap_or_default(),
            },
        );
        Outcome::status(Status::success())
    }

    fn delete(&self, command: &Command) -> Outcome {
        let mut entries = self.entries.write();
        let Some(existing) = entries.get(&command.key[..]) else {
            return Outcome::status(Status::new(StatusCode::NotFound, "Key not found"));
        };
        if !command.force {
            if let Err(status) = check_version(Some(existing), command.db_version.as_deref()) {
                return Outcome::status(status);
            }
        }
        entries.remove(&command.key[..]);
        Outcome::status(Status::success())
    }
}

/// An absent entry and an empty version are the same thing.
fn check_version(existing: Option<&Entry>, expected: Option<&[u8]>) -> Result<(), Status> {
    let stored = existing.map_or(&[][..], |e| &e.version[..]);
    let expected = expected.unwrap_or(&[]);
    if stored == expected {
        Ok(())
    } else {
        Err(Status::new(StatusCode::VersionMismatch, "Version mismatch"))
    }
}

impl CommandProcessor for MemoryStore {
    fn execute(&self, command: &Command, value: Option<&PooledValue>) -> Outcome {
        if let Err(status) = self.admit(command) {
            return Outcome::status(status);
        }
        match command.op {
            OpKind::Get | OpKind::GetVersion | OpKind::GetNext | OpKind::GetPrevious => self.get(command),
            OpKind::Put => self.put(command, value),
            OpKind::Delete => self.delete(command),
            OpKind::Flush => Outcome::status(StorageWrite::flush(self)),
            OpKind::Noop => Outcome::status(Status::success()),
            OpKind::StartBatch | OpKind::EndBatch | OpKind::AbortBatch => Outcome::status(Status::new(
                StatusCode::InvalidRequest,
                "batch control reached the command processor",
            )),
        }
    }
}

impl StorageWrite for MemoryStore {
    fn apply_atomic(&self, write: AtomicWrite) -> Status {
        let mut entries = self.entries.write();
        let ops = write.len();
        for op in write.ops {
            match op {
                WriteOp::Put {
                    key,
                    value,
                    new_version,
                } => {
                    let entry = Entry {
                        value: value.as_ref().map(PooledValue::bytes).unwrap_or_default(),
                        version: new_version.unwrap_or_default(),
                    };
                    entries.insert(key, entry);
                }
                WriteOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        debug!(ops, "atomic write applied");
        Status::success()
    }

    fn flush(&self) -> Status {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Status::success()
    }
}

impl Validator for MemoryStore {
    fn validate_cluster_version(&self, cluster_version: i64) -> Result<(), Status> {
        let ours = self.cluster_version.load(Ordering::Acquire);
        if cluster_version == ours {
            Ok(())
        } else {
            Err(Status::new(
                StatusCode::VersionFailure,
                format!("Cluster version mismatch: drive is at {ours}"),
            ))
        }
    }

    fn authorize(&self, user_id: i64, op: OpKind, key: &[u8]) -> Result<(), Status> {
        let Some(users) = &self.users else {
            return Ok(());
        };
        match users.get(&user_id) {
            Some(access) if access.allows(op, key) => Ok(()),
            _ => Err(Status::new(StatusCode::NotAuthorized, "permission denied")),
        }
    }

    fn validate_key(&self, key: &[u8]) -> Result<(), Status> {
        if key.is_empty() {
            Err(Status::new(StatusCode::InvalidRequest, "Key is empty"))
        } else {
            Ok(())
        }
    }

    fn validate_version(&self, key: &[u8], expected: Option<&[u8]>) -> Result<(), Status> {
        check_version(self.entries.read().get(key), expected)
    }
}

impl DriveLifecycle for MemoryStore {
    fn permits(&self, op: OpKind) -> bool {
        !(op.is_write() && self.read_only.load(Ordering::Acquire))
    }
}
