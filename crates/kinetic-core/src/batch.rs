//! Batch transactions and the registry that tracks the open ones.
//!
//! A batch is opened by START_BATCH, collects puts and deletes from the
//! same connection, and is either committed as a single atomic write by
//! END_BATCH or thrown away (ABORT_BATCH, timeout, connection close).
//!
//! A [`BatchHandle`] is shared between the registry, the pipeline and the
//! timeout subscription. All mutable state sits behind the transaction's
//! own lock, and `complete` is the single flag every teardown path checks
//! under that lock, so whichever path gets there first wins and the rest
//! become no-ops.
//!
//! Lock order is registry map, then transaction state. No path takes them
//! the other way round.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::collab::{DriveLifecycle, StorageWrite, Validator};
use crate::command::{Command, OpKind};
use crate::error::BatchError;
use crate::events::{BatchTimeout, EventBus, Subscription};
use crate::limits::Limits;
use crate::memory::PooledValue;
use crate::priority::Priority;
use crate::status::{Status, StatusCode};
use crate::time;

/// Size charged against the batch limit for every delete, whatever the
/// key length.
pub const DELETE_ACCOUNTING_BYTES: usize = 4096;

/// Identifies a batch: client batch ids are only unique per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub conn_id: u64,
    pub batch_id: u32,
}

impl BatchKey {
    pub fn new(conn_id: u64, batch_id: u32) -> Self {
        Self { conn_id, batch_id }
    }
}

/// One put or delete waiting in a batch.
#[derive(Debug)]
pub struct BatchMember {
    pub command: Command,
    pub value: Option<PooledValue>,
    /// Status assigned at ingest. Anything other than success fails the
    /// commit, except `NoSpace` on deletes.
    pub admission: Status,
}

impl BatchMember {
    fn accounted_size(&self) -> usize {
        match self.command.op {
            OpKind::Delete => DELETE_ACCOUNTING_BYTES,
            _ => self.command.key.len() + self.value.as_ref().map_or(0, |v| v.len()),
        }
    }
}

/// A single operation inside an [`AtomicWrite`].
#[derive(Debug)]
pub enum WriteOp {
    Put {
        key: Bytes,
        value: Option<PooledValue>,
        new_version: Option<Bytes>,
    },
    Delete {
        key: Bytes,
    },
}

impl WriteOp {
    pub fn key(&self) -> &Bytes {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// Operations applied to storage as one unit, in submission order.
#[derive(Debug, Default)]
pub struct AtomicWrite {
    pub ops: Vec<WriteOp>,
}

impl AtomicWrite {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Default)]
struct BatchState {
    members: Vec<BatchMember>,
    /// Members read off the connection, some possibly still in the queue.
    ingested: usize,
    size_bytes: usize,
    delete_count: usize,
    complete: bool,
    /// Member buffers now belong to a committed write.
    do_not_release_buffers: bool,
    subscription: Option<Subscription<BatchKey>>,
}

impl BatchState {
    /// Marks the batch finished and drops any buffers it still owns.
    /// Returns false if it was already complete.
    fn finish(&mut self) -> bool {
        if self.complete {
            return false;
        }
        self.complete = true;
        if !self.do_not_release_buffers {
            self.members.clear();
        }
        true
    }
}

/// An open batch. Attributes fixed by the opening command are immutable;
/// everything else is behind the state lock.
#[derive(Debug)]
pub struct BatchTransaction {
    key: BatchKey,
    priority: Priority,
    timeout_ms: u64,
    cluster_version: i64,
    user_id: i64,
    created_ms: u64,
    deadline_ms: u64,
    state: Mutex<BatchState>,
    member_added: Condvar,
}

pub type BatchHandle = Arc<BatchTransaction>;

impl BatchTransaction {
    pub fn key(&self) -> BatchKey {
        self.key
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn cluster_version(&self) -> i64 {
        self.cluster_version
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.state.lock().size_bytes
    }

    pub fn delete_count(&self) -> usize {
        self.state.lock().delete_count
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    pub fn buffers_transferred(&self) -> bool {
        self.state.lock().do_not_release_buffers
    }

    /// Counts a member that was ingested and queued but not yet added.
    pub fn note_ingested(&self) {
        self.state.lock().ingested += 1;
    }

    /// Waits until every ingested member has been added, the batch
    /// completes, or `timeout` passes. Returns whether all members are in.
    ///
    /// Members run through the queue and may be added by several workers,
    /// so END_BATCH can be dequeued while the last member is still being
    /// added on another thread.
    pub fn wait_for_members(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.members.len() < state.ingested && !state.complete {
            if self.member_added.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.members.len() >= state.ingested
    }

    /// Stamps the batch's scheduling attributes onto `command`, so a batch
    /// runs at the priority it was opened with.
    pub fn inherit_into(&self, command: &mut Command) {
        command.priority = self.priority;
        command.timeout_ms = self.timeout_ms;
        command.cluster_version = self.cluster_version;
    }
}

/// Result of a commit that reached storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub members: usize,
    /// What storage reported for the atomic write.
    pub status: Status,
}

/// Open batches across all connections.
pub struct BatchRegistry {
    batches: Mutex<AHashMap<BatchKey, BatchHandle>>,
    events: EventBus<BatchKey, BatchTimeout>,
    limits: Limits,
}

impl BatchRegistry {
    pub fn new(limits: Limits) -> Self {
        Self {
            batches: Mutex::new(AHashMap::new()),
            events: EventBus::new(),
            limits,
        }
    }

    /// Opens the batch named by `command` (a START_BATCH) on `conn_id`.
    ///
    /// A zero timeout on the command selects `default_timeout_ms`. Longer
    /// timeouts than [`time::MAX_TIMEOUT_MS`] are clamped.
    /// `on_timeout` is subscribed for the batch and runs if its deadline
    /// passes before commit or abort.
    pub fn create<F>(
        &self,
        conn_id: u64,
        command: &Command,
        default_timeout_ms: u64,
        on_timeout: F,
    ) -> Result<BatchHandle, BatchError>
    where
        F: Fn(&BatchTimeout) + Send + Sync + 'static,
    {
        let batch_id = command.batch_id.ok_or(BatchError::NotFound)?;
        let key = BatchKey::new(conn_id, batch_id);

        let mut batches = self.batches.lock();
        if batches.contains_key(&key) {
            return Err(BatchError::InUse);
        }
        if batches.len() >= self.limits.max_batches {
            return Err(BatchError::TooMany);
        }

        let timeout_ms = if command.timeout_ms == 0 {
            default_timeout_ms
        } else {
            command.timeout_ms
        }
        .min(time::MAX_TIMEOUT_MS);
        let created_ms = time::now_ms();
        let txn = Arc::new(BatchTransaction {
            key,
            priority: command.priority,
            timeout_ms,
            cluster_version: command.cluster_version,
            user_id: command.user_id,
            created_ms,
            deadline_ms: created_ms.saturating_add(timeout_ms),
            state: Mutex::new(BatchState::default()),
            member_added: Condvar::new(),
        });

        let sub = self.events.subscribe(key, on_timeout);
        txn.state.lock().subscription = Some(sub);
        batches.insert(key, Arc::clone(&txn));
        debug!(conn_id, batch_id, timeout_ms, "batch opened");
        Ok(txn)
    }

    pub fn get(&self, key: &BatchKey) -> Option<BatchHandle> {
        self.batches.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &BatchKey) -> bool {
        self.batches.lock().contains_key(key)
    }

    /// Looks up the open batch for `key` and copies its priority, timeout
    /// and cluster version onto `command`.
    pub fn inherit(&self, key: &BatchKey, command: &mut Command) -> Result<BatchHandle, BatchError> {
        let txn = self.get(key).ok_or(BatchError::NotFound)?;
        if txn.is_complete() {
            return Err(BatchError::NotFound);
        }
        txn.inherit_into(command);
        Ok(txn)
    }

    /// Appends a put or delete to the open batch `key`.
    pub fn add_member(&self, key: &BatchKey, member: BatchMember) -> Result<(), BatchError> {
        let txn = self.get(key).ok_or(BatchError::NotFound)?;
        let mut state = txn.state.lock();
        if state.complete {
            return Err(BatchError::NotFound);
        }
        state.size_bytes = state.size_bytes.saturating_add(member.accounted_size());
        if member.command.op == OpKind::Delete {
            state.delete_count += 1;
        }
        state.members.push(member);
        drop(state);
        txn.member_added.notify_all();
        Ok(())
    }

    /// Validates and applies the batch `key` as one atomic write.
    ///
    /// The batch leaves the registry whatever the outcome. Nothing reaches
    /// storage unless every member validates; a validation failure names
    /// the first failing member.
    pub fn commit(
        &self,
        key: &BatchKey,
        declared_count: u32,
        validator: &dyn Validator,
        lifecycle: &dyn DriveLifecycle,
        storage: &dyn StorageWrite,
    ) -> Result<CommitOutcome, BatchError> {
        let txn = self.batches.lock().remove(key).ok_or(BatchError::NotFound)?;

        let write = {
            let mut state = txn.state.lock();
            if let Some(sub) = state.subscription.take() {
                self.events.unsubscribe(&sub);
            }
            if state.complete {
                return Err(BatchError::AlreadyComplete);
            }

            let check = self.check_commit(&state, declared_count, &txn, validator, lifecycle);
            if let Err(e) = check {
                state.finish();
                return Err(e);
            }

            state.do_not_release_buffers = true;
            state.complete = true;
            let ops = state.members.drain(..).map(into_write_op).collect();
            AtomicWrite { ops }
        };

        let members = write.len();
        let status = storage.apply_atomic(write);
        debug!(
            conn_id = key.conn_id,
            batch_id = key.batch_id,
            members,
            status = %status,
            "batch committed"
        );
        Ok(CommitOutcome { members, status })
    }

    fn check_commit(
        &self,
        state: &BatchState,
        declared_count: u32,
        txn: &BatchTransaction,
        validator: &dyn Validator,
        lifecycle: &dyn DriveLifecycle,
    ) -> Result<(), BatchError> {
        if state.members.len() != declared_count as usize {
            return Err(BatchError::CountMismatch {
                declared: declared_count,
                received: state.members.len(),
            });
        }
        if state.size_bytes > self.limits.max_batch_size {
            return Err(BatchError::TooLarge);
        }
        if state.delete_count > self.limits.max_deletes_per_batch {
            return Err(BatchError::TooManyDeletes);
        }
        for member in &state.members {
            validate_member(member, txn, validator, lifecycle).map_err(|status| {
                BatchError::Validation {
                    failed_sequence: member.command.sequence,
                    status,
                }
            })?;
        }
        Ok(())
    }

    /// Discards the batch `key` without applying anything.
    pub fn abort(&self, key: &BatchKey) -> Result<(), BatchError> {
        let txn = self.batches.lock().remove(key).ok_or(BatchError::NotFound)?;
        let mut state = txn.state.lock();
        if let Some(sub) = state.subscription.take() {
            self.events.unsubscribe(&sub);
        }
        if !state.finish() {
            return Err(BatchError::AlreadyComplete);
        }
        debug!(conn_id = key.conn_id, batch_id = key.batch_id, "batch aborted");
        Ok(())
    }

    /// Tears down the batch `key` because its deadline passed.
    ///
    /// Returns false if the batch had already completed or left the
    /// registry, in which case nothing is changed.
    pub fn expire(&self, key: &BatchKey) -> bool {
        let mut batches = self.batches.lock();
        let Some(txn) = batches.get(key).cloned() else {
            return false;
        };
        let mut state = txn.state.lock();
        if !state.finish() {
            return false;
        }
        batches.remove(key);
        if let Some(sub) = state.subscription.take() {
            self.events.unsubscribe(&sub);
        }
        debug!(conn_id = key.conn_id, batch_id = key.batch_id, "batch expired");
        true
    }

    /// Open batches whose deadline is at or before `now_ms`.
    pub fn expired(&self, now_ms: u64) -> Vec<BatchTimeout> {
        self.batches
            .lock()
            .values()
            .filter(|txn| txn.deadline_ms <= now_ms)
            .map(|txn| BatchTimeout {
                key: txn.key,
                deadline_ms: txn.deadline_ms,
            })
            .collect()
    }

    /// Delivers a timeout event to the batch's subscriber.
    pub fn publish_timeout(&self, event: &BatchTimeout) -> bool {
        self.events.publish(&event.key, event)
    }

    /// Earliest deadline among open batches.
    pub fn next_deadline(&self) -> Option<u64> {
        self.batches.lock().values().map(|txn| txn.deadline_ms).min()
    }

    /// Drops every batch owned by `conn_id`. Returns how many there were.
    pub fn remove_connection(&self, conn_id: u64) -> usize {
        let removed: Vec<BatchHandle> = {
            let mut batches = self.batches.lock();
            let keys: Vec<BatchKey> = batches
                .keys()
                .filter(|k| k.conn_id == conn_id)
                .copied()
                .collect();
            keys.iter().filter_map(|k| batches.remove(k)).collect()
        };
        for txn in &removed {
            let mut state = txn.state.lock();
            if let Some(sub) = state.subscription.take() {
                self.events.unsubscribe(&sub);
            }
            state.finish();
        }
        removed.len()
    }

    /// Whether any batch is open on `conn_id`.
    pub fn has_open_batches(&self, conn_id: u64) -> bool {
        self.batches.lock().keys().any(|k| k.conn_id == conn_id)
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriptions(&self) -> usize {
        self.events.len()
    }
}

fn validate_member(
    member: &BatchMember,
    txn: &BatchTransaction,
    validator: &dyn Validator,
    lifecycle: &dyn DriveLifecycle,
) -> Result<(), Status> {
    let cmd = &member.command;

    let tolerated = cmd.op == OpKind::Delete && member.admission.code == StatusCode::NoSpace;
    if !member.admission.is_success() && !tolerated {
        return Err(member.admission.clone());
    }
    if !lifecycle.permits(cmd.op) {
        return Err(Status::new(
            StatusCode::InvalidRequest,
            "Drive does not support this command now",
        ));
    }
    validator.validate_cluster_version(txn.cluster_version)?;
    validator.authorize(txn.user_id, cmd.op, &cmd.key)?;
    if cmd.op == OpKind::Put {
        validator.validate_key(&cmd.key)?;
    }
    if !cmd.force {
        validator.validate_version(&cmd.key, cmd.db_version.as_deref())?;
    }
    Ok(())
}

fn into_write_op(member: BatchMember) -> WriteOp {
    let BatchMember { command, value, .. } = member;
    match command.op {
        OpKind::Delete => WriteOp::Delete { key: command.key },
        _ => WriteOp::Put {
            key: command.key,
            value,
            new_version: command.new_version,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ValuePool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingStorage {
        calls: Mutex<Vec<Vec<(bool, Bytes)>>>,
    }

    impl StorageWrite for RecordingStorage {
        fn apply_atomic(&self, write: AtomicWrite) -> Status {
            let ops = write
                .ops
                .iter()
                .map(|op| (matches!(op, WriteOp::Put { .. }), op.key().clone()))
                .collect();
            self.calls.lock().push(ops);
            Status::success()
        }

        fn flush(&self) -> Status {
            Status::success()
        }
    }

    /// Rejects keys starting with `deny`.
    struct PrefixValidator {
        deny: &'static [u8],
    }

    impl Validator for PrefixValidator {
        fn validate_cluster_version(&self, v: i64) -> Result<(), Status> {
            if v == 0 {
                Ok(())
            } else {
                Err(Status::new(StatusCode::VersionFailure, "cluster version"))
            }
        }

        fn authorize(&self, _user: i64, _op: OpKind, key: &[u8]) -> Result<(), Status> {
            if !self.deny.is_empty() && key.starts_with(self.deny) {
                Err(Status::new(StatusCode::NotAuthorized, "denied"))
            } else {
                Ok(())
            }
        }

        fn validate_key(&self, _key: &[u8]) -> Result<(), Status> {
            Ok(())
        }

        fn validate_version(&self, _key: &[u8], _expected: Option<&[u8]>) -> Result<(), Status> {
            Ok(())
        }
    }

    struct AllowAll;

    impl DriveLifecycle for AllowAll {
        fn permits(&self, _op: OpKind) -> bool {
            true
        }
    }

    fn allow() -> PrefixValidator {
        PrefixValidator { deny: b"" }
    }

    fn start(batch_id: u32) -> Command {
        let mut cmd = Command::new(OpKind::StartBatch, 1);
        cmd.batch_id = Some(batch_id);
        cmd.priority = Priority::Higher;
        cmd.timeout_ms = 5_000;
        cmd
    }

    fn member(op: OpKind, seq: u64, key: &'static [u8], value: Option<PooledValue>) -> BatchMember {
        let mut command = Command::new(op, seq);
        command.key = Bytes::from_static(key);
        BatchMember {
            command,
            value,
            admission: Status::success(),
        }
    }

    fn registry() -> BatchRegistry {
        BatchRegistry::new(Limits::default())
    }

    #[test]
    fn create_rejects_duplicate_id() {
        let reg = registry();
        reg.create(1, &start(9), 1000, |_| {}).unwrap();
        assert_eq!(
            reg.create(1, &start(9), 1000, |_| {}).unwrap_err(),
            BatchError::InUse
        );
        // same id on another connection is fine
        reg.create(2, &start(9), 1000, |_| {}).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn create_respects_batch_limit() {
        let reg = BatchRegistry::new(Limits {
            max_batches: 1,
            ..Limits::default()
        });
        reg.create(1, &start(1), 1000, |_| {}).unwrap();
        assert_eq!(
            reg.create(1, &start(2), 1000, |_| {}).unwrap_err(),
            BatchError::TooMany
        );
    }

    #[test]
    fn zero_timeout_uses_default() {
        let reg = registry();
        let mut cmd = start(1);
        cmd.timeout_ms = 0;
        let txn = reg.create(1, &cmd, 1234, |_| {}).unwrap();
        assert_eq!(txn.timeout_ms(), 1234);
        assert_eq!(txn.deadline_ms() - txn.created_ms(), 1234);
    }

    #[test]
    fn members_inherit_batch_attributes() {
        let reg = registry();
        reg.create(1, &start(3), 1000, |_| {}).unwrap();

        let mut put = Command::new(OpKind::Put, 2);
        put.priority = Priority::Lowest;
        put.timeout_ms = 1;
        reg.inherit(&BatchKey::new(1, 3), &mut put).unwrap();
        assert_eq!(put.priority, Priority::Higher);
        assert_eq!(put.timeout_ms, 5_000);

        let mut orphan = Command::new(OpKind::Put, 3);
        assert_eq!(
            reg.inherit(&BatchKey::new(1, 4), &mut orphan).unwrap_err(),
            BatchError::NotFound
        );
    }

    #[test]
    fn commit_applies_members_in_order() {
        let reg = registry();
        let pool = ValuePool::new(1 << 20);
        let key = BatchKey::new(1, 1);
        reg.create(1, &start(1), 1000, |_| {}).unwrap();
        reg.add_member(&key, member(OpKind::Put, 2, b"a", Some(pool.admit(Bytes::from_static(b"1")).unwrap())))
            .unwrap();
        reg.add_member(&key, member(OpKind::Delete, 3, b"b", None)).unwrap();
        reg.add_member(&key, member(OpKind::Put, 4, b"c", Some(pool.admit(Bytes::from_static(b"3")).unwrap())))
            .unwrap();

        let storage = RecordingStorage::default();
        let outcome = reg.commit(&key, 3, &allow(), &AllowAll, &storage).unwrap();
        assert_eq!(outcome.members, 3);
        assert!(outcome.status.is_success());

        let calls = storage.calls.lock();
        assert_eq!(calls.len(), 1);
        let keys: Vec<_> = calls[0].iter().map(|(put, k)| (*put, k.clone())).collect();
        assert_eq!(
            keys,
            vec![
                (true, Bytes::from_static(b"a")),
                (false, Bytes::from_static(b"b")),
                (true, Bytes::from_static(b"c")),
            ]
        );
        drop(calls);

        // the write consumed the buffers and the batch is gone
        assert_eq!(pool.used_bytes(), 0);
        assert!(!reg.contains(&key));
        assert_eq!(reg.subscriptions(), 0);
        assert_eq!(
            reg.add_member(&key, member(OpKind::Put, 5, b"d", None)).unwrap_err(),
            BatchError::NotFound
        );
    }

    #[test]
    fn validation_failure_applies_nothing() {
        let reg = registry();
        let pool = ValuePool::new(1 << 20);
        let key = BatchKey::new(1, 1);
        reg.create(1, &start(1), 1000, |_| {}).unwrap();
        reg.add_member(&key, member(OpKind::Put, 2, b"ok", Some(pool.admit(Bytes::from_static(b"x")).unwrap())))
            .unwrap();
        reg.add_member(&key, member(OpKind::Put, 3, b"secret/1", None)).unwrap();
        reg.add_member(&key, member(OpKind::Put, 4, b"secret/2", None)).unwrap();

        let storage = RecordingStorage::default();
        let err = reg
            .commit(&key, 3, &PrefixValidator { deny: b"secret" }, &AllowAll, &storage)
            .unwrap_err();
        assert_eq!(err.failed_sequence(), Some(3));
        assert_eq!(err.status().code, StatusCode::NotAuthorized);
        assert!(storage.calls.lock().is_empty());
        assert_eq!(pool.used_bytes(), 0);
        assert!(!reg.contains(&key));
    }

    #[test]
    fn oversize_batch_is_refused() {
        let reg = BatchRegistry::new(Limits {
            max_batch_size: 50,
            ..Limits::default()
        });
        let pool = ValuePool::new(1 << 20);
        let key = BatchKey::new(1, 1);
        reg.create(1, &start(1), 1000, |_| {}).unwrap();
        for seq in 2..5 {
            let value = pool.admit(Bytes::from(vec![0u8; 99])).unwrap();
            reg.add_member(&key, member(OpKind::Put, seq, b"k", Some(value))).unwrap();
        }
        assert_eq!(reg.get(&key).unwrap().size_bytes(), 300);

        let storage = RecordingStorage::default();
        let err = reg.commit(&key, 3, &allow(), &AllowAll, &storage).unwrap_err();
        assert_eq!(err, BatchError::TooLarge);
        assert!(storage.calls.lock().is_empty());
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn deletes_are_charged_flat() {
        let reg = registry();
        let key = BatchKey::new(1, 1);
        reg.create(1, &start(1), 1000, |_| {}).unwrap();
        reg.add_member(&key, member(OpKind::Delete, 2, b"k", None)).unwrap();
        let txn = reg.get(&key).unwrap();
        assert_eq!(txn.size_bytes(), DELETE_ACCOUNTING_BYTES);
        assert_eq!(txn.delete_count(), 1);
    }

    #[test]
    fn too_many_deletes() {
        let reg = BatchRegistry::new(Limits {
            max_deletes_per_batch: 1,
            ..Limits::default()
        });
        let key = BatchKey::new(1, 1);
        reg.create(1, &start(1), 1000, |_| {}).unwrap();
        reg.add_member(&key, member(OpKind::Delete, 2, b"a", None)).unwrap();
        reg.add_member(&key, member(OpKind::Delete, 3, b"b", None)).unwrap();
        let err = reg
            .commit(&key, 2, &allow(), &AllowAll, &RecordingStorage::default())
            .unwrap_err();
        assert_eq!(err, BatchError::TooManyDeletes);
    }

    #[test]
    fn count_mismatch() {
        let reg = registry();
        let key = BatchKey::new(1, 1);
        reg.create(1, &start(1), 1000, |_| {}).unwrap();
        reg.add_member(&key, member(OpKind::Delete, 2, b"a", None)).unwrap();
        let err = reg
            .commit(&key, 2, &allow(), &AllowAll, &RecordingStorage::default())
            .unwrap_err();
        assert_eq!(
            err,
            BatchError::CountMismatch {
                declared: 2,
                received: 1
            }
        );
        assert!(!reg.contains(&key));
    }

    #[test]
    fn no_space_tolerated_on_delete_only() {
        let reg = registry();
        let key = BatchKey::new(1, 1);
        reg.create(1, &start(1), 1000, |_| {}).unwrap();
        let mut del = member(OpKind::Delete, 2, b"a", None);
        del.admission = Status::new(StatusCode::NoSpace, "Drive is full");
        reg.add_member(&key, del).unwrap();
        let storage = RecordingStorage::default();
        reg.commit(&key, 1, &allow(), &AllowAll, &storage).unwrap();
        assert_eq!(storage.calls.lock().len(), 1);

        let key = BatchKey::new(1, 2);
        reg.create(1, &start(2), 1000, |_| {}).unwrap();
        let mut put = member(OpKind::Put, 3, b"a", None);
        put.admission = Status::new(StatusCode::NoSpace, "Drive is full");
        reg.add_member(&key, put).unwrap();
        let err = reg.commit(&key, 1, &allow(), &AllowAll, &storage).unwrap_err();
        assert_eq!(err.status().code, StatusCode::NoSpace);
        assert_eq!(err.failed_sequence(), Some(3));
    }

    #[test]
    fn abort_releases_and_removes() {
        let reg = registry();
        let pool = ValuePool::new(100);
        let key = BatchKey::new(1, 1);
        let txn = reg.create(1, &start(1), 1000, |_| {}).unwrap();
        reg.add_member(&key, member(OpKind::Put, 2, b"a", Some(pool.admit(Bytes::from_static(b"xyz")).unwrap())))
            .unwrap();
        assert_eq!(pool.used_bytes(), 3);

        reg.abort(&key).unwrap();
        // a handle still held elsewhere doesn't pin the buffers
        assert!(txn.is_complete());
        assert_eq!(pool.used_bytes(), 0);
        assert_eq!(reg.abort(&key).unwrap_err(), BatchError::NotFound);
        assert_eq!(reg.subscriptions(), 0);
    }

    #[test]
    fn expire_is_noop_after_completion() {
        let reg = registry();
        let key = BatchKey::new(1, 1);
        reg.create(1, &start(1), 1000, |_| {}).unwrap();
        assert!(reg.expire(&key));
        assert!(!reg.expire(&key));
        assert!(reg.is_empty());

        reg.create(1, &start(2), 1000, |_| {}).unwrap();
        let key = BatchKey::new(1, 2);
        reg.commit(&key, 0, &allow(), &AllowAll, &RecordingStorage::default())
            .unwrap();
        assert!(!reg.expire(&key));
    }

    #[test]
    fn timeouts_are_published_to_subscriber() {
        let reg = registry();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let mut cmd = start(1);
        cmd.timeout_ms = 1;
        reg.create(7, &cmd, 1000, move |ev| {
            assert_eq!(ev.key, BatchKey::new(7, 1));
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        reg.create(7, &start(2), 1000, |_| {}).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let expired = reg.expired(time::now_ms());
        assert_eq!(expired.len(), 1);
        for ev in &expired {
            assert!(reg.publish_timeout(ev));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(reg.next_deadline().is_some());
    }

    #[test]
    fn wait_for_members_sees_late_add() {
        let reg = Arc::new(registry());
        let key = BatchKey::new(1, 1);
        let txn = reg.create(1, &start(1), 1000, |_| {}).unwrap();
        txn.note_ingested();
        txn.note_ingested();
        reg.add_member(&key, member(OpKind::Delete, 2, b"a", None)).unwrap();
        assert!(!txn.wait_for_members(std::time::Duration::from_millis(5)));

        let adder = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                reg.add_member(&key, member(OpKind::Delete, 3, b"b", None)).unwrap();
            })
        };
        assert!(txn.wait_for_members(std::time::Duration::from_secs(5)));
        adder.join().unwrap();
        assert_eq!(txn.member_count(), 2);
    }

    #[test]
    fn wait_for_members_keeps_one_deadline_across_wakeups() {
        let reg = Arc::new(registry());
        let key = BatchKey::new(1, 1);
        let txn = reg.create(1, &start(1), 10_000, |_| {}).unwrap();
        for _ in 0..100 {
            txn.note_ingested();
        }

        // a trickle of adds keeps waking the waiter without completing it
        let adder = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                for seq in 2..12 {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    reg.add_member(&key, member(OpKind::Delete, seq, b"k", None)).unwrap();
                }
            })
        };
        let started = std::time::Instant::now();
        assert!(!txn.wait_for_members(std::time::Duration::from_millis(60)));
        assert!(started.elapsed() < std::time::Duration::from_millis(150));
        adder.join().unwrap();
    }

    #[test]
    fn oversized_timeout_is_clamped() {
        let reg = registry();
        let mut cmd = start(1);
        cmd.timeout_ms = u64::MAX;
        let txn = reg.create(1, &cmd, 1000, |_| {}).unwrap();
        assert_eq!(txn.deadline_ms() - txn.created_ms(), time::MAX_TIMEOUT_MS);
    }

    #[test]
    fn remove_connection_drops_its_batches() {
        let reg = registry();
        reg.create(1, &start(1), 1000, |_| {}).unwrap();
        reg.create(1, &start(2), 1000, |_| {}).unwrap();
        reg.create(2, &start(1), 1000, |_| {}).unwrap();
        assert!(reg.has_open_batches(1));
        assert_eq!(reg.remove_connection(1), 2);
        assert!(!reg.has_open_batches(1));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.subscriptions(), 1);
    }
}
