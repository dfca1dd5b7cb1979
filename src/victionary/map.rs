//! The generic staged map every Victionary sub-registry instantiates.
//!
//! A `SystemTableMap<E>` holds the committed entries (shared handles keyed
//! by normalized key string) plus a per-session list of pending operations.
//! A session sees its own staged changes immediately; everyone else sees
//! them only after `commit`. Persistence is gated at compile time by trait
//! bound: table I/O exists only for `E: TableBacked`, and get-or-construct
//! only for `E: CreateFromKey`.
//!
//! All methods assume the caller holds the Victionary lock; the borrow on
//! the guard enforces it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::session::{Arena, Session, SessionId};
use crate::victionary::keys::VictionaryKey;
use crate::victionary::store::{SystemRow, SystemTable};

pub trait VictionaryEntry: Send + Sync + 'static {
    type Key: VictionaryKey + Clone;

    fn key(&self) -> &Self::Key;
}

/// Row marshalling for entry kinds with a backing system table.
pub trait TableBacked: VictionaryEntry + Sized {
    /// Whether rows may be updated or deleted after bootstrap. Properties
    /// are write-once.
    const MUTABLE: bool = true;

    fn from_row(row: &SystemRow) -> Result<Self>;
    fn to_row(&self) -> SystemRow;
}

/// Factory for memory-only entry kinds that `acquire_or_create` can build
/// on demand (currently only `TypeContext`).
pub trait CreateFromKey: VictionaryEntry + Sized {
    type Deps;

    fn create(key: &Self::Key, deps: &Self::Deps) -> Result<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

/// One queued change. For `Insert` the entry is present and `old_key` is
/// empty. For `Update` the entry holds the new value and `old_key` names the
/// key to remove if the key changed (renames). For `Delete` the entry is
/// absent and `old_key` holds the key to remove.
pub struct PendingOp<E: VictionaryEntry> {
    pub op_type: OperationType,
    pub entry: Option<Arc<E>>,
    pub old_key: String,
}

impl<E: VictionaryEntry> PendingOp<E> {
    fn new_key(&self) -> &str {
        match &self.entry {
            Some(entry) => entry.key().as_str(),
            None => &self.old_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub committed_entries: usize,
    pub uncommitted_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct SystemTableMap<E: VictionaryEntry> {
    committed: BTreeMap<String, Arc<E>>,
    pending: HashMap<SessionId, Vec<PendingOp<E>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<E: VictionaryEntry> Default for SystemTableMap<E> {
    fn default() -> Self {
        SystemTableMap {
            committed: BTreeMap::new(),
            pending: HashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl<E: VictionaryEntry> SystemTableMap<E> {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Lookup =====

    /// Committed state only, ignoring every session's staged changes.
    pub fn get_committed(&self, key_str: &str) -> Option<&E> {
        match self.committed.get(key_str) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.as_ref())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Most recent version visible to `session`: the last pending op on the
    /// key if any (a pending delete hides the entry), else the committed
    /// entry. Passing no session is equivalent to `get_committed`.
    pub fn get(&self, session: Option<&Session>, key_str: &str) -> Option<&E> {
        if let Some(session) = session {
            if let Some(ops) = self.pending.get(&session.id()) {
                let mut most_recent: Option<&PendingOp<E>> = None;
                for op in ops {
                    if op.new_key() == key_str
                        || (op.op_type == OperationType::Update && op.old_key == key_str)
                    {
                        most_recent = Some(op);
                    }
                }
                if let Some(op) = most_recent {
                    return match op.op_type {
                        OperationType::Delete => None,
                        _ => op.entry.as_deref(),
                    };
                }
            }
        }
        self.get_committed(key_str)
    }

    // ===== Acquisition with reference counting =====

    /// Acquire an entry with its lifetime tied to `arena`: the returned
    /// reference stays valid after the Victionary lock is released, until
    /// the arena is cleared.
    pub fn acquire<'a>(&self, key_str: &str, arena: &'a Arena) -> Option<&'a E> {
        let handle = self.committed.get(key_str)?.clone();
        Some(arena.keep_shared(handle))
    }

    /// Acquire the shared handle directly; use when the reference must
    /// outlive a single statement (e.g. session-scoped variables).
    pub fn acquire_client_managed(&self, key_str: &str) -> Option<Arc<E>> {
        self.committed.get(key_str).cloned()
    }

    /// Strong-reference count of an entry's handle; 0 if absent. A count
    /// above 1 means something outside the map still holds the entry.
    pub fn get_use_count(&self, key_str: &str) -> usize {
        self.committed
            .get(key_str)
            .map(Arc::strong_count)
            .unwrap_or(0)
    }

    // ===== Staging =====

    pub fn mark_for_insertion(&mut self, session: &Session, entry: E) {
        self.pending
            .entry(session.id())
            .or_default()
            .push(PendingOp {
                op_type: OperationType::Insert,
                entry: Some(Arc::new(entry)),
                old_key: String::new(),
            });
    }

    /// `old_key` equal to `entry.key()` expresses a data-only update; a
    /// differing key expresses a rename.
    pub fn mark_for_update(&mut self, session: &Session, entry: E, old_key: &E::Key) {
        self.pending
            .entry(session.id())
            .or_default()
            .push(PendingOp {
                op_type: OperationType::Update,
                entry: Some(Arc::new(entry)),
                old_key: old_key.as_str().to_string(),
            });
    }

    pub fn mark_for_deletion(&mut self, session: &Session, key: &E::Key) {
        self.pending
            .entry(session.id())
            .or_default()
            .push(PendingOp {
                op_type: OperationType::Delete,
                entry: None,
                old_key: key.as_str().to_string(),
            });
    }

    pub fn has_uncommitted(&self, session: &Session) -> bool {
        self.pending
            .get(&session.id())
            .map(|ops| !ops.is_empty())
            .unwrap_or(false)
    }

    // ===== Transaction lifecycle =====

    /// Apply this session's pending ops to the committed map, in staging
    /// order.
    pub fn commit(&mut self, session: &Session) {
        let Some(ops) = self.pending.remove(&session.id()) else {
            return;
        };
        for op in ops {
            match op.op_type {
                OperationType::Insert | OperationType::Update => {
                    let entry = op.entry.expect("insert/update op carries an entry");
                    let new_key = entry.key().as_str().to_string();
                    self.committed.insert(new_key.clone(), entry);
                    if op.op_type == OperationType::Update
                        && !op.old_key.is_empty()
                        && op.old_key != new_key
                    {
                        self.committed.remove(&op.old_key);
                    }
                }
                OperationType::Delete => {
                    self.committed.remove(&op.old_key);
                }
            }
        }
    }

    /// Discard this session's pending ops without touching committed state.
    pub fn rollback(&mut self, session: &Session) {
        self.pending.remove(&session.id());
    }

    /// Empty both maps (startup reload, tests).
    pub fn clear(&mut self) {
        self.committed.clear();
        self.pending.clear();
    }

    // ===== Prefix queries =====

    /// All committed entries whose normalized key starts with `prefix`.
    /// Returned references are valid only while the lock is held.
    pub fn get_prefix_committed(&self, prefix: &str) -> Vec<&E> {
        if prefix.is_empty() {
            return Vec::new();
        }
        self.committed
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| &**v)
            .collect()
    }

    /// Like `get_prefix_committed` but returns shared handles.
    pub fn get_prefix_committed_handles(&self, prefix: &str) -> Vec<Arc<E>> {
        if prefix.is_empty() {
            return Vec::new();
        }
        self.committed
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn has_prefix_committed(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return false;
        }
        self.committed
            .range(prefix.to_string()..)
            .next()
            .map(|(k, _)| k.starts_with(prefix))
            .unwrap_or(false)
    }

    pub fn get_all_committed(&self) -> Vec<&E> {
        self.committed.values().map(|v| &**v).collect()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            committed_entries: self.committed.len(),
            uncommitted_entries: self.pending.values().map(Vec::len).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl<E: TableBacked> SystemTableMap<E> {
    /// Clear the map and load every row from the backing table.
    /// Called once, under write lock, during initialization.
    pub fn reload_from_table(&mut self, table: &SystemTable) -> Result<()> {
        self.clear();
        let mut loaded = 0usize;
        for row in table.rows() {
            let entry = E::from_row(row).map_err(|e| {
                Error::Integrity(format!(
                    "failed to read row from {}: {}",
                    table.name(),
                    e
                ))
            })?;
            let key = entry.key().as_str().to_string();
            self.committed.insert(key, Arc::new(entry));
            loaded += 1;
        }
        tracing::info!(table = table.name(), loaded, "loaded system table entries");
        Ok(())
    }

    /// Replay this session's pending ops against the backing table. Must run
    /// before the host transaction commits so the row writes are part of it.
    /// Rows missing on delete are demoted to a warning (idempotent); a
    /// missing row on update is an integrity error.
    pub fn write_uncommitted_to_table(
        &self,
        session: &Session,
        table: &mut SystemTable,
    ) -> Result<()> {
        let Some(ops) = self.pending.get(&session.id()) else {
            return Ok(());
        };

        for op in ops {
            match op.op_type {
                OperationType::Insert => {
                    let entry = op.entry.as_ref().expect("insert op carries an entry");
                    table.insert(entry.to_row());
                }
                OperationType::Update => {
                    if !E::MUTABLE {
                        return Err(Error::Integrity(format!(
                            "updates are not supported for {}",
                            table.name()
                        )));
                    }
                    let entry = op.entry.as_ref().expect("update op carries an entry");
                    let lookup = if op.old_key.is_empty() {
                        entry.key().as_str()
                    } else {
                        &op.old_key
                    };
                    // Probe by re-deriving each row's key; normalized keys
                    // compare bytewise, matching a binary-collation index.
                    let idx = table
                        .position(|row| {
                            E::from_row(row)
                                .map(|e| e.key().as_str() == lookup)
                                .unwrap_or(false)
                        })
                        .ok_or_else(|| {
                            Error::Integrity(format!(
                                "row not found in {} for update of key {}",
                                table.name(),
                                lookup
                            ))
                        })?;
                    table.update_at(idx, entry.to_row());
                }
                OperationType::Delete => {
                    if !E::MUTABLE {
                        return Err(Error::Integrity(format!(
                            "deletes are not supported for {}",
                            table.name()
                        )));
                    }
                    let idx = table.position(|row| {
                        E::from_row(row)
                            .map(|e| e.key().as_str() == op.old_key)
                            .unwrap_or(false)
                    });
                    match idx {
                        Some(idx) => table.remove_at(idx),
                        None => {
                            tracing::warn!(
                                table = table.name(),
                                key = %op.old_key,
                                "row not found for delete"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl<E: CreateFromKey> SystemTableMap<E> {
    /// Get-or-construct under the write lock, returning the shared handle.
    pub fn get_or_create_handle(&mut self, key: &E::Key, deps: &E::Deps) -> Result<Arc<E>> {
        let key_str = key.as_str().to_string();
        if !self.committed.contains_key(&key_str) {
            let entry = E::create(key, deps)?;
            self.committed.insert(key_str.clone(), Arc::new(entry));
        }
        Ok(self
            .committed
            .get(&key_str)
            .expect("entry just inserted")
            .clone())
    }

    /// Get-or-construct under the write lock, then acquire on the arena.
    pub fn acquire_or_create<'a>(
        &mut self,
        key: &E::Key,
        arena: &'a Arena,
        deps: &E::Deps,
    ) -> Result<&'a E> {
        let handle = self.get_or_create_handle(key, deps)?;
        Ok(arena.keep_shared(handle))
    }
}
