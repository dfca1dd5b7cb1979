//! Named metadata locks.
//!
//! Stand-in for the host's MDL subsystem, reduced to the namespaces this
//! subsystem uses: the global shared read lock, the backup lock, and
//! per-extension locks keyed on the normalized extension name. Install and
//! uninstall take the extension lock exclusive; DDL that references an
//! extension takes it shared, which is what blocks uninstall for the
//! duration of the statement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MdlNamespace {
    GlobalRead,
    Backup,
    Extension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdlType {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

struct MdlInner {
    locks: Mutex<HashMap<(MdlNamespace, String), LockState>>,
    cond: Condvar,
}

pub struct MdlManager {
    inner: Arc<MdlInner>,
}

impl MdlManager {
    pub fn new() -> Self {
        MdlManager {
            inner: Arc::new(MdlInner {
                locks: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Acquire a named lock, waiting up to `timeout`. The returned ticket
    /// releases the lock when dropped.
    pub fn acquire(
        &self,
        namespace: MdlNamespace,
        name: &str,
        lock_type: MdlType,
        timeout: Duration,
    ) -> Result<MdlTicket> {
        let key = (namespace, name.to_string());
        let deadline = Instant::now() + timeout;
        let mut locks = self.inner.locks.lock();
        loop {
            let state = locks.entry(key.clone()).or_default();
            let compatible = match lock_type {
                MdlType::Shared => !state.writer,
                MdlType::Exclusive => !state.writer && state.readers == 0,
            };
            if compatible {
                match lock_type {
                    MdlType::Shared => state.readers += 1,
                    MdlType::Exclusive => state.writer = true,
                }
                return Ok(MdlTicket {
                    inner: self.inner.clone(),
                    key,
                    lock_type,
                });
            }
            if Instant::now() >= deadline
                || self.inner.cond.wait_until(&mut locks, deadline).timed_out()
            {
                return Err(Error::Validation(format!(
                    "Lock wait timeout exceeded waiting for {:?} lock on '{}'",
                    lock_type, name
                )));
            }
        }
    }

    #[cfg(test)]
    fn is_locked(&self, namespace: MdlNamespace, name: &str) -> bool {
        let locks = self.inner.locks.lock();
        locks
            .get(&(namespace, name.to_string()))
            .map(|s| s.writer || s.readers > 0)
            .unwrap_or(false)
    }
}

impl Default for MdlManager {
    fn default() -> Self {
        MdlManager::new()
    }
}

pub struct MdlTicket {
    inner: Arc<MdlInner>,
    key: (MdlNamespace, String),
    lock_type: MdlType,
}

impl Drop for MdlTicket {
    fn drop(&mut self) {
        let mut locks = self.inner.locks.lock();
        if let Some(state) = locks.get_mut(&self.key) {
            match self.lock_type {
                MdlType::Shared => state.readers = state.readers.saturating_sub(1),
                MdlType::Exclusive => state.writer = false,
            }
            if state.readers == 0 && !state.writer {
                locks.remove(&self.key);
            }
        }
        self.inner.cond.notify_all();
    }
}
