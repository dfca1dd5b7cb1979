//! Session and arena stand-ins for the host's `THD` and `MEM_ROOT`.
//!
//! The subsystem never depends on host internals; it only needs a session
//! identity for staging, a warning sink, the binlog-suppression flag, and
//! an arena that pins shared handles until it is cleared.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::mdl::MdlTicket;

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Session {
    id: SessionId,
    current_db: String,
    binlog_suppressed: Cell<bool>,
    lock_wait_timeout: Duration,
    warnings: RefCell<Vec<String>>,
    // Statement-scoped metadata lock tickets.
    tickets: RefCell<Vec<MdlTicket>>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            current_db: "test".to_string(),
            binlog_suppressed: Cell::new(false),
            lock_wait_timeout: Duration::from_secs(50),
            warnings: RefCell::new(Vec::new()),
            tickets: RefCell::new(Vec::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn current_db(&self) -> &str {
        &self.current_db
    }

    pub fn set_current_db(&mut self, db: impl Into<String>) {
        self.current_db = db.into();
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        self.lock_wait_timeout
    }

    pub fn set_lock_wait_timeout(&mut self, timeout: Duration) {
        self.lock_wait_timeout = timeout;
    }

    /// Suppress binlogging for the scope of the returned guard. The system
    /// tables are not replicated; replication carries the DDL instead.
    pub fn suppress_binlog(&self) -> BinlogGuard<'_> {
        let prev = self.binlog_suppressed.replace(true);
        BinlogGuard {
            session: self,
            prev,
        }
    }

    pub fn binlog_suppressed(&self) -> bool {
        self.binlog_suppressed.get()
    }

    pub fn push_warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(session = self.id, "{}", message);
        self.warnings.borrow_mut().push(message);
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.borrow().clone()
    }

    pub fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.warnings.borrow_mut())
    }

    /// Hold a metadata lock ticket until the end of the statement.
    pub fn hold_ticket(&self, ticket: MdlTicket) {
        self.tickets.borrow_mut().push(ticket);
    }

    /// Release all statement-scoped metadata locks.
    pub fn release_statement_locks(&self) {
        self.tickets.borrow_mut().clear();
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

pub struct BinlogGuard<'a> {
    session: &'a Session,
    prev: bool,
}

impl Drop for BinlogGuard<'_> {
    fn drop(&mut self) {
        self.session.binlog_suppressed.set(self.prev);
    }
}

/// Cleanup-scoped keeper of shared handles, standing in for the host arena
/// allocator's cleanup registration.
///
/// `keep_shared` pins one strong reference for the lifetime of the arena and
/// hands back a plain reference to the pointee. Because `clear` takes
/// `&mut self`, the borrow checker guarantees no reference obtained from the
/// arena survives a clear.
#[derive(Default)]
pub struct Arena {
    kept: RefCell<Vec<Box<dyn Any>>>,
}

impl Arena {
    pub fn new() -> Self {
        Arena::default()
    }

    pub fn keep_shared<T: 'static>(&self, handle: Arc<T>) -> &T {
        let ptr = Arc::as_ptr(&handle);
        self.kept.borrow_mut().push(Box::new(handle));
        // The Arc stored above keeps the allocation alive until clear();
        // Arc pointees have stable addresses.
        unsafe { &*ptr }
    }

    /// Drop every kept handle, releasing their strong references.
    pub fn clear(&mut self) {
        self.kept.get_mut().clear();
    }

    pub fn kept_count(&self) -> usize {
        self.kept.borrow().len()
    }
}
