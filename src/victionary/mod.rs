//! The Victionary: in-memory, transactionally-staged registry of every
//! extension-owned object, and the write path to the system tables backing
//! the persistent subset.
//!
//! One process-wide reader-writer lock protects all six maps. Readers get a
//! point-in-time-consistent view for as long as they hold the guard; DDL
//! and install/uninstall are the only writers. No partial commit is ever
//! externally visible: all cross-session visibility goes through
//! `commit_all`.

pub mod descriptors;
pub mod entries;
pub mod keys;
pub mod map;
pub mod store;

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::session::Session;

use self::descriptors::{ExtensionDescriptor, TypeContext, TypeDescriptor};
use self::entries::{ColumnEntry, ExtensionEntry, PropertyEntry};
use self::keys::{ColumnKeyPrefix, VictionaryKey};
use self::map::SystemTableMap;
use self::store::{
    SystemTableStore, CUSTOM_COLUMNS_TABLE, EXTENSIONS_TABLE, PROPERTIES_TABLE,
};

/// The six sub-registries. Access goes through `Victionary::read_guard` /
/// `write_guard`; holding the guard is what licenses map calls.
#[derive(Default)]
pub struct Maps {
    pub properties: SystemTableMap<PropertyEntry>,
    pub columns: SystemTableMap<ColumnEntry>,
    pub extensions: SystemTableMap<ExtensionEntry>,
    pub type_descriptors: SystemTableMap<TypeDescriptor>,
    pub extension_descriptors: SystemTableMap<ExtensionDescriptor>,
    pub type_contexts: SystemTableMap<TypeContext>,
}

impl Maps {
    /// All committed custom columns of one table. Sugar over the columns
    /// prefix scan; references are valid while the guard is held.
    pub fn custom_columns_for_table(&self, db: &str, table: &str) -> Vec<&ColumnEntry> {
        self.columns
            .get_prefix_committed(ColumnKeyPrefix::new(db, table).as_str())
    }
}

pub struct Victionary {
    maps: RwLock<Maps>,
    initialized: AtomicBool,
    initializing: AtomicBool,
}

impl Victionary {
    pub fn new() -> Self {
        Victionary {
            maps: RwLock::new(Maps::default()),
            initialized: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn read_guard(&self) -> RwLockReadGuard<'_, Maps> {
        debug_assert!(
            self.initialized.load(Ordering::SeqCst) || self.initializing.load(Ordering::SeqCst),
            "Victionary not initialized or initializing"
        );
        self.maps.read()
    }

    pub fn write_guard(&self) -> RwLockWriteGuard<'_, Maps> {
        debug_assert!(
            self.initialized.load(Ordering::SeqCst) || self.initializing.load(Ordering::SeqCst),
            "Victionary not initialized or initializing"
        );
        self.maps.write()
    }

    /// One-shot initialization during server startup: load every persistent
    /// map from its backing table under write lock. Double-init is an error.
    pub fn init(&self, _session: &Session, store: &SystemTableStore) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(Error::Integrity(
                "Victionary initialized twice".to_string(),
            ));
        }
        self.initializing.store(true, Ordering::SeqCst);

        let result = (|| -> Result<()> {
            let mut maps = self.write_guard();
            maps.properties
                .reload_from_table(store.table(PROPERTIES_TABLE)?)?;
            maps.extensions
                .reload_from_table(store.table(EXTENSIONS_TABLE)?)?;
            maps.columns
                .reload_from_table(store.table(CUSTOM_COLUMNS_TABLE)?)?;
            Ok(())
        })();

        self.initializing.store(false, Ordering::SeqCst);
        if result.is_ok() {
            self.initialized.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Initialize without table loads. For unit tests.
    pub fn init_for_testing(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Promote this session's staged ops in every map, atomically with
    /// respect to all readers.
    pub fn commit_all(&self, session: &Session) {
        let mut maps = self.write_guard();
        maps.properties.commit(session);
        maps.columns.commit(session);
        maps.extensions.commit(session);
        maps.type_descriptors.commit(session);
        maps.extension_descriptors.commit(session);
        maps.type_contexts.commit(session);
    }

    /// Discard this session's staged ops in every map.
    pub fn rollback_all(&self, session: &Session) {
        let mut maps = self.write_guard();
        maps.properties.rollback(session);
        maps.columns.rollback(session);
        maps.extensions.rollback(session);
        maps.type_descriptors.rollback(session);
        maps.extension_descriptors.rollback(session);
        maps.type_contexts.rollback(session);
    }

    /// Push this session's staged row changes into the backing tables. Must
    /// run before the host transaction commits so the writes are part of it.
    /// Binlogging is suppressed across the call: the system tables are not
    /// replicated.
    pub fn write_all_uncommitted_entries(
        &self,
        session: &Session,
        store: &mut SystemTableStore,
    ) -> Result<()> {
        let _binlog = session.suppress_binlog();
        let maps = self.read_guard();
        maps.properties
            .write_uncommitted_to_table(session, store.table_mut(PROPERTIES_TABLE)?)?;
        maps.extensions
            .write_uncommitted_to_table(session, store.table_mut(EXTENSIONS_TABLE)?)?;
        maps.columns
            .write_uncommitted_to_table(session, store.table_mut(CUSTOM_COLUMNS_TABLE)?)?;
        Ok(())
    }

    /// Empty every map. Tests and shutdown.
    pub fn clear_all(&self) {
        let mut maps = self.maps.write();
        maps.properties.clear();
        maps.columns.clear();
        maps.extensions.clear();
        maps.type_descriptors.clear();
        maps.extension_descriptors.clear();
        maps.type_contexts.clear();
    }
}

impl Default for Victionary {
    fn default() -> Self {
        Victionary::new()
    }
}
