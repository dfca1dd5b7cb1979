//! Custom-type resolution and DDL staging.
//!
//! `resolve_type` turns SQL-level type text into a concrete `TypeContext`.
//! `MetadataModifier` accumulates the column-metadata changes a DDL
//! statement implies, then stages them into the Victionary under the
//! locking protocol: shared metadata locks on every referenced extension
//! (the counter-lock to uninstall's exclusive lock), validation against
//! committed type descriptors, and staging in remove → rename → insert
//! order. That order is load-bearing: a custom→custom MODIFY becomes
//! remove-then-insert and the remove must apply first.

pub mod sql;

use std::sync::Arc;

use crate::config::SCHEMA_NAME;
use crate::error::{Error, Result};
use crate::mdl::{MdlNamespace, MdlType};
use crate::runtime::ExtensionRuntime;
use crate::session::{Arena, Session};
use crate::victionary::descriptors::{TypeContext, TypeDescriptor};
use crate::victionary::entries::ColumnEntry;
use crate::victionary::keys::{
    normalize_extension_name, ColumnKey, ExtensionKey, TypeContextKey, TypeDescriptorKey,
    TypeDescriptorKeyPrefix, TypeParameters, VictionaryKey,
};
use crate::victionary::map::VictionaryEntry;
use crate::victionary::{Maps, Victionary};

/// Databases whose tables never carry custom-type metadata.
fn is_special_database(db: &str) -> bool {
    db == "mysql" || db == "sys" || db == SCHEMA_NAME
}

fn resolve_descriptor_handle(
    maps: &Maps,
    extension_name: Option<&str>,
    type_name: &str,
) -> Result<Option<Arc<TypeDescriptor>>> {
    let prefix = TypeDescriptorKeyPrefix::new(type_name, extension_name);
    let mut handles = maps
        .type_descriptors
        .get_prefix_committed_handles(prefix.as_str());
    if handles.len() > 1 {
        return Err(Error::Integrity(format!(
            "found more than one entry for type '{}'",
            type_name
        )));
    }
    Ok(handles.pop())
}

/// Resolve `[extension.]type_name` to a concrete `TypeContext` scoped to
/// `arena`. An unknown type is not an error here; the caller sees `None`.
pub fn resolve_type<'a>(
    victionary: &Victionary,
    extension_name: Option<&str>,
    type_name: &str,
    arena: &'a Arena,
) -> Result<Option<&'a TypeContext>> {
    if !victionary.is_initialized() {
        return Err(Error::Integrity(format!(
            "failed to resolve type '{}': Victionary not initialized",
            type_name
        )));
    }
    let mut maps = victionary.write_guard();
    let Some(descriptor) = resolve_descriptor_handle(&maps, extension_name, type_name)? else {
        return Ok(None);
    };
    // Parameterized type syntax is not parsed yet; bare lookups carry empty
    // parameters end to end.
    let key = TypeContextKey::new(descriptor.key().clone(), TypeParameters::default());
    let context = maps
        .type_contexts
        .acquire_or_create(&key, arena, &descriptor)?;
    Ok(Some(context))
}

/// Like `resolve_type`, but hands back the shared handle for references
/// that must outlive a statement.
pub fn resolve_type_client_managed(
    victionary: &Victionary,
    extension_name: Option<&str>,
    type_name: &str,
) -> Result<Option<Arc<TypeContext>>> {
    let mut maps = victionary.write_guard();
    let Some(descriptor) = resolve_descriptor_handle(&maps, extension_name, type_name)? else {
        return Ok(None);
    };
    let key = TypeContextKey::new(descriptor.key().clone(), TypeParameters::default());
    let context = maps.type_contexts.get_or_create_handle(&key, &descriptor)?;
    Ok(Some(context))
}

/// Column-on-table injection: when the host opens a table share, each field
/// is cross-referenced against the columns map (the session's staged ops
/// first). A hit yields the field's `TypeContext`, scoped to the share's
/// long-lived arena.
pub fn custom_type_for_column<'a>(
    victionary: &Victionary,
    session: &Session,
    db: &str,
    table: &str,
    column: &str,
    arena: &'a Arena,
) -> Result<Option<&'a TypeContext>> {
    if is_special_database(db) || !victionary.is_initialized() {
        return Ok(None);
    }

    let key = ColumnKey::new(db, table, column);
    let mut maps = victionary.write_guard();

    let Some(column_entry) = maps.columns.get(Some(session), key.as_str()) else {
        return Ok(None);
    };
    let descriptor_key = TypeDescriptorKey::new(
        column_entry.type_name.clone(),
        column_entry.extension_name.clone(),
        column_entry.extension_version.clone(),
    );
    // The descriptor must already be committed; the column row names it.
    let Some(descriptor) = maps
        .type_descriptors
        .acquire_client_managed(descriptor_key.as_str())
    else {
        return Err(Error::Integrity(format!(
            "failed to find type '{}' in extension '{}' version '{}' for column {}.{}.{}",
            descriptor_key.type_name(),
            descriptor_key.extension_name(),
            descriptor_key.extension_version(),
            db,
            table,
            column
        )));
    };

    let context_key = TypeContextKey::new(descriptor_key, TypeParameters::default());
    let context = maps
        .type_contexts
        .acquire_or_create(&context_key, arena, &descriptor)?;
    Ok(Some(context))
}

pub fn table_has_custom_columns(victionary: &Victionary, db: &str, table: &str) -> bool {
    if is_special_database(db) || !victionary.is_initialized() {
        return false;
    }
    let maps = victionary.read_guard();
    maps.columns.has_prefix_committed(
        crate::victionary::keys::ColumnKeyPrefix::new(db, table).as_str(),
    )
}

/// Only InnoDB-backed tables may carry custom-typed columns.
pub fn ensure_supported_engine(engine: Option<&str>, operation: &str) -> Result<()> {
    match engine {
        None => Ok(()),
        Some(e) if e.eq_ignore_ascii_case("InnoDB") => Ok(()),
        Some(e) => Err(Error::Validation(format!(
            "Custom types are only supported with InnoDB storage engine. \
             Cannot {} with {} storage engine.",
            operation, e
        ))),
    }
}

/// The resolved type a DDL field refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomTypeRef {
    pub extension_name: String,
    pub extension_version: String,
    pub type_name: String,
}

impl CustomTypeRef {
    pub fn from_context(tc: &TypeContext) -> Self {
        CustomTypeRef {
            extension_name: tc.extension_name().to_string(),
            extension_version: tc.extension_version().to_string(),
            type_name: tc.type_name().to_string(),
        }
    }
}

/// One field of a CREATE TABLE (or ADD COLUMN) list, after the planner
/// resolved its type.
#[derive(Debug, Clone)]
pub struct CreateFieldInfo {
    pub name: String,
    pub custom: Option<CustomTypeRef>,
}

/// One ADD/MODIFY/CHANGE item of an ALTER TABLE.
#[derive(Debug, Clone)]
pub struct AlterColumnChange {
    /// `Some` for MODIFY/CHANGE (the pre-change column name), `None` for
    /// ADD COLUMN.
    pub old_name: Option<String>,
    pub new_name: String,
    pub custom: Option<CustomTypeRef>,
}

/// An ALTER TABLE, reduced to what column metadata cares about. Order of
/// application: table rename, drops, column renames, changes.
#[derive(Debug, Clone, Default)]
pub struct AlterSpec {
    pub rename_to: Option<(String, String)>,
    pub dropped_columns: Vec<String>,
    pub renamed_columns: Vec<(String, String)>,
    pub changes: Vec<AlterColumnChange>,
}

#[derive(Debug, Clone)]
struct RoutineRef {
    extension_name: String,
    function_name: String,
}

/// Accumulates a statement's custom-column changes, then locks, validates,
/// and stages them.
#[derive(Default)]
pub struct MetadataModifier {
    to_add: Vec<ColumnEntry>,
    to_remove: Vec<ColumnKey>,
    // (new entry, old key)
    to_rename: Vec<(ColumnEntry, ColumnKey)>,
    to_call: Vec<RoutineRef>,
}

impl MetadataModifier {
    pub fn has_entries(&self) -> bool {
        !self.to_add.is_empty()
            || !self.to_remove.is_empty()
            || !self.to_rename.is_empty()
            || !self.to_call.is_empty()
    }

    // ===== High-level entry points =====

    /// CREATE TABLE.
    pub fn process_create(
        runtime: &ExtensionRuntime,
        session: &Session,
        db: &str,
        table: &str,
        create_fields: &[CreateFieldInfo],
        engine: Option<&str>,
    ) -> Result<()> {
        if create_fields.iter().any(|f| f.custom.is_some()) {
            ensure_supported_engine(engine, "CREATE TABLE")?;
        }
        let mut modifier = MetadataModifier::default();
        modifier.add_columns(db, table, create_fields);
        modifier.lock_and_apply(runtime, session)
    }

    /// DROP TABLE.
    pub fn process_drop(
        runtime: &ExtensionRuntime,
        session: &Session,
        drop_temporary: bool,
        tables: &[(String, String)],
    ) -> Result<()> {
        if drop_temporary {
            return Ok(());
        }
        let mut modifier = MetadataModifier::default();
        for (db, table) in tables {
            modifier.remove_columns(&runtime.victionary, db, table);
        }
        modifier.lock_and_apply(runtime, session)
    }

    /// ALTER TABLE. Order matters; see the module docs.
    pub fn process_alter(
        runtime: &ExtensionRuntime,
        session: &Session,
        db: &str,
        table: &str,
        alter: &AlterSpec,
        engine: Option<&str>,
    ) -> Result<()> {
        if alter.changes.iter().any(|c| c.custom.is_some()) {
            ensure_supported_engine(engine, "ALTER TABLE")?;
        }
        let mut modifier = MetadataModifier::default();
        modifier.alter_columns(&runtime.victionary, db, table, alter);
        modifier.lock_and_apply(runtime, session)
    }

    /// RENAME TABLE: pairs of (old, new).
    pub fn process_rename(
        runtime: &ExtensionRuntime,
        session: &Session,
        pairs: &[((String, String), (String, String))],
    ) -> Result<()> {
        let mut modifier = MetadataModifier::default();
        for (old, new) in pairs {
            modifier.rename_columns_table(
                &runtime.victionary,
                (&old.0, &old.1),
                (&new.0, &new.1),
            );
        }
        modifier.lock_and_apply(runtime, session)
    }

    /// Functions referenced by the statement, as (extension, function)
    /// pairs. Locking them shared here is what blocks uninstall for the
    /// statement's duration.
    pub fn process_calls(
        runtime: &ExtensionRuntime,
        session: &Session,
        routines: &[(String, String)],
    ) -> Result<()> {
        let mut modifier = MetadataModifier::default();
        for (extension_name, function_name) in routines {
            modifier.to_call.push(RoutineRef {
                extension_name: extension_name.clone(),
                function_name: function_name.clone(),
            });
        }
        modifier.lock_and_apply(runtime, session)
    }

    // ===== Host transaction hooks =====

    /// Push staged rows to the backing tables (before the host commit).
    pub fn store(runtime: &ExtensionRuntime, session: &Session) -> Result<()> {
        let mut store = runtime.store.lock();
        runtime
            .victionary
            .write_all_uncommitted_entries(session, &mut store)
    }

    pub fn commit(runtime: &ExtensionRuntime, session: &Session) {
        runtime.victionary.commit_all(session);
    }

    pub fn rollback(runtime: &ExtensionRuntime, session: &Session) {
        runtime.victionary.rollback_all(session);
    }

    /// Exclusive per-extension lock; the serialization point for install and
    /// uninstall against DDL referencing the extension.
    pub fn lock_extension_exclusive(
        runtime: &ExtensionRuntime,
        session: &Session,
        extension_name: &str,
    ) -> Result<()> {
        let normalized = normalize_extension_name(extension_name);
        let ticket = runtime.mdl.acquire(
            MdlNamespace::Extension,
            &normalized,
            MdlType::Exclusive,
            session.lock_wait_timeout(),
        )?;
        session.hold_ticket(ticket);
        Ok(())
    }

    // ===== Accumulation =====

    fn add_columns(&mut self, db: &str, table: &str, create_fields: &[CreateFieldInfo]) {
        if is_special_database(db) {
            return;
        }
        for field in create_fields {
            let Some(custom) = &field.custom else {
                continue;
            };
            // CREATE ... SELECT can redefine a field; skip duplicates.
            let duplicate = self.to_add.iter().any(|entry| {
                entry.column_name().eq_ignore_ascii_case(&field.name)
                    && entry.db_name().eq_ignore_ascii_case(db)
                    && entry.table_name().eq_ignore_ascii_case(table)
            });
            if duplicate {
                continue;
            }
            self.to_add.push(ColumnEntry::new(
                ColumnKey::new(db, table, field.name.clone()),
                custom.extension_name.clone(),
                custom.extension_version.clone(),
                custom.type_name.clone(),
            ));
        }
    }

    fn remove_columns(&mut self, victionary: &Victionary, db: &str, table: &str) {
        if is_special_database(db) || !victionary.is_initialized() {
            return;
        }
        let maps = victionary.read_guard();
        for entry in maps.custom_columns_for_table(db, table) {
            self.to_remove
                .push(ColumnKey::new(db, table, entry.column_name()));
        }
    }

    fn rename_columns_table(
        &mut self,
        victionary: &Victionary,
        old: (&str, &str),
        new: (&str, &str),
    ) {
        if !victionary.is_initialized() {
            return;
        }
        let maps = victionary.read_guard();
        for old_col in maps.custom_columns_for_table(old.0, old.1) {
            let new_entry = ColumnEntry::new(
                ColumnKey::new(new.0, new.1, old_col.column_name()),
                old_col.extension_name.clone(),
                old_col.extension_version.clone(),
                old_col.type_name.clone(),
            );
            self.to_rename.push((new_entry, old_col.key().clone()));
        }
    }

    fn alter_columns(&mut self, victionary: &Victionary, db: &str, table: &str, alter: &AlterSpec) {
        if is_special_database(db) || !victionary.is_initialized() {
            return;
        }

        // 0. ALTER TABLE ... RENAME moves every known custom column to the
        // new table name first.
        if let Some((new_db, new_table)) = &alter.rename_to {
            self.rename_columns_table(victionary, (db, table), (new_db, new_table));
        }

        let maps = victionary.read_guard();
        let current = maps.custom_columns_for_table(db, table);
        let is_custom = |name: &str| {
            current
                .iter()
                .any(|c| c.column_name().eq_ignore_ascii_case(name))
        };

        // 1. DROP COLUMN.
        for dropped in &alter.dropped_columns {
            if is_custom(dropped) {
                self.to_remove.push(ColumnKey::new(db, table, dropped));
            }
        }

        // 2. RENAME COLUMN, preserving the other fields.
        for (old_name, new_name) in &alter.renamed_columns {
            if let Some(old_entry) = current
                .iter()
                .find(|c| c.column_name().eq_ignore_ascii_case(old_name))
            {
                let new_entry = ColumnEntry::new(
                    ColumnKey::new(db, table, new_name),
                    old_entry.extension_name.clone(),
                    old_entry.extension_version.clone(),
                    old_entry.type_name.clone(),
                );
                self.to_rename.push((new_entry, old_entry.key().clone()));
            }
        }

        // 3. ADD/MODIFY/CHANGE COLUMN, classified by (was-custom, is-custom).
        for change in &alter.changes {
            let now_custom = change.custom.as_ref();
            match &change.old_name {
                Some(old_name) => {
                    let was_custom = is_custom(old_name);
                    match (was_custom, now_custom) {
                        (true, None) => {
                            self.to_remove.push(ColumnKey::new(db, table, old_name));
                        }
                        (false, Some(custom)) => {
                            self.to_add.push(ColumnEntry::new(
                                ColumnKey::new(db, table, change.new_name.clone()),
                                custom.extension_name.clone(),
                                custom.extension_version.clone(),
                                custom.type_name.clone(),
                            ));
                        }
                        (true, Some(custom)) => {
                            // custom -> custom is remove-then-insert; commit
                            // order applies the remove first.
                            self.to_remove.push(ColumnKey::new(db, table, old_name));
                            self.to_add.push(ColumnEntry::new(
                                ColumnKey::new(db, table, change.new_name.clone()),
                                custom.extension_name.clone(),
                                custom.extension_version.clone(),
                                custom.type_name.clone(),
                            ));
                        }
                        (false, None) => {}
                    }
                }
                None => {
                    if let Some(custom) = now_custom {
                        self.to_add.push(ColumnEntry::new(
                            ColumnKey::new(db, table, change.new_name.clone()),
                            custom.extension_name.clone(),
                            custom.extension_version.clone(),
                            custom.type_name.clone(),
                        ));
                    }
                }
            }
        }
    }

    // ===== Lock, validate, stage =====

    fn lock_and_apply(mut self, runtime: &ExtensionRuntime, session: &Session) -> Result<()> {
        if !self.has_entries() {
            return Ok(());
        }
        self.lock_extensions_shared(runtime, session)?;
        self.validate_entries(runtime)?;
        self.mark_victionary_modifications(runtime, session);
        Ok(())
    }

    /// Shared MDL on every distinct extension the statement references,
    /// with statement duration.
    fn lock_extensions_shared(
        &self,
        runtime: &ExtensionRuntime,
        session: &Session,
    ) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        let mut lock = |ext_name: &str| -> Result<()> {
            if ext_name.is_empty() {
                return Ok(());
            }
            let normalized = normalize_extension_name(ext_name);
            if !seen.insert(normalized.clone()) {
                return Ok(());
            }
            let ticket = runtime.mdl.acquire(
                MdlNamespace::Extension,
                &normalized,
                MdlType::Shared,
                session.lock_wait_timeout(),
            )?;
            session.hold_ticket(ticket);
            Ok(())
        };

        for entry in &self.to_add {
            lock(&entry.extension_name)?;
        }
        for (new_entry, _) in &self.to_rename {
            lock(&new_entry.extension_name)?;
        }
        for routine in &self.to_call {
            lock(&routine.extension_name)?;
        }
        Ok(())
    }

    /// Every referenced type must resolve to a committed descriptor whose
    /// extension name and version match; every referenced function must
    /// exist for its extension.
    fn validate_entries(&self, runtime: &ExtensionRuntime) -> Result<()> {
        let maps = runtime.victionary.read_guard();

        let validate_entry = |entry: &ColumnEntry| -> Result<()> {
            if entry.extension_name.is_empty() || entry.type_name.is_empty() {
                return Ok(());
            }
            let key = TypeDescriptorKey::new(
                entry.type_name.clone(),
                entry.extension_name.clone(),
                entry.extension_version.clone(),
            );
            let Some(descriptor) = maps.type_descriptors.get_committed(key.as_str()) else {
                return Err(Error::Validation(format!(
                    "Custom type '{}' from extension '{}' version '{}' not found",
                    entry.type_name, entry.extension_name, entry.extension_version
                )));
            };
            if !descriptor
                .extension_name()
                .eq_ignore_ascii_case(&entry.extension_name)
                || descriptor.extension_version() != entry.extension_version
            {
                return Err(Error::Validation(format!(
                    "Extension '{}' version '{}' is not found for custom type '{}'",
                    entry.extension_name, entry.extension_version, entry.type_name
                )));
            }
            Ok(())
        };

        for entry in &self.to_add {
            validate_entry(entry)?;
        }
        for (new_entry, _) in &self.to_rename {
            validate_entry(new_entry)?;
        }

        for routine in &self.to_call {
            let ext_key = ExtensionKey::new(routine.extension_name.clone());
            if maps.extensions.get_committed(ext_key.as_str()).is_none() {
                return Err(Error::Validation(format!(
                    "Extension '{}' not found for custom function '{}'",
                    routine.extension_name, routine.function_name
                )));
            }
            if runtime
                .vdfs
                .find_qualified(&routine.extension_name, &routine.function_name)
                .is_none()
            {
                return Err(Error::Validation(format!(
                    "Custom function '{}' not found in extension '{}'",
                    routine.function_name, routine.extension_name
                )));
            }
        }
        Ok(())
    }

    /// Stage into the columns map: removes, then renames, then inserts.
    fn mark_victionary_modifications(&mut self, runtime: &ExtensionRuntime, session: &Session) {
        let mut maps = runtime.victionary.write_guard();

        for key in self.to_remove.drain(..) {
            maps.columns.mark_for_deletion(session, &key);
        }
        for (new_entry, old_key) in self.to_rename.drain(..) {
            maps.columns.mark_for_update(session, new_entry, &old_key);
        }
        for entry in self.to_add.drain(..) {
            maps.columns.mark_for_insertion(session, entry);
        }
    }
}
