//! Extension install, uninstall, and startup load.
//!
//! Install and uninstall are DDL-like: binlog suppressed, global shared
//! read lock and backup lock first, then the exclusive per-extension
//! metadata lock that serializes them against concurrent DDL referencing
//! the extension. All registry changes are staged through the Victionary
//! and become visible at the single commit point; the shared object is
//! unloaded only after a committed uninstall.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ddl::MetadataModifier;
use crate::error::{Error, Result};
use crate::mdl::{MdlNamespace, MdlType};
use crate::runtime::ExtensionRuntime;
use crate::session::Session;
use crate::vdf::VdfRegistry;
use crate::veb;
use crate::vef::library::LoadedExtension;
use crate::victionary::descriptors::{
    implementation_type_for, ExtensionDescriptor, TypeDescriptor,
};
use crate::victionary::entries::ExtensionEntry;
use crate::victionary::keys::{
    normalize_extension_name, ExtensionDescriptorKey, ExtensionKey, TypeDescriptorKey,
    VictionaryKey,
};
use crate::victionary::map::VictionaryEntry;
use crate::victionary::Maps;

fn stage_type_descriptors(
    maps: &mut Maps,
    session: &Session,
    extension_name: &str,
    extension_version: &str,
    loaded: &LoadedExtension,
) {
    for type_desc in &loaded.registration().types {
        let key = TypeDescriptorKey::new(
            type_desc.name.clone(),
            extension_name.to_string(),
            extension_version.to_string(),
        );
        let descriptor = TypeDescriptor::new(
            key,
            implementation_type_for(type_desc.persisted_length),
            type_desc.persisted_length,
            type_desc.max_decode_buffer_length,
            type_desc.encode,
            type_desc.decode,
            type_desc.compare,
            type_desc.hash,
        );
        maps.type_descriptors.mark_for_insertion(session, descriptor);
    }
}

fn register_vdfs(
    vdfs: &VdfRegistry,
    extension_name: &str,
    loaded: &LoadedExtension,
) -> Result<()> {
    for func in &loaded.registration().funcs {
        if let Err(e) = vdfs.register(extension_name, func.clone(), loaded.protocol()) {
            // Back out the functions registered so far; the UDF registry is
            // not transactional.
            vdfs.unregister_extension(extension_name);
            return Err(e);
        }
    }
    Ok(())
}

impl ExtensionRuntime {
    /// `INSTALL EXTENSION <name>`.
    pub fn install_extension(&self, session: &Session, name: &str) -> Result<()> {
        // The statement is not replicated; the system tables are not either.
        let _binlog = session.suppress_binlog();
        tracing::info!(extension = name, "installing extension");

        let result = self.install_extension_impl(session, name);
        match result {
            Ok(version) => {
                let committed = self.end_transaction(session, false);
                session.release_statement_locks();
                committed?;
                tracing::info!(
                    extension = name,
                    version = %version,
                    "extension installed successfully"
                );
                Ok(())
            }
            Err(e) => {
                let _ = self.end_transaction(session, true);
                session.release_statement_locks();
                Err(e)
            }
        }
    }

    fn install_extension_impl(&self, session: &Session, name: &str) -> Result<String> {
        veb::validate_extension_name(name)?;

        // Global shared read lock, then backup lock, then the exclusive
        // per-extension lock. This order is the deadlock-safety contract.
        session.hold_ticket(self.mdl.acquire(
            MdlNamespace::GlobalRead,
            "",
            MdlType::Shared,
            session.lock_wait_timeout(),
        )?);
        session.hold_ticket(self.mdl.acquire(
            MdlNamespace::Backup,
            "",
            MdlType::Shared,
            session.lock_wait_timeout(),
        )?);
        MetadataModifier::lock_extension_exclusive(self, session, name)?;

        let version = veb::load_veb_manifest(&self.config, name)?;

        // Fail fast on duplicates from the in-memory cache; the
        // authoritative re-check happens under the write guard below.
        {
            let maps = self.victionary.read_guard();
            let key = ExtensionKey::new(name);
            if maps.extensions.get_committed(key.as_str()).is_some() {
                return Err(Error::Validation(format!(
                    "Extension '{}' is already installed",
                    name
                )));
            }
        }

        let (_expanded_path, sha256) = veb::expand_veb_to_directory(&self.config, name)?;
        let so_path = veb::extension_so_path(&self.config, name, &sha256);
        if !so_path.exists() {
            return Err(Error::Validation(format!(
                "Extension archive '{}' does not contain {}",
                name,
                so_path.display()
            )));
        }

        let loaded = Arc::new(LoadedExtension::load(&so_path)?);
        let registration = loaded.registration();
        if !registration.extension_name.eq_ignore_ascii_case(name) {
            return Err(Error::Abi(format!(
                "Extension '{}' registered under mismatched name '{}'",
                name, registration.extension_name
            )));
        }
        if registration.extension_version != version {
            return Err(Error::Validation(format!(
                "Extension '{}' manifest version '{}' does not match registered version '{}'",
                name, version, registration.extension_version
            )));
        }

        self.install_loaded(session, name, &version, &sha256, loaded)?;
        Ok(version)
    }

    /// Register a loaded extension's objects and stage its registry entry.
    /// The disk half of install ends here; startup load and tests drive
    /// this directly with an already-loaded registration.
    pub fn install_loaded(
        &self,
        session: &Session,
        name: &str,
        version: &str,
        sha256: &str,
        loaded: Arc<LoadedExtension>,
    ) -> Result<()> {
        {
            let mut maps = self.victionary.write_guard();
            stage_type_descriptors(&mut maps, session, name, version, &loaded);
            maps.extension_descriptors.mark_for_insertion(
                session,
                ExtensionDescriptor::new(
                    ExtensionDescriptorKey::new(name, version),
                    loaded.clone(),
                ),
            );
        }

        register_vdfs(&self.vdfs, name, &loaded)?;

        // Authoritative duplicate check under the write guard, then stage
        // the extensions row.
        let marked = {
            let mut maps = self.victionary.write_guard();
            let key = ExtensionKey::new(name);
            if maps.extensions.get_committed(key.as_str()).is_some() {
                false
            } else {
                maps.extensions.mark_for_insertion(
                    session,
                    ExtensionEntry::new(key, version.to_string(), sha256.to_string()),
                );
                true
            }
        };
        if !marked {
            self.vdfs.unregister_extension(name);
            return Err(Error::Validation(format!(
                "Extension '{}' is already installed",
                name
            )));
        }

        // Push the row into the extensions table inside the transaction.
        let write_result = {
            let mut store = self.store.lock();
            self.victionary
                .write_all_uncommitted_entries(session, &mut store)
        };
        if let Err(e) = write_result {
            self.vdfs.unregister_extension(name);
            return Err(Error::Resource(format!(
                "Failed to write extension '{}' to table: {}",
                name, e
            )));
        }
        Ok(())
    }

    /// `UNINSTALL EXTENSION <name>`.
    pub fn uninstall_extension(&self, session: &Session, name: &str) -> Result<()> {
        let _binlog = session.suppress_binlog();

        let locks = (|| -> Result<()> {
            session.hold_ticket(self.mdl.acquire(
                MdlNamespace::GlobalRead,
                "",
                MdlType::Shared,
                session.lock_wait_timeout(),
            )?);
            session.hold_ticket(self.mdl.acquire(
                MdlNamespace::Backup,
                "",
                MdlType::Shared,
                session.lock_wait_timeout(),
            )?);
            MetadataModifier::lock_extension_exclusive(self, session, name)
        })();
        if let Err(e) = locks {
            session.release_statement_locks();
            return Err(e);
        }

        tracing::info!(extension = name, "uninstalling extension");

        let mut to_unregister: Option<Arc<LoadedExtension>> = None;
        let result = self.uninstall_extension_impl(session, name, &mut to_unregister);
        match result {
            Ok(()) => {
                let committed = self.end_transaction(session, false);
                session.release_statement_locks();
                committed?;
                // Only after the commit succeeded is it safe to drop the
                // function pointers and close the shared object.
                if let Some(loaded) = to_unregister {
                    self.vdfs.unregister_extension(name);
                    drop(loaded);
                }
                tracing::info!(extension = name, "extension uninstalled successfully");
                Ok(())
            }
            Err(e) => {
                let _ = self.end_transaction(session, true);
                session.release_statement_locks();
                Err(e)
            }
        }
    }

    fn uninstall_extension_impl(
        &self,
        session: &Session,
        name: &str,
        to_unregister: &mut Option<Arc<LoadedExtension>>,
    ) -> Result<()> {
        let normalized = normalize_extension_name(name);
        let mut maps = self.victionary.write_guard();

        let ext_key = ExtensionKey::new(name);
        let Some(ext_entry) = maps.extensions.get_committed(ext_key.as_str()) else {
            return Err(Error::Validation(format!(
                "Extension '{}' is not installed",
                name
            )));
        };
        let version = ext_entry.extension_version.clone();

        // RESTRICT semantics: any column still referencing this extension at
        // its installed version blocks the uninstall.
        let mut dependent_count = 0usize;
        let mut first_column = None;
        for col in maps.columns.get_all_committed() {
            if normalize_extension_name(&col.extension_name) == normalized
                && col.extension_version == version
            {
                if first_column.is_none() {
                    first_column = Some((
                        col.db_name().to_string(),
                        col.table_name().to_string(),
                        col.column_name().to_string(),
                        col.type_name.clone(),
                    ));
                }
                dependent_count += 1;
            }
        }
        if let Some((db, table, column, type_name)) = first_column {
            return Err(Error::Validation(format!(
                "Cannot drop extension `{}` as {} column(s) depend on it, e.g. {}.{}.{} has type {}",
                name, dependent_count, db, table, column, type_name
            )));
        }

        // In-use checks: a strong count above 1 means someone outside the
        // Victionary still holds the handle.
        let mut context_keys = Vec::new();
        for tc in maps.type_contexts.get_all_committed() {
            if normalize_extension_name(tc.extension_name()) == normalized
                && tc.extension_version() == version
            {
                if maps.type_contexts.get_use_count(tc.key().as_str()) > 1 {
                    return Err(Error::Validation(format!(
                        "Cannot uninstall extension '{}': type '{}' is currently in use",
                        name,
                        tc.type_name()
                    )));
                }
                context_keys.push(tc.key().clone());
            }
        }
        let mut descriptor_keys = Vec::new();
        for td in maps.type_descriptors.get_all_committed() {
            if normalize_extension_name(td.extension_name()) == normalized
                && td.extension_version() == version
            {
                if maps.type_descriptors.get_use_count(td.key().as_str()) > 1 {
                    return Err(Error::Validation(format!(
                        "Cannot uninstall extension '{}': type '{}' is currently in use",
                        name,
                        td.type_name()
                    )));
                }
                descriptor_keys.push(td.key().clone());
            }
        }

        // Stage deletions: contexts, then descriptors, then the extensions
        // row, then the live registration handle.
        for key in &context_keys {
            maps.type_contexts.mark_for_deletion(session, key);
        }
        for key in &descriptor_keys {
            maps.type_descriptors.mark_for_deletion(session, key);
        }
        maps.extensions.mark_for_deletion(session, &ext_key);

        let desc_key = ExtensionDescriptorKey::new(name, version);
        if let Some(desc) = maps
            .extension_descriptors
            .get_committed(desc_key.as_str())
        {
            *to_unregister = Some(desc.registration().clone());
        }
        maps.extension_descriptors.mark_for_deletion(session, &desc_key);
        drop(maps);

        // Push the row delete inside the transaction.
        let mut store = self.store.lock();
        self.victionary
            .write_all_uncommitted_entries(session, &mut store)
            .map_err(|e| {
                Error::Resource(format!("Failed to delete extension '{}': {}", name, e))
            })
    }

    /// Server startup: for every committed extensions row, validate the
    /// archive, re-expand, reload the shared object, and re-register its
    /// types and functions. Runs no SQL. Afterwards, garbage-collect
    /// expansion directories for hashes that are no longer installed.
    pub fn load_installed_extensions(&self, session: &Session) -> Result<()> {
        let entries: Vec<(String, String, String)> = {
            let maps = self.victionary.read_guard();
            maps.extensions
                .get_all_committed()
                .iter()
                .map(|e| {
                    (
                        e.extension_name().to_string(),
                        e.extension_version.clone(),
                        e.veb_sha256.clone(),
                    )
                })
                .collect()
        };

        let mut installed = HashMap::new();
        let result = (|| -> Result<()> {
            for (name, version, stored_sha) in &entries {
                let archive = veb::veb_archive_path(&self.config, name);
                if !archive.exists() {
                    return Err(Error::Validation(format!(
                        "Archive '{}' for installed extension '{}' is missing",
                        archive.display(),
                        name
                    )));
                }
                let manifest_version = veb::load_veb_manifest(&self.config, name)?;
                if &manifest_version != version {
                    return Err(Error::Validation(format!(
                        "Extension '{}' manifest version '{}' does not match installed version '{}'",
                        name, manifest_version, version
                    )));
                }

                let (_path, sha256) = veb::expand_veb_to_directory(&self.config, name)?;
                if &sha256 != stored_sha {
                    // Warn and proceed: the archive was replaced in place
                    // since the install was recorded.
                    tracing::warn!(
                        extension = %name,
                        stored = %stored_sha,
                        computed = %sha256,
                        "archive hash differs from installed hash"
                    );
                }

                let so_path = veb::extension_so_path(&self.config, name, &sha256);
                let loaded = Arc::new(LoadedExtension::load(&so_path)?);

                {
                    let mut maps = self.victionary.write_guard();
                    stage_type_descriptors(&mut maps, session, name, version, &loaded);
                    maps.extension_descriptors.mark_for_insertion(
                        session,
                        ExtensionDescriptor::new(
                            ExtensionDescriptorKey::new(name.clone(), version.clone()),
                            loaded.clone(),
                        ),
                    );
                }
                register_vdfs(&self.vdfs, name, &loaded)?;

                tracing::info!(extension = %name, version = %version, "reloaded installed extension");
                installed.insert(name.clone(), sha256);
            }
            Ok(())
        })();

        if let Err(e) = result {
            self.victionary.rollback_all(session);
            return Err(e);
        }
        self.victionary.commit_all(session);
        veb::cleanup_orphaned_expansions(&self.config, &installed);
        Ok(())
    }
}
