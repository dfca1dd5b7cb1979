//! The extension subsystem bundle.
//!
//! Owns the Victionary, the backing system-table store, the metadata lock
//! manager, and the VDF registry, the same way the host database owns its
//! registries. Lifecycle operations (install, uninstall, startup load) are
//! implemented in `veb::lifecycle` as methods on this type.

use std::fs;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Result;
use crate::mdl::MdlManager;
use crate::session::Session;
use crate::vdf::VdfRegistry;
use crate::victionary::store::SystemTableStore;
use crate::victionary::Victionary;

pub struct ExtensionRuntime {
    pub config: Config,
    pub victionary: Victionary,
    pub store: Mutex<SystemTableStore>,
    pub mdl: MdlManager,
    pub vdfs: VdfRegistry,
}

impl ExtensionRuntime {
    pub fn open(config: Config) -> Result<ExtensionRuntime> {
        fs::create_dir_all(&config.veb_dir)?;
        let store = SystemTableStore::open(&config.data_dir)?;
        Ok(ExtensionRuntime {
            config,
            victionary: Victionary::new(),
            store: Mutex::new(store),
            mdl: MdlManager::new(),
            vdfs: VdfRegistry::new(),
        })
    }

    /// Server startup: load the persistent maps, then re-load every
    /// installed extension from its archive.
    pub fn startup(&self, session: &mut Session) -> Result<()> {
        {
            let store = self.store.lock();
            self.victionary.init(session, &store)?;
        }
        self.load_installed_extensions(session)
    }

    /// Finish the host transaction: flush row writes and promote staged ops
    /// on success, or discard both on failure. This is the single point at
    /// which staged state becomes externally visible.
    pub fn end_transaction(&self, session: &Session, failed: bool) -> Result<()> {
        let mut store = self.store.lock();
        if failed {
            store.discard()?;
            self.victionary.rollback_all(session);
        } else {
            store.flush()?;
            self.victionary.commit_all(session);
        }
        Ok(())
    }
}
