use std::path::{Path, PathBuf};

/// Version of the extension schema, exposed to clients as a read-only
/// session variable by the host server.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Name of the schema holding the extension system tables.
pub const SCHEMA_NAME: &str = "villagesql";

/// Subsystem configuration.
///
/// `veb_dir` is the one user-configurable path (`--veb-dir`): the root
/// directory holding `<name>.veb` archives and their `_expanded/` tree.
/// `data_dir` is where the host stores the backing system tables; it is
/// owned by server bootstrap, not by this subsystem.
#[derive(Debug, Clone)]
pub struct Config {
    pub veb_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn new(veb_dir: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> Self {
        Config {
            veb_dir: veb_dir.as_ref().to_path_buf(),
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }
}
