//! VEB archives on disk.
//!
//! A VEB is a tar archive packaging `manifest.json` and
//! `lib/<extension>.so`. Expansion is content-addressed: the SHA-256 of the
//! archive bytes selects the subdirectory under `_expanded/<name>/`, so
//! re-expanding the same archive is idempotent and partially-written
//! directories from failed installs are garbage-collected at the next
//! startup.

pub mod lifecycle;

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tar::{Archive, EntryType};

use crate::config::Config;
use crate::error::{Error, Result};

pub const EXPANDED_DIR: &str = "_expanded";
pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Deserialize)]
pub struct VebManifest {
    pub version: String,
}

/// Extension names: 1-64 characters, leading alphabetic, trailing
/// alphanumeric, body letters/digits/underscore/hyphen.
pub fn validate_extension_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation(
            "Extension name cannot be empty".to_string(),
        ));
    }
    if name.len() > 64 {
        return Err(Error::Validation(format!(
            "Extension name '{}' exceeds maximum length of 64 characters",
            name
        )));
    }
    let bytes = name.as_bytes();
    if !bytes[0].is_ascii_alphabetic() {
        return Err(Error::Validation(format!(
            "Extension name '{}' must start with a letter",
            name
        )));
    }
    if !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return Err(Error::Validation(format!(
            "Extension name '{}' must end with a letter or digit",
            name
        )));
    }
    for &c in bytes {
        if !c.is_ascii_alphanumeric() && c != b'_' && c != b'-' {
            return Err(Error::Validation(format!(
                "Extension name '{}' contains invalid character '{}' \
                 (only letters, digits, underscore, and hyphen allowed)",
                name, c as char
            )));
        }
    }
    Ok(())
}

/// Archive entries must use relative paths without parent components.
pub fn validate_relative_path(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::Validation(format!(
                    "archive entry '{}' is not a safe relative path",
                    path.display()
                )))
            }
        }
    }
    Ok(())
}

pub fn veb_archive_path(config: &Config, name: &str) -> PathBuf {
    config.veb_dir.join(format!("{}.veb", name))
}

pub fn expansion_root(config: &Config, name: &str) -> PathBuf {
    config.veb_dir.join(EXPANDED_DIR).join(name)
}

/// `_expanded/<name>/<sha256>/lib/<name>.<dll-ext>`
pub fn extension_so_path(config: &Config, name: &str, sha256: &str) -> PathBuf {
    expansion_root(config, name).join(sha256).join("lib").join(format!(
        "{}.{}",
        name,
        std::env::consts::DLL_EXTENSION
    ))
}

/// SHA-256 of a file's bytes as a 64-character lowercase hex string.
pub fn calculate_file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Read `manifest.json` out of `<name>.veb` and return its version string,
/// validated as strict SemVer.
pub fn load_veb_manifest(config: &Config, name: &str) -> Result<String> {
    let archive_path = veb_archive_path(config, name);
    if !archive_path.exists() {
        return Err(Error::Validation(format!(
            "Extension archive '{}' not found",
            archive_path.display()
        )));
    }

    let file = fs::File::open(&archive_path)?;
    let mut archive = Archive::new(file);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path().map_err(|e| Error::Parse(e.to_string()))?;
        if path.as_os_str() == MANIFEST_NAME {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            let manifest: VebManifest = serde_json::from_str(&contents)?;
            crate::semver::Semver::parse(&manifest.version).map_err(|e| {
                Error::Validation(format!(
                    "Extension '{}' manifest has invalid version '{}': {}",
                    name, manifest.version, e
                ))
            })?;
            return Ok(manifest.version);
        }
    }

    Err(Error::Validation(format!(
        "Extension archive '{}' has no {}",
        archive_path.display(),
        MANIFEST_NAME
    )))
}

/// Expand `<name>.veb` into its content-addressed directory, returning the
/// expanded path and the archive hash. A directory that already exists for
/// this hash is reused without re-extracting.
pub fn expand_veb_to_directory(config: &Config, name: &str) -> Result<(PathBuf, String)> {
    let archive_path = veb_archive_path(config, name);
    let sha256 = calculate_file_sha256(&archive_path)?;
    let dest = expansion_root(config, name).join(&sha256);

    if dest.exists() {
        tracing::debug!(extension = name, sha256 = %sha256, "expansion directory exists, reusing");
        return Ok((dest, sha256));
    }
    fs::create_dir_all(&dest)?;

    let file = fs::File::open(&archive_path)?;
    let mut archive = Archive::new(file);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        match entry_type {
            EntryType::Directory | EntryType::Regular => {}
            _ => {
                return Err(Error::Validation(
                    "VEB archives may not contain special entries".to_string(),
                ));
            }
        }
        let path = entry
            .path()
            .map_err(|e| Error::Parse(e.to_string()))?
            .into_owned();
        validate_relative_path(&path)?;

        let dest_path = dest.join(&path);
        if entry_type == EntryType::Directory {
            fs::create_dir_all(&dest_path)?;
        } else {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest_path)?;
        }
    }

    tracing::info!(extension = name, sha256 = %sha256, "expanded VEB archive");
    Ok((dest, sha256))
}

/// Remove every `_expanded/<name>/<sha>` directory whose hash is not the
/// currently-installed one, and every `_expanded/<name>` for extensions no
/// longer installed. `installed` maps extension name to its current hash.
pub fn cleanup_orphaned_expansions(config: &Config, installed: &HashMap<String, String>) {
    let expanded = config.veb_dir.join(EXPANDED_DIR);
    let Ok(entries) = fs::read_dir(&expanded) else {
        return;
    };
    for entry in entries.flatten() {
        let ext_dir = entry.path();
        if !ext_dir.is_dir() {
            continue;
        }
        let ext_name = entry.file_name().to_string_lossy().into_owned();
        match installed.get(&ext_name) {
            None => {
                tracing::info!(extension = %ext_name, "removing expansion for uninstalled extension");
                let _ = fs::remove_dir_all(&ext_dir);
            }
            Some(current_sha) => {
                let Ok(hash_dirs) = fs::read_dir(&ext_dir) else {
                    continue;
                };
                for hash_entry in hash_dirs.flatten() {
                    let hash_name = hash_entry.file_name().to_string_lossy().into_owned();
                    if &hash_name != current_sha {
                        tracing::info!(
                            extension = %ext_name,
                            sha256 = %hash_name,
                            "removing orphaned expansion directory"
                        );
                        let _ = fs::remove_dir_all(hash_entry.path());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_name_rules() {
        assert!(validate_extension_name("complex").is_ok());
        assert!(validate_extension_name("my_ext-2").is_ok());
        assert!(validate_extension_name("A1").is_ok());
        assert!(validate_extension_name("x").is_ok());

        assert!(validate_extension_name("").is_err());
        assert!(validate_extension_name("1complex").is_err());
        assert!(validate_extension_name("complex_").is_err());
        assert!(validate_extension_name("com plex").is_err());
        assert!(validate_extension_name("com.plex").is_err());
        assert!(validate_extension_name(&"a".repeat(65)).is_err());
        assert!(validate_extension_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_relative_path_validation() {
        assert!(validate_relative_path(Path::new("lib/ext.so")).is_ok());
        assert!(validate_relative_path(Path::new("manifest.json")).is_ok());
        assert!(validate_relative_path(Path::new("./lib/ext.so")).is_ok());
        assert!(validate_relative_path(Path::new("/etc/passwd")).is_err());
        assert!(validate_relative_path(Path::new("../escape")).is_err());
        assert!(validate_relative_path(Path::new("lib/../../escape")).is_err());
    }
}
