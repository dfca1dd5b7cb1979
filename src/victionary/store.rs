//! File-backed system tables.
//!
//! Stand-in for the host storage engine at the boundary the Victionary
//! needs: full scan, insert, probe-and-update, probe-and-delete. Each table
//! persists as a bincode file with a checksum header; `flush` writes every
//! table and `discard` re-reads them, which is how the transaction stand-in
//! maps commit and rollback onto the store.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bincode::{Decode, Encode};

use crate::error::{Error, Result};

pub const PROPERTIES_TABLE: &str = "properties";
pub const CUSTOM_COLUMNS_TABLE: &str = "custom_columns";
pub const EXTENSIONS_TABLE: &str = "extensions";

/// One row: the column values in table order. `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SystemRow(pub Vec<Option<String>>);

impl SystemRow {
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).and_then(|v| v.as_deref())
    }

    /// Read a non-null column, as an Integrity error if null or missing.
    pub fn require(&self, idx: usize, column: &str) -> Result<&str> {
        self.get(idx)
            .ok_or_else(|| Error::Integrity(format!("column '{}' missing from row", column)))
    }

    /// Nullable columns map to empty strings on read.
    pub fn get_or_empty(&self, idx: usize) -> String {
        self.get(idx).unwrap_or("").to_string()
    }
}

#[derive(Debug, Clone, Encode, Decode)]
struct TableHeader {
    version: u32,
    num_rows: u32,
    checksum: u64,
}

fn compute_checksum(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |acc, &byte| {
        acc.wrapping_mul(31).wrapping_add(byte as u64)
    })
}

pub struct SystemTable {
    name: String,
    file_path: PathBuf,
    rows: Vec<SystemRow>,
}

impl SystemTable {
    fn open(name: &str, dir: &Path) -> Result<SystemTable> {
        let file_path = dir.join(format!("{}.tbl", name));
        let mut table = SystemTable {
            name: name.to_string(),
            file_path,
            rows: Vec::new(),
        };
        table.reload()?;
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> &[SystemRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn insert(&mut self, row: SystemRow) {
        self.rows.push(row);
    }

    pub fn position<F: Fn(&SystemRow) -> bool>(&self, pred: F) -> Option<usize> {
        self.rows.iter().position(|r| pred(r))
    }

    pub fn update_at(&mut self, idx: usize, row: SystemRow) {
        self.rows[idx] = row;
    }

    pub fn remove_at(&mut self, idx: usize) {
        self.rows.remove(idx);
    }

    fn flush(&self) -> Result<()> {
        let config = bincode::config::standard();
        let mut row_bytes = Vec::new();
        for row in &self.rows {
            let encoded = bincode::encode_to_vec(row, config)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            row_bytes.extend_from_slice(&encoded);
        }

        let header = TableHeader {
            version: 1,
            num_rows: self.rows.len() as u32,
            checksum: compute_checksum(&row_bytes),
        };
        let mut out = bincode::encode_to_vec(&header, config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        out.extend_from_slice(&row_bytes);
        fs::write(&self.file_path, out)?;
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        self.rows.clear();
        if !self.file_path.exists() {
            return Ok(());
        }
        let data = fs::read(&self.file_path)?;
        let config = bincode::config::standard();
        let (header, header_len): (TableHeader, usize) =
            bincode::decode_from_slice(&data, config)
                .map_err(|e| Error::Integrity(format!("corrupt table {}: {}", self.name, e)))?;

        let row_bytes = &data[header_len..];
        let expected = compute_checksum(row_bytes);
        if header.checksum != expected {
            return Err(Error::Integrity(format!(
                "table {} checksum mismatch: expected {}, got {}",
                self.name, expected, header.checksum
            )));
        }

        let mut offset = 0;
        for _ in 0..header.num_rows {
            let (row, read): (SystemRow, usize) =
                bincode::decode_from_slice(&row_bytes[offset..], config)
                    .map_err(|e| Error::Integrity(format!("corrupt row in {}: {}", self.name, e)))?;
            self.rows.push(row);
            offset += read;
        }
        Ok(())
    }
}

/// The directory of extension system tables.
pub struct SystemTableStore {
    dir: PathBuf,
    tables: BTreeMap<String, SystemTable>,
}

impl SystemTableStore {
    /// Open (creating files lazily) the three extension system tables under
    /// `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<SystemTableStore> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut tables = BTreeMap::new();
        for name in [PROPERTIES_TABLE, EXTENSIONS_TABLE, CUSTOM_COLUMNS_TABLE] {
            tables.insert(name.to_string(), SystemTable::open(name, &dir)?);
        }
        Ok(SystemTableStore { dir, tables })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table(&self, name: &str) -> Result<&SystemTable> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::Integrity(format!("unknown system table '{}'", name)))
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut SystemTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::Integrity(format!("unknown system table '{}'", name)))
    }

    /// Persist every table. The transaction stand-in's commit point.
    pub fn flush(&self) -> Result<()> {
        for table in self.tables.values() {
            table.flush()?;
        }
        Ok(())
    }

    /// Re-read every table from disk, discarding unflushed writes. The
    /// transaction stand-in's rollback.
    pub fn discard(&mut self) -> Result<()> {
        for table in self.tables.values_mut() {
            table.reload()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(values: &[Option<&str>]) -> SystemRow {
        SystemRow(values.iter().map(|v| v.map(|s| s.to_string())).collect())
    }

    #[test]
    fn test_flush_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut store = SystemTableStore::open(dir.path()).unwrap();
        let table = store.table_mut(EXTENSIONS_TABLE).unwrap();
        table.insert(row(&[Some("complex"), Some("1.0.0"), Some("abc123")]));
        table.insert(row(&[Some("bytes"), Some("2.0.0"), None]));
        store.flush().unwrap();

        let reopened = SystemTableStore::open(dir.path()).unwrap();
        let table = reopened.table(EXTENSIONS_TABLE).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0].get(0), Some("complex"));
        assert_eq!(table.rows()[1].get(2), None);
    }

    #[test]
    fn test_discard_drops_unflushed_writes() {
        let dir = TempDir::new().unwrap();
        let mut store = SystemTableStore::open(dir.path()).unwrap();
        store
            .table_mut(EXTENSIONS_TABLE)
            .unwrap()
            .insert(row(&[Some("a"), Some("1.0.0"), Some("x")]));
        store.flush().unwrap();

        store
            .table_mut(EXTENSIONS_TABLE)
            .unwrap()
            .insert(row(&[Some("b"), Some("1.0.0"), Some("y")]));
        assert_eq!(store.table(EXTENSIONS_TABLE).unwrap().len(), 2);
        store.discard().unwrap();
        assert_eq!(store.table(EXTENSIONS_TABLE).unwrap().len(), 1);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let mut store = SystemTableStore::open(dir.path()).unwrap();
        store
            .table_mut(EXTENSIONS_TABLE)
            .unwrap()
            .insert(row(&[Some("a"), Some("1.0.0"), Some("x")]));
        store.flush().unwrap();

        // Corrupt a byte past the header.
        let path = dir.path().join("extensions.tbl");
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        assert!(SystemTableStore::open(dir.path()).is_err());
    }
}
