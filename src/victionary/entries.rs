//! Table-backed entry kinds: properties, custom columns, extensions.

use crate::error::Result;
use crate::victionary::keys::{ColumnKey, ExtensionKey, PropertyKey};
use crate::victionary::map::{TableBacked, VictionaryEntry};
use crate::victionary::store::SystemRow;

fn non_null(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

// ===== Property =====

/// Row in `villagesql.properties`. Properties are write-once during
/// bootstrap; update and delete are intentionally unimplemented.
#[derive(Debug, Clone, Default)]
pub struct PropertyEntry {
    key: PropertyKey,
    pub value: String,
    pub description: String,
}

impl PropertyEntry {
    pub fn new(key: PropertyKey, value: impl Into<String>, description: impl Into<String>) -> Self {
        PropertyEntry {
            key,
            value: value.into(),
            description: description.into(),
        }
    }

    pub fn name(&self) -> &str {
        self.key.name()
    }
}

impl VictionaryEntry for PropertyEntry {
    type Key = PropertyKey;

    fn key(&self) -> &PropertyKey {
        &self.key
    }
}

impl TableBacked for PropertyEntry {
    const MUTABLE: bool = false;

    fn from_row(row: &SystemRow) -> Result<PropertyEntry> {
        let name = row.require(0, "name")?;
        Ok(PropertyEntry {
            key: PropertyKey::new(name),
            value: row.get_or_empty(1),
            description: row.get_or_empty(2),
        })
    }

    fn to_row(&self) -> SystemRow {
        SystemRow(vec![
            Some(self.key.name().to_string()),
            non_null(&self.value),
            non_null(&self.description),
        ])
    }
}

// ===== Column =====

/// Row in `villagesql.custom_columns`: a column in a user table that uses a
/// custom type.
#[derive(Debug, Clone, Default)]
pub struct ColumnEntry {
    key: ColumnKey,
    pub extension_name: String,
    pub extension_version: String,
    pub type_name: String,
}

impl ColumnEntry {
    pub fn new(
        key: ColumnKey,
        extension_name: impl Into<String>,
        extension_version: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        ColumnEntry {
            key,
            extension_name: extension_name.into(),
            extension_version: extension_version.into(),
            type_name: type_name.into(),
        }
    }

    pub fn db_name(&self) -> &str {
        self.key.db()
    }

    pub fn table_name(&self) -> &str {
        self.key.table()
    }

    pub fn column_name(&self) -> &str {
        self.key.column()
    }
}

impl VictionaryEntry for ColumnEntry {
    type Key = ColumnKey;

    fn key(&self) -> &ColumnKey {
        &self.key
    }
}

impl TableBacked for ColumnEntry {
    fn from_row(row: &SystemRow) -> Result<ColumnEntry> {
        let db = row.require(0, "db_name")?;
        let table = row.require(1, "table_name")?;
        let column = row.require(2, "column_name")?;
        let key = ColumnKey::new(db, table, column);
        Ok(ColumnEntry {
            key,
            extension_name: row.require(3, "extension_name")?.to_string(),
            extension_version: row.require(4, "extension_version")?.to_string(),
            type_name: row.require(5, "type_name")?.to_string(),
        })
        // Type parameter columns will be appended here when they exist;
        // older rows without them must keep loading.
    }

    fn to_row(&self) -> SystemRow {
        SystemRow(vec![
            Some(self.key.db().to_string()),
            Some(self.key.table().to_string()),
            Some(self.key.column().to_string()),
            Some(self.extension_name.clone()),
            Some(self.extension_version.clone()),
            Some(self.type_name.clone()),
        ])
    }
}

// ===== Extension =====

/// Row in `villagesql.extensions`: one installed extension.
#[derive(Debug, Clone, Default)]
pub struct ExtensionEntry {
    key: ExtensionKey,
    pub extension_version: String,
    /// Content hash of the archive that produced the currently-loaded
    /// shared object.
    pub veb_sha256: String,
}

impl ExtensionEntry {
    pub fn new(
        key: ExtensionKey,
        extension_version: impl Into<String>,
        veb_sha256: impl Into<String>,
    ) -> Self {
        ExtensionEntry {
            key,
            extension_version: extension_version.into(),
            veb_sha256: veb_sha256.into(),
        }
    }

    pub fn extension_name(&self) -> &str {
        self.key.extension_name()
    }
}

impl VictionaryEntry for ExtensionEntry {
    type Key = ExtensionKey;

    fn key(&self) -> &ExtensionKey {
        &self.key
    }
}

impl TableBacked for ExtensionEntry {
    fn from_row(row: &SystemRow) -> Result<ExtensionEntry> {
        let name = row.require(0, "extension_name")?;
        Ok(ExtensionEntry {
            key: ExtensionKey::new(name),
            extension_version: row.require(1, "extension_version")?.to_string(),
            veb_sha256: row.require(2, "veb_sha256")?.to_string(),
        })
    }

    fn to_row(&self) -> SystemRow {
        SystemRow(vec![
            Some(self.key.extension_name().to_string()),
            Some(self.extension_version.clone()),
            Some(self.veb_sha256.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::victionary::keys::VictionaryKey;

    #[test]
    fn test_column_entry_row_roundtrip() {
        let entry = ColumnEntry::new(
            ColumnKey::new("db", "t", "x"),
            "complex_ext",
            "1.0.0",
            "complex",
        );
        let row = entry.to_row();
        let back = ColumnEntry::from_row(&row).unwrap();
        assert_eq!(back.key().as_str(), entry.key().as_str());
        assert_eq!(back.extension_name, "complex_ext");
        assert_eq!(back.extension_version, "1.0.0");
        assert_eq!(back.type_name, "complex");
    }

    #[test]
    fn test_property_nullable_columns() {
        let row = SystemRow(vec![Some("schema_version".to_string()), None, None]);
        let entry = PropertyEntry::from_row(&row).unwrap();
        assert_eq!(entry.value, "");
        assert_eq!(entry.description, "");

        // Empty strings write back as SQL NULL.
        let out = entry.to_row();
        assert_eq!(out.0[1], None);
        assert_eq!(out.0[2], None);
    }

    #[test]
    fn test_extension_entry_missing_column_is_error() {
        let row = SystemRow(vec![Some("complex".to_string()), None, Some("sha".into())]);
        assert!(ExtensionEntry::from_row(&row).is_err());
    }
}
