//! Identifier normalization and the strongly-typed keys used by every
//! Victionary map.
//!
//! Each key carries its original component strings for display plus the
//! normalized dotted form used for map ordering and lookups. Normalization
//! is applied exactly once, at key construction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};

/// How database and table identifiers are cased, paralleling the host's
/// table-name-casing mode. Column, extension, type, and property names are
/// always compared case-insensitively regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierCasing {
    Sensitive,
    StoreLower,
    CompareLower,
}

static IDENTIFIER_CASING: AtomicU8 = AtomicU8::new(0);

pub fn set_identifier_casing(mode: IdentifierCasing) {
    let v = match mode {
        IdentifierCasing::Sensitive => 0,
        IdentifierCasing::StoreLower => 1,
        IdentifierCasing::CompareLower => 2,
    };
    IDENTIFIER_CASING.store(v, Ordering::SeqCst);
}

pub fn identifier_casing() -> IdentifierCasing {
    match IDENTIFIER_CASING.load(Ordering::SeqCst) {
        1 => IdentifierCasing::StoreLower,
        2 => IdentifierCasing::CompareLower,
        _ => IdentifierCasing::Sensitive,
    }
}

pub fn normalize_database_name(name: &str) -> String {
    if identifier_casing() == IdentifierCasing::Sensitive {
        return name.to_string();
    }
    name.to_lowercase()
}

pub fn normalize_table_name(name: &str) -> String {
    if identifier_casing() == IdentifierCasing::Sensitive {
        return name.to_string();
    }
    name.to_lowercase()
}

pub fn normalize_column_name(name: &str) -> String {
    name.to_lowercase()
}

pub fn normalize_extension_name(name: &str) -> String {
    name.to_lowercase()
}

pub fn normalize_type_name(name: &str) -> String {
    name.to_lowercase()
}

pub fn normalize_property_name(name: &str) -> String {
    name.to_lowercase()
}

/// Implemented by every key and prefix type: exposes the normalized string
/// used for map ordering.
pub trait VictionaryKey {
    fn as_str(&self) -> &str;
}

// ===== Property =====

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyKey {
    name: String,
    normalized: String,
}

impl PropertyKey {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let normalized = normalize_property_name(&name);
        PropertyKey { name, normalized }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl VictionaryKey for PropertyKey {
    fn as_str(&self) -> &str {
        &self.normalized
    }
}

// ===== Column =====

/// Key for custom column entries: `norm_db.norm_table.norm_column`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnKey {
    db: String,
    table: String,
    column: String,
    normalized: String,
}

impl ColumnKey {
    pub fn new(
        db: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        let db = db.into();
        let table = table.into();
        let column = column.into();
        let normalized = format!(
            "{}.{}.{}",
            normalize_database_name(&db),
            normalize_table_name(&table),
            normalize_column_name(&column)
        );
        ColumnKey {
            db,
            table,
            column,
            normalized,
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn column(&self) -> &str {
        &self.column
    }
}

impl VictionaryKey for ColumnKey {
    fn as_str(&self) -> &str {
        &self.normalized
    }
}

/// Prefix for all custom columns of one table (`db.table.`) or one database
/// (`db.` when the table name is empty).
#[derive(Debug, Clone)]
pub struct ColumnKeyPrefix {
    normalized: String,
}

impl ColumnKeyPrefix {
    pub fn new(db: &str, table: &str) -> Self {
        let normalized = if table.is_empty() {
            format!("{}.", normalize_database_name(db))
        } else {
            format!(
                "{}.{}.",
                normalize_database_name(db),
                normalize_table_name(table)
            )
        };
        ColumnKeyPrefix { normalized }
    }
}

impl VictionaryKey for ColumnKeyPrefix {
    fn as_str(&self) -> &str {
        &self.normalized
    }
}

// ===== Extension =====

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionKey {
    extension_name: String,
    normalized: String,
}

impl ExtensionKey {
    pub fn new(name: impl Into<String>) -> Self {
        let extension_name = name.into();
        let normalized = normalize_extension_name(&extension_name);
        ExtensionKey {
            extension_name,
            normalized,
        }
    }

    pub fn extension_name(&self) -> &str {
        &self.extension_name
    }
}

impl VictionaryKey for ExtensionKey {
    fn as_str(&self) -> &str {
        &self.normalized
    }
}

// ===== TypeDescriptor =====

/// Key for type descriptors: `norm_type.norm_ext.norm_version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeDescriptorKey {
    type_name: String,
    extension_name: String,
    extension_version: String,
    normalized: String,
}

impl TypeDescriptorKey {
    pub fn new(
        type_name: impl Into<String>,
        extension_name: impl Into<String>,
        extension_version: impl Into<String>,
    ) -> Self {
        let type_name = type_name.into();
        let extension_name = extension_name.into();
        let extension_version = extension_version.into();
        let normalized = format!(
            "{}.{}.{}",
            normalize_type_name(&type_name),
            normalize_extension_name(&extension_name),
            normalize_extension_name(&extension_version)
        );
        TypeDescriptorKey {
            type_name,
            extension_name,
            extension_version,
            normalized,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn extension_name(&self) -> &str {
        &self.extension_name
    }

    pub fn extension_version(&self) -> &str {
        &self.extension_version
    }
}

impl VictionaryKey for TypeDescriptorKey {
    fn as_str(&self) -> &str {
        &self.normalized
    }
}

/// Prefix for type descriptors by type name, optionally narrowed to one
/// extension: `type.` or `type.ext.`.
#[derive(Debug, Clone)]
pub struct TypeDescriptorKeyPrefix {
    normalized: String,
}

impl TypeDescriptorKeyPrefix {
    pub fn new(type_name: &str, extension_name: Option<&str>) -> Self {
        let normalized = match extension_name {
            Some(ext) if !ext.is_empty() => format!(
                "{}.{}.",
                normalize_type_name(type_name),
                normalize_extension_name(ext)
            ),
            _ => format!("{}.", normalize_type_name(type_name)),
        };
        TypeDescriptorKeyPrefix { normalized }
    }
}

impl VictionaryKey for TypeDescriptorKeyPrefix {
    fn as_str(&self) -> &str {
        &self.normalized
    }
}

// ===== ExtensionDescriptor =====

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionDescriptorKey {
    extension_name: String,
    extension_version: String,
    normalized: String,
}

impl ExtensionDescriptorKey {
    pub fn new(
        extension_name: impl Into<String>,
        extension_version: impl Into<String>,
    ) -> Self {
        let extension_name = extension_name.into();
        let extension_version = extension_version.into();
        let normalized = format!(
            "{}.{}",
            normalize_extension_name(&extension_name),
            normalize_extension_name(&extension_version)
        );
        ExtensionDescriptorKey {
            extension_name,
            extension_version,
            normalized,
        }
    }

    pub fn extension_name(&self) -> &str {
        &self.extension_name
    }

    pub fn extension_version(&self) -> &str {
        &self.extension_version
    }
}

impl VictionaryKey for ExtensionDescriptorKey {
    fn as_str(&self) -> &str {
        &self.normalized
    }
}

// ===== TypeParameters and TypeContext =====

/// Concrete instantiation parameters for a custom type: the difference
/// between an abstract type (`VECTOR`) and a concrete one (`VECTOR(1536)`).
///
/// The serialized form is `key1=value1;key2=value2;...` with keys ascending,
/// so two parameter sets differing only in insertion order are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeParameters {
    params: BTreeMap<String, String>,
    normalized: String,
}

impl TypeParameters {
    pub fn new(params: BTreeMap<String, String>) -> Self {
        let mut normalized = String::new();
        for (k, v) in &params {
            if !normalized.is_empty() {
                normalized.push(';');
            }
            normalized.push_str(k);
            normalized.push('=');
            normalized.push_str(v);
        }
        TypeParameters { params, normalized }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

impl VictionaryKey for TypeParameters {
    fn as_str(&self) -> &str {
        &self.normalized
    }
}

/// Key for a concrete type instantiation: the descriptor key plus its
/// parameters (`descriptor_key[.param_str]`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeContextKey {
    descriptor_key: TypeDescriptorKey,
    parameters: TypeParameters,
    normalized: String,
}

impl TypeContextKey {
    pub fn new(descriptor_key: TypeDescriptorKey, parameters: TypeParameters) -> Self {
        let normalized = if parameters.as_str().is_empty() {
            descriptor_key.as_str().to_string()
        } else {
            format!("{}.{}", descriptor_key.as_str(), parameters.as_str())
        };
        TypeContextKey {
            descriptor_key,
            parameters,
            normalized,
        }
    }

    pub fn descriptor_key(&self) -> &TypeDescriptorKey {
        &self.descriptor_key
    }

    pub fn parameters(&self) -> &TypeParameters {
        &self.parameters
    }
}

impl VictionaryKey for TypeContextKey {
    fn as_str(&self) -> &str {
        &self.normalized
    }
}
