//! Pluggable extension subsystem for the VillageSQL relational database.
//!
//! Extensions package a native shared object and a JSON manifest into a
//! content-addressed tar archive (a VEB). Installing one loads the shared
//! object, registers its custom scalar types and functions (VDFs) through
//! a versioned C ABI, and records it in backing system tables. All
//! registry state lives in the Victionary: a process-wide, reference-
//! counted, transactionally-staged map of extension-owned objects, where a
//! session sees its own staged changes immediately and everyone else sees
//! them atomically at commit.

pub use config::{Config, SCHEMA_NAME, SCHEMA_VERSION};
pub use error::{Error, Result};
pub use runtime::ExtensionRuntime;
pub use semver::Semver;
pub use session::{Arena, Session, SessionId};

pub mod config;
pub mod ddl;
pub mod error;
pub mod mdl;
pub mod runtime;
pub mod semver;
pub mod session;
pub mod vdf;
pub mod veb;
pub mod vef;
pub mod victionary;
