//! Memory-only entry kinds: type descriptors, type contexts, and the live
//! registration handles of loaded extensions.

use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::vef::library::LoadedExtension;
use crate::vef::{VefCompareFn, VefDecodeFn, VefEncodeFn, VefHashFn};
use crate::victionary::keys::{
    ExtensionDescriptorKey, TypeContextKey, TypeDescriptorKey, VictionaryKey,
};
use crate::victionary::map::{CreateFromKey, VictionaryEntry};

/// Storage implementation classes for custom types. Opaque to extensions;
/// chosen by the server from the persisted length.
pub const IMPL_TYPE_VARBINARY: u8 = 1;
pub const IMPL_TYPE_BLOB: u8 = 2;

pub fn implementation_type_for(persisted_length: i64) -> u8 {
    if persisted_length <= 255 {
        IMPL_TYPE_VARBINARY
    } else {
        IMPL_TYPE_BLOB
    }
}

/// Immutable metadata and function pointers for a custom type. Built from
/// extension registration, never from table rows; the function pointers are
/// owned by the extension's shared object while it stays loaded.
#[derive(Debug)]
pub struct TypeDescriptor {
    key: TypeDescriptorKey,
    implementation_type: u8,
    persisted_length: i64,
    max_decode_buffer_length: i64,
    encode: VefEncodeFn,
    decode: VefDecodeFn,
    compare: VefCompareFn,
    hash: Option<VefHashFn>,
}

impl TypeDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: TypeDescriptorKey,
        implementation_type: u8,
        persisted_length: i64,
        max_decode_buffer_length: i64,
        encode: VefEncodeFn,
        decode: VefDecodeFn,
        compare: VefCompareFn,
        hash: Option<VefHashFn>,
    ) -> Self {
        TypeDescriptor {
            key,
            implementation_type,
            persisted_length,
            max_decode_buffer_length,
            encode,
            decode,
            compare,
            hash,
        }
    }

    pub fn type_name(&self) -> &str {
        self.key.type_name()
    }

    pub fn extension_name(&self) -> &str {
        self.key.extension_name()
    }

    pub fn extension_version(&self) -> &str {
        self.key.extension_version()
    }

    pub fn implementation_type(&self) -> u8 {
        self.implementation_type
    }

    pub fn persisted_length(&self) -> i64 {
        self.persisted_length
    }

    pub fn max_decode_buffer_length(&self) -> i64 {
        self.max_decode_buffer_length
    }

    pub fn encode(&self) -> VefEncodeFn {
        self.encode
    }

    pub fn decode(&self) -> VefDecodeFn {
        self.decode
    }

    pub fn compare(&self) -> VefCompareFn {
        self.compare
    }

    /// May be absent; binary hashing is safe then because encode
    /// canonicalizes.
    pub fn hash(&self) -> Option<VefHashFn> {
        self.hash
    }

    // ===== Safe wrappers over the ABI function pointers =====

    /// Encode a string representation into the type's binary form.
    /// `Ok(None)` means the encoded value is SQL NULL.
    pub fn encode_value(&self, from: &[u8]) -> Result<Option<Vec<u8>>> {
        let cap = self.persisted_length.max(1) as usize;
        let mut buf = vec![0u8; cap];
        let mut out_len: usize = 0;
        let failed = unsafe {
            (self.encode)(
                buf.as_mut_ptr(),
                buf.len(),
                from.as_ptr() as *const std::os::raw::c_char,
                from.len(),
                &mut out_len,
            )
        };
        if failed {
            return Err(Error::Abi(format!(
                "invalid value for type '{}'",
                self.type_name()
            )));
        }
        if out_len == usize::MAX {
            return Ok(None);
        }
        if out_len > buf.len() {
            return Err(Error::Abi(format!(
                "encode for type '{}' overflowed its buffer",
                self.type_name()
            )));
        }
        buf.truncate(out_len);
        Ok(Some(buf))
    }

    /// Decode the binary form back to its string representation.
    pub fn decode_value(&self, data: &[u8]) -> Result<Vec<u8>> {
        let cap = self.max_decode_buffer_length.max(1) as usize;
        let mut buf = vec![0u8; cap];
        let mut out_len: usize = 0;
        let failed = unsafe {
            (self.decode)(
                data.as_ptr(),
                data.len(),
                buf.as_mut_ptr() as *mut std::os::raw::c_char,
                buf.len(),
                &mut out_len,
            )
        };
        if failed || out_len > buf.len() {
            return Err(Error::Abi(format!(
                "failed to decode value of type '{}'",
                self.type_name()
            )));
        }
        buf.truncate(out_len);
        Ok(buf)
    }

    /// Three-way compare two binary values, ascending.
    pub fn compare_values(&self, a: &[u8], b: &[u8]) -> i32 {
        unsafe { (self.compare)(a.as_ptr(), a.len(), b.as_ptr(), b.len()) }
    }
}

impl VictionaryEntry for TypeDescriptor {
    type Key = TypeDescriptorKey;

    fn key(&self) -> &TypeDescriptorKey {
        &self.key
    }
}

/// A concrete type: descriptor plus instantiation parameters. Immutable
/// after construction; shared and cached in the Victionary, handed out to
/// query execution through arena-scoped acquisition.
///
/// The descriptor reference is non-owning (`Weak`) so contexts never hold
/// the descriptor's strong count up. Uninstall deletes every context of an
/// extension in the same transaction that deletes its descriptors, and its
/// in-use check refuses to run while either has external strong references.
#[derive(Debug)]
pub struct TypeContext {
    key: TypeContextKey,
    descriptor: Weak<TypeDescriptor>,
}

impl TypeContext {
    pub fn new(key: TypeContextKey, descriptor: &Arc<TypeDescriptor>) -> Result<TypeContext> {
        if descriptor.key() != key.descriptor_key() {
            return Err(Error::Integrity(format!(
                "type context key {} does not match descriptor {}",
                key.as_str(),
                descriptor.key().as_str()
            )));
        }
        Ok(TypeContext {
            key,
            descriptor: Arc::downgrade(descriptor),
        })
    }

    pub fn type_name(&self) -> &str {
        self.key.descriptor_key().type_name()
    }

    pub fn extension_name(&self) -> &str {
        self.key.descriptor_key().extension_name()
    }

    pub fn extension_version(&self) -> &str {
        self.key.descriptor_key().extension_version()
    }

    pub fn parameters(&self) -> &crate::victionary::keys::TypeParameters {
        self.key.parameters()
    }

    /// The committed descriptor this context instantiates. Failure to
    /// upgrade means the uninstall invariant was violated.
    pub fn descriptor(&self) -> Result<Arc<TypeDescriptor>> {
        self.descriptor.upgrade().ok_or_else(|| {
            Error::Integrity(format!(
                "type descriptor for context {} is gone",
                self.key.as_str()
            ))
        })
    }

    /// Types are compatible for comparison when they name the same type at
    /// the same extension and version.
    pub fn is_compatible_with(&self, other: &TypeContext) -> bool {
        self.key.descriptor_key() == other.key.descriptor_key()
    }
}

impl VictionaryEntry for TypeContext {
    type Key = TypeContextKey;

    fn key(&self) -> &TypeContextKey {
        &self.key
    }
}

impl CreateFromKey for TypeContext {
    type Deps = Arc<TypeDescriptor>;

    fn create(key: &TypeContextKey, deps: &Arc<TypeDescriptor>) -> Result<TypeContext> {
        TypeContext::new(key.clone(), deps)
    }
}

/// In-memory descriptor for a loaded extension: the registration handle of
/// the `.so`. Transactional (staged like every other entry) but never
/// persisted. Dropping the last handle after a committed uninstall is what
/// unregisters and unloads the shared object.
pub struct ExtensionDescriptor {
    key: ExtensionDescriptorKey,
    registration: Arc<LoadedExtension>,
}

impl ExtensionDescriptor {
    pub fn new(key: ExtensionDescriptorKey, registration: Arc<LoadedExtension>) -> Self {
        ExtensionDescriptor { key, registration }
    }

    pub fn extension_name(&self) -> &str {
        self.key.extension_name()
    }

    pub fn extension_version(&self) -> &str {
        self.key.extension_version()
    }

    pub fn registration(&self) -> &Arc<LoadedExtension> {
        &self.registration
    }
}

impl VictionaryEntry for ExtensionDescriptor {
    type Key = ExtensionDescriptorKey;

    fn key(&self) -> &ExtensionDescriptorKey {
        &self.key
    }
}
