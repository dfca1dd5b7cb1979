//! Loading extension shared objects and parsing their registrations.
//!
//! `LoadedExtension::load` resolves `vef_register`/`vef_unregister`, calls
//! the register entry point with the server's protocol, and copies the
//! returned descriptor blobs into owned Rust data. The raw registration
//! pointer and the library handle stay alive until the `LoadedExtension`
//! is dropped, at which point `vef_unregister` runs and the library is
//! closed.

use std::ffi::CStr;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};

use super::*;
use crate::error::{Error, Result};

/// A parsed VDF parameter or return type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedType {
    String,
    Real,
    Int,
    /// The bare type name, defined by the same extension.
    Custom(String),
}

impl ParsedType {
    pub fn type_id(&self) -> VefTypeId {
        match self {
            ParsedType::String => VEF_TYPE_STRING,
            ParsedType::Real => VEF_TYPE_REAL,
            ParsedType::Int => VEF_TYPE_INT,
            ParsedType::Custom(_) => VEF_TYPE_CUSTOM,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub params: Vec<ParsedType>,
    pub return_type: ParsedType,
}

#[derive(Clone)]
pub struct ParsedTypeDesc {
    pub name: String,
    pub persisted_length: i64,
    pub max_decode_buffer_length: i64,
    pub encode: VefEncodeFn,
    pub decode: VefDecodeFn,
    pub compare: VefCompareFn,
    pub hash: Option<VefHashFn>,
}

#[derive(Debug, Clone)]
pub struct ParsedFuncDesc {
    pub name: String,
    pub signature: ParsedSignature,
    pub vdf: VefVdfFn,
    pub prerun: Option<VefPrerunFn>,
    pub postrun: Option<VefPostrunFn>,
    pub buffer_size: usize,
}

/// Owned copy of everything an extension registered.
#[derive(Clone)]
pub struct ParsedRegistration {
    pub extension_name: String,
    pub extension_version: String,
    pub types: Vec<ParsedTypeDesc>,
    pub funcs: Vec<ParsedFuncDesc>,
}

unsafe fn required_str(ptr: *const std::os::raw::c_char, field: &str) -> Result<String> {
    if ptr.is_null() {
        return Err(Error::Abi(format!("registration missing field '{}'", field)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(|s| s.to_string())
        .map_err(|_| Error::Abi(format!("registration field '{}' is not valid UTF-8", field)))
}

unsafe fn parse_type(raw: &VefType, context: &str) -> Result<ParsedType> {
    match raw.id {
        VEF_TYPE_STRING => Ok(ParsedType::String),
        VEF_TYPE_REAL => Ok(ParsedType::Real),
        VEF_TYPE_INT => Ok(ParsedType::Int),
        VEF_TYPE_CUSTOM => {
            let name = required_str(raw.custom_type, context)?;
            Ok(ParsedType::Custom(name))
        }
        other => Err(Error::Abi(format!(
            "unknown type id {} in {}",
            other, context
        ))),
    }
}

impl ParsedRegistration {
    /// Copy a raw registration into owned data.
    ///
    /// # Safety
    /// `reg` must point to a live registration produced by the extension's
    /// `vef_register`, with all descriptor pointers valid.
    pub unsafe fn from_raw(reg: &VefRegistration) -> Result<ParsedRegistration> {
        if !reg.error_msg.is_null() {
            let msg = CStr::from_ptr(reg.error_msg).to_string_lossy().into_owned();
            return Err(Error::Abi(format!("extension registration failed: {}", msg)));
        }

        let extension_name = required_str(reg.extension_name, "extension_name")?;
        let extension_version = required_str(reg.extension_version, "extension_version")?;

        if reg.type_count > 0 && reg.types.is_null() {
            return Err(Error::Abi("registration type array is null".to_string()));
        }
        if reg.func_count > 0 && reg.funcs.is_null() {
            return Err(Error::Abi("registration function array is null".to_string()));
        }

        let mut types = Vec::with_capacity(reg.type_count as usize);
        for i in 0..reg.type_count as usize {
            let desc_ptr = *reg.types.add(i);
            if desc_ptr.is_null() {
                return Err(Error::Abi(format!("type descriptor {} is null", i)));
            }
            let desc = &*desc_ptr;
            let name = required_str(desc.name, "type name")?;
            let encode = desc
                .encode_func
                .ok_or_else(|| Error::Abi(format!("type '{}' has no encode function", name)))?;
            let decode = desc
                .decode_func
                .ok_or_else(|| Error::Abi(format!("type '{}' has no decode function", name)))?;
            let compare = desc
                .compare_func
                .ok_or_else(|| Error::Abi(format!("type '{}' has no compare function", name)))?;
            types.push(ParsedTypeDesc {
                name,
                persisted_length: desc.persisted_length,
                max_decode_buffer_length: desc.max_decode_buffer_length,
                encode,
                decode,
                compare,
                hash: desc.hash_func,
            });
        }

        let mut funcs = Vec::with_capacity(reg.func_count as usize);
        for i in 0..reg.func_count as usize {
            let desc_ptr = *reg.funcs.add(i);
            if desc_ptr.is_null() {
                return Err(Error::Abi(format!("function descriptor {} is null", i)));
            }
            let desc = &*desc_ptr;
            let name = required_str(desc.name, "function name")?;
            let vdf = desc
                .vdf
                .ok_or_else(|| Error::Abi(format!("function '{}' has no row callback", name)))?;
            if desc.signature.is_null() {
                return Err(Error::Abi(format!("function '{}' has no signature", name)));
            }
            let raw_sig = &*desc.signature;
            let mut params = Vec::with_capacity(raw_sig.param_count as usize);
            for p in 0..raw_sig.param_count as usize {
                let raw_param = &*raw_sig.params.add(p);
                params.push(parse_type(raw_param, "parameter type")?);
            }
            let return_type = parse_type(&raw_sig.return_type, "return type")?;
            funcs.push(ParsedFuncDesc {
                name,
                signature: ParsedSignature {
                    params,
                    return_type,
                },
                vdf,
                prerun: desc.prerun,
                postrun: desc.postrun,
                buffer_size: desc.buffer_size,
            });
        }

        Ok(ParsedRegistration {
            extension_name,
            extension_version,
            types,
            funcs,
        })
    }
}

// Raw handle to the loaded shared object. Only present for extensions loaded
// from disk; in-process registrations (startup validation tests) have none.
struct RawHandle {
    registration: *mut VefRegistration,
    unregister: VefUnregisterFn,
    // Declared last so the library outlives the registration pointer during
    // drop.
    library: Library,
}

// The extension contract requires registrations to be usable from any server
// thread; the raw pointers are owned by the extension until unregister.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

/// A live extension: the parsed registration plus, for disk-loaded
/// extensions, the `.so` handle and unregister callback. Dropping the last
/// handle unregisters and closes the shared object.
pub struct LoadedExtension {
    so_path: PathBuf,
    protocol: VefProtocol,
    parsed: ParsedRegistration,
    raw: Option<RawHandle>,
}

impl LoadedExtension {
    /// dlopen the shared object, resolve the entry points, and register.
    pub fn load(so_path: &Path) -> Result<LoadedExtension> {
        let library = unsafe {
            Library::new(so_path).map_err(|e| {
                Error::Resource(format!(
                    "Failed to load extension library '{}': {}",
                    so_path.display(),
                    e
                ))
            })?
        };

        let register: Symbol<VefRegisterFn> = unsafe {
            library.get(VEF_REGISTER_SYMBOL).map_err(|e| {
                Error::Abi(format!(
                    "'{}' does not export vef_register: {}",
                    so_path.display(),
                    e
                ))
            })?
        };
        let unregister: Symbol<VefUnregisterFn> = unsafe {
            library.get(VEF_UNREGISTER_SYMBOL).map_err(|e| {
                Error::Abi(format!(
                    "'{}' does not export vef_unregister: {}",
                    so_path.display(),
                    e
                ))
            })?
        };
        let unregister_fn: VefUnregisterFn = *unregister;

        let mut arg = VefRegisterArg {
            protocol: VEF_PROTOCOL_1,
            server_version: VefVersion::new(1, 0, 0),
            vef_version: VefVersion::new(1, 0, 0),
        };
        let registration = unsafe { register(&mut arg) };
        if registration.is_null() {
            return Err(Error::Abi(format!(
                "vef_register returned null for '{}'",
                so_path.display()
            )));
        }

        // Read only fields valid at the negotiated protocol. Protocol 1 is
        // the full struct today.
        let protocol = unsafe { (*registration).protocol.min(VEF_PROTOCOL_1) };
        let parsed = match unsafe { ParsedRegistration::from_raw(&*registration) } {
            Ok(parsed) => parsed,
            Err(e) => {
                let mut unreg_arg = VefUnregisterArg {
                    protocol: VEF_PROTOCOL_1,
                };
                unsafe { unregister_fn(&mut unreg_arg, registration) };
                return Err(e);
            }
        };

        tracing::debug!(
            extension = %parsed.extension_name,
            version = %parsed.extension_version,
            types = parsed.types.len(),
            funcs = parsed.funcs.len(),
            "loaded extension library"
        );

        Ok(LoadedExtension {
            so_path: so_path.to_path_buf(),
            protocol,
            parsed,
            raw: Some(RawHandle {
                registration,
                unregister: unregister_fn,
                library,
            }),
        })
    }

    /// Build a registration that lives in this process rather than in a
    /// shared object. Used for startup validation paths and tests; there is
    /// nothing to unregister or unload.
    pub fn from_parts(so_path: impl AsRef<Path>, parsed: ParsedRegistration) -> LoadedExtension {
        LoadedExtension {
            so_path: so_path.as_ref().to_path_buf(),
            protocol: VEF_PROTOCOL_1,
            parsed,
            raw: None,
        }
    }

    pub fn so_path(&self) -> &Path {
        &self.so_path
    }

    pub fn protocol(&self) -> VefProtocol {
        self.protocol
    }

    pub fn registration(&self) -> &ParsedRegistration {
        &self.parsed
    }
}

impl Drop for LoadedExtension {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            let mut arg = VefUnregisterArg {
                protocol: self.protocol,
            };
            unsafe { (raw.unregister)(&mut arg, raw.registration) };
            // The library handle drops here, closing the shared object only
            // after the extension released its registration memory.
            drop(raw.library);
            tracing::debug!(path = %self.so_path.display(), "unloaded extension library");
        }
    }
}
