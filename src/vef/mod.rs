//! The VEF extension ABI.
//!
//! Mirror of the C header shared with extension authors. Every struct that
//! crosses the boundary is `#[repr(C)]` and begins with its protocol tag;
//! later protocol versions may only append fields. The server passes the
//! highest protocol it supports to `vef_register` and reads only fields
//! valid at `min(server_protocol, extension_protocol)`.

pub mod library;

use std::os::raw::{c_char, c_int, c_uint, c_void};

pub type VefProtocol = c_uint;

pub const VEF_PROTOCOL_1: VefProtocol = 1;

/// Max length of error messages in caller-provided buffers.
pub const VEF_MAX_ERROR_LEN: usize = 512;

/// Symbol names every extension shared object must export.
pub const VEF_REGISTER_SYMBOL: &[u8] = b"vef_register\0";
pub const VEF_UNREGISTER_SYMBOL: &[u8] = b"vef_unregister\0";

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VefVersion {
    pub major: c_uint,
    pub minor: c_uint,
    pub patch: c_uint,
    pub extra: *const u8,
}

impl VefVersion {
    pub const fn new(major: c_uint, minor: c_uint, patch: c_uint) -> Self {
        VefVersion {
            major,
            minor,
            patch,
            extra: std::ptr::null(),
        }
    }
}

/// Context passed to every extension call (prerun, vdf, postrun).
#[repr(C)]
#[derive(Debug)]
pub struct VefContext {
    pub protocol: VefProtocol,
}

#[repr(C)]
pub struct VefRegisterArg {
    pub protocol: VefProtocol,
    pub server_version: VefVersion,
    pub vef_version: VefVersion,
}

#[repr(C)]
pub struct VefUnregisterArg {
    pub protocol: VefProtocol,
}

/// Type identifiers for VEF values (parameters and return types).
pub type VefTypeId = c_int;

pub const VEF_TYPE_STRING: VefTypeId = 0;
pub const VEF_TYPE_REAL: VefTypeId = 1;
pub const VEF_TYPE_INT: VefTypeId = 2;
pub const VEF_TYPE_CUSTOM: VefTypeId = 3;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VefType {
    pub id: VefTypeId,
    /// Only set when `id == VEF_TYPE_CUSTOM`. The bare type name, without
    /// the extension name; must refer to a type defined in this extension.
    pub custom_type: *const c_char,
}

#[repr(C)]
pub struct VefSignature {
    pub param_count: c_uint,
    pub params: *const VefType,
    pub return_type: VefType,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VefStrValue {
    pub str_len: usize,
    pub str_value: *const c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VefBinValue {
    pub bin_len: usize,
    pub bin_value: *const u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union VefInvalueData {
    pub str_value: VefStrValue,
    pub bin_value: VefBinValue,
    pub real_value: f64,
    pub int_value: i64,
}

/// Input value for a VDF argument. `type_id` selects the union member;
/// check `is_null` first.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VefInvalue {
    // NOTE: no `Debug` derive here — `VefInvalueData` is a `#[repr(C)]` union
    // and reading its active member without knowing which one is active is
    // unsafe, so `VefInvalue` gets a manual `Debug` impl below that only
    // prints the discriminant fields.
    pub type_id: VefTypeId,
    pub is_null: bool,
    pub value: VefInvalueData,
}

impl std::fmt::Debug for VefInvalue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VefInvalue")
            .field("type_id", &self.type_id)
            .field("is_null", &self.is_null)
            .finish_non_exhaustive()
    }
}

pub type VefResultType = c_int;

/// The buffer contains the serialized value.
pub const VEF_RESULT_VALUE: VefResultType = 0;
/// The result value is SQL NULL.
pub const VEF_RESULT_NULL: VefResultType = 1;
/// The result is an error; the message is in `error_msg`.
pub const VEF_RESULT_ERROR: VefResultType = 2;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VefStrResult {
    pub str_buf: *mut c_char,
    pub max_str_len: usize,
    /// Zero-copy escape hatch: the callee may set `*alt_str_buf` to its own
    /// memory instead of writing into `str_buf`. The pointer must stay valid
    /// until the next row call or the postrun hook.
    pub alt_str_buf: *mut *mut c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VefBinResult {
    pub bin_buf: *mut u8,
    pub max_bin_len: usize,
    pub alt_bin_buf: *mut *mut u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union VefResultData {
    pub str_result: VefStrResult,
    pub bin_result: VefBinResult,
    pub real_value: f64,
    pub int_value: i64,
}

/// Result of a VDF row call. The union member is selected by the declared
/// return type; `actual_len` is authoritative for STRING/CUSTOM values.
#[repr(C)]
pub struct VefVdfResult {
    pub result_type: VefResultType,
    pub actual_len: usize,
    /// Caller-provided buffer of `VEF_MAX_ERROR_LEN` bytes. Write a
    /// null-terminated string here when `result_type == VEF_RESULT_ERROR`.
    pub error_msg: *mut c_char,
    pub value: VefResultData,
}

#[repr(C)]
pub struct VefVdfArgs {
    /// `user_data` from the prerun result (null if no prerun was called).
    pub user_data: *mut c_void,
    pub value_count: c_uint,
    pub values: *mut VefInvalue,
}

#[repr(C)]
pub struct VefPrerunArgs {
    pub arg_count: c_uint,
    pub arg_types: *mut VefType,
    /// Per argument: non-null if the argument is a constant, pointing at its
    /// serialized value; null otherwise.
    pub const_values: *mut *const c_char,
    pub const_lengths: *mut usize,
}

#[repr(C)]
pub struct VefPrerunResult {
    pub result_type: VefResultType,
    pub error_msg: *mut c_char,
    /// Requested result buffer size (0 = use the default for the type).
    pub result_buffer_size: usize,
    /// Extension-allocated state threaded into every row call and postrun.
    pub user_data: *mut c_void,
}

#[repr(C)]
pub struct VefPostrunArgs {
    pub user_data: *mut c_void,
}

#[repr(C)]
pub struct VefPostrunResult {
    pub reserved: *mut c_void,
}

pub type VefVdfFn =
    unsafe extern "C" fn(ctx: *mut VefContext, args: *mut VefVdfArgs, result: *mut VefVdfResult);

pub type VefPrerunFn = unsafe extern "C" fn(
    ctx: *mut VefContext,
    args: *mut VefPrerunArgs,
    result: *mut VefPrerunResult,
);

pub type VefPostrunFn = unsafe extern "C" fn(
    ctx: *mut VefContext,
    args: *mut VefPostrunArgs,
    result: *mut VefPostrunResult,
);

/// Encode: string representation to internal binary representation.
/// Returns false on success. Setting `*length = usize::MAX` signals that the
/// encoded value is SQL NULL.
pub type VefEncodeFn = unsafe extern "C" fn(
    buffer: *mut u8,
    buffer_size: usize,
    from: *const c_char,
    from_len: usize,
    length: *mut usize,
) -> bool;

/// Decode: internal binary representation to string representation.
/// Returns false on success.
pub type VefDecodeFn = unsafe extern "C" fn(
    buffer: *const u8,
    buffer_size: usize,
    to: *mut c_char,
    to_size: usize,
    to_length: *mut usize,
) -> bool;

/// Three-way compare of two binary values, always ascending; DESC is the
/// caller's job.
pub type VefCompareFn = unsafe extern "C" fn(
    data1: *const u8,
    len1: usize,
    data2: *const u8,
    len2: usize,
) -> c_int;

pub type VefHashFn = unsafe extern "C" fn(data: *const u8, len: usize) -> usize;

#[repr(C)]
pub struct VefFuncDesc {
    pub protocol: VefProtocol,
    /// UTF-8 encoded.
    pub name: *const c_char,
    pub signature: *mut VefSignature,
    /// Main function pointer, called for each row.
    pub vdf: Option<VefVdfFn>,
    pub prerun: Option<VefPrerunFn>,
    pub postrun: Option<VefPostrunFn>,
    /// Minimum buffer size requested for string results (0 = default).
    pub buffer_size: usize,
}

#[repr(C)]
pub struct VefTypeDesc {
    pub protocol: VefProtocol,
    /// UTF-8 encoded.
    pub name: *const c_char,
    /// Size of the binary representation when stored.
    pub persisted_length: i64,
    /// Maximum size of the string representation (decode output buffer).
    pub max_decode_buffer_length: i64,
    pub encode_func: Option<VefEncodeFn>,
    pub decode_func: Option<VefDecodeFn>,
    pub compare_func: Option<VefCompareFn>,
    /// Optional. When absent, binary equality must match semantic equality,
    /// which requires `encode` to canonicalize equivalent values.
    pub hash_func: Option<VefHashFn>,
}

#[repr(C)]
pub struct VefRegistration {
    pub protocol: VefProtocol,
    /// Set by the extension when registration fails.
    pub error_msg: *mut c_char,
    pub extension_version: *const c_char,
    pub sdk_version: VefVersion,
    pub extension_name: *const c_char,
    pub func_count: c_uint,
    pub funcs: *mut *mut VefFuncDesc,
    pub type_count: c_uint,
    pub types: *mut *mut VefTypeDesc,
}

pub type VefRegisterFn = unsafe extern "C" fn(arg: *mut VefRegisterArg) -> *mut VefRegistration;

pub type VefUnregisterFn =
    unsafe extern "C" fn(arg: *mut VefUnregisterArg, registration: *mut VefRegistration);
