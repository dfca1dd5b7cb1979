//! COMPLEX type extension for VillageSQL.
//!
//! Demonstrates the full VEF ABI surface:
//! - a custom type (COMPLEX, stored as two little-endian f64s) with
//!   encode/decode/compare
//! - VDFs: complex_abs(COMPLEX) -> REAL and
//!   complex_add(COMPLEX, COMPLEX) -> COMPLEX
//!
//! Exports `vef_register`/`vef_unregister` so the packaged cdylib installs
//! like any third-party extension.

use std::os::raw::{c_char, c_int};

use villagesql_ext::vef::*;

pub const COMPLEX_SIZE: usize = 16;
const MAX_DECODE_LEN: i64 = 64;

/// Parse the text form `(re,im)`.
pub fn parse_complex(text: &str) -> Option<(f64, f64)> {
    let inner = text.trim().strip_prefix('(')?.strip_suffix(')')?;
    let (re_str, im_str) = inner.split_once(',')?;
    let re: f64 = re_str.trim().parse().ok()?;
    let im: f64 = im_str.trim().parse().ok()?;
    if !re.is_finite() || !im.is_finite() {
        return None;
    }
    Some((re, im))
}

fn store_complex(buffer: &mut [u8], re: f64, im: f64) {
    // Canonicalize negative zero so binary equality matches semantic
    // equality (no hash function is registered).
    let re = if re == 0.0 { 0.0 } else { re };
    let im = if im == 0.0 { 0.0 } else { im };
    buffer[..8].copy_from_slice(&re.to_le_bytes());
    buffer[8..16].copy_from_slice(&im.to_le_bytes());
}

pub fn read_complex(data: &[u8]) -> Option<(f64, f64)> {
    if data.len() != COMPLEX_SIZE {
        return None;
    }
    let re = f64::from_le_bytes(data[..8].try_into().ok()?);
    let im = f64::from_le_bytes(data[8..16].try_into().ok()?);
    Some((re, im))
}

unsafe extern "C" fn complex_encode(
    buffer: *mut u8,
    buffer_size: usize,
    from: *const c_char,
    from_len: usize,
    length: *mut usize,
) -> bool {
    let text = std::slice::from_raw_parts(from as *const u8, from_len);
    let Ok(text) = std::str::from_utf8(text) else {
        return true;
    };
    let Some((re, im)) = parse_complex(text) else {
        return true;
    };
    if buffer_size < COMPLEX_SIZE {
        return true;
    }
    store_complex(std::slice::from_raw_parts_mut(buffer, COMPLEX_SIZE), re, im);
    *length = COMPLEX_SIZE;
    false
}

unsafe extern "C" fn complex_decode(
    buffer: *const u8,
    buffer_size: usize,
    to: *mut c_char,
    to_size: usize,
    to_length: *mut usize,
) -> bool {
    let data = std::slice::from_raw_parts(buffer, buffer_size);
    let Some((re, im)) = read_complex(data) else {
        return true;
    };
    let text = format!("({},{})", re, im);
    if text.len() > to_size {
        return true;
    }
    std::ptr::copy_nonoverlapping(text.as_ptr(), to as *mut u8, text.len());
    *to_length = text.len();
    false
}

unsafe extern "C" fn complex_compare(
    data1: *const u8,
    len1: usize,
    data2: *const u8,
    len2: usize,
) -> c_int {
    let a = read_complex(std::slice::from_raw_parts(data1, len1));
    let b = read_complex(std::slice::from_raw_parts(data2, len2));
    let (Some((re1, im1)), Some((re2, im2))) = (a, b) else {
        // Malformed values sort by length; lengths can break ties.
        return (len1 as c_int) - (len2 as c_int);
    };
    // Order by real part, then imaginary part.
    match re1.partial_cmp(&re2).unwrap_or(std::cmp::Ordering::Equal) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Greater => 1,
        std::cmp::Ordering::Equal => {
            match im1.partial_cmp(&im2).unwrap_or(std::cmp::Ordering::Equal) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Greater => 1,
                std::cmp::Ordering::Equal => 0,
            }
        }
    }
}

unsafe fn write_error(result: &mut VefVdfResult, message: &str) {
    let len = message.len().min(VEF_MAX_ERROR_LEN - 1);
    std::ptr::copy_nonoverlapping(message.as_ptr(), result.error_msg as *mut u8, len);
    *result.error_msg.add(len) = 0;
    result.result_type = VEF_RESULT_ERROR;
}

unsafe fn complex_arg(args: &VefVdfArgs, index: usize) -> Result<Option<(f64, f64)>, ()> {
    let value = &*args.values.add(index);
    if value.is_null {
        return Ok(None);
    }
    let bin = value.value.bin_value;
    read_complex(std::slice::from_raw_parts(bin.bin_value, bin.bin_len))
        .map(|v| Some(v))
        .ok_or(())
}

/// complex_abs(COMPLEX) -> REAL: the modulus.
unsafe extern "C" fn complex_abs_vdf(
    _ctx: *mut VefContext,
    args: *mut VefVdfArgs,
    result: *mut VefVdfResult,
) {
    let args = &*args;
    let result = &mut *result;
    match complex_arg(args, 0) {
        Ok(Some((re, im))) => {
            result.result_type = VEF_RESULT_VALUE;
            result.value.real_value = (re * re + im * im).sqrt();
        }
        Ok(None) => result.result_type = VEF_RESULT_NULL,
        Err(()) => write_error(result, "complex_abs: malformed COMPLEX value"),
    }
}

/// complex_add(COMPLEX, COMPLEX) -> COMPLEX: component-wise sum.
unsafe extern "C" fn complex_add_vdf(
    _ctx: *mut VefContext,
    args: *mut VefVdfArgs,
    result: *mut VefVdfResult,
) {
    let args = &*args;
    let result = &mut *result;
    let lhs = complex_arg(args, 0);
    let rhs = complex_arg(args, 1);
    match (lhs, rhs) {
        (Ok(Some((re1, im1))), Ok(Some((re2, im2)))) => {
            let bin = result.value.bin_result;
            if bin.max_bin_len < COMPLEX_SIZE {
                write_error(result, "complex_add: result buffer too small");
                return;
            }
            store_complex(
                std::slice::from_raw_parts_mut(bin.bin_buf, COMPLEX_SIZE),
                re1 + re2,
                im1 + im2,
            );
            result.actual_len = COMPLEX_SIZE;
            result.result_type = VEF_RESULT_VALUE;
        }
        (Ok(None), _) | (_, Ok(None)) => result.result_type = VEF_RESULT_NULL,
        _ => write_error(result, "complex_add: malformed COMPLEX value"),
    }
}

// Registration memory: one allocation whose first member is the
// registration struct, so unregister can recover and free everything.
#[repr(C)]
struct ExtensionState {
    registration: VefRegistration,
    type_descs: [VefTypeDesc; 1],
    type_ptrs: [*mut VefTypeDesc; 1],
    func_descs: [VefFuncDesc; 2],
    func_ptrs: [*mut VefFuncDesc; 2],
    signatures: [VefSignature; 2],
    abs_params: [VefType; 1],
    add_params: [VefType; 2],
}

const COMPLEX_NAME: &std::ffi::CStr = c"complex";
const EXTENSION_NAME: &std::ffi::CStr = c"complex_ext";
const EXTENSION_VERSION: &std::ffi::CStr = c"1.0.0";
const ABS_NAME: &std::ffi::CStr = c"complex_abs";
const ADD_NAME: &std::ffi::CStr = c"complex_add";

/// # Safety
/// Called by the server with a valid register argument.
#[no_mangle]
pub unsafe extern "C" fn vef_register(_arg: *mut VefRegisterArg) -> *mut VefRegistration {
    let complex_type = VefType {
        id: VEF_TYPE_CUSTOM,
        custom_type: COMPLEX_NAME.as_ptr(),
    };

    let mut state = Box::new(ExtensionState {
        registration: VefRegistration {
            protocol: VEF_PROTOCOL_1,
            error_msg: std::ptr::null_mut(),
            extension_version: EXTENSION_VERSION.as_ptr(),
            sdk_version: VefVersion::new(1, 0, 0),
            extension_name: EXTENSION_NAME.as_ptr(),
            func_count: 2,
            funcs: std::ptr::null_mut(),
            type_count: 1,
            types: std::ptr::null_mut(),
        },
        type_descs: [VefTypeDesc {
            protocol: VEF_PROTOCOL_1,
            name: COMPLEX_NAME.as_ptr(),
            persisted_length: COMPLEX_SIZE as i64,
            max_decode_buffer_length: MAX_DECODE_LEN,
            encode_func: Some(complex_encode),
            decode_func: Some(complex_decode),
            compare_func: Some(complex_compare),
            hash_func: None,
        }],
        type_ptrs: [std::ptr::null_mut()],
        func_descs: [
            VefFuncDesc {
                protocol: VEF_PROTOCOL_1,
                name: ABS_NAME.as_ptr(),
                signature: std::ptr::null_mut(),
                vdf: Some(complex_abs_vdf),
                prerun: None,
                postrun: None,
                buffer_size: 0,
            },
            VefFuncDesc {
                protocol: VEF_PROTOCOL_1,
                name: ADD_NAME.as_ptr(),
                signature: std::ptr::null_mut(),
                vdf: Some(complex_add_vdf),
                prerun: None,
                postrun: None,
                buffer_size: COMPLEX_SIZE,
            },
        ],
        func_ptrs: [std::ptr::null_mut(), std::ptr::null_mut()],
        signatures: [
            VefSignature {
                param_count: 1,
                params: std::ptr::null(),
                return_type: VefType {
                    id: VEF_TYPE_REAL,
                    custom_type: std::ptr::null(),
                },
            },
            VefSignature {
                param_count: 2,
                params: std::ptr::null(),
                return_type: complex_type,
            },
        ],
        abs_params: [complex_type],
        add_params: [complex_type, complex_type],
    });

    // Wire the internal pointers now that the allocation is in place.
    state.signatures[0].params = state.abs_params.as_ptr();
    state.signatures[1].params = state.add_params.as_ptr();
    state.func_descs[0].signature = &mut state.signatures[0];
    state.func_descs[1].signature = &mut state.signatures[1];
    state.type_ptrs[0] = &mut state.type_descs[0];
    state.func_ptrs[0] = &mut state.func_descs[0];
    state.func_ptrs[1] = &mut state.func_descs[1];
    state.registration.types = state.type_ptrs.as_mut_ptr();
    state.registration.funcs = state.func_ptrs.as_mut_ptr();

    Box::into_raw(state) as *mut VefRegistration
}

/// # Safety
/// `registration` must be a pointer previously returned by `vef_register`.
#[no_mangle]
pub unsafe extern "C" fn vef_unregister(
    _arg: *mut VefUnregisterArg,
    registration: *mut VefRegistration,
) {
    if !registration.is_null() {
        drop(Box::from_raw(registration as *mut ExtensionState));
    }
}
