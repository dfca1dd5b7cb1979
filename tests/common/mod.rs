#![allow(dead_code)]

//! Shared fixtures: an isolated runtime over temp directories, an
//! in-process VEF registration (a "boxed_int" type plus a handful of
//! VDFs), and a VEB archive packer.

use std::fs;
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use villagesql_ext::vef::library::{
    LoadedExtension, ParsedFuncDesc, ParsedRegistration, ParsedSignature, ParsedType,
    ParsedTypeDesc,
};
use villagesql_ext::vef::*;
use villagesql_ext::{Config, ExtensionRuntime, Session};

pub const FIXTURE_VERSION: &str = "1.0.0";
pub const FIXTURE_SHA: &str =
    "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

pub struct TestEnv {
    pub dir: TempDir,
    pub runtime: ExtensionRuntime,
}

impl TestEnv {
    pub fn new() -> TestEnv {
        let dir = TempDir::new().expect("create temp dir");
        let config = Config::new(dir.path().join("veb"), dir.path().join("data"));
        let runtime = ExtensionRuntime::open(config).expect("open runtime");
        let mut session = Session::new();
        runtime.startup(&mut session).expect("startup");
        TestEnv { dir, runtime }
    }

    pub fn veb_dir(&self) -> &Path {
        self.runtime.config.veb_dir.as_path()
    }
}

// ===== boxed_int: an i64 stored as 8 little-endian bytes =====

unsafe extern "C" fn boxed_int_encode(
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
    let text = text.trim();
    if text.eq_ignore_ascii_case("null") {
        // Encoding to SQL NULL.
        *length = usize::MAX;
        return false;
    }
    let Ok(value) = text.parse::<i64>() else {
        return true;
    };
    if buffer_size < 8 {
        return true;
    }
    std::slice::from_raw_parts_mut(buffer, 8).copy_from_slice(&value.to_le_bytes());
    *length = 8;
    false
}

unsafe extern "C" fn boxed_int_decode(
    buffer: *const u8,
    buffer_size: usize,
    to: *mut c_char,
    to_size: usize,
    to_length: *mut usize,
) -> bool {
    if buffer_size != 8 {
        return true;
    }
    let bytes: [u8; 8] = std::slice::from_raw_parts(buffer, 8).try_into().unwrap();
    let text = i64::from_le_bytes(bytes).to_string();
    if text.len() > to_size {
        return true;
    }
    std::ptr::copy_nonoverlapping(text.as_ptr(), to as *mut u8, text.len());
    *to_length = text.len();
    false
}

unsafe extern "C" fn boxed_int_compare(
    data1: *const u8,
    len1: usize,
    data2: *const u8,
    len2: usize,
) -> c_int {
    if len1 != 8 || len2 != 8 {
        return (len1 as c_int) - (len2 as c_int);
    }
    let a = i64::from_le_bytes(std::slice::from_raw_parts(data1, 8).try_into().unwrap());
    let b = i64::from_le_bytes(std::slice::from_raw_parts(data2, 8).try_into().unwrap());
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

unsafe extern "C" fn boxed_int_hash(data: *const u8, len: usize) -> usize {
    std::slice::from_raw_parts(data, len)
        .iter()
        .fold(0usize, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as usize))
}

pub fn boxed(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

unsafe fn read_boxed_arg(args: &VefVdfArgs, index: usize) -> Result<Option<i64>, ()> {
    let value = &*args.values.add(index);
    if value.is_null {
        return Ok(None);
    }
    let bin = value.value.bin_value;
    if bin.bin_len != 8 {
        return Err(());
    }
    let bytes: [u8; 8] = std::slice::from_raw_parts(bin.bin_value, 8)
        .try_into()
        .unwrap();
    Ok(Some(i64::from_le_bytes(bytes)))
}

unsafe fn set_error(result: &mut VefVdfResult, message: &str) {
    let len = message.len().min(VEF_MAX_ERROR_LEN - 1);
    std::ptr::copy_nonoverlapping(message.as_ptr(), result.error_msg as *mut u8, len);
    *result.error_msg.add(len) = 0;
    result.result_type = VEF_RESULT_ERROR;
}

/// unbox(boxed_int) -> INT
unsafe extern "C" fn unbox_vdf(
    _ctx: *mut VefContext,
    args: *mut VefVdfArgs,
    result: *mut VefVdfResult,
) {
    let args = &*args;
    let result = &mut *result;
    match read_boxed_arg(args, 0) {
        Ok(Some(value)) => {
            result.result_type = VEF_RESULT_VALUE;
            result.value.int_value = value;
        }
        Ok(None) => result.result_type = VEF_RESULT_NULL,
        Err(()) => set_error(result, "unbox: malformed boxed_int"),
    }
}

/// boxed_add(boxed_int, boxed_int) -> boxed_int
unsafe extern "C" fn boxed_add_vdf(
    _ctx: *mut VefContext,
    args: *mut VefVdfArgs,
    result: *mut VefVdfResult,
) {
    let args = &*args;
    let result = &mut *result;
    match (read_boxed_arg(args, 0), read_boxed_arg(args, 1)) {
        (Ok(Some(a)), Ok(Some(b))) => {
            let bin = result.value.bin_result;
            if bin.max_bin_len < 8 {
                set_error(result, "boxed_add: result buffer too small");
                return;
            }
            std::slice::from_raw_parts_mut(bin.bin_buf, 8)
                .copy_from_slice(&a.wrapping_add(b).to_le_bytes());
            result.actual_len = 8;
            result.result_type = VEF_RESULT_VALUE;
        }
        (Ok(None), _) | (_, Ok(None)) => result.result_type = VEF_RESULT_NULL,
        _ => set_error(result, "boxed_add: malformed boxed_int"),
    }
}

/// row_counter() -> INT, counting rows through prerun/postrun user_data.
unsafe extern "C" fn row_counter_prerun(
    _ctx: *mut VefContext,
    _args: *mut VefPrerunArgs,
    result: *mut VefPrerunResult,
) {
    let result = &mut *result;
    result.user_data = Box::into_raw(Box::new(0i64)) as *mut std::ffi::c_void;
    result.result_type = VEF_RESULT_VALUE;
}

unsafe extern "C" fn row_counter_vdf(
    _ctx: *mut VefContext,
    args: *mut VefVdfArgs,
    result: *mut VefVdfResult,
) {
    let args = &*args;
    let result = &mut *result;
    let counter = args.user_data as *mut i64;
    *counter += 1;
    result.result_type = VEF_RESULT_VALUE;
    result.value.int_value = *counter;
}

unsafe extern "C" fn row_counter_postrun(
    _ctx: *mut VefContext,
    args: *mut VefPostrunArgs,
    _result: *mut VefPostrunResult,
) {
    let args = &*args;
    if !args.user_data.is_null() {
        drop(Box::from_raw(args.user_data as *mut i64));
    }
}

/// check_positive(INT) -> INT, erroring on negative input rows.
unsafe extern "C" fn check_positive_vdf(
    _ctx: *mut VefContext,
    args: *mut VefVdfArgs,
    result: *mut VefVdfResult,
) {
    let args = &*args;
    let result = &mut *result;
    let value = &*args.values.add(0);
    if value.is_null {
        result.result_type = VEF_RESULT_NULL;
        return;
    }
    let v = value.value.int_value;
    if v < 0 {
        set_error(result, "value must not be negative");
    } else {
        result.result_type = VEF_RESULT_VALUE;
        result.value.int_value = v;
    }
}

pub fn make_registration(name: &str, version: &str) -> ParsedRegistration {
    let boxed_int = || ParsedType::Custom("boxed_int".to_string());
    ParsedRegistration {
        extension_name: name.to_string(),
        extension_version: version.to_string(),
        types: vec![
            ParsedTypeDesc {
                name: "boxed_int".to_string(),
                persisted_length: 8,
                max_decode_buffer_length: 32,
                encode: boxed_int_encode,
                decode: boxed_int_decode,
                compare: boxed_int_compare,
                hash: Some(boxed_int_hash),
            },
            // A second type with the same representation, for type-mismatch
            // scenarios.
            ParsedTypeDesc {
                name: "raw_word".to_string(),
                persisted_length: 8,
                max_decode_buffer_length: 32,
                encode: boxed_int_encode,
                decode: boxed_int_decode,
                compare: boxed_int_compare,
                hash: None,
            },
        ],
        funcs: vec![
            ParsedFuncDesc {
                name: "unbox".to_string(),
                signature: ParsedSignature {
                    params: vec![boxed_int()],
                    return_type: ParsedType::Int,
                },
                vdf: unbox_vdf,
                prerun: None,
                postrun: None,
                buffer_size: 0,
            },
            ParsedFuncDesc {
                name: "boxed_add".to_string(),
                signature: ParsedSignature {
                    params: vec![boxed_int(), boxed_int()],
                    return_type: boxed_int(),
                },
                vdf: boxed_add_vdf,
                prerun: None,
                postrun: None,
                buffer_size: 8,
            },
            ParsedFuncDesc {
                name: "row_counter".to_string(),
                signature: ParsedSignature {
                    params: vec![],
                    return_type: ParsedType::Int,
                },
                vdf: row_counter_vdf,
                prerun: Some(row_counter_prerun),
                postrun: Some(row_counter_postrun),
                buffer_size: 0,
            },
            ParsedFuncDesc {
                name: "check_positive".to_string(),
                signature: ParsedSignature {
                    params: vec![ParsedType::Int],
                    return_type: ParsedType::Int,
                },
                vdf: check_positive_vdf,
                prerun: None,
                postrun: None,
                buffer_size: 0,
            },
        ],
    }
}

/// Install the fixture extension as if its archive had been unpacked and
/// loaded, committing the transaction.
pub fn install_fixture(env: &TestEnv, session: &Session, name: &str) {
    let loaded = Arc::new(LoadedExtension::from_parts(
        format!("/fixtures/{}.so", name),
        make_registration(name, FIXTURE_VERSION),
    ));
    env.runtime
        .install_loaded(session, name, FIXTURE_VERSION, FIXTURE_SHA, loaded)
        .expect("install fixture");
    env.runtime
        .end_transaction(session, false)
        .expect("commit fixture install");
    session.release_statement_locks();
}

/// Write `<name>.veb` containing a manifest and a (dummy) shared object.
pub fn pack_veb(veb_dir: &Path, name: &str, version: &str, so_bytes: &[u8]) {
    fs::create_dir_all(veb_dir).unwrap();
    let file = fs::File::create(veb_dir.join(format!("{}.veb", name))).unwrap();
    let mut builder = tar::Builder::new(file);

    let manifest = format!("{{\"version\": \"{}\"}}", version);
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "manifest.json", manifest.as_bytes())
        .unwrap();

    let so_name = format!("lib/{}.{}", name, std::env::consts::DLL_EXTENSION);
    let mut header = tar::Header::new_gnu();
    header.set_size(so_bytes.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, so_name, so_bytes).unwrap();

    builder.finish().unwrap();
}
