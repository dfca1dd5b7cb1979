//! VDF registration and invocation.
//!
//! VDFs are scalar functions contributed by extensions, registered under
//! their qualified `extension.function` name. `VdfHandler` owns the
//! per-statement binding: the reusable invalue array, the fixed error
//! buffer, the result buffer for STRING/CUSTOM returns, and the
//! prerun/postrun lifecycle around per-row invocation.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ddl::resolve_type_client_managed;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::vef::library::{ParsedFuncDesc, ParsedType};
use crate::vef::{
    VefContext, VefInvalue, VefInvalueData, VefPostrunArgs, VefPostrunResult, VefPrerunArgs,
    VefPrerunResult, VefProtocol, VefStrValue, VefBinValue, VefType, VefVdfArgs, VefVdfResult,
    VefResultData, VefStrResult, VefBinResult, VEF_MAX_ERROR_LEN, VEF_RESULT_ERROR,
    VEF_RESULT_NULL, VEF_RESULT_VALUE, VEF_TYPE_CUSTOM, VEF_TYPE_INT, VEF_TYPE_REAL,
    VEF_TYPE_STRING,
};
use crate::victionary::descriptors::TypeContext;
use crate::victionary::keys::normalize_extension_name;
use crate::victionary::Victionary;

const DEFAULT_RESULT_BUFFER: usize = 256;

/// A host-side scalar value crossing the VDF boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Str(String),
    /// A custom-typed value in its persisted binary form.
    Custom(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    fn as_int(&self) -> i64 {
        match self {
            SqlValue::Int(v) => *v,
            SqlValue::Real(v) => *v as i64,
            SqlValue::Str(s) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn as_real(&self) -> f64 {
        match self {
            SqlValue::Int(v) => *v as f64,
            SqlValue::Real(v) => *v,
            SqlValue::Str(s) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn to_text_bytes(&self) -> Vec<u8> {
        match self {
            SqlValue::Int(v) => v.to_string().into_bytes(),
            SqlValue::Real(v) => v.to_string().into_bytes(),
            SqlValue::Str(s) => s.as_bytes().to_vec(),
            SqlValue::Custom(b) => b.clone(),
            SqlValue::Null => Vec::new(),
        }
    }

    fn to_binary_bytes(&self) -> Vec<u8> {
        match self {
            SqlValue::Custom(b) => b.clone(),
            SqlValue::Str(s) => s.as_bytes().to_vec(),
            _ => self.to_text_bytes(),
        }
    }
}

pub fn qualified_name(extension_name: &str, function_name: &str) -> String {
    format!(
        "{}.{}",
        normalize_extension_name(extension_name),
        normalize_extension_name(function_name)
    )
}

#[derive(Debug)]
pub struct VdfFunction {
    pub extension_name: String,
    pub name: String,
    pub desc: ParsedFuncDesc,
    pub protocol: VefProtocol,
}

/// The host UDF subsystem's registry of extension functions, keyed by
/// qualified name.
pub struct VdfRegistry {
    funcs: RwLock<HashMap<String, Arc<VdfFunction>>>,
}

impl VdfRegistry {
    pub fn new() -> Self {
        VdfRegistry {
            funcs: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        extension_name: &str,
        desc: ParsedFuncDesc,
        protocol: VefProtocol,
    ) -> Result<()> {
        let key = qualified_name(extension_name, &desc.name);
        let mut funcs = self.funcs.write();
        if funcs.contains_key(&key) {
            return Err(Error::Validation(format!(
                "Function '{}' is already registered",
                key
            )));
        }
        tracing::debug!(function = %key, "registering VDF");
        funcs.insert(
            key,
            Arc::new(VdfFunction {
                extension_name: extension_name.to_string(),
                name: desc.name.clone(),
                desc,
                protocol,
            }),
        );
        Ok(())
    }

    pub fn unregister(&self, extension_name: &str, function_name: &str) -> bool {
        self.funcs
            .write()
            .remove(&qualified_name(extension_name, function_name))
            .is_some()
    }

    /// Remove every function belonging to `extension_name`; returns how
    /// many were removed.
    pub fn unregister_extension(&self, extension_name: &str) -> usize {
        let prefix = format!("{}.", normalize_extension_name(extension_name));
        let mut funcs = self.funcs.write();
        let before = funcs.len();
        funcs.retain(|key, _| !key.starts_with(&prefix));
        before - funcs.len()
    }

    pub fn find_qualified(
        &self,
        extension_name: &str,
        function_name: &str,
    ) -> Option<Arc<VdfFunction>> {
        self.funcs
            .read()
            .get(&qualified_name(extension_name, function_name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.funcs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.read().is_empty()
    }
}

impl Default for VdfRegistry {
    fn default() -> Self {
        VdfRegistry::new()
    }
}

/// One bound argument: its resolved type context (if custom) and its
/// constant value (if the planner proved it constant).
#[derive(Debug, Clone, Default)]
pub struct VdfArg {
    pub type_context: Option<Arc<TypeContext>>,
    pub constant: Option<SqlValue>,
}

/// Outcome of one row invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum VdfOutput {
    Value(SqlValue),
    Null,
    /// The row errored; a warning was pushed and the row reads as NULL.
    RowError,
}

fn empty_invalue() -> VefInvalue {
    VefInvalue {
        type_id: VEF_TYPE_STRING,
        is_null: true,
        value: VefInvalueData { int_value: 0 },
    }
}

/// Per-statement binding of one VDF. Created by `bind`, driven row by row
/// with `invoke_row`, torn down by `cleanup` (or drop), which runs postrun
/// even after an error.
#[derive(Debug)]
pub struct VdfHandler {
    func: Arc<VdfFunction>,
    args: Vec<VdfArg>,
    context: VefContext,
    invalues: Vec<VefInvalue>,
    scratch: Vec<Vec<u8>>,
    error_msg: Vec<u8>,
    result_buffer: Vec<u8>,
    user_data: *mut c_void,
    active: bool,
    row_errored: bool,
    return_context: Option<Arc<TypeContext>>,
}

impl VdfHandler {
    /// Validate and convert arguments, allocate buffers, and run prerun.
    ///
    /// Typing rules for custom parameters: the argument must already carry
    /// the matching type context, or be a constant string that the type's
    /// encode accepts, or be SQL NULL. Anything else fails initialization.
    pub fn bind(
        victionary: &Victionary,
        func: Arc<VdfFunction>,
        mut args: Vec<VdfArg>,
    ) -> Result<VdfHandler> {
        let signature = &func.desc.signature;
        if args.len() != signature.params.len() {
            return Err(Error::Validation(format!(
                "Cannot initialize function '{}': wrong number of arguments (expected {}, got {})",
                func.name,
                signature.params.len(),
                args.len()
            )));
        }

        for (i, param) in signature.params.iter().enumerate() {
            let ParsedType::Custom(expected_type) = param else {
                continue;
            };
            let arg = &mut args[i];

            // NULL is allowed for any parameter; the VDF handles it.
            if matches!(arg.constant, Some(SqlValue::Null)) {
                continue;
            }

            if let Some(tc) = &arg.type_context {
                if !tc.type_name().eq_ignore_ascii_case(expected_type) {
                    return Err(Error::Validation(format!(
                        "Cannot initialize function '{}': argument {} type mismatch \
                         (expected {}, got {})",
                        func.name,
                        i + 1,
                        expected_type,
                        tc.type_name()
                    )));
                }
                continue;
            }

            // A constant string is implicitly encoded to the declared type.
            if let Some(SqlValue::Str(text)) = &arg.constant {
                let Some(tc) = resolve_type_client_managed(
                    victionary,
                    Some(&func.extension_name),
                    expected_type,
                )?
                else {
                    return Err(Error::Validation(format!(
                        "Cannot initialize function '{}': custom type '{}' not found \
                         for argument {}",
                        func.name,
                        expected_type,
                        i + 1
                    )));
                };
                let descriptor = tc.descriptor()?;
                let encoded = descriptor.encode_value(text.as_bytes()).map_err(|_| {
                    Error::Validation(format!(
                        "Cannot initialize function '{}': invalid constant for type '{}' \
                         in argument {}",
                        func.name,
                        expected_type,
                        i + 1
                    ))
                })?;
                arg.constant = Some(match encoded {
                    Some(bytes) => SqlValue::Custom(bytes),
                    None => SqlValue::Null,
                });
                arg.type_context = Some(tc);
                continue;
            }

            return Err(Error::Validation(format!(
                "Cannot initialize function '{}': argument {} must be of custom type '{}'",
                func.name,
                i + 1,
                expected_type
            )));
        }

        // The result item of a custom-returning VDF is tagged with the
        // resolved context so downstream operations see the right type.
        let return_context = match &signature.return_type {
            ParsedType::Custom(type_name) => {
                let tc = resolve_type_client_managed(
                    victionary,
                    Some(&func.extension_name),
                    type_name,
                )?
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "Cannot initialize function '{}': return type '{}' not found",
                        func.name, type_name
                    ))
                })?;
                Some(tc)
            }
            _ => None,
        };

        let arg_count = args.len();
        let result_buffer_size = match signature.return_type {
            ParsedType::String | ParsedType::Custom(_) => {
                if func.desc.buffer_size > 0 {
                    func.desc.buffer_size
                } else {
                    DEFAULT_RESULT_BUFFER
                }
            }
            _ => 0,
        };

        let mut handler = VdfHandler {
            context: VefContext {
                protocol: func.protocol,
            },
            args,
            invalues: vec![empty_invalue(); arg_count],
            scratch: vec![Vec::new(); arg_count],
            error_msg: vec![0u8; VEF_MAX_ERROR_LEN],
            result_buffer: vec![0u8; result_buffer_size],
            user_data: std::ptr::null_mut(),
            active: false,
            row_errored: false,
            return_context,
            func,
        };
        handler.run_prerun()?;
        handler.active = true;
        Ok(handler)
    }

    pub fn function(&self) -> &Arc<VdfFunction> {
        &self.func
    }

    pub fn return_context(&self) -> Option<&Arc<TypeContext>> {
        self.return_context.as_ref()
    }

    pub fn row_errored(&self) -> bool {
        self.row_errored
    }

    fn run_prerun(&mut self) -> Result<()> {
        let Some(prerun) = self.func.desc.prerun else {
            return Ok(());
        };

        let arg_count = self.args.len();

        // Keep the custom type name strings alive for the duration of the
        // prerun call.
        let mut type_name_storage: Vec<Option<CString>> = Vec::with_capacity(arg_count);
        let mut arg_types: Vec<VefType> = Vec::with_capacity(arg_count);
        for (i, param) in self.func.desc.signature.params.iter().enumerate() {
            let custom_name = match &self.args[i].type_context {
                Some(tc) => Some(CString::new(tc.type_name()).unwrap_or_default()),
                None => match param {
                    ParsedType::Custom(name) => Some(CString::new(name.as_str()).unwrap_or_default()),
                    _ => None,
                },
            };
            let custom_ptr = custom_name
                .as_ref()
                .map(|c| c.as_ptr())
                .unwrap_or(std::ptr::null());
            arg_types.push(VefType {
                id: param.type_id(),
                custom_type: custom_ptr,
            });
            type_name_storage.push(custom_name);
        }

        // Constant argument values, serialized.
        let const_storage: Vec<Option<Vec<u8>>> = self
            .args
            .iter()
            .map(|arg| {
                arg.constant
                    .as_ref()
                    .filter(|v| !v.is_null())
                    .map(|v| v.to_binary_bytes())
            })
            .collect();
        let mut const_values: Vec<*const c_char> = const_storage
            .iter()
            .map(|v| {
                v.as_ref()
                    .map(|b| b.as_ptr() as *const c_char)
                    .unwrap_or(std::ptr::null())
            })
            .collect();
        let mut const_lengths: Vec<usize> = const_storage
            .iter()
            .map(|v| v.as_ref().map(|b| b.len()).unwrap_or(0))
            .collect();

        let mut prerun_args = VefPrerunArgs {
            arg_count: arg_count as u32,
            arg_types: arg_types.as_mut_ptr(),
            const_values: const_values.as_mut_ptr(),
            const_lengths: const_lengths.as_mut_ptr(),
        };
        let mut prerun_result = VefPrerunResult {
            result_type: VEF_RESULT_VALUE,
            error_msg: self.error_msg.as_mut_ptr() as *mut c_char,
            result_buffer_size: 0,
            user_data: std::ptr::null_mut(),
        };
        self.error_msg[0] = 0;

        unsafe { prerun(&mut self.context, &mut prerun_args, &mut prerun_result) };

        if prerun_result.result_type == VEF_RESULT_ERROR {
            return Err(Error::Abi(format!(
                "Cannot initialize function '{}': {}",
                self.func.name,
                self.error_message_or("prerun failed")
            )));
        }

        self.user_data = prerun_result.user_data;
        if prerun_result.result_buffer_size > self.result_buffer.len() {
            self.result_buffer = vec![0u8; prerun_result.result_buffer_size];
        }
        Ok(())
    }

    fn error_message_or(&self, fallback: &str) -> String {
        let end = self
            .error_msg
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.error_msg.len());
        if end == 0 {
            fallback.to_string()
        } else {
            String::from_utf8_lossy(&self.error_msg[..end]).into_owned()
        }
    }

    fn marshal_args(&mut self, row: &[SqlValue]) {
        let params = &self.func.desc.signature.params;
        for i in 0..self.invalues.len() {
            // A converted constant wins over the per-row value.
            let effective: &SqlValue = self.args[i]
                .constant
                .as_ref()
                .unwrap_or_else(|| &row[i]);
            let param_type = params
                .get(i)
                .map(|p| p.type_id())
                .unwrap_or(VEF_TYPE_STRING);
            let is_null = effective.is_null();
            self.invalues[i].type_id = param_type;
            self.invalues[i].is_null = is_null;

            match param_type {
                VEF_TYPE_INT => {
                    self.invalues[i].value = VefInvalueData {
                        int_value: effective.as_int(),
                    };
                }
                VEF_TYPE_REAL => {
                    self.invalues[i].value = VefInvalueData {
                        real_value: effective.as_real(),
                    };
                }
                VEF_TYPE_CUSTOM => {
                    self.scratch[i] = effective.to_binary_bytes();
                    self.invalues[i].value = VefInvalueData {
                        bin_value: VefBinValue {
                            bin_len: if is_null { 0 } else { self.scratch[i].len() },
                            bin_value: if is_null {
                                std::ptr::null()
                            } else {
                                self.scratch[i].as_ptr()
                            },
                        },
                    };
                }
                _ => {
                    self.scratch[i] = effective.to_text_bytes();
                    self.invalues[i].value = VefInvalueData {
                        str_value: VefStrValue {
                            str_len: if is_null { 0 } else { self.scratch[i].len() },
                            str_value: if is_null {
                                std::ptr::null()
                            } else {
                                self.scratch[i].as_ptr() as *const c_char
                            },
                        },
                    };
                }
            }
        }
    }

    /// Invoke the VDF for one row. ABI row errors push a warning on the
    /// session and yield `RowError`; statement-level failures were already
    /// rejected at bind time.
    pub fn invoke_row(&mut self, session: &Session, row: &[SqlValue]) -> Result<VdfOutput> {
        if row.len() != self.invalues.len() {
            return Err(Error::Integrity(format!(
                "function '{}' invoked with {} values, bound with {}",
                self.func.name,
                row.len(),
                self.invalues.len()
            )));
        }
        self.marshal_args(row);

        let return_type = self.func.desc.signature.return_type.clone();
        let is_binary = matches!(return_type, ParsedType::Custom(_));
        self.error_msg[0] = 0;

        let mut alt_str: *mut c_char = std::ptr::null_mut();
        let mut alt_bin: *mut u8 = std::ptr::null_mut();

        let mut result = VefVdfResult {
            result_type: VEF_RESULT_VALUE,
            actual_len: 0,
            error_msg: self.error_msg.as_mut_ptr() as *mut c_char,
            value: VefResultData { int_value: 0 },
        };
        match return_type {
            ParsedType::String => {
                result.value = VefResultData {
                    str_result: VefStrResult {
                        str_buf: self.result_buffer.as_mut_ptr() as *mut c_char,
                        max_str_len: self.result_buffer.len(),
                        alt_str_buf: &mut alt_str,
                    },
                };
            }
            ParsedType::Custom(_) => {
                result.value = VefResultData {
                    bin_result: VefBinResult {
                        bin_buf: self.result_buffer.as_mut_ptr(),
                        max_bin_len: self.result_buffer.len(),
                        alt_bin_buf: &mut alt_bin,
                    },
                };
            }
            _ => {}
        }

        let mut vdf_args = VefVdfArgs {
            user_data: self.user_data,
            value_count: self.invalues.len() as u32,
            values: self.invalues.as_mut_ptr(),
        };
        unsafe { (self.func.desc.vdf)(&mut self.context, &mut vdf_args, &mut result) };

        match result.result_type {
            VEF_RESULT_VALUE => {
                let value = match &self.func.desc.signature.return_type {
                    ParsedType::Int => SqlValue::Int(unsafe { result.value.int_value }),
                    ParsedType::Real => SqlValue::Real(unsafe { result.value.real_value }),
                    ParsedType::String | ParsedType::Custom(_) => {
                        // Zero-copy escape hatch: a non-null alt pointer
                        // replaces the caller-provided buffer; actual_len is
                        // authoritative either way.
                        let bytes = unsafe {
                            if is_binary {
                                let src = if alt_bin.is_null() {
                                    self.result_buffer.as_ptr()
                                } else {
                                    alt_bin as *const u8
                                };
                                std::slice::from_raw_parts(src, result.actual_len).to_vec()
                            } else {
                                let src = if alt_str.is_null() {
                                    self.result_buffer.as_ptr()
                                } else {
                                    alt_str as *const u8
                                };
                                std::slice::from_raw_parts(src, result.actual_len).to_vec()
                            }
                        };
                        if is_binary {
                            SqlValue::Custom(bytes)
                        } else {
                            SqlValue::Str(String::from_utf8_lossy(&bytes).into_owned())
                        }
                    }
                };
                Ok(VdfOutput::Value(value))
            }
            VEF_RESULT_NULL => Ok(VdfOutput::Null),
            VEF_RESULT_ERROR => {
                session.push_warning(format!(
                    "VDF error in function '{}': {}",
                    self.func.name,
                    self.error_message_or("unknown error")
                ));
                self.row_errored = true;
                Ok(VdfOutput::RowError)
            }
            other => Err(Error::Abi(format!(
                "function '{}' returned unknown result type {}",
                self.func.name, other
            ))),
        }
    }

    /// Run postrun (once), including after an error.
    pub fn cleanup(&mut self) {
        if self.active {
            if let Some(postrun) = self.func.desc.postrun {
                let mut args = VefPostrunArgs {
                    user_data: self.user_data,
                };
                let mut result = VefPostrunResult {
                    reserved: std::ptr::null_mut(),
                };
                unsafe { postrun(&mut self.context, &mut args, &mut result) };
            }
        }
        self.active = false;
    }
}

impl Drop for VdfHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}
