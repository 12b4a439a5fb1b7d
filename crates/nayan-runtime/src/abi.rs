/// C ABI exports for the Nayan runtime
///
/// The host supplies the forward pass as a table of callbacks and drives
/// engines through integer ids. Every fallible entry point returns an
/// [`ErrorCode`]; the message of the last failure on the calling thread is
/// available from `nayan_last_error`.
use crate::{set_last_error, take_last_error, ErrorCode, GenerationConfig, RuntimeConfig};
use crate::engine::{EngineBuilder, GenerationState, InferenceEngine};
use log::info;
use nayan_core::error::Error;
use nayan_core::{BackendError, ForwardPass, LoadOptions, VOCAB_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::raw::{c_char, c_void};
use std::path::Path;
use std::slice;
use std::sync::Arc;

#[cfg(test)]
use std::ffi::CStr;

/// Host callback status: success
pub const NAYAN_HOST_OK: i32 = 0;
/// Host callback status: a transient buffer could not be allocated
pub const NAYAN_HOST_RESOURCE_EXHAUSTED: i32 = 2;

/// Load a model; writes an opaque handle to `out_handle`
pub type NayanLoadFn = unsafe extern "C" fn(
    user_data: *mut c_void,
    path_ptr: *const u8,
    path_len: usize,
    inter_op_threads: u32,
    intra_op_threads: u32,
    out_handle: *mut u64,
) -> i32;

/// Run one forward pass; fills `out_len` scores (`ids_len * VOCAB_SIZE`)
pub type NayanRunFn = unsafe extern "C" fn(
    user_data: *mut c_void,
    handle: u64,
    ids_ptr: *const i64,
    ids_len: usize,
    out_scores: *mut f32,
    out_len: usize,
) -> i32;

/// Release a model handle
pub type NayanCloseFn = unsafe extern "C" fn(user_data: *mut c_void, handle: u64) -> i32;

/// Forward-pass callbacks supplied by the host
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NayanBackendVTable {
    pub user_data: *mut c_void,
    pub load: Option<NayanLoadFn>,
    pub run: Option<NayanRunFn>,
    pub close: Option<NayanCloseFn>,
}

/// Generation options for C ABI
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GenOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    /// 0 selects greedy decoding
    pub top_k: u32,
}

impl Default for GenOptions {
    fn default() -> Self {
        let config = GenerationConfig::default();
        Self {
            max_tokens: config.max_tokens as u32,
            temperature: config.temperature,
            top_k: config.top_k as u32,
        }
    }
}

impl From<GenOptions> for GenerationConfig {
    fn from(opts: GenOptions) -> Self {
        GenerationConfig {
            max_tokens: opts.max_tokens as usize,
            temperature: opts.temperature,
            top_k: opts.top_k as usize,
        }
    }
}

/// Forward pass implemented by host callbacks
pub struct ForeignBackend {
    user_data: *mut c_void,
    load: NayanLoadFn,
    run: NayanRunFn,
    close: NayanCloseFn,
}

// The host guarantees its callbacks and user_data may be used from any thread.
unsafe impl Send for ForeignBackend {}
unsafe impl Sync for ForeignBackend {}

impl ForeignBackend {
    fn from_vtable(vtable: &NayanBackendVTable) -> Option<Self> {
        Some(Self {
            user_data: vtable.user_data,
            load: vtable.load?,
            run: vtable.run?,
            close: vtable.close?,
        })
    }
}

fn host_error(what: &str, status: i32) -> BackendError {
    let message = format!("host {} callback returned status {}", what, status);
    if status == NAYAN_HOST_RESOURCE_EXHAUSTED {
        BackendError::resource(message)
    } else {
        BackendError::new(message)
    }
}

impl ForwardPass for ForeignBackend {
    type Handle = u64;

    fn load(&self, path: &Path, options: &LoadOptions) -> Result<u64, BackendError> {
        let path = path
            .to_str()
            .ok_or_else(|| BackendError::new(format!("model path is not UTF-8: {}", path.display())))?;
        let mut handle = 0u64;
        let status = unsafe {
            (self.load)(
                self.user_data,
                path.as_ptr(),
                path.len(),
                options.inter_op_threads as u32,
                options.intra_op_threads as u32,
                &mut handle,
            )
        };
        if status != NAYAN_HOST_OK {
            return Err(host_error("load", status));
        }
        Ok(handle)
    }

    fn run(&self, handle: &mut u64, input_ids: &[i64]) -> Result<Vec<f32>, BackendError> {
        let len = input_ids
            .len()
            .checked_mul(VOCAB_SIZE)
            .ok_or_else(|| BackendError::resource("score buffer size overflows usize"))?;
        let mut scores = Vec::new();
        scores
            .try_reserve_exact(len)
            .map_err(|e| BackendError::resource(format!("cannot allocate {} scores: {}", len, e)))?;
        scores.resize(len, 0.0f32);

        let status = unsafe {
            (self.run)(
                self.user_data,
                *handle,
                input_ids.as_ptr(),
                input_ids.len(),
                scores.as_mut_ptr(),
                scores.len(),
            )
        };
        if status != NAYAN_HOST_OK {
            return Err(host_error("run", status));
        }
        Ok(scores)
    }

    fn close(&self, handle: u64) -> Result<(), BackendError> {
        let status = unsafe { (self.close)(self.user_data, handle) };
        if status != NAYAN_HOST_OK {
            return Err(host_error("close", status));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

type HostEngine = InferenceEngine<ForeignBackend>;

struct Registry {
    config: RuntimeConfig,
    engines: HashMap<u32, Arc<HostEngine>>,
    next_id: u32,
}

// Global engine registry; engines are cloned out before any long call
static REGISTRY: Mutex<Option<Registry>> = parking_lot::const_mutex(None);

fn fail(error: Error) -> u32 {
    let code = ErrorCode::from(&error);
    set_last_error(error.to_string());
    code as u32
}

fn invalid_argument(message: &str) -> u32 {
    set_last_error(message.to_string());
    ErrorCode::InvalidArgument as u32
}

fn lookup(engine_id: u32) -> Result<Arc<HostEngine>, u32> {
    let registry = REGISTRY.lock();
    match registry.as_ref() {
        Some(registry) => registry
            .engines
            .get(&engine_id)
            .cloned()
            .ok_or_else(|| invalid_argument(&format!("Invalid engine id: {}", engine_id))),
        None => {
            set_last_error("Runtime not initialized".to_string());
            Err(ErrorCode::GenericFailure as u32)
        }
    }
}

unsafe fn utf8_arg<'a>(ptr: *const u8, len: usize, what: &str) -> Result<&'a str, u32> {
    if len == 0 {
        return Ok("");
    }
    if ptr.is_null() {
        return Err(invalid_argument(&format!("Invalid {} pointer", what)));
    }
    let bytes = slice::from_raw_parts(ptr, len);
    std::str::from_utf8(bytes)
        .map_err(|e| invalid_argument(&format!("Invalid UTF-8 in {}: {}", what, e)))
}

/// Initialize runtime with JSON config
///
/// The config applies to engines created afterwards. Calling it again keeps
/// existing engines.
///
/// # Safety
/// `config_ptr` must be valid for reads of `config_len` bytes, or null.
#[no_mangle]
pub unsafe extern "C" fn nayan_init(config_ptr: *const u8, config_len: usize) -> u32 {
    let config_str = match utf8_arg(config_ptr, config_len, "config") {
        Ok("") => "{}",
        Ok(s) => s,
        Err(code) => return code,
    };

    let config = match RuntimeConfig::from_json(config_str) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };

    let mut registry = REGISTRY.lock();
    match registry.as_mut() {
        Some(registry) => registry.config = config,
        None => {
            *registry = Some(Registry { config, engines: HashMap::new(), next_id: 1 });
            info!("nayan runtime initialized");
        }
    }
    ErrorCode::Ok as u32
}

/// Create an engine over host callbacks; writes its id (> 0) to `out_engine`
///
/// # Safety
/// `vtable` must point to a valid vtable whose callbacks stay callable, with
/// the same `user_data`, until the engine is destroyed. `out_engine` must be
/// valid for writes.
#[no_mangle]
pub unsafe extern "C" fn nayan_engine_create(
    vtable: *const NayanBackendVTable,
    out_engine: *mut u32,
) -> u32 {
    if vtable.is_null() || out_engine.is_null() {
        return invalid_argument("Invalid vtable or output pointer");
    }
    let backend = match ForeignBackend::from_vtable(&*vtable) {
        Some(backend) => backend,
        None => return invalid_argument("Backend vtable is missing a callback"),
    };

    let mut registry = REGISTRY.lock();
    let Some(registry) = registry.as_mut() else {
        set_last_error("Runtime not initialized".to_string());
        return ErrorCode::GenericFailure as u32;
    };

    let engine = EngineBuilder::new(backend).config(registry.config.clone()).build();
    let id = registry.next_id;
    registry.next_id = registry.next_id.wrapping_add(1).max(1);
    registry.engines.insert(id, Arc::new(engine));

    *out_engine = id;
    ErrorCode::Ok as u32
}

/// Load (or reload) a model by path
///
/// # Safety
/// `path_ptr` must be valid for reads of `path_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn nayan_load_model(engine_id: u32, path_ptr: *const u8, path_len: usize) -> u32 {
    let path = match utf8_arg(path_ptr, path_len, "path") {
        Ok("") => return invalid_argument("Empty model path"),
        Ok(s) => s,
        Err(code) => return code,
    };
    let engine = match lookup(engine_id) {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    match engine.load_model(path) {
        Ok(()) => ErrorCode::Ok as u32,
        Err(e) => fail(e),
    }
}

/// Run a blocking generation
///
/// On success writes an owned UTF-8 buffer to `out_text`/`out_len`; release
/// it with `nayan_free_text`. The text may contain NUL bytes. On failure
/// nothing is written.
///
/// # Safety
/// `prompt_ptr` must be valid for reads of `prompt_len` bytes.
/// `opts_ptr` must be valid for reads or null.
/// `out_text` and `out_len` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn nayan_generate(
    engine_id: u32,
    prompt_ptr: *const u8,
    prompt_len: usize,
    opts_ptr: *const GenOptions,
    out_text: *mut *mut u8,
    out_len: *mut usize,
) -> u32 {
    if out_text.is_null() || out_len.is_null() {
        return invalid_argument("Invalid output pointer");
    }
    let prompt = match utf8_arg(prompt_ptr, prompt_len, "prompt") {
        Ok(s) => s,
        Err(code) => return code,
    };
    let options = if opts_ptr.is_null() { GenOptions::default() } else { *opts_ptr };
    let engine = match lookup(engine_id) {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    match engine.generate(prompt, options.into()) {
        Ok(result) => {
            let bytes = result.text.into_bytes().into_boxed_slice();
            *out_len = bytes.len();
            *out_text = Box::into_raw(bytes) as *mut u8;
            ErrorCode::Ok as u32
        }
        Err(e) => fail(e),
    }
}

/// Free text returned by `nayan_generate`
///
/// # Safety
/// `ptr`/`len` must come from one successful `nayan_generate` call and must
/// not be freed twice. Null is ignored.
#[no_mangle]
pub unsafe extern "C" fn nayan_free_text(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    drop(Box::from_raw(slice::from_raw_parts_mut(ptr, len) as *mut [u8]));
}

/// Engine state as a code: 0 idle, 1 loading, 2 ready, 3 generating, 4 failed
pub fn state_code(state: &GenerationState) -> u32 {
    match state {
        GenerationState::Idle => 0,
        GenerationState::ModelLoading => 1,
        GenerationState::Ready => 2,
        GenerationState::Generating => 3,
        GenerationState::Failed(_) => 4,
    }
}

/// Write the engine state code to `out_state`
///
/// # Safety
/// `out_state` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn nayan_engine_state(engine_id: u32, out_state: *mut u32) -> u32 {
    if out_state.is_null() {
        return invalid_argument("Invalid output pointer");
    }
    match lookup(engine_id) {
        Ok(engine) => {
            *out_state = state_code(&engine.state());
            ErrorCode::Ok as u32
        }
        Err(code) => code,
    }
}

/// Release the engine's model and return it to idle
#[no_mangle]
pub extern "C" fn nayan_close(engine_id: u32) -> u32 {
    let engine = match lookup(engine_id) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    match engine.close() {
        Ok(()) => ErrorCode::Ok as u32,
        Err(e) => fail(e),
    }
}

/// Destroy an engine; a run in flight on another thread finishes first
#[no_mangle]
pub extern "C" fn nayan_engine_destroy(engine_id: u32) -> u32 {
    let removed = REGISTRY.lock().as_mut().and_then(|r| r.engines.remove(&engine_id));
    match removed {
        Some(_) => ErrorCode::Ok as u32,
        None => invalid_argument(&format!("Invalid engine id: {}", engine_id)),
    }
}

/// Get last error message
///
/// Returns number of bytes written to buffer, not counting the terminator.
///
/// # Safety
/// `buf_ptr` must be valid for writes of `buf_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn nayan_last_error(buf_ptr: *mut c_char, buf_len: usize) -> usize {
    if buf_ptr.is_null() || buf_len == 0 {
        return 0;
    }

    let error_msg = take_last_error().unwrap_or_else(|| "No error".to_string());
    let bytes = error_msg.as_bytes();
    let copy_len = bytes.len().min(buf_len - 1);

    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf_ptr as *mut u8, copy_len);
    *buf_ptr.add(copy_len) = 0;

    copy_len
}

/// Get runtime version string
#[no_mangle]
pub extern "C" fn nayan_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Host-side state behind `user_data`
    struct FakeHost {
        favourite: usize,
        closes: AtomicUsize,
    }

    unsafe extern "C" fn fake_load(
        _user_data: *mut c_void,
        path_ptr: *const u8,
        path_len: usize,
        _inter_op_threads: u32,
        _intra_op_threads: u32,
        out_handle: *mut u64,
    ) -> i32 {
        let path = std::str::from_utf8(slice::from_raw_parts(path_ptr, path_len)).unwrap();
        if path.contains("missing") {
            return 1;
        }
        *out_handle = 7;
        NAYAN_HOST_OK
    }

    unsafe extern "C" fn fake_run(
        user_data: *mut c_void,
        handle: u64,
        _ids_ptr: *const i64,
        _ids_len: usize,
        out_scores: *mut f32,
        out_len: usize,
    ) -> i32 {
        assert_eq!(handle, 7);
        let host = &*(user_data as *const FakeHost);
        let scores = slice::from_raw_parts_mut(out_scores, out_len);
        scores[out_len - VOCAB_SIZE + host.favourite] = 5.0;
        NAYAN_HOST_OK
    }

    unsafe extern "C" fn fake_close(user_data: *mut c_void, _handle: u64) -> i32 {
        let host = &*(user_data as *const FakeHost);
        host.closes.fetch_add(1, Ordering::SeqCst);
        NAYAN_HOST_OK
    }

    fn create_engine(host: &FakeHost) -> u32 {
        let config = br#"{"seed": 3}"#;
        assert_eq!(unsafe { nayan_init(config.as_ptr(), config.len()) }, ErrorCode::Ok as u32);

        let vtable = NayanBackendVTable {
            user_data: host as *const FakeHost as *mut c_void,
            load: Some(fake_load),
            run: Some(fake_run),
            close: Some(fake_close),
        };
        let mut id = 0;
        assert_eq!(unsafe { nayan_engine_create(&vtable, &mut id) }, ErrorCode::Ok as u32);
        assert!(id > 0);
        id
    }

    fn load(id: u32, path: &str) -> u32 {
        unsafe { nayan_load_model(id, path.as_ptr(), path.len()) }
    }

    fn generate(id: u32, prompt: &str, opts: &GenOptions) -> Result<Vec<u8>, u32> {
        let mut text = std::ptr::null_mut();
        let mut len = 0;
        let code = unsafe {
            nayan_generate(id, prompt.as_ptr(), prompt.len(), opts, &mut text, &mut len)
        };
        if code != ErrorCode::Ok as u32 {
            assert!(text.is_null());
            return Err(code);
        }
        let bytes = unsafe { slice::from_raw_parts(text, len) }.to_vec();
        unsafe { nayan_free_text(text, len) };
        Ok(bytes)
    }

    fn last_error() -> String {
        let mut buf = [0 as c_char; 256];
        unsafe { nayan_last_error(buf.as_mut_ptr(), buf.len()) };
        unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned()
    }

    fn state(id: u32) -> u32 {
        let mut code = u32::MAX;
        assert_eq!(unsafe { nayan_engine_state(id, &mut code) }, ErrorCode::Ok as u32);
        code
    }

    #[test]
    fn test_generate_through_host_callbacks() {
        let host = FakeHost { favourite: 'A' as usize, closes: AtomicUsize::new(0) };
        let id = create_engine(&host);
        assert_eq!(state(id), 0);

        assert_eq!(load(id, "/models/model.onnx"), ErrorCode::Ok as u32);
        assert_eq!(state(id), 2);

        let opts = GenOptions { max_tokens: 5, temperature: 0.8, top_k: 0 };
        assert_eq!(generate(id, "Hi", &opts).unwrap(), b"HiAAAAA");

        assert_eq!(nayan_close(id), ErrorCode::Ok as u32);
        assert_eq!(state(id), 0);
        assert_eq!(host.closes.load(Ordering::SeqCst), 1);
        assert_eq!(nayan_engine_destroy(id), ErrorCode::Ok as u32);
    }

    #[test]
    fn test_generate_before_load_reports_error_code() {
        let host = FakeHost { favourite: 'A' as usize, closes: AtomicUsize::new(0) };
        let id = create_engine(&host);

        let result = generate(id, "Hi", &GenOptions::default());
        assert_eq!(result, Err(ErrorCode::ModelNotLoaded as u32));
        assert!(last_error().contains("not loaded"));
        nayan_engine_destroy(id);
    }

    #[test]
    fn test_failed_load() {
        let host = FakeHost { favourite: 'A' as usize, closes: AtomicUsize::new(0) };
        let id = create_engine(&host);

        assert_eq!(load(id, "/models/missing.onnx"), ErrorCode::ModelLoadFailure as u32);
        assert_eq!(state(id), 4);
        assert_eq!(
            generate(id, "Hi", &GenOptions::default()),
            Err(ErrorCode::ModelNotLoaded as u32)
        );
        nayan_engine_destroy(id);
    }

    #[test]
    fn test_invalid_options() {
        let host = FakeHost { favourite: 'A' as usize, closes: AtomicUsize::new(0) };
        let id = create_engine(&host);
        load(id, "model.onnx");

        let opts = GenOptions { temperature: 0.0, ..Default::default() };
        assert_eq!(generate(id, "Hi", &opts), Err(ErrorCode::InvalidConfig as u32));
        assert_eq!(generate(id, "", &GenOptions::default()), Err(ErrorCode::InvalidArgument as u32));
        assert_eq!(state(id), 2);
        nayan_engine_destroy(id);
    }

    #[test]
    fn test_nul_fragment_survives() {
        let host = FakeHost { favourite: 0, closes: AtomicUsize::new(0) };
        let id = create_engine(&host);
        load(id, "model.onnx");

        let opts = GenOptions { max_tokens: 2, temperature: 1.0, top_k: 0 };
        assert_eq!(generate(id, "z", &opts).unwrap(), b"z\0\0");
        nayan_engine_destroy(id);
    }

    #[test]
    fn test_missing_callback_rejected() {
        let vtable = NayanBackendVTable {
            user_data: std::ptr::null_mut(),
            load: Some(fake_load),
            run: None,
            close: Some(fake_close),
        };
        let mut id = 0;
        let code = unsafe { nayan_engine_create(&vtable, &mut id) };
        assert_eq!(code, ErrorCode::InvalidArgument as u32);
        assert_eq!(id, 0);
    }

    #[test]
    fn test_unknown_engine() {
        let config = b"{}";
        unsafe { nayan_init(config.as_ptr(), config.len()) };
        assert_eq!(nayan_close(u32::MAX), ErrorCode::InvalidArgument as u32);
        assert_eq!(nayan_engine_destroy(u32::MAX), ErrorCode::InvalidArgument as u32);
    }

    #[test]
    fn test_bad_config_json() {
        let config = b"{\"block_size\": 0}";
        let code = unsafe { nayan_init(config.as_ptr(), config.len()) };
        assert_eq!(code, ErrorCode::InvalidConfig as u32);
    }

    #[test]
    fn test_version() {
        let ver_ptr = nayan_version();
        assert!(!ver_ptr.is_null());

        let c_str = unsafe { CStr::from_ptr(ver_ptr) };
        let version = c_str.to_str().unwrap();
        assert!(!version.is_empty());
    }
}
