//! Sandboxed module execution host.
//!
//! Guest binaries are compiled once per `(name, byte length)` key and kept
//! in a bounded LRU cache; every call gets a fresh store, so no state leaks
//! between invocations. Guests interact with the shell only through the
//! import ABI under the `env` namespace: `write_stdout`, `write_stderr`,
//! `read_stdin`, `get_argc`, `get_arg`, `get_env`, and `set_exit_code`,
//! plus a host-provided `env.memory` for modules that import rather than
//! export their linear memory.
//!
//! Runaway guests are preempted two ways: an epoch deadline (a background
//! ticker thread advances the engine epoch, so a spinning guest traps even
//! though it never yields) and a wall-clock timeout around the call future.
//! Either path surfaces as [`ModuleError::Timeout`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use wasmtime::{
    Caller, Config, Engine, Extern, Linker, Memory, MemoryType, Module, ResourceLimiter, Store,
    Trap, TypedFunc,
};

use crate::config::RuntimeConfig;
use crate::error::{ModuleDiagnostics, ModuleError};
use crate::result::ExecutionResult;

use super::cache::LruCache;

/// Interval between engine epoch increments.
const EPOCH_TICK: Duration = Duration::from_millis(10);

const WASM_PAGE: u64 = 65536;

/// Cache key for compiled modules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ModuleKey {
    name: String,
    len: usize,
}

/// Inputs for one guest call.
#[derive(Debug, Clone, Default)]
pub struct ModuleInvocation {
    /// Shell arguments; argument 0 seen by the guest is the invoked
    /// function name, these follow.
    pub args: Vec<String>,
    /// Environment variables visible through `get_env`.
    pub env: HashMap<String, String>,
    /// Text available through `read_stdin`.
    pub stdin: String,
}

/// Per-call guest state stored alongside the wasmtime store.
struct GuestState {
    argv: Vec<String>,
    env: HashMap<String, String>,
    stdin: Vec<u8>,
    stdin_pos: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
    host_memory: Option<Memory>,
    limiter: MemoryLimiter,
}

/// Caps guest linear-memory growth at the configured maximum.
struct MemoryLimiter {
    max_memory: u64,
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired as u64 <= self.max_memory || current == desired)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        _desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(true)
    }
}

enum EntryFunc {
    Int(TypedFunc<(), i32>),
    Unit(TypedFunc<(), ()>),
}

/// Compiles, caches, and executes guest modules.
pub struct ModuleHost {
    engine: Engine,
    config: RuntimeConfig,
    cache: LruCache<ModuleKey, Module>,
    compile_count: AtomicU64,
}

impl ModuleHost {
    /// Build a host with its own engine and epoch ticker thread. The ticker
    /// holds a weak engine handle and exits once the host is dropped.
    pub fn new(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        let engine = Engine::new(&wasm_config)?;

        let weak = engine.weak();
        std::thread::spawn(move || loop {
            std::thread::sleep(EPOCH_TICK);
            match weak.upgrade() {
                Some(engine) => engine.increment_epoch(),
                None => break,
            }
        });

        Ok(Self {
            engine,
            config: config.clone(),
            cache: LruCache::new(config.cache_size),
            compile_count: AtomicU64::new(0),
        })
    }

    /// Number of underlying compiles performed so far.
    pub fn compile_count(&self) -> u64 {
        self.compile_count.load(Ordering::Relaxed)
    }

    /// Number of modules currently cached.
    pub fn cached_modules(&self) -> usize {
        self.cache.len()
    }

    /// Drop a module from the cache. Idempotent; per-call stores mean any
    /// transient I/O state is gone already.
    pub fn unload(&self, name: &str, byte_len: usize) -> bool {
        self.cache.remove(&ModuleKey {
            name: name.to_string(),
            len: byte_len,
        })
    }

    fn load(&self, name: &str, binary: &[u8]) -> Result<Module, ModuleError> {
        let key = ModuleKey {
            name: name.to_string(),
            len: binary.len(),
        };
        if let Some(module) = self.cache.get(&key) {
            tracing::debug!(module = name, "module cache hit");
            return Ok(module);
        }
        let module = Module::new(&self.engine, binary).map_err(|e| ModuleError::Load {
            module: name.to_string(),
            reason: e.to_string(),
        })?;
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(key, module.clone());
        tracing::debug!(module = name, bytes = binary.len(), "module compiled");
        Ok(module)
    }

    /// Execute one exported function of a guest binary.
    pub async fn execute(
        &self,
        name: &str,
        binary: &[u8],
        function: &str,
        invocation: ModuleInvocation,
    ) -> Result<ExecutionResult, ModuleError> {
        let started = Instant::now();
        let module = self.load(name, binary)?;

        let mut argv = Vec::with_capacity(invocation.args.len() + 1);
        argv.push(function.to_string());
        argv.extend(invocation.args);

        let state = GuestState {
            argv,
            env: invocation.env,
            stdin: invocation.stdin.into_bytes(),
            stdin_pos: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: 0,
            host_memory: None,
            limiter: MemoryLimiter {
                max_memory: self.config.max_memory_pages * WASM_PAGE,
            },
        };

        let mut store = Store::new(&self.engine, state);
        store.limiter(|s| &mut s.limiter);
        store.epoch_deadline_trap();
        let ticks = (self.config.execution_timeout.as_millis() as u64
            / EPOCH_TICK.as_millis() as u64)
            .max(1)
            + 1;
        store.set_epoch_deadline(ticks);

        let memory_ty = MemoryType::new(
            self.config.min_memory_pages as u32,
            Some(self.config.max_memory_pages as u32),
        );
        let host_memory =
            Memory::new(&mut store, memory_ty).map_err(|e| ModuleError::Memory {
                module: name.to_string(),
                reason: e.to_string(),
            })?;
        store.data_mut().host_memory = Some(host_memory);

        let mut linker: Linker<GuestState> = Linker::new(&self.engine);
        linker
            .define(&store, "env", "memory", host_memory)
            .and_then(|linker| add_shell_imports(linker))
            .map_err(|e| ModuleError::Load {
                module: name.to_string(),
                reason: e.to_string(),
            })?;

        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| ModuleError::Load {
                module: name.to_string(),
                reason: e.to_string(),
            })?;

        let entry = instance
            .get_func(&mut store, function)
            .and_then(|func| {
                if let Ok(f) = func.typed::<(), i32>(&store) {
                    Some(EntryFunc::Int(f))
                } else if let Ok(f) = func.typed::<(), ()>(&store) {
                    Some(EntryFunc::Unit(f))
                } else {
                    None
                }
            })
            .ok_or_else(|| ModuleError::Execution {
                module: name.to_string(),
                reason: format!("export `{}` not found or not callable", function),
                diagnostics: ModuleDiagnostics::default(),
            })?;

        let budget = self.config.execution_timeout;
        let outcome = tokio::time::timeout(budget, async {
            match entry {
                EntryFunc::Int(f) => f.call_async(&mut store, ()).await.map(Some),
                EntryFunc::Unit(f) => f.call_async(&mut store, ()).await.map(|()| None),
            }
        })
        .await;

        let execution_time = started.elapsed();
        match outcome {
            Err(_) => Err(ModuleError::Timeout {
                module: name.to_string(),
                timeout: budget,
                diagnostics: diagnostics(&store, execution_time),
            }),
            Ok(Err(e)) => {
                if matches!(e.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
                    Err(ModuleError::Timeout {
                        module: name.to_string(),
                        timeout: budget,
                        diagnostics: diagnostics(&store, execution_time),
                    })
                } else {
                    Err(ModuleError::Execution {
                        module: name.to_string(),
                        reason: e.to_string(),
                        diagnostics: diagnostics(&store, execution_time),
                    })
                }
            }
            Ok(Ok(returned)) => {
                let state = store.data();
                // An explicit set_exit_code wins over the return value.
                let exit_code = if state.exit_code != 0 {
                    state.exit_code
                } else {
                    returned.unwrap_or(0)
                };
                Ok(ExecutionResult {
                    process_id: 0,
                    command: String::new(),
                    stdout: String::from_utf8_lossy(&state.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&state.stderr).into_owned(),
                    exit_code,
                    execution_time,
                })
            }
        }
    }
}

fn diagnostics(store: &Store<GuestState>, execution_time: Duration) -> ModuleDiagnostics {
    let state = store.data();
    ModuleDiagnostics {
        process_id: 0,
        execution_time,
        stdout: String::from_utf8_lossy(&state.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&state.stderr).into_owned(),
    }
}

fn add_shell_imports(linker: &mut Linker<GuestState>) -> wasmtime::Result<&mut Linker<GuestState>> {
    linker.func_wrap(
        "env",
        "write_stdout",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
            if let Some(bytes) = read_guest(&mut caller, ptr, len) {
                caller.data_mut().stdout.extend_from_slice(&bytes);
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "write_stderr",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
            if let Some(bytes) = read_guest(&mut caller, ptr, len) {
                caller.data_mut().stderr.extend_from_slice(&bytes);
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "read_stdin",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> i32 {
            let chunk = {
                let state = caller.data();
                let remaining = &state.stdin[state.stdin_pos..];
                let n = remaining.len().min(len.max(0) as usize);
                remaining[..n].to_vec()
            };
            if chunk.is_empty() {
                return 0;
            }
            if write_guest(&mut caller, ptr, &chunk) {
                caller.data_mut().stdin_pos += chunk.len();
                chunk.len() as i32
            } else {
                0
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_argc",
        |caller: Caller<'_, GuestState>| -> i32 { caller.data().argv.len() as i32 },
    )?;

    linker.func_wrap(
        "env",
        "get_arg",
        |mut caller: Caller<'_, GuestState>, index: i32, ptr: i32, len: i32| -> i32 {
            let arg = if index >= 0 {
                caller.data().argv.get(index as usize).cloned()
            } else {
                None
            };
            let Some(arg) = arg else { return -1 };
            let n = arg.len().min(len.max(0) as usize);
            let bytes = arg.as_bytes()[..n].to_vec();
            if write_guest(&mut caller, ptr, &bytes) {
                n as i32
            } else {
                0
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_env",
        |mut caller: Caller<'_, GuestState>,
         key_ptr: i32,
         key_len: i32,
         ptr: i32,
         len: i32|
         -> i32 {
            let Some(key) = read_guest(&mut caller, key_ptr, key_len) else {
                return -1;
            };
            let key = String::from_utf8_lossy(&key).into_owned();
            let Some(value) = caller.data().env.get(key.trim()).cloned() else {
                return -1;
            };
            let n = value.len().min(len.max(0) as usize);
            let bytes = value.as_bytes()[..n].to_vec();
            if write_guest(&mut caller, ptr, &bytes) {
                n as i32
            } else {
                0
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "set_exit_code",
        |mut caller: Caller<'_, GuestState>, code: i32| {
            caller.data_mut().exit_code = code;
        },
    )?;

    Ok(linker)
}

fn exported_memory(caller: &mut Caller<'_, GuestState>) -> Option<Memory> {
    caller.get_export("memory").and_then(Extern::into_memory)
}

/// Read bytes out of guest memory with bounds validation. When both a
/// guest-exported memory and the host-provided `env.memory` exist, the
/// region holding live (non-zero) data wins; a best-effort shim for modules
/// that export their own memory instead of using the import.
fn read_guest(caller: &mut Caller<'_, GuestState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    if ptr < 0 || len < 0 {
        tracing::warn!(ptr, len, "guest memory read with negative offset");
        return None;
    }
    let (ptr, len) = (ptr as usize, len as usize);

    let mut regions = Vec::new();
    if let Some(memory) = exported_memory(caller) {
        regions.push(memory);
    }
    if let Some(memory) = caller.data().host_memory {
        regions.push(memory);
    }

    let mut slices: Vec<Vec<u8>> = Vec::new();
    for memory in regions {
        let data = memory.data(&mut *caller);
        if let Some(end) = ptr.checked_add(len) {
            if end <= data.len() {
                slices.push(data[ptr..end].to_vec());
            }
        }
    }
    if slices.is_empty() {
        tracing::warn!(ptr, len, "guest memory read out of bounds");
        return None;
    }
    match slices.iter().position(|s| s.iter().any(|&b| b != 0)) {
        Some(i) => Some(slices.swap_remove(i)),
        None => Some(slices.swap_remove(0)),
    }
}

/// Write bytes into guest memory with bounds validation. Prefers the
/// guest-exported memory, falling back to the host-provided import.
fn write_guest(caller: &mut Caller<'_, GuestState>, ptr: i32, bytes: &[u8]) -> bool {
    if ptr < 0 {
        tracing::warn!(ptr, "guest memory write with negative offset");
        return false;
    }
    let ptr = ptr as usize;
    let Some(memory) = exported_memory(caller).or(caller.data().host_memory) else {
        tracing::warn!("guest has no accessible memory");
        return false;
    };
    let data = memory.data_mut(&mut *caller);
    let Some(end) = ptr.checked_add(bytes.len()) else {
        return false;
    };
    if end > data.len() {
        tracing::warn!(ptr, len = bytes.len(), "guest memory write out of bounds");
        return false;
    }
    data[ptr..end].copy_from_slice(bytes);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> ModuleHost {
        ModuleHost::new(&RuntimeConfig::default()).unwrap()
    }

    fn wasm(wat: &str) -> Vec<u8> {
        wat::parse_str(wat).unwrap()
    }

    const HELLO: &str = r#"
        (module
          (import "env" "write_stdout" (func $ws (param i32 i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "hello\n")
          (func (export "main") (call $ws (i32.const 0) (i32.const 6))))
    "#;

    #[tokio::test]
    async fn test_execute_writes_stdout() {
        let result = host()
            .execute("hello", &wasm(HELLO), "main", ModuleInvocation::default())
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_set_exit_code_wins() {
        let wat = r#"
            (module
              (import "env" "set_exit_code" (func $ec (param i32)))
              (func (export "main") (result i32)
                (call $ec (i32.const 7))
                (i32.const 3)))
        "#;
        let result = host()
            .execute("codes", &wasm(wat), "main", ModuleInvocation::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn test_main_return_value_is_exit_code() {
        let wat = r#"(module (func (export "main") (result i32) (i32.const 3)))"#;
        let result = host()
            .execute("ret", &wasm(wat), "main", ModuleInvocation::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_args_reach_guest() {
        // Copies argv[1] into memory and echoes it back.
        let wat = r#"
            (module
              (import "env" "get_arg" (func $ga (param i32 i32 i32) (result i32)))
              (import "env" "write_stdout" (func $ws (param i32 i32)))
              (memory (export "memory") 1)
              (func (export "main")
                (call $ws (i32.const 0) (call $ga (i32.const 1) (i32.const 0) (i32.const 64)))))
        "#;
        let invocation = ModuleInvocation {
            args: vec!["world".to_string()],
            ..Default::default()
        };
        let result = host().execute("argecho", &wasm(wat), "main", invocation).await.unwrap();
        assert_eq!(result.stdout, "world");
    }

    #[tokio::test]
    async fn test_env_lookup() {
        let wat = r#"
            (module
              (import "env" "get_env" (func $ge (param i32 i32 i32 i32) (result i32)))
              (import "env" "write_stdout" (func $ws (param i32 i32)))
              (memory (export "memory") 1)
              (data (i32.const 0) "GREETING")
              (func (export "main")
                (call $ws
                  (i32.const 64)
                  (call $ge (i32.const 0) (i32.const 8) (i32.const 64) (i32.const 64)))))
        "#;
        let mut invocation = ModuleInvocation::default();
        invocation.env.insert("GREETING".into(), "hi".into());
        let result = host().execute("envmod", &wasm(wat), "main", invocation).await.unwrap();
        assert_eq!(result.stdout, "hi");
    }

    #[tokio::test]
    async fn test_stdin_echo() {
        let wat = r#"
            (module
              (import "env" "read_stdin" (func $rs (param i32 i32) (result i32)))
              (import "env" "write_stdout" (func $ws (param i32 i32)))
              (memory (export "memory") 1)
              (func (export "main")
                (call $ws (i32.const 0) (call $rs (i32.const 0) (i32.const 1024)))))
        "#;
        let invocation = ModuleInvocation {
            stdin: "piped in".to_string(),
            ..Default::default()
        };
        let result = host().execute("stdin", &wasm(wat), "main", invocation).await.unwrap();
        assert_eq!(result.stdout, "piped in");
    }

    #[tokio::test]
    async fn test_host_memory_import() {
        // The module imports env.memory instead of exporting its own.
        let wat = r#"
            (module
              (import "env" "memory" (memory 2 256))
              (import "env" "write_stdout" (func $ws (param i32 i32)))
              (data (i32.const 0) "via host\n")
              (func (export "main") (call $ws (i32.const 0) (i32.const 9))))
        "#;
        let result = host()
            .execute("hostmem", &wasm(wat), "main", ModuleInvocation::default())
            .await
            .unwrap();
        assert_eq!(result.stdout, "via host\n");
    }

    #[tokio::test]
    async fn test_out_of_bounds_read_is_noop() {
        let wat = r#"
            (module
              (import "env" "write_stdout" (func $ws (param i32 i32)))
              (memory (export "memory") 1)
              (func (export "main") (call $ws (i32.const 166777216) (i32.const 16))))
        "#;
        let result = host()
            .execute("oob", &wasm(wat), "main", ModuleInvocation::default())
            .await
            .unwrap();
        assert_eq!(result.stdout, "");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_load_error_names_module() {
        let err = host()
            .execute("tool", &[0u8; 10], "main", ModuleInvocation::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::Load { .. }));
        assert_eq!(err.module_name(), "tool");
    }

    #[tokio::test]
    async fn test_missing_export_is_execution_error() {
        let wat = r#"(module (func (export "other")))"#;
        let err = host()
            .execute("noent", &wasm(wat), "main", ModuleInvocation::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::Execution { .. }));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_recompile() {
        let host = host();
        let binary = wasm(HELLO);
        host.execute("hello", &binary, "main", ModuleInvocation::default())
            .await
            .unwrap();
        host.execute("hello", &binary, "main", ModuleInvocation::default())
            .await
            .unwrap();
        assert_eq!(host.compile_count(), 1);
        assert_eq!(host.cached_modules(), 1);

        // A different name is a different key.
        host.execute("hello2", &binary, "main", ModuleInvocation::default())
            .await
            .unwrap();
        assert_eq!(host.compile_count(), 2);
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let host = host();
        let binary = wasm(HELLO);
        host.execute("hello", &binary, "main", ModuleInvocation::default())
            .await
            .unwrap();
        assert!(host.unload("hello", binary.len()));
        assert!(!host.unload("hello", binary.len()));
    }

    #[tokio::test]
    async fn test_spinning_guest_times_out() {
        let config = RuntimeConfig {
            execution_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let host = ModuleHost::new(&config).unwrap();
        let wat = r#"(module (func (export "main") (loop $l (br $l))))"#;
        let err = host
            .execute("spin", &wasm(wat), "main", ModuleInvocation::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::Timeout { .. }));
    }
}
