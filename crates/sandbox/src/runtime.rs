use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use rustpython_pylib;
use rustpython_stdlib;
use rustpython_vm as vm;
use rustpython_vm::builtins::PyBaseException;
use rustpython_vm::scope::Scope;
use rustpython_vm::{Interpreter, InterpreterBuilder};
use serde_json::{Value, json};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::protocol::{CallPayload, OutputStream};

/// Outbound side of a running program: console output and calls into the host.
pub trait HostBridge: Send + Sync {
    fn output(&self, stream: OutputStream, text: &str);

    /// Blocks until the host answers the call.
    fn call(&self, command: &str, payload: Value) -> Result<Value, String>;

    /// Asks the host to push `event` to this program.
    fn subscribe(&self, event: &str);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// `"<ExceptionType>: <message>"` of an uncaught exception.
    pub error: Option<String>,
}

pub struct Runtime {
    interpreter: Interpreter,
    scope: Scope,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
}

impl Runtime {
    pub fn new(config: &SandboxConfig, bridge: Arc<dyn HostBridge>) -> Result<Self, SandboxError> {
        let builder = InterpreterBuilder::new();
        let interpreter = init_stdlib(builder).interpreter();
        let scope = interpreter
            .enter(|vm: &vm::VirtualMachine| {
                let scope = vm.new_scope_with_builtins();
                Ok(scope)
            })
            .map_err(|err: vm::PyRef<PyBaseException>| SandboxError::Init(format!("{err:?}")))?;

        let runtime = Self {
            interpreter,
            scope,
            subscriptions: Arc::default(),
        };
        runtime.install(config, bridge)?;
        Ok(runtime)
    }

    fn install(&self, config: &SandboxConfig, bridge: Arc<dyn HostBridge>) -> Result<(), SandboxError> {
        let scope = self.scope.clone();
        let subscriptions = self.subscriptions.clone();
        let allowed_modules = serde_json::to_string(&config.allowed_modules)
            .map_err(|err| SandboxError::Init(err.to_string()))?;

        self.interpreter
            .enter(move |vm: &vm::VirtualMachine| -> vm::PyResult<()> {
                let stdout_bridge = bridge.clone();
                let emit_stdout = vm.new_function(
                    "__hh_emit_stdout",
                    move |text: String| -> vm::PyResult<()> {
                        stdout_bridge.output(OutputStream::Stdout, &text);
                        Ok(())
                    },
                );
                scope
                    .globals
                    .set_item("__hh_emit_stdout", emit_stdout.into(), vm)?;

                let stderr_bridge = bridge.clone();
                let emit_stderr = vm.new_function(
                    "__hh_emit_stderr",
                    move |text: String| -> vm::PyResult<()> {
                        stderr_bridge.output(OutputStream::Stderr, &text);
                        Ok(())
                    },
                );
                scope
                    .globals
                    .set_item("__hh_emit_stderr", emit_stderr.into(), vm)?;

                let call_bridge = bridge.clone();
                let call_fn = vm.new_function(
                    "__hh_call",
                    move |request_json: String| -> vm::PyResult<String> {
                        let request: CallPayload = match serde_json::from_str(&request_json) {
                            Ok(request) => request,
                            Err(err) => {
                                return Ok(json!({ "error": format!("invalid call: {err}") }).to_string());
                            }
                        };
                        let response = match call_bridge.call(&request.command, request.payload) {
                            Ok(value) => json!({ "value": value }),
                            Err(error) => json!({ "error": error }),
                        };
                        Ok(response.to_string())
                    },
                );
                scope.globals.set_item("__hh_call", call_fn.into(), vm)?;

                let subscribe_bridge = bridge.clone();
                let subscribe_fn = vm.new_function(
                    "__hh_subscribe",
                    move |event: String| -> vm::PyResult<()> {
                        let added = subscriptions
                            .lock()
                            .map(|mut subscriptions| subscriptions.insert(event.clone()))
                            .unwrap_or(false);
                        if added {
                            subscribe_bridge.subscribe(&event);
                        }
                        Ok(())
                    },
                );
                scope
                    .globals
                    .set_item("__hh_subscribe", subscribe_fn.into(), vm)?;

                let allowed = format!("__hh_allowed_modules = set({allowed_modules})\n");
                let init_segments = [
                    ("module_name", "__name__ = '__main__'\n"),
                    (
                        "builtins_ref",
                        r#"__hh_builtins = __builtins__
if isinstance(__hh_builtins, dict):
    def __hh_get_builtin(name):
        return __hh_builtins.get(name)
else:
    def __hh_get_builtin(name):
        return getattr(__hh_builtins, name, None)
"#,
                    ),
                    (
                        "builtin_refs",
                        "__hh_exec_builtin = __hh_get_builtin('exec')\n__hh_globals_builtin = __hh_get_builtin('globals')\n__hh_import_builtin = __hh_get_builtin('__import__')\n",
                    ),
                    (
                        "streams",
                        r#"class __HhStream:
    def __init__(self, emit):
        self._emit = emit

    def write(self, text):
        text = str(text)
        if text:
            self._emit(text)
        return len(text)

    def flush(self):
        pass

__hh_sys = __hh_import_builtin('sys')
__hh_sys.stdout = __HhStream(__hh_emit_stdout)
__hh_sys.stderr = __HhStream(__hh_emit_stderr)
del __hh_sys
"#,
                    ),
                    (
                        "safe_list",
                        r#"__hh_safe_builtin_names = [
    "print", "len", "str", "int", "float", "list", "dict", "set", "tuple", "bool",
    "type", "isinstance", "enumerate", "zip", "map", "filter", "sorted", "min", "max",
    "sum", "abs", "round", "chr", "ord", "hex", "bin", "oct", "repr", "ascii", "format",
    "__import__", "__build_class__", "any", "all", "hasattr", "getattr", "setattr",
    "delattr", "dir", "range", "reversed", "slice", "iter", "next", "pow", "divmod",
    "complex", "bytes", "bytearray", "hash", "id", "callable", "issubclass", "super",
    "property", "staticmethod", "classmethod", "object", "BaseException", "ArithmeticError",
    "LookupError", "AssertionError", "NotImplementedError", "ZeroDivisionError",
    "OverflowError", "UnicodeError", "Warning", "UserWarning", "RuntimeWarning", "Exception",
    "ValueError", "TypeError", "KeyError", "IndexError", "AttributeError", "RuntimeError", "NameError",
    "ImportError", "StopIteration", "GeneratorExit", "SystemExit", "KeyboardInterrupt",
    "PermissionError", "RecursionError",
]"#,
                    ),
                    (
                        "safe_builtins",
                        "__hh_safe_builtins = {}\nfor __hh_name in __hh_safe_builtin_names:\n    __hh_value = __hh_get_builtin(__hh_name)\n    if __hh_value is not None:\n        __hh_safe_builtins[__hh_name] = __hh_value\n",
                    ),
                    (
                        "safe_blocklist",
                        "for __hh_name in [\"open\", \"input\", \"eval\", \"exec\", \"compile\", \"globals\", \"locals\", \"vars\", \"breakpoint\"]:\n    __hh_safe_builtins[__hh_name] = None\n",
                    ),
                    ("allowed_modules", allowed.as_str()),
                    (
                        "safe_imports",
                        r#"__hh_user_globals = __hh_globals_builtin()
__hh_builtins_module = __hh_import_builtin('builtins')

def __hh_safe_import(name, globals=None, locals=None, fromlist=(), level=0, _import=__hh_import_builtin):
    if globals is None or globals is __hh_user_globals:
        root = name.split('.')[0]
        if level != 0 or root not in __hh_allowed_modules:
            raise ImportError(f"Import of '{root}' is blocked")
    return _import(name, globals, locals, fromlist, level)

__hh_safe_builtins['__import__'] = __hh_safe_import
__hh_builtins_module.__import__ = __hh_safe_import
del __hh_builtins_module
"#,
                    ),
                    (
                        "sdk",
                        r#"__hh_json = __hh_import_builtin('json')
__hh_time = __hh_import_builtin('time')

def sleep(ms):
    __hh_time.sleep(max(ms, 0) / 1000)

def call(command, payload=None):
    request = __hh_json.dumps({"command": str(command), "payload": payload}, default=str)
    response = __hh_json.loads(__hh_call(request))
    if "error" in response:
        raise RuntimeError(response["error"])
    return response.get("value")

__hh_handlers = {}

def on(event, handler, _handlers=__hh_handlers, _subscribe=__hh_subscribe):
    event = str(event)
    _handlers.setdefault(event, []).append(handler)
    _subscribe(event)

def __hh_dispatch(event, payload_json, _handlers=__hh_handlers):
    payload = __hh_json.loads(payload_json)
    try:
        for handler in list(_handlers.get(event, ())):
            handler(payload)
    except BaseException as error:
        return type(error).__name__ + ": " + str(error)
    return None
"#,
                    ),
                    (
                        "run",
                        r#"def __hh_run(code, _exec=__hh_exec_builtin, _globals=__hh_globals_builtin):
    try:
        _exec(code, _globals())
    except BaseException as error:
        return type(error).__name__ + ": " + str(error)
    return None
"#,
                    ),
                    (
                        "cleanup",
                        r#"del __hh_import_builtin
del __hh_exec_builtin
del __hh_globals_builtin
del __hh_get_builtin
del __hh_builtins
del __hh_safe_builtin_names
del __hh_name
del __hh_value
"#,
                    ),
                    ("builtins_assign", "__builtins__ = __hh_safe_builtins\n"),
                ];

                for (label, code) in init_segments {
                    vm.run_string(scope.clone(), code, &format!("<hh_init_{label}>"))?;
                }
                Ok(())
            })
            .map_err(|err: vm::PyRef<PyBaseException>| SandboxError::Init(format!("{err:?}")))
    }

    /// Whether the program registered at least one event handler.
    pub fn is_listening(&self) -> bool {
        self.subscriptions
            .lock()
            .map(|subscriptions| !subscriptions.is_empty())
            .unwrap_or(false)
    }

    /// Runs every handler registered for `event`, in registration order.
    pub fn dispatch_event(&self, event: &str, payload: &Value) -> Result<Evaluation, SandboxError> {
        let scope = self.scope.clone();
        self.interpreter
            .enter(|vm: &vm::VirtualMachine| -> vm::PyResult<Evaluation> {
                scope
                    .globals
                    .set_item("__hh_event", vm.ctx.new_str(event).into(), vm)?;
                scope.globals.set_item(
                    "__hh_event_payload",
                    vm.ctx.new_str(payload.to_string()).into(),
                    vm,
                )?;
                vm.run_string(
                    scope.clone(),
                    "__hh_error = __hh_dispatch(__hh_event, __hh_event_payload)\n",
                    "<hh_event>",
                )?;
                Ok(Evaluation {
                    error: get_string_from_scope(vm, &scope, "__hh_error"),
                })
            })
            .map_err(|err: vm::PyRef<PyBaseException>| SandboxError::Exec(format!("{err:?}")))
    }

    /// Evaluates `code` in the global scope and returns once the call has returned.
    ///
    /// An uncaught exception ends up in [`Evaluation::error`]; it is never
    /// surfaced as an `Err`, which is reserved for interpreter failures.
    pub fn evaluate(&self, code: &str) -> Result<Evaluation, SandboxError> {
        let scope = self.scope.clone();
        self.interpreter
            .enter(|vm: &vm::VirtualMachine| -> vm::PyResult<Evaluation> {
                scope
                    .globals
                    .set_item("__hh_code", vm.ctx.new_str(code).into(), vm)?;
                vm.run_string(
                    scope.clone(),
                    "__hh_error = __hh_run(__hh_code)\n",
                    "<hh_exec>",
                )?;
                Ok(Evaluation {
                    error: get_string_from_scope(vm, &scope, "__hh_error"),
                })
            })
            .map_err(|err: vm::PyRef<PyBaseException>| SandboxError::Exec(format!("{err:?}")))
    }
}

fn init_stdlib(builder: InterpreterBuilder) -> InterpreterBuilder {
    let defs = rustpython_stdlib::stdlib_module_defs(&builder.ctx);
    builder
        .add_native_modules(&defs)
        .add_frozen_modules(rustpython_pylib::FROZEN_STDLIB)
        .init_hook(set_frozen_stdlib_dir)
}

fn set_frozen_stdlib_dir(vm: &mut vm::VirtualMachine) {
    use rustpython_vm::common::rc::PyRc;

    if let Some(state) = PyRc::get_mut(&mut vm.state) {
        state.config.paths.stdlib_dir = Some(rustpython_pylib::LIB_PATH.to_owned());
    }
}

fn get_string_from_scope(vm: &vm::VirtualMachine, scope: &Scope, name: &str) -> Option<String> {
    scope
        .globals
        .get_item(name, vm)
        .ok()
        .and_then(|value| value.try_to_value::<String>(vm).ok())
}
