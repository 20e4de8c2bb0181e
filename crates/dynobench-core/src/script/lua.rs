//! Lua-backed test scripts (sandboxed)

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mlua::{
    FromLua, Function, IntoLua, IntoLuaMulti, Lua, LuaOptions, LuaSerdeExt, MultiValue, StdLib,
    Value as LuaValue, Variadic,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EntryPoint, Params, ScriptError, Scriptable};
use crate::protocol::Telemetry;
use crate::signal::CancelSignal;
use crate::value::Value;

tokio::task_local! {
    /// Cancellation of the invocation currently running on this task
    static ENTRY_CANCEL: CancellationToken;
}

/// Globals installed by [`LuaScript::bind`] besides the device commands
const SANDBOX_GLOBALS: [&str; 4] = ["stop", "sleep", "intParam", "strParam"];

#[derive(Debug, thiserror::Error)]
#[error("stop requested: {0}")]
struct StopRequest(String);

fn is_stop(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::CallbackError { cause, .. } => is_stop(cause),
        mlua::Error::WithContext { cause, .. } => is_stop(cause),
        mlua::Error::ExternalError(err) => err.downcast_ref::<StopRequest>().is_some(),
        _ => false,
    }
}

impl ScriptError {
    fn from_lua(err: mlua::Error) -> Self {
        if is_stop(&err) {
            ScriptError::Stopped
        } else {
            ScriptError::Runtime(err)
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FromLua for Value {
    fn from_lua(value: LuaValue, _: &Lua) -> mlua::Result<Self> {
        match value {
            LuaValue::Integer(n) => Ok(Value::Int(n)),
            LuaValue::Number(n) => Ok(Value::Int(n.trunc() as i64)),
            LuaValue::String(s) => Ok(Value::Str(s.to_string_lossy().to_string())),
            other => Err(mlua::Error::RuntimeError(format!(
                "unsupported argument type: {}",
                other.type_name()
            ))),
        }
    }
}

/// Positional command arguments; trailing nils are dropped, gaps rejected
fn command_args(lua: &Lua, name: &str, mut args: Variadic<LuaValue>) -> mlua::Result<Vec<Value>> {
    while matches!(args.last(), Some(LuaValue::Nil)) {
        args.pop();
    }
    args.iter()
        .enumerate()
        .map(|(i, arg)| match arg {
            LuaValue::Nil => Err(mlua::Error::RuntimeError(format!(
                "{name}: argument {} is nil",
                i + 1
            ))),
            arg => Value::from_lua(arg.clone(), lua),
        })
        .collect()
}

impl IntoLua for Value {
    fn into_lua(self, lua: &Lua) -> mlua::Result<LuaValue> {
        match self {
            Value::Int(n) => Ok(LuaValue::Integer(n)),
            Value::Str(s) => lua.create_string(&s).map(LuaValue::String),
        }
    }
}

/// Telemetry reaches scripts as a table keyed by the export column names
impl IntoLua for Telemetry {
    fn into_lua(self, lua: &Lua) -> mlua::Result<LuaValue> {
        lua.to_value(&self)
    }
}

struct Invocation {
    args: MultiValue,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<(), ScriptError>>,
}

#[derive(Default)]
struct ScriptState {
    /// One persistent worker per entry point, created on first use
    threads: HashMap<EntryPoint, mpsc::UnboundedSender<Invocation>>,
}

struct ScriptInner {
    lua: Lua,
    entries: HashMap<EntryPoint, Function>,
    params: Arc<Params>,
    state: Mutex<ScriptState>,
    shutdown: CancellationToken,
}

impl Drop for ScriptInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A loaded test script
///
/// Cheap to clone; clones share one interpreter. Each instance has its own
/// interpreter, so script-local state never leaks between instances.
#[derive(Clone)]
pub struct LuaScript {
    inner: Arc<ScriptInner>,
}

impl LuaScript {
    /// Evaluate `source` and collect its entry points
    pub fn load(source: &str, params: Params) -> Result<Self, ScriptError> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::new().catch_rust_panics(true),
        )
        .map_err(ScriptError::Load)?;

        let exported = lua
            .load(source)
            .set_name("script")
            .eval::<LuaValue>()
            .map_err(ScriptError::Load)?;
        let LuaValue::Table(table) = exported else {
            return Err(ScriptError::NoEntryTable);
        };

        let mut entries = HashMap::new();
        for pair in table.pairs::<LuaValue, LuaValue>() {
            let (key, value) = pair.map_err(ScriptError::Load)?;
            let (LuaValue::String(key), LuaValue::Function(func)) = (key, value) else {
                continue;
            };
            if let Ok(entry) = key.to_string_lossy().parse::<EntryPoint>() {
                entries.insert(entry, func);
            }
        }

        let globals = lua.globals();
        for entry in EntryPoint::ALL {
            if entries.contains_key(&entry) {
                continue;
            }
            if let Ok(LuaValue::Function(func)) = globals.get::<LuaValue>(entry.name()) {
                entries.insert(entry, func);
            }
        }

        if !entries.contains_key(&EntryPoint::Test) {
            return Err(ScriptError::MissingTest);
        }
        debug!(entries = entries.len(), "script loaded");

        Ok(Self {
            inner: Arc::new(ScriptInner {
                lua,
                entries,
                params: Arc::new(params),
                state: Mutex::new(ScriptState::default()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Whether the script defines `entry`
    pub fn has_entry(&self, entry: EntryPoint) -> bool {
        self.inner.entries.contains_key(&entry)
    }

    /// Operator parameters
    pub fn params(&self) -> &Params {
        &self.inner.params
    }

    /// Install `target`'s commands and the sandbox globals
    ///
    /// Everything installed here is removed again when the returned
    /// [`Binding`] is released or dropped.
    pub fn bind(&self, target: Arc<dyn Scriptable>) -> Result<Binding, ScriptError> {
        let _state = lock(&self.inner.state);
        let names = self.install(target).map_err(ScriptError::Runtime)?;
        Ok(Binding {
            script: self.clone(),
            names,
            released: false,
        })
    }

    fn install(&self, target: Arc<dyn Scriptable>) -> mlua::Result<Vec<&'static str>> {
        let lua = &self.inner.lua;
        let globals = lua.globals();

        let stop = lua.create_function(|_, message: Option<String>| -> mlua::Result<()> {
            let message = message.unwrap_or_default();
            info!(%message, "script requested stop");
            Err(mlua::Error::external(StopRequest(message)))
        })?;

        let sleep = lua.create_async_function(|_, ms: i64| async move {
            let duration = Duration::from_millis(ms.max(0) as u64);
            match ENTRY_CANCEL.try_with(CancellationToken::clone) {
                Ok(cancel) => tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(duration) => {}
                },
                Err(_) => tokio::time::sleep(duration).await,
            }
            Ok::<(), mlua::Error>(())
        })?;

        let params = self.inner.params.clone();
        let int_param =
            lua.create_function(move |_, (name, default): (String, Option<i64>)| {
                Ok(params
                    .get(&name)
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    .unwrap_or(default.unwrap_or(0)))
            })?;

        let params = self.inner.params.clone();
        let str_param =
            lua.create_function(move |_, (name, default): (String, Option<String>)| {
                Ok(params
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| default.unwrap_or_default()))
            })?;

        globals.set("stop", stop)?;
        globals.set("sleep", sleep)?;
        globals.set("intParam", int_param)?;
        globals.set("strParam", str_param)?;

        let mut names = SANDBOX_GLOBALS.to_vec();
        for name in target.methods() {
            let target = target.clone();
            let command =
                lua.create_async_function(move |lua, args: Variadic<LuaValue>| {
                    let target = target.clone();
                    let args = command_args(&lua, name, args);
                    async move {
                        target
                            .control(name, &args?)
                            .await
                            .map_err(mlua::Error::external)
                    }
                })?;
            globals.set(name, command)?;
            names.push(name);
        }

        Ok(names)
    }

    fn uninstall(&self, names: &[&'static str]) {
        let _state = lock(&self.inner.state);
        let globals = self.inner.lua.globals();
        for name in names {
            if let Err(err) = globals.set(*name, LuaValue::Nil) {
                warn!(name, %err, "failed to remove script global");
            }
        }
    }

    /// Run an entry point to completion on its persistent worker
    ///
    /// Undefined entry points succeed without doing anything. `stop()` is
    /// reported as [`ScriptError::Stopped`] whatever its message; firing
    /// `signal` abandons the invocation with [`ScriptError::Cancelled`].
    pub async fn execute(
        &self,
        entry: EntryPoint,
        signal: &CancelSignal,
        args: impl IntoLuaMulti,
    ) -> Result<(), ScriptError> {
        let Some(func) = self.inner.entries.get(&entry) else {
            return Ok(());
        };
        let args = args
            .into_lua_multi(&self.inner.lua)
            .map_err(ScriptError::Runtime)?;

        let (reply, response) = oneshot::channel();
        self.thread(entry, func)
            .send(Invocation {
                args,
                cancel: signal.token().clone(),
                reply,
            })
            .map_err(|_| ScriptError::Released)?;

        response.await.map_err(|_| ScriptError::Released)?
    }

    fn thread(&self, entry: EntryPoint, func: &Function) -> mpsc::UnboundedSender<Invocation> {
        let mut state = lock(&self.inner.state);
        if let Some(thread) = state.threads.get(&entry) {
            if !thread.is_closed() {
                return thread.clone();
            }
        }

        let (thread, invocations) = mpsc::unbounded_channel();
        tokio::spawn(run_entry(
            entry,
            func.clone(),
            invocations,
            self.inner.shutdown.clone(),
        ));
        state.threads.insert(entry, thread.clone());
        thread
    }

    /// Stop every entry point worker
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

async fn run_entry(
    entry: EntryPoint,
    func: Function,
    mut invocations: mpsc::UnboundedReceiver<Invocation>,
    shutdown: CancellationToken,
) {
    loop {
        let invocation = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = invocations.recv() => match next {
                Some(invocation) => invocation,
                None => break,
            },
        };

        let Invocation {
            args,
            cancel,
            reply,
        } = invocation;

        let call = ENTRY_CANCEL.scope(cancel.clone(), func.call_async::<()>(args));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScriptError::Cancelled),
            _ = shutdown.cancelled() => Err(ScriptError::Released),
            result = call => result.map_err(ScriptError::from_lua),
        };

        if let Err(err) = &result {
            debug!(%entry, %err, "entry point ended with error");
        }
        let _ = reply.send(result);
    }
}

/// Installed script globals; removed on [`Binding::release`] or drop
pub struct Binding {
    script: LuaScript,
    names: Vec<&'static str>,
    released: bool,
}

impl Binding {
    /// Names installed into the script
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    /// Remove the installed globals
    pub fn release(mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        if !self.released {
            self.released = true;
            self.script.uninstall(&self.names);
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.clear();
    }
}
