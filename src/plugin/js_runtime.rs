//! JavaScript Runtime Module
//!
//! This module defines [`ScriptSandbox`], the contract every script engine
//! satisfies, and [`JsRuntimeWrapper`], its deno_core implementation.
//!
//! A sandbox is not thread-safe. It lives on one thread for its whole life
//! and its owner serializes calls (see [`SandboxHandle`]).
//!
//! [`SandboxHandle`]: super::js_wrapper::SandboxHandle

use async_trait::async_trait;
use deno_core::{serde_v8, v8, JsRuntime};
use std::sync::Arc;
use tracing::debug;

use super::js_bindings::{create_runtime, ScriptBindings};
use super::value::ScriptValue;
use crate::core::error::{Result, TingError};

/// Stops whatever script is currently running; callable from any thread
pub type Terminator = Arc<dyn Fn() + Send + Sync>;

/// Script evaluation engine
#[async_trait(?Send)]
pub trait ScriptSandbox {
    /// Prepare the engine; calling it again is a no-op
    fn initialize(&mut self) -> Result<()>;

    /// Run script text and return its completion value
    fn evaluate_script(&mut self, code: &str) -> Result<ScriptValue>;

    /// Call a global function, awaiting it when it returns a promise
    async fn call_function(&mut self, name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue>;

    fn set_global(&mut self, name: &str, value: ScriptValue) -> Result<()>;

    fn get_global(&mut self, name: &str) -> Result<ScriptValue>;

    /// Release the engine; later calls fail until `initialize` runs again
    fn dispose(&mut self);

    /// Handle able to interrupt a running call from another thread
    fn terminator(&mut self) -> Option<Terminator> {
        None
    }
}

/// deno_core backed sandbox for one source
pub struct JsRuntimeWrapper {
    runtime: Option<JsRuntime>,
    bindings: ScriptBindings,
    max_heap_bytes: usize,
}

impl JsRuntimeWrapper {
    pub fn new(bindings: ScriptBindings, max_heap_bytes: usize) -> Self {
        Self {
            runtime: None,
            bindings,
            max_heap_bytes,
        }
    }

    fn runtime(&mut self) -> Result<&mut JsRuntime> {
        let runtime = self
            .runtime
            .as_mut()
            .ok_or_else(|| TingError::ScriptError("Script engine is not initialized".to_string()))?;
        // A previous call may have been interrupted
        runtime.v8_isolate().cancel_terminate_execution();
        Ok(runtime)
    }

    fn read_global(runtime: &mut JsRuntime, name: &str) -> Result<ScriptValue> {
        let scope = &mut runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);

        let key = v8::String::new(scope, name)
            .ok_or_else(|| TingError::ScriptError(format!("Invalid global name {}", name)))?;
        match global.get(scope, key.into()) {
            Some(value) => Ok(to_script_value(scope, value)),
            None => Ok(ScriptValue::Null),
        }
    }

    fn clear_invoke_slots(runtime: &mut JsRuntime) {
        let _ = runtime.execute_script(
            "<cleanup>",
            r#"
            globalThis._ting_result = undefined;
            globalThis._ting_error = undefined;
            globalThis._ting_status = undefined;
            "#
            .to_string()
            .into(),
        );
    }
}

/// Convert a V8 value, keeping functions and other non-data values opaque
fn to_script_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> ScriptValue {
    if value.is_null_or_undefined() {
        return ScriptValue::Null;
    }
    if value.is_function() || value.is_symbol() || value.is_promise() {
        return ScriptValue::Opaque(value.type_of(scope).to_rust_string_lossy(scope));
    }

    match serde_v8::from_v8::<serde_json::Value>(scope, value) {
        Ok(json) => ScriptValue::from(json),
        Err(_) => ScriptValue::Opaque(value.type_of(scope).to_rust_string_lossy(scope)),
    }
}

/// Message of a script failure without V8's "Uncaught " prefix
fn script_error(err: deno_core::error::AnyError) -> TingError {
    let message = match err.downcast_ref::<deno_core::error::JsError>() {
        Some(js_error) => js_error
            .exception_message
            .trim_start_matches("Uncaught ")
            .to_string(),
        None => err.to_string(),
    };
    TingError::ScriptError(message)
}

#[async_trait(?Send)]
impl ScriptSandbox for JsRuntimeWrapper {
    fn initialize(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            return Ok(());
        }
        debug!(source = %self.bindings.source_name, "Creating script runtime");
        self.runtime = Some(create_runtime(&self.bindings, self.max_heap_bytes)?);
        Ok(())
    }

    fn evaluate_script(&mut self, code: &str) -> Result<ScriptValue> {
        let runtime = self.runtime()?;
        let result = runtime
            .execute_script("<source_script>", code.to_string().into())
            .map_err(script_error)?;

        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, result);
        Ok(to_script_value(scope, local))
    }

    async fn call_function(&mut self, name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue> {
        debug!(source = %self.bindings.source_name, function = name, "Calling script function");
        let runtime = self.runtime()?;

        let args_json = serde_json::to_string(&ScriptValue::List(args).to_json())?;

        {
            let scope = &mut runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);

            let invoke_name = v8::String::new(scope, "_ting_invoke")
                .ok_or_else(|| TingError::ScriptError("Failed to allocate string".to_string()))?;
            let invoke_val = global
                .get(scope, invoke_name.into())
                .ok_or_else(|| TingError::ScriptError("_ting_invoke not found".to_string()))?;
            let invoke_func = v8::Local::<v8::Function>::try_from(invoke_val)
                .map_err(|_| TingError::ScriptError("_ting_invoke is not a function".to_string()))?;

            let func_name = v8::String::new(scope, name)
                .ok_or_else(|| TingError::ScriptError("Failed to allocate string".to_string()))?;
            let args_str = v8::String::new(scope, &args_json)
                .ok_or_else(|| TingError::ScriptError("Failed to allocate string".to_string()))?;
            let args_val = v8::json::parse(scope, args_str)
                .ok_or_else(|| TingError::ScriptError("Failed to parse arguments in V8".to_string()))?;

            let recv = v8::undefined(scope).into();
            if invoke_func
                .call(scope, recv, &[func_name.into(), args_val])
                .is_none()
            {
                return Err(TingError::ScriptError(format!(
                    "Failed to call {}: execution terminated",
                    name
                )));
            }
        }

        let loop_result = runtime.run_event_loop(Default::default()).await;

        let outcome = match loop_result {
            Err(e) => Err(script_error(e)),
            Ok(()) => {
                let status = Self::read_global(runtime, "_ting_status")?;
                match status.as_string().as_deref() {
                    Some("success") => Self::read_global(runtime, "_ting_result"),
                    Some("error") => {
                        let message = Self::read_global(runtime, "_ting_error")?
                            .as_string()
                            .unwrap_or_else(|| "Unknown error".to_string());
                        Err(TingError::ScriptError(message))
                    }
                    Some("pending") => Err(TingError::ScriptError(format!(
                        "{} never settled: event loop finished while it was pending",
                        name
                    ))),
                    _ => Err(TingError::ScriptError(format!("{} did not run", name))),
                }
            }
        };

        // Never let one call's result or exception be seen by the next
        Self::clear_invoke_slots(runtime);
        outcome
    }

    fn set_global(&mut self, name: &str, value: ScriptValue) -> Result<()> {
        let runtime = self.runtime()?;
        let scope = &mut runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);

        let key = v8::String::new(scope, name)
            .ok_or_else(|| TingError::ScriptError(format!("Invalid global name {}", name)))?;
        let value = serde_v8::to_v8(scope, value.to_json())
            .map_err(|e| TingError::ScriptError(format!("Failed to convert {}: {}", name, e)))?;

        match global.set(scope, key.into(), value) {
            Some(true) => Ok(()),
            _ => Err(TingError::ScriptError(format!("Failed to set global {}", name))),
        }
    }

    fn get_global(&mut self, name: &str) -> Result<ScriptValue> {
        let runtime = self.runtime()?;
        Self::read_global(runtime, name)
    }

    fn dispose(&mut self) {
        if self.runtime.take().is_some() {
            debug!(source = %self.bindings.source_name, "Script runtime disposed");
        }
    }

    fn terminator(&mut self) -> Option<Terminator> {
        let runtime = self.runtime.as_mut()?;
        let handle = runtime.v8_isolate().thread_safe_handle();
        Some(Arc::new(move || {
            handle.terminate_execution();
        }))
    }
}

impl Drop for JsRuntimeWrapper {
    fn drop(&mut self) {
        self.dispose();
    }
}
