//! JavaScript bindings for source scripts
//!
//! This module builds the deno_core runtime a source script runs in and
//! installs the host API the script may use:
//! - `Ting.log.{debug,info,warn,error}` and `console.*`, routed to `tracing`
//! - `Ting.sourceName`, `Ting.baseUrl` and `Ting.absoluteUrl(path)`
//! - `_ting_invoke`, the trampoline the host uses to call script functions
//!
//! Scripts get no network or filesystem access; the engine fetches on their
//! behalf and hands them the response.

use crate::core::error::{Result, TingError};
use deno_core::{op2, v8, Extension, JsRuntime, Op, RuntimeOptions};
use serde::Serialize;
use std::borrow::Cow;
use tracing::{debug, error, info, warn};

/// Identity exposed to the script as the `Ting` global
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptBindings {
    pub source_name: String,
    pub base_url: String,
}

#[op2(fast)]
fn op_source_log(#[string] level: String, #[string] source: String, #[string] message: String) {
    match level.as_str() {
        "debug" => debug!(target: "source_script", source = %source, "{}", message),
        "warn" => warn!(target: "source_script", source = %source, "{}", message),
        "error" => error!(target: "source_script", source = %source, "{}", message),
        _ => info!(target: "source_script", source = %source, "{}", message),
    }
}

const PRELUDE: &str = r#"
"use strict";

(() => {
    const bindings = globalThis.__ting_bindings;
    delete globalThis.__ting_bindings;

    const stringify = (args) => args
        .map((a) => (typeof a === "string" ? a : (() => { try { return JSON.stringify(a); } catch (_) { return String(a); } })()))
        .join(" ");
    const log = (level) => (...args) => Deno.core.ops.op_source_log(level, bindings.sourceName, stringify(args));

    globalThis.Ting = Object.freeze({
        sourceName: bindings.sourceName,
        baseUrl: bindings.baseUrl,
        log: Object.freeze({
            debug: log("debug"),
            info: log("info"),
            warn: log("warn"),
            error: log("error"),
        }),
        absoluteUrl(path) {
            if (path === undefined || path === null) return bindings.baseUrl;
            path = String(path);
            if (/^[a-z][a-z0-9+.-]*:/i.test(path)) return path;
            if (path.startsWith("//")) return bindings.baseUrl.split(":")[0] + ":" + path;
            const base = bindings.baseUrl.replace(/\/+$/, "");
            if (path.startsWith("/")) {
                const origin = base.match(/^[a-z][a-z0-9+.-]*:\/\/[^/]+/i);
                return (origin ? origin[0] : base) + path;
            }
            return base + "/" + path;
        },
    });

    globalThis.console = {
        log: log("info"),
        info: log("info"),
        debug: log("debug"),
        warn: log("warn"),
        error: log("error"),
    };

    // Host-side calls go through here so arguments never need to be compiled
    // into script text. Results stay in globals until the host reads and
    // clears them.
    globalThis._ting_invoke = async function (funcName, args) {
        globalThis._ting_status = "pending";
        globalThis._ting_result = undefined;
        globalThis._ting_error = undefined;
        try {
            const func = globalThis[funcName];
            if (typeof func !== "function") {
                throw new Error(`Function ${funcName} not found`);
            }
            globalThis._ting_result = await func(...args);
            globalThis._ting_status = "success";
        } catch (e) {
            globalThis._ting_error = (e && e.message !== undefined) ? String(e.message) : String(e);
            globalThis._ting_status = "error";
        }
    };
})();
"#;

/// Create a runtime with the host API installed
///
/// `max_heap_bytes` caps the V8 heap; a script that reaches the cap is
/// terminated instead of aborting the process.
pub fn create_runtime(bindings: &ScriptBindings, max_heap_bytes: usize) -> Result<JsRuntime> {
    let ext = Extension {
        name: "ting_source",
        ops: Cow::Borrowed(&[op_source_log::DECL]),
        ..Default::default()
    };

    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_bytes);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![ext],
        create_params: Some(create_params),
        ..Default::default()
    });

    let handle = runtime.v8_isolate().thread_safe_handle();
    let source_name = bindings.source_name.clone();
    runtime.add_near_heap_limit_callback(move |current, _initial| {
        warn!(source = %source_name, heap = current, "Script reached heap limit, terminating");
        handle.terminate_execution();
        // Headroom for the termination to unwind
        current * 2
    });

    let bindings_json = serde_json::to_string(bindings)?;
    runtime
        .execute_script(
            "<ting_bindings>",
            format!("globalThis.__ting_bindings = {};", bindings_json).into(),
        )
        .map_err(|e| TingError::ScriptError(format!("Failed to install bindings: {}", e)))?;
    runtime
        .execute_script("<ting_prelude>", PRELUDE.to_string().into())
        .map_err(|e| TingError::ScriptError(format!("Failed to install bindings: {}", e)))?;

    Ok(runtime)
}
