//! # Sandbox construction
//!
//! Runs once per Isolate, before any namespace exists. The prelude script in
//! `sandbox.js`:
//!
//! 1. installs shims for capabilities the engine may lack (`queueMicrotask`,
//!    `structuredClone`);
//! 2. prunes each well-known object down to [`ALLOW_LIST`], collecting
//!    properties that refuse deletion as warnings;
//! 3. patches primitives that leak ambient state: `eval` becomes
//!    indirect-only, wall-clock and randomness throw, dates are UTC-only and
//!    string ordering is by code unit;
//! 4. deep-freezes everything reachable from the global object, prototypes
//!    and accessors included.
//!
//! It returns a frozen helper object that the runtime uses to compile guest
//! bodies, settle results and build capability handles. Helpers are captured
//! before the freeze and are never reachable from guest code.

use rquickjs::Ctx;
use rquickjs::Function;
use rquickjs::Object;
use serde_json::Map;
use serde_json::Value;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;

const PRELUDE: &str = include_str!("sandbox.js");

/// Own string properties kept on each well-known object. Anything else is
/// deleted at boot. Symbol-keyed properties are left alone.
pub const ALLOW_LIST: &[(&str, &[&str])] = &[
    ("globalThis", &[
        "globalThis", "undefined", "NaN", "Infinity",
        "Object", "Function", "Array", "Number", "Boolean", "String", "Symbol", "BigInt",
        "Date", "Promise", "RegExp", "Map", "Set", "WeakMap", "WeakSet", "Proxy", "Reflect",
        "JSON", "Math",
        "Error", "AggregateError", "EvalError", "RangeError", "ReferenceError",
        "SyntaxError", "TypeError", "URIError",
        "ArrayBuffer", "DataView", "Int8Array", "Uint8Array", "Uint8ClampedArray",
        "Int16Array", "Uint16Array", "Int32Array", "Uint32Array", "Float32Array",
        "Float64Array", "BigInt64Array", "BigUint64Array",
        "parseFloat", "parseInt", "isFinite", "isNaN", "eval",
        "decodeURI", "decodeURIComponent", "encodeURI", "encodeURIComponent",
        "escape", "unescape",
        "queueMicrotask", "structuredClone",
    ]),
    ("Object", &[
        "length", "name", "prototype",
        "assign", "create", "defineProperties", "defineProperty", "entries", "freeze",
        "fromEntries", "getOwnPropertyDescriptor", "getOwnPropertyDescriptors",
        "getOwnPropertyNames", "getOwnPropertySymbols", "getPrototypeOf", "groupBy",
        "hasOwn", "is", "isExtensible", "isFrozen", "isSealed", "keys",
        "preventExtensions", "seal", "setPrototypeOf", "values",
    ]),
    ("Function", &["length", "name", "prototype"]),
    ("Array", &["length", "name", "prototype", "from", "isArray", "of"]),
    ("Number", &[
        "length", "name", "prototype",
        "EPSILON", "MAX_SAFE_INTEGER", "MAX_VALUE", "MIN_SAFE_INTEGER", "MIN_VALUE",
        "NaN", "NEGATIVE_INFINITY", "POSITIVE_INFINITY",
        "isFinite", "isInteger", "isNaN", "isSafeInteger", "parseFloat", "parseInt",
    ]),
    ("String", &["length", "name", "prototype", "fromCharCode", "fromCodePoint", "raw"]),
    ("Symbol", &[
        "length", "name", "prototype", "for", "keyFor",
        "asyncIterator", "hasInstance", "isConcatSpreadable", "iterator", "match",
        "matchAll", "replace", "search", "species", "split", "toPrimitive",
        "toStringTag", "unscopables",
    ]),
    ("Promise", &[
        "length", "name", "prototype",
        "all", "allSettled", "any", "race", "reject", "resolve", "withResolvers",
    ]),
    ("Reflect", &[
        "apply", "construct", "defineProperty", "deleteProperty", "get",
        "getOwnPropertyDescriptor", "getPrototypeOf", "has", "isExtensible", "ownKeys",
        "preventExtensions", "set", "setPrototypeOf",
    ]),
    ("JSON", &["parse", "stringify"]),
    ("Math", &[
        "E", "LN10", "LN2", "LOG10E", "LOG2E", "PI", "SQRT1_2", "SQRT2",
        "abs", "acos", "acosh", "asin", "asinh", "atan", "atan2", "atanh", "cbrt",
        "ceil", "clz32", "cos", "cosh", "exp", "expm1", "floor", "fround", "hypot",
        "imul", "log", "log10", "log1p", "log2", "max", "min", "pow", "random",
        "round", "sign", "sin", "sinh", "sqrt", "tan", "tanh", "trunc",
    ]),
];

/// The outcome of sandbox construction.
pub struct Sandbox<'js> {
    /// Runtime helpers; see `sandbox.js` for the members.
    pub helpers: Object<'js>,
    /// Properties that could not be pruned.
    pub warnings: Vec<String>,
}

fn allow_list_json() -> String {
    let table: Map<String, Value> = ALLOW_LIST
        .iter()
        .map(|(path, keep)| {
            let keep = keep.iter().map(|key| Value::from(*key)).collect();
            (path.to_string(), Value::Array(keep))
        })
        .collect();
    Value::Object(table).to_string()
}

/// Prunes, patches and freezes the context's global object.
///
/// Must run exactly once per context, before any guest code.
pub fn build<'js>(ctx: &Ctx<'js>) -> Result<Sandbox<'js>> {
    let prelude: Function = ctx
        .eval(PRELUDE)
        .map_err(|e| Error::from_js(ctx, e))?;
    let built: Object = prelude
        .call((allow_list_json(),))
        .map_err(|e| Error::from_js(ctx, e))?;

    let helpers: Object = built.get("helpers").map_err(|e| Error::from_js(ctx, e))?;
    let warnings: Vec<String> = built.get("warnings").map_err(|e| Error::from_js(ctx, e))?;

    if !warnings.is_empty() {
        warn!(properties = ?warnings, "sandbox could not prune some properties");
    }
    Ok(Sandbox { helpers, warnings })
}
