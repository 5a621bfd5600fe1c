//! Compile-only check of guest function bodies.
//!
//! Bodies are compiled the same way the Isolate compiles them, as the body of
//! a strict-mode async function, in a throwaway context. Nothing is run.

use rquickjs::Context;
use rquickjs::Function;
use rquickjs::Runtime;
use rquickjs::Value;

use crate::error::Error;

/// Returns the engine's syntax error message if `code` does not compile.
pub fn check_function_body(code: &str) -> Result<(), String> {
    let runtime = Runtime::new().map_err(|e| e.to_string())?;
    let context = Context::full(&runtime).map_err(|e| e.to_string())?;
    context.with(|ctx| {
        let constructor: Function = ctx
            .eval("Object.getPrototypeOf(async function () {}).constructor")
            .map_err(|e| Error::from_js(&ctx, e).to_string())?;
        constructor
            .call::<_, Value>((format!("\"use strict\";\n{}", code),))
            .map(|_| ())
            .map_err(|e| Error::from_js(&ctx, e).to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_bodies() {
        assert_eq!(check_function_body("return 1 + 2;"), Ok(()));
        assert_eq!(check_function_body("const x = await Promise.resolve(1); return x;"), Ok(()));
        assert_eq!(check_function_body(""), Ok(()));
    }

    #[test]
    fn test_rejects_bad_syntax() {
        assert!(check_function_body("return (;").is_err());
        assert!(check_function_body("}").is_err());
    }

    #[test]
    fn test_body_is_strict() {
        assert!(check_function_body("with ({}) {}").is_err());
        assert!(check_function_body("var eval = 1;").is_err());
    }

    #[test]
    fn test_body_is_not_run() {
        assert_eq!(check_function_body("throw new Error('boom');"), Ok(()));
        assert_eq!(check_function_body("while (true) {}"), Ok(()));
    }
}
