use rquickjs::Ctx;
use rquickjs::Value;
use rquickjs::convert::Coerced;

use crate::namespace;

/// Errors raised inside the Isolate.
///
/// None of these cross the boundary as values: they are rendered with
/// `Display` and sent as the text of a `reject`.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Nonexistent namespace, duplicate create or duplicate install.
    Namespace(namespace::Error),
    /// Missing imports, shadowed arguments or exceeded ceilings.
    Dependency(String),
    /// Guest code threw, failed to compile, or the engine failed.
    Guest(String),
    /// A message the Isolate cannot act on.
    Protocol(String),
}

impl Error {
    /// Converts an engine error, taking the pending exception if there is one.
    pub fn from_js(ctx: &Ctx<'_>, error: rquickjs::Error) -> Self {
        match error {
            rquickjs::Error::Exception => Self::Guest(describe_caught(ctx)),
            other => Self::Guest(other.to_string()),
        }
    }
}

/// Takes and renders the pending exception. QuickJS raises a bare `null`
/// when an allocation fails, which would otherwise read as "null".
pub fn describe_caught(ctx: &Ctx<'_>) -> String {
    let caught = ctx.catch();
    if caught.is_null() || caught.is_undefined() {
        return EMPTY_EXCEPTION.to_string();
    }
    describe(&caught)
}

/// Text of an exception that carries no value.
pub const EMPTY_EXCEPTION: &str = "engine raised an exception without a value (out of memory?)";

/// Renders a thrown guest value as text: the `message` of error-like objects,
/// the string coercion of anything else.
pub fn describe(value: &Value<'_>) -> String {
    if let Some(object) = value.as_object() {
        if let Ok(message) = object.get::<_, String>("message") {
            return message;
        }
    }
    match value.get::<Coerced<String>>() {
        Ok(Coerced(text)) => text,
        Err(_) => "uncaught guest exception".to_string(),
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Namespace(e) => write!(f, "{}", e),
            Self::Dependency(msg) => write!(f, "{}", msg),
            Self::Guest(msg) => write!(f, "{}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<namespace::Error> for Error {
    fn from(e: namespace::Error) -> Self {
        Self::Namespace(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use rquickjs::Context;
    use rquickjs::Runtime;

    use super::*;

    fn thrown(source: &str) -> Error {
        let runtime = Runtime::new().expect("runtime");
        let context = Context::full(&runtime).expect("context");
        context.with(|ctx| {
            let error = ctx.eval::<(), _>(source).expect_err("source throws");
            Error::from_js(&ctx, error)
        })
    }

    #[test]
    fn test_error_messages_are_taken_from_the_exception() {
        assert_eq!(thrown("throw new TypeError('bad input')"), Error::Guest("bad input".into()));
        assert_eq!(thrown("throw 'plain text'"), Error::Guest("plain text".into()));
    }

    #[test]
    fn test_empty_exceptions_are_not_rendered_as_null() {
        assert_eq!(thrown("throw null"), Error::Guest(EMPTY_EXCEPTION.into()));
        assert_eq!(thrown("throw undefined"), Error::Guest(EMPTY_EXCEPTION.into()));
    }
}
