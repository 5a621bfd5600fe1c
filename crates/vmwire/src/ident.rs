//! # Identifier, namespace, and code validation
//!
//! Everything that crosses into the Isolate by name is checked here first.
//! Validation is synchronous and local: a failure never reaches the wire.
//!
//! ## Rules
//!
//! - **Identifiers** match `[A-Za-z][A-Za-z0-9_]*` and are not reserved words.
//! - **Namespaces** are one or more identifiers joined by `.`.
//! - **Code** is restricted to printable ASCII plus tab, line feed, vertical
//!   tab, form feed and carriage return.

use std::time::Duration;

/// Words that can never be bound as guest names.
pub const RESERVED: &[&str] = &[
    "arguments", "await", "break", "case", "catch", "class", "const", "continue",
    "debugger", "default", "delete", "do", "else", "enum", "eval", "export",
    "extends", "false", "finally", "for", "function", "if", "implements",
    "import", "in", "instanceof", "interface", "let", "new", "null", "package",
    "private", "protected", "public", "return", "static", "super", "switch",
    "this", "throw", "true", "try", "typeof", "undefined", "var", "void",
    "while", "with", "yield", "NaN", "Infinity",
];

/// Validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The identifier is empty or contains characters outside the grammar.
    MalformedIdentifier(String),
    /// The identifier is a reserved word.
    ReservedIdentifier(String),
    /// A namespace segment is not a valid identifier.
    MalformedNamespace(String),
    /// The code contains a character outside the permitted set.
    ForbiddenCharacter { position: usize, character: char },
    /// The code does not compile as a strict-mode function body.
    Syntax(String),
    /// A timeout of zero or beyond the configured maximum.
    Timeout { requested: Duration, max: Duration },
    /// A dependency object could not be reconstructed.
    MalformedDependency(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedIdentifier(name) => write!(f, "malformed identifier '{}'", name),
            Self::ReservedIdentifier(name) => write!(f, "identifier '{}' is a reserved word", name),
            Self::MalformedNamespace(name) => write!(f, "malformed namespace '{}'", name),
            Self::ForbiddenCharacter { position, character } => {
                write!(f, "forbidden character {:?} at position {}", character, position)
            }
            Self::Syntax(msg) => write!(f, "code does not compile: {}", msg),
            Self::Timeout { requested, max } => write!(
                f,
                "timeout {}ms outside of (0, {}]ms",
                requested.as_millis(),
                max.as_millis()
            ),
            Self::MalformedDependency(msg) => write!(f, "malformed dependency: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Validates an identifier, returning it unchanged on success.
pub fn identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let well_formed = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if !well_formed {
        return Err(Error::MalformedIdentifier(name.to_string()));
    }
    if RESERVED.contains(&name) {
        return Err(Error::ReservedIdentifier(name.to_string()));
    }
    Ok(name)
}

/// Validates a dot-joined namespace name, returning it unchanged on success.
pub fn namespace(name: &str) -> Result<&str> {
    let valid = !name.is_empty() && name.split('.').all(|segment| identifier(segment).is_ok());
    if !valid {
        return Err(Error::MalformedNamespace(name.to_string()));
    }
    Ok(name)
}

/// Checks that guest code only uses the permitted character set.
pub fn code(text: &str) -> Result<&str> {
    for (position, character) in text.char_indices() {
        let permitted = matches!(character, ' '..='~' | '\t' | '\n' | '\u{0b}' | '\u{0c}' | '\r');
        if !permitted {
            return Err(Error::ForbiddenCharacter { position, character });
        }
    }
    Ok(text)
}

/// Checks that a timeout is positive and no larger than `max`.
pub fn timeout(requested: Duration, max: Duration) -> Result<Duration> {
    if requested.is_zero() || requested > max {
        return Err(Error::Timeout { requested, max });
    }
    Ok(requested)
}
