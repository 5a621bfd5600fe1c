//! # Dependencies
//!
//! A dependency is a named unit of guest code plus the map of names it
//! imports from the namespace it runs in. Dependencies travel to the Isolate
//! as plain records; `as_object` / `from_object` give the record form.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::ident;

/// A named unit of guest code.
///
/// `imports` maps the local (imported) name to the name of the installed
/// symbol it resolves to. Keys are unique by construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub imports: BTreeMap<String, String>,
}

impl Dependency {
    /// Builds and validates a dependency.
    pub fn new<I, K, V>(name: impl Into<String>, code: impl Into<String>, imports: I) -> ident::Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let dependency = Self {
            name: name.into(),
            code: code.into(),
            imports: imports.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        };
        dependency.validate()?;
        Ok(dependency)
    }

    /// Builds a dependency without imports.
    pub fn leaf(name: impl Into<String>, code: impl Into<String>) -> ident::Result<Self> {
        Self::new(name, code, std::iter::empty::<(String, String)>())
    }

    /// Checks the name, every import pair, and the code character set.
    ///
    /// Compilation is checked separately, by whoever owns a guest engine.
    pub fn validate(&self) -> ident::Result<()> {
        ident::identifier(&self.name)?;
        for (local, target) in &self.imports {
            ident::identifier(local)?;
            ident::identifier(target)?;
        }
        ident::code(&self.code)?;
        Ok(())
    }

    /// Returns the record form of this dependency.
    pub fn as_object(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "code": self.code,
            "imports": self.imports,
        })
    }

    /// Reconstructs a dependency from its record form, validating it.
    pub fn from_object(object: &Value) -> ident::Result<Self> {
        let dependency: Self = Self::deserialize(object)
            .map_err(|e| ident::Error::MalformedDependency(e.to_string()))?;
        dependency.validate()?;
        Ok(dependency)
    }

    /// Names of the installed symbols this dependency needs.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.imports.values().map(String::as_str)
    }
}
