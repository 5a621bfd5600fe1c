//! # Namespace tree
//!
//! Hierarchical scopes that own installed symbols, link edges and the mute
//! flag.
//!
//! ## Invariants
//!
//! - Lookup is layered: a namespace's own symbols shadow its ancestors', and
//!   a miss walks parent links until found or exhausted.
//! - Writes only ever touch the namespace's own table.
//! - Installing a name that already resolves, locally or through an ancestor,
//!   fails.
//! - Deleting a namespace removes its whole subtree.
//!
//! The tree is generic over the symbol value so it can be exercised without a
//! guest engine.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    NotFound(String),
    AlreadyExists(String),
    AlreadyInstalled { namespace: String, symbol: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "namespace '{}' does not exist", name),
            Self::AlreadyExists(name) => write!(f, "namespace '{}' already exists", name),
            Self::AlreadyInstalled { namespace, symbol } => {
                write!(f, "'{}' is already installed in namespace '{}'", symbol, namespace)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Namespace<V> {
    parent: Option<String>,
    children: BTreeSet<String>,
    installed: BTreeMap<String, V>,
    links: BTreeSet<String>,
    muted: bool,
}

impl<V> Namespace<V> {
    fn new(parent: Option<String>) -> Self {
        Self {
            parent,
            children: BTreeSet::new(),
            installed: BTreeMap::new(),
            links: BTreeSet::new(),
            muted: false,
        }
    }
}

pub struct NamespaceTree<V> {
    namespaces: HashMap<String, Namespace<V>>,
}

impl<V> NamespaceTree<V> {
    pub fn new() -> Self {
        Self { namespaces: HashMap::new() }
    }

    fn get(&self, name: &str) -> Result<&Namespace<V>> {
        self.namespaces
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Namespace<V>> {
        self.namespaces
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    /// Creates `name`, optionally as a child of `parent`.
    pub fn create(&mut self, name: &str, parent: Option<&str>) -> Result<()> {
        if self.exists(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        if let Some(parent) = parent {
            self.get_mut(parent)?.children.insert(name.to_string());
        }
        self.namespaces
            .insert(name.to_string(), Namespace::new(parent.map(str::to_string)));
        Ok(())
    }

    /// Removes `name` and all of its descendants, depth first.
    ///
    /// Returns every removed name, descendants before their parents. Link
    /// edges pointing into the removed subtree are dropped as well.
    pub fn delete(&mut self, name: &str) -> Result<Vec<String>> {
        let parent = self.get(name)?.parent.clone();
        if let Some(parent) = parent {
            if let Ok(ns) = self.get_mut(&parent) {
                ns.children.remove(name);
            }
        }

        let mut removed = Vec::new();
        self.remove_subtree(name, &mut removed);

        for ns in self.namespaces.values_mut() {
            for gone in &removed {
                ns.links.remove(gone);
            }
        }
        Ok(removed)
    }

    fn remove_subtree(&mut self, name: &str, removed: &mut Vec<String>) {
        let Some(ns) = self.namespaces.remove(name) else { return };
        for child in &ns.children {
            self.remove_subtree(child, removed);
        }
        removed.push(name.to_string());
    }

    /// Resolves `symbol` in `namespace`, walking up through ancestors.
    pub fn resolve(&self, namespace: &str, symbol: &str) -> Result<Option<&V>> {
        let mut current = Some(self.get(namespace)?);
        while let Some(ns) = current {
            if let Some(value) = ns.installed.get(symbol) {
                return Ok(Some(value));
            }
            current = ns.parent.as_deref().and_then(|p| self.namespaces.get(p));
        }
        Ok(None)
    }

    /// Fails if `symbol` already resolves in `namespace`.
    pub fn ensure_free(&self, namespace: &str, symbol: &str) -> Result<()> {
        if self.resolve(namespace, symbol)?.is_some() {
            return Err(Error::AlreadyInstalled {
                namespace: namespace.to_string(),
                symbol: symbol.to_string(),
            });
        }
        Ok(())
    }

    /// Installs `value` under `symbol` in the namespace's own table.
    pub fn install(&mut self, namespace: &str, symbol: &str, value: V) -> Result<()> {
        self.ensure_free(namespace, symbol)?;
        self.get_mut(namespace)?
            .installed
            .insert(symbol.to_string(), value);
        Ok(())
    }

    /// Adds a one-way propagation edge from `source` to `target`.
    pub fn link(&mut self, source: &str, target: &str) -> Result<()> {
        self.get(target)?;
        self.get_mut(source)?.links.insert(target.to_string());
        Ok(())
    }

    /// Removes the edge from `source` to `target`; reports whether it existed.
    pub fn unlink(&mut self, source: &str, target: &str) -> Result<bool> {
        self.get(target)?;
        Ok(self.get_mut(source)?.links.remove(target))
    }

    /// Sets the mute flag and returns its previous value.
    pub fn set_muted(&mut self, name: &str, muted: bool) -> Result<bool> {
        let ns = self.get_mut(name)?;
        Ok(std::mem::replace(&mut ns.muted, muted))
    }

    pub fn is_muted(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.muted)
    }

    /// All namespace names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.keys().cloned().collect();
        names.sort();
        names
    }

    /// Symbols in the namespace's own table, sorted.
    pub fn installed(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.get(name)?.installed.keys().cloned().collect())
    }

    /// Namespaces that events cast in `name` propagate to.
    pub fn linked_to(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.get(name)?.links.iter().cloned().collect())
    }

    /// Namespaces whose events propagate into `name`.
    pub fn linked_from(&self, name: &str) -> Result<Vec<String>> {
        self.get(name)?;
        let mut sources: Vec<String> = self
            .namespaces
            .iter()
            .filter(|(_, ns)| ns.links.contains(name))
            .map(|(source, _)| source.clone())
            .collect();
        sources.sort();
        Ok(sources)
    }

    /// `name` followed by its parent, grandparent, and so on.
    pub fn ancestors(&self, name: &str) -> Result<Vec<String>> {
        let mut chain = vec![name.to_string()];
        let mut current = self.get(name)?.parent.clone();
        while let Some(parent) = current {
            current = self.namespaces.get(&parent).and_then(|ns| ns.parent.clone());
            chain.push(parent);
        }
        Ok(chain)
    }

    pub fn children(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.get(name)?.children.iter().cloned().collect())
    }

    /// Drops every namespace and every value they hold.
    pub fn clear(&mut self) {
        self.namespaces.clear();
    }
}

impl<V> Default for NamespaceTree<V> {
    fn default() -> Self {
        Self::new()
    }
}
