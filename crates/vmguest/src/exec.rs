//! # Dependency execution
//!
//! A dependency body runs as a strict-mode async function whose parameters
//! are, in order: the namespace's event handle (`__events`), each import by
//! its local name, each argument by name. The body is compiled afresh on
//! every call, so nothing leaks between two executions of the same
//! dependency. Imports are passed by reference; installed values are never
//! re-evaluated.
//!
//! `install` runs the body with no arguments and caches the settled result
//! under the dependency name, frozen if it is an object or function.

use std::collections::BTreeSet;
use std::rc::Rc;
use std::rc::Weak;

use rquickjs::Array;
use rquickjs::Ctx;
use rquickjs::Exception;
use rquickjs::Function;
use rquickjs::Persistent;
use rquickjs::Value;
use serde_json::Map;
use serde_json::Value as Json;
use tracing::debug;
use vmwire::Dependency;
use vmwire::Message;
use vmwire::ident;

use crate::error::Error;
use crate::error::Result;
use crate::isolate::Core;
use crate::isolate::Deferred;
use crate::isolate::Isolate;

/// Name of the event handle parameter. It is outside the identifier grammar,
/// so no import or argument can collide with it.
pub const EVENTS_PARAM: &str = "__events";

impl Isolate {
    /// Starts a dependency body and returns its (possibly pending) result.
    fn run<'js>(
        &self,
        ctx: &Ctx<'js>,
        namespace: &str,
        dependency: &Dependency,
        args: &Map<String, Json>,
    ) -> Result<Value<'js>> {
        if dependency.imports.len() > self.config.max_imports {
            return Err(Error::Dependency(format!(
                "'{}' has {} imports, at most {} are allowed",
                dependency.name,
                dependency.imports.len(),
                self.config.max_imports
            )));
        }
        if args.len() > self.config.max_args {
            return Err(Error::Dependency(format!(
                "{} arguments given, at most {} are allowed",
                args.len(),
                self.config.max_args
            )));
        }
        for name in args.keys() {
            ident::identifier(name).map_err(|e| Error::Dependency(e.to_string()))?;
        }

        let shadowed: Vec<&str> = args
            .keys()
            .filter(|name| dependency.imports.contains_key(*name))
            .map(String::as_str)
            .collect();
        if !shadowed.is_empty() {
            return Err(Error::Dependency(format!(
                "arguments shadow imports: {}",
                shadowed.join(", ")
            )));
        }

        let (handle, imports) = {
            let state = self.core.state.borrow();
            let handle = state
                .handles
                .get(namespace)
                .cloned()
                .ok_or_else(|| crate::namespace::Error::NotFound(namespace.to_string()))?;

            let mut missing = BTreeSet::new();
            let mut imports = Vec::with_capacity(dependency.imports.len());
            for (local, target) in &dependency.imports {
                match state.tree.resolve(namespace, target)? {
                    Some(value) => imports.push((local.clone(), value.clone())),
                    None => {
                        missing.insert(target.as_str());
                    }
                }
            }
            if !missing.is_empty() {
                let missing: Vec<&str> = missing.into_iter().collect();
                return Err(Error::Dependency(format!(
                    "'{}' imports missing dependencies: {}",
                    dependency.name,
                    missing.join(", ")
                )));
            }
            (handle, imports)
        };

        let js = |e| Error::from_js(ctx, e);
        let mut params = Vec::with_capacity(1 + imports.len() + args.len());
        let values = Array::new(ctx.clone()).map_err(js)?;

        params.push(EVENTS_PARAM.to_string());
        values.set(0, handle.restore(ctx).map_err(js)?).map_err(js)?;
        for (index, (local, value)) in imports.into_iter().enumerate() {
            params.push(local);
            values.set(index + 1, value.restore(ctx).map_err(js)?).map_err(js)?;
        }
        params.extend(args.keys().cloned());
        let args_text = Json::Array(args.values().cloned().collect()).to_string();

        let run = self.helper(ctx, "run")?;
        run.call((params, dependency.code.as_str(), values, args_text))
            .map_err(js)
    }

    /// Installs `dependency` in `namespace`; the reply is sent once the body
    /// settles.
    pub(crate) fn install(&self, namespace: &str, tunnel: u64, dependency: Dependency) -> Result<()> {
        self.core.state.borrow().tree.ensure_free(namespace, &dependency.name)?;

        self.context.with(|ctx| {
            let js = |e| Error::from_js(&ctx, e);
            let result = self.run(&ctx, namespace, &dependency, &Map::new())?;

            let weak: Weak<Core> = Rc::downgrade(&self.core);
            let owner = namespace.to_string();
            let name = dependency.name.clone();
            let on_ok = Function::new(ctx.clone(), move |value: Value<'_>| {
                let Some(core) = weak.upgrade() else { return };
                let value = Persistent::save(value.ctx(), value.clone());
                let installed = core.state.borrow_mut().tree.install(&owner, &name, value);
                if installed.is_ok() {
                    debug!(vm = %core.vm, namespace = %owner, dependency = %name, "installed");
                }
                core.reply(tunnel, installed.map(|_| Json::Null).map_err(Error::from));
            })
            .map_err(js)?;

            let weak: Weak<Core> = Rc::downgrade(&self.core);
            let on_err = Function::new(ctx.clone(), move |message: String| {
                if let Some(core) = weak.upgrade() {
                    core.reply(tunnel, Err(Error::Guest(message)));
                }
            })
            .map_err(js)?;

            let adopt = self.helper(&ctx, "adopt")?;
            adopt.call::<_, ()>((result, on_ok, on_err)).map_err(js)
        })
    }

    /// Executes `dependency` in `namespace` with `args`; the reply carries the
    /// settled result.
    pub(crate) fn execute(
        &self,
        namespace: &str,
        tunnel: u64,
        dependency: &Dependency,
        args: &Map<String, Json>,
    ) -> Result<()> {
        self.context.with(|ctx| {
            let js = |e| Error::from_js(&ctx, e);
            let result = self.run(&ctx, namespace, dependency, args)?;

            let weak: Weak<Core> = Rc::downgrade(&self.core);
            let on_ok = Function::new(ctx.clone(), move |text: String| {
                let Some(core) = weak.upgrade() else { return };
                let payload = serde_json::from_str(&text)
                    .map_err(|e| Error::Guest(format!("result is not serializable: {}", e)));
                core.reply(tunnel, payload);
            })
            .map_err(js)?;

            let weak: Weak<Core> = Rc::downgrade(&self.core);
            let on_err = Function::new(ctx.clone(), move |message: String| {
                if let Some(core) = weak.upgrade() {
                    core.reply(tunnel, Err(Error::Guest(message)));
                }
            })
            .map_err(js)?;

            let settle = self.helper(&ctx, "settle")?;
            settle.call::<_, ()>((result, on_ok, on_err)).map_err(js)
        })
    }

    /// Installs a guest-visible stub that forwards calls to predefined host
    /// function `idx`.
    pub(crate) fn predefine(&self, namespace: &str, idx: u32, function: &str) -> Result<()> {
        ident::identifier(function).map_err(|e| Error::Dependency(e.to_string()))?;
        self.core.state.borrow().tree.ensure_free(namespace, function)?;

        let stub = self.context.with(|ctx| {
            let js = |e| Error::from_js(&ctx, e);

            let weak: Weak<Core> = Rc::downgrade(&self.core);
            let owner = namespace.to_string();
            let send = Function::new(
                ctx.clone(),
                move |args: String, resolve: Function<'_>, reject: Function<'_>| -> rquickjs::Result<()> {
                    let ctx = resolve.ctx().clone();
                    let Some(core) = weak.upgrade() else {
                        return Err(Exception::throw_message(&ctx, "isolate is shutting down"));
                    };
                    let args: Vec<Json> = serde_json::from_str(&args)
                        .map_err(|e| Exception::throw_message(&ctx, &e.to_string()))?;
                    let deferred = Deferred {
                        resolve: Persistent::save(resolve.ctx(), resolve.clone()),
                        reject: Persistent::save(reject.ctx(), reject.clone()),
                    };
                    let tunnel = core.tunnels.open(Some(&owner), deferred);
                    let sent = core.send(Message::Call {
                        namespace: owner.clone(),
                        tunnel,
                        idx,
                        args,
                    });
                    if !sent {
                        drop(core.tunnels.take(tunnel));
                        return Err(Exception::throw_message(&ctx, "controller is unreachable"));
                    }
                    Ok(())
                },
            )
            .map_err(js)?;

            let make = self.helper(&ctx, "stub")?;
            let stub: Value = make.call((function, send)).map_err(js)?;
            Ok::<_, Error>(Persistent::save(&ctx, stub))
        })?;

        self.core
            .state
            .borrow_mut()
            .tree
            .install(namespace, function, stub)?;
        debug!(vm = %self.core.vm, namespace, function, idx, "predefined");
        Ok(())
    }
}
