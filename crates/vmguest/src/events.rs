//! # Guest events
//!
//! Every namespace owns one capability handle, `{ on, once, off, cast }`,
//! bound as the first parameter of every guest body executed in it.
//!
//! ## Delivery
//!
//! Casting never calls a listener directly. It queues a [`Delivery`], and the
//! queue is drained between inbound messages. A delivery reaches listeners in
//! the origin namespace and in each namespace it links to (one hop). Events
//! cast by guest code are also forwarded to the Controller unless the origin
//! namespace is muted; events emitted by the Controller are not sent back.
//!
//! `on` and `once` return a listener id that `off` accepts, so once-listeners
//! can be removed before they fire.

use std::rc::Rc;
use std::rc::Weak;

use rquickjs::Ctx;
use rquickjs::Exception;
use rquickjs::Function;
use rquickjs::Object;
use rquickjs::Persistent;
use rquickjs::Value;
use serde_json::Value as Json;
use tracing::debug;
use tracing::warn;
use vmwire::Message;

use crate::error::Error;
use crate::error::Result;
use crate::isolate::Core;
use crate::isolate::Isolate;

pub(crate) struct Listener {
    pub(crate) id: u64,
    pub(crate) event: String,
    pub(crate) callback: Persistent<Function<'static>>,
    pub(crate) once: bool,
}

/// A queued event.
pub(crate) struct Delivery {
    pub(crate) origin: String,
    pub(crate) event: String,
    /// JSON array of the event arguments.
    pub(crate) args: String,
    /// Cast by guest code rather than emitted by the Controller.
    pub(crate) from_guest: bool,
}

impl Core {
    fn listen(&self, namespace: &str, event: String, callback: Persistent<Function<'static>>, once: bool) -> Option<u64> {
        let mut state = self.state.borrow_mut();
        if !state.tree.exists(namespace) {
            return None;
        }
        let id = state.next_listener;
        state.next_listener += 1;
        state
            .listeners
            .entry(namespace.to_string())
            .or_default()
            .push(Listener { id, event, callback, once });
        Some(id)
    }

    fn unlisten(&self, namespace: &str, id: u64) -> bool {
        let mut state = self.state.borrow_mut();
        let Some(listeners) = state.listeners.get_mut(namespace) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    fn enqueue(&self, delivery: Delivery) {
        self.state.borrow_mut().queue.push_back(delivery);
    }

    /// Callbacks listening for `event` in `namespace`; once-listeners are
    /// removed as they are taken.
    fn take_callbacks(&self, namespace: &str, event: &str) -> Vec<Persistent<Function<'static>>> {
        let mut state = self.state.borrow_mut();
        let Some(listeners) = state.listeners.get_mut(namespace) else {
            return Vec::new();
        };
        let callbacks = listeners
            .iter()
            .filter(|listener| listener.event == event)
            .map(|listener| listener.callback.clone())
            .collect();
        listeners.retain(|listener| !(listener.once && listener.event == event));
        callbacks
    }
}

impl Isolate {
    /// Builds the capability handle for `namespace`.
    pub(crate) fn events_handle<'js>(&self, ctx: &Ctx<'js>, namespace: &str) -> Result<Persistent<Object<'static>>> {
        let make = self.helper(ctx, "events")?;
        let js = |e| Error::from_js(ctx, e);

        let weak: Weak<Core> = Rc::downgrade(&self.core);
        let owner = namespace.to_string();
        let on = Function::new(
            ctx.clone(),
            move |event: String, listener: Function<'js>, once: bool| -> rquickjs::Result<f64> {
                let ctx = listener.ctx().clone();
                let Some(core) = weak.upgrade() else {
                    return Err(Exception::throw_message(&ctx, "isolate is shutting down"));
                };
                let callback = Persistent::save(&ctx, listener);
                match core.listen(&owner, event, callback, once) {
                    Some(id) => Ok(id as f64),
                    None => Err(Exception::throw_message(&ctx, &format!("namespace '{}' was deleted", owner))),
                }
            },
        )
        .map_err(js)?;

        let weak: Weak<Core> = Rc::downgrade(&self.core);
        let owner = namespace.to_string();
        let off = Function::new(ctx.clone(), move |id: f64| -> bool {
            match weak.upgrade() {
                Some(core) if id >= 0.0 => core.unlisten(&owner, id as u64),
                _ => false,
            }
        })
        .map_err(js)?;

        let weak: Weak<Core> = Rc::downgrade(&self.core);
        let owner = namespace.to_string();
        let cast = Function::new(ctx.clone(), move |event: String, args: String| {
            if let Some(core) = weak.upgrade() {
                core.enqueue(Delivery {
                    origin: owner.clone(),
                    event,
                    args,
                    from_guest: true,
                });
            }
        })
        .map_err(js)?;

        let handle: Object = make.call((on, off, cast)).map_err(js)?;
        Ok(Persistent::save(ctx, handle))
    }

    /// Queues an event emitted by the Controller into `namespace`.
    pub(crate) fn emit(&self, namespace: String, event: String, args: Vec<Json>) {
        if !self.core.state.borrow().tree.exists(&namespace) {
            warn!(vm = %self.core.vm, namespace = %namespace, event = %event, "emit into unknown namespace");
            return;
        }
        self.core.enqueue(Delivery {
            origin: namespace,
            event,
            args: Json::from(args).to_string(),
            from_guest: false,
        });
    }

    /// Hands one queued event to its listeners.
    pub(crate) fn deliver(&self, delivery: Delivery) {
        let (targets, forward) = {
            let state = self.core.state.borrow();
            if !state.tree.exists(&delivery.origin) {
                return;
            }
            let mut targets = vec![delivery.origin.clone()];
            targets.extend(state.tree.linked_to(&delivery.origin).unwrap_or_default());
            let muted = state.tree.is_muted(&delivery.origin).unwrap_or(true);
            (targets, delivery.from_guest && !muted)
        };

        if forward {
            let args = match serde_json::from_str::<Vec<Json>>(&delivery.args) {
                Ok(args) => args,
                Err(e) => {
                    warn!(vm = %self.core.vm, error = %e, "undecodable event arguments");
                    Vec::new()
                }
            };
            self.core.send(Message::Emit {
                namespace: delivery.origin.clone(),
                event: delivery.event.clone(),
                args,
            });
        }

        for target in targets {
            let callbacks = self.core.take_callbacks(&target, &delivery.event);
            if callbacks.is_empty() {
                continue;
            }
            debug!(vm = %self.core.vm, namespace = %target, event = %delivery.event, listeners = callbacks.len(), "delivering");
            self.context.with(|ctx| {
                let deliver = match self.helper(&ctx, "deliver") {
                    Ok(deliver) => deliver,
                    Err(e) => {
                        warn!(vm = %self.core.vm, error = %e, "cannot deliver events");
                        return;
                    }
                };
                for callback in callbacks {
                    let called = callback
                        .restore(&ctx)
                        .and_then(|callback| deliver.call::<_, Value>((callback, delivery.args.as_str())));
                    if let Err(e) = called {
                        warn!(vm = %self.core.vm, namespace = %target, event = %delivery.event, error = %Error::from_js(&ctx, e), "listener failed");
                    }
                }
            });
        }
    }
}
