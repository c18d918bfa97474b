//! Handles onto outstanding requests and subscriptions.
//!
//! A [`CommandResult`] moves from pending to either notified (carrying the
//! reply value) or errored. Broadcast subscriptions and auto-restarting
//! signal requests are multi-shot: each delivery notifies, then the handle
//! keeps listening.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::client::{self, Engine, IpcError};
use crate::Value;

/// What a result is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// The reply to one command.
    Command,
    /// Every firing of a broadcast id.
    Broadcast(u32),
    /// The next emission of a signal id.
    Signal(u32),
}

#[derive(Debug, Clone)]
pub(crate) enum Failure {
    /// Error reply from the server.
    Server(String),
    /// Reply payload could not be decoded.
    Malformed(String),
    Disconnected,
}

impl Failure {
    fn message(&self) -> String {
        match self {
            Failure::Server(m) => m.clone(),
            Failure::Malformed(m) => format!("malformed reply: {m}"),
            Failure::Disconnected => "disconnected".to_string(),
        }
    }

    fn to_error(&self) -> IpcError {
        match self {
            Failure::Server(m) => IpcError::Server(m.clone()),
            Failure::Malformed(m) => IpcError::Protocol(m.clone()),
            Failure::Disconnected => IpcError::Disconnected,
        }
    }
}

enum State {
    Pending,
    Notified(Value),
    Errored(Failure),
}

type Notifier = Box<dyn FnMut(&Value)>;

pub(crate) struct ResultInner {
    engine: Weak<RefCell<Engine>>,
    kind: ResultKind,
    cookie: Cell<i32>,
    auto_restart: Cell<bool>,
    /// A request (or subscription) is registered with the connection.
    in_flight: Cell<bool>,
    state: RefCell<State>,
    deliveries: Cell<u64>,
    notifiers: RefCell<Vec<Notifier>>,
    channels: RefCell<Vec<mpsc::UnboundedSender<Value>>>,
}

impl ResultInner {
    pub(crate) fn new(engine: Weak<RefCell<Engine>>, kind: ResultKind, cookie: i32) -> Self {
        Self {
            engine,
            kind,
            cookie: Cell::new(cookie),
            auto_restart: Cell::new(matches!(kind, ResultKind::Signal(_))),
            in_flight: Cell::new(true),
            state: RefCell::new(State::Pending),
            deliveries: Cell::new(0),
            notifiers: RefCell::new(Vec::new()),
            channels: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn kind(&self) -> ResultKind {
        self.kind
    }

    pub(crate) fn cookie(&self) -> i32 {
        self.cookie.get()
    }

    pub(crate) fn set_cookie(&self, cookie: i32) {
        self.cookie.set(cookie);
    }

    /// Signal results re-request themselves when they fire.
    pub(crate) fn auto_restarts(&self) -> bool {
        matches!(self.kind, ResultKind::Signal(_)) && self.auto_restart.get()
    }

    pub(crate) fn set_in_flight(&self, in_flight: bool) {
        self.in_flight.set(in_flight);
    }

    pub(crate) fn reset(&self) {
        *self.state.borrow_mut() = State::Pending;
    }

    /// The value a late notifier or channel should see at once, if the
    /// result will never deliver again.
    fn terminal_value(&self) -> Option<Value> {
        match &*self.state.borrow() {
            State::Errored(f) => Some(Value::new_error(f.message())),
            State::Notified(v) if !self.in_flight.get() => Some(v.clone()),
            _ => None,
        }
    }

    fn outcome_since(&self, seen: u64) -> Option<Result<Value, IpcError>> {
        match &*self.state.borrow() {
            State::Errored(f) => Some(Err(f.to_error())),
            State::Notified(v) if !self.in_flight.get() || self.deliveries.get() > seen => {
                Some(Ok(v.clone()))
            }
            _ => None,
        }
    }

    pub(crate) fn deliver(&self, value: &Value) {
        *self.state.borrow_mut() = State::Notified(value.clone());
        self.deliveries.set(self.deliveries.get() + 1);
        self.notify(value);
    }

    pub(crate) fn fail(&self, failure: Failure) {
        let value = Value::new_error(failure.message());
        self.in_flight.set(false);
        *self.state.borrow_mut() = State::Errored(failure);
        self.deliveries.set(self.deliveries.get() + 1);
        self.notify(&value);
    }

    fn notify(&self, value: &Value) {
        // Notifiers may register further notifiers, or restart the result,
        // while running.
        let mut running = mem::take(&mut *self.notifiers.borrow_mut());
        for notifier in running.iter_mut() {
            notifier(value);
        }
        let mut slot = self.notifiers.borrow_mut();
        running.append(&mut *slot);
        *slot = running;

        let mut channels = self.channels.borrow_mut();
        channels.retain(|tx| tx.send(value.clone()).is_ok());
        if !self.in_flight.get() {
            slot.clear();
            channels.clear();
        }
    }
}

/// Handle onto a pending request or subscription.
///
/// Dropping the handle cancels it: the connection forgets the cookie and a
/// reply that arrives later is discarded. Use [`CommandResult::detach`] to
/// keep notifiers running without holding the handle.
pub struct CommandResult {
    inner: Rc<ResultInner>,
    detached: bool,
}

impl CommandResult {
    pub(crate) fn new(inner: Rc<ResultInner>) -> Self {
        Self {
            inner,
            detached: false,
        }
    }

    pub fn kind(&self) -> ResultKind {
        self.inner.kind
    }

    /// Cookie currently correlating this result; changes on restart.
    pub fn cookie(&self) -> i32 {
        self.inner.cookie()
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.inner.state.borrow(), State::Pending)
    }

    pub fn is_error(&self) -> bool {
        matches!(&*self.inner.state.borrow(), State::Errored(_))
    }

    /// The error message of an errored result.
    pub fn get_error(&self) -> Option<String> {
        match &*self.inner.state.borrow() {
            State::Errored(f) => Some(f.message()),
            _ => None,
        }
    }

    /// The most recently delivered value.
    pub fn value(&self) -> Option<Value> {
        match &*self.inner.state.borrow() {
            State::Notified(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Number of deliveries so far, errors included.
    pub fn deliveries(&self) -> u64 {
        self.inner.deliveries.get()
    }

    /// Block until the result completes, driving the connection on this
    /// thread.
    ///
    /// For a broadcast or auto-restarting signal this returns the next
    /// delivery after the call.
    ///
    /// # Errors
    ///
    /// - `IpcError::Server` if the server answered with an error value
    /// - `IpcError::Disconnected` if the connection went away first
    /// - `IpcError::Protocol` if the reply could not be decoded
    pub fn wait(&self) -> Result<Value, IpcError> {
        let seen = self.inner.deliveries.get();
        loop {
            if let Some(outcome) = self.inner.outcome_since(seen) {
                return outcome;
            }
            let engine = self.inner.engine.upgrade().ok_or(IpcError::Disconnected)?;
            client::drive(&engine, None)?;
        }
    }

    /// Call `notifier` on each delivery.
    ///
    /// If the result has already completed for good, `notifier` runs
    /// immediately with the final value.
    pub fn set_notifier<F>(&self, notifier: F)
    where
        F: FnMut(&Value) + 'static,
    {
        match self.inner.terminal_value() {
            Some(value) => {
                let mut notifier = notifier;
                notifier(&value);
            }
            None => self.inner.notifiers.borrow_mut().push(Box::new(notifier)),
        }
    }

    /// A channel fed with every delivery. It closes once the result can no
    /// longer deliver.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.terminal_value() {
            Some(value) => {
                // Receiver is alive, so this cannot fail.
                let _ = tx.send(value);
            }
            None => self.inner.channels.borrow_mut().push(tx),
        }
        rx
    }

    /// Control whether a signal result re-requests itself after firing.
    /// Signal results start with this on.
    pub fn set_auto_restart(&self, enabled: bool) {
        self.inner.auto_restart.set(enabled);
    }

    /// Ask for the next emission again.
    ///
    /// Signal results re-issue their request under a fresh cookie and go
    /// back to pending. Broadcast subscriptions never stop, so this is a
    /// no-op for them.
    ///
    /// # Errors
    ///
    /// `IpcError::NotRestartable` for command results, and
    /// `IpcError::Disconnected` once the connection is gone.
    pub fn restart(&self) -> Result<(), IpcError> {
        match self.inner.kind {
            ResultKind::Command => Err(IpcError::NotRestartable),
            ResultKind::Broadcast(_) if self.is_error() => Err(IpcError::Disconnected),
            ResultKind::Broadcast(_) => Ok(()),
            ResultKind::Signal(_) => {
                let engine = self.inner.engine.upgrade().ok_or(IpcError::Disconnected)?;
                client::restart_signal(&engine, &self.inner)
            }
        }
    }

    /// Give the handle to the connection. Notifiers keep firing until the
    /// result completes or the connection closes.
    pub fn detach(mut self) {
        if let Some(engine) = self.inner.engine.upgrade() {
            match engine.try_borrow_mut() {
                Ok(mut engine) => engine.keep_alive(&self.inner),
                Err(_) => warn!("Cannot detach result {} while the connection is busy", self.cookie()),
            }
        }
        self.detached = true;
    }
}

impl Drop for CommandResult {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(engine) = self.inner.engine.upgrade() {
            match engine.try_borrow_mut() {
                Ok(mut engine) => engine.forget(&self.inner),
                // Pruned when its reply shows up.
                Err(_) => trace!("Deferred cancel of result {}", self.cookie()),
            }
        }
    }
}

impl fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.borrow() {
            State::Pending => "pending",
            State::Notified(_) => "notified",
            State::Errored(_) => "errored",
        };
        f.debug_struct("CommandResult")
            .field("kind", &self.inner.kind)
            .field("cookie", &self.inner.cookie())
            .field("state", &state)
            .field("deliveries", &self.inner.deliveries.get())
            .finish()
    }
}
