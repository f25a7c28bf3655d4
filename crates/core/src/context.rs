//! Request-scoped context store.
//!
//! Each inbound request runs inside its own task-local scope (see [`scope`]).
//! Values written through a [`ContextVar`] are visible to everything the
//! request awaits, at any call depth, and never to another in-flight request.
//! Outside of a scope every variable reads as absent.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

const SLOT_COUNT: usize = 8;

type Slot = Option<Arc<dyn Any + Send + Sync>>;

#[derive(Clone, Default)]
struct Slots([Slot; SLOT_COUNT]);

impl Slots {
    fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }
}

tokio::task_local! {
    static STORE: RefCell<Slots>;
}

/// Correlation identifier of the current request.
pub static REQUEST_ID: ContextVar<String> = ContextVar::new("request_id", 0);
/// Client address, `"unknown"` when the transport exposes no peer.
pub static CLIENT_IP: ContextVar<String> = ContextVar::new("client_ip", 1);
/// Socket peer address, absent when the transport exposes none.
pub static CLIENT_HOST: ContextVar<String> = ContextVar::new("client_host", 2);
pub static METHOD: ContextVar<String> = ContextVar::new("method", 3);
pub static ROUTE: ContextVar<String> = ContextVar::new("route", 4);
/// Hostname the request was addressed to, without port.
pub static HOST: ContextVar<String> = ContextVar::new("host", 5);
pub static USER_AGENT: ContextVar<String> = ContextVar::new("user_agent", 6);
/// Authenticated user, set by business code when it knows one.
pub static USER_ID: ContextVar<i64> = ContextVar::new("user_id", 7);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context variable `{0}` used outside of a request scope")]
    NoScope(&'static str),

    #[error("token created by `{found}` cannot reset `{expected}`")]
    ForeignToken {
        expected: &'static str,
        found: &'static str,
    },
}

/// A typed, named slot in the request context store.
pub struct ContextVar<T> {
    name: &'static str,
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextVar<T> {
    const fn new(name: &'static str, index: usize) -> Self {
        assert!(index < SLOT_COUNT);
        Self {
            name,
            index,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> ContextVar<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Current value, or `None` when unset or outside of a request scope.
    pub fn get(&self) -> Option<T> {
        STORE
            .try_with(|store| {
                store.borrow().0[self.index]
                    .as_ref()
                    .and_then(|value| value.downcast_ref::<T>())
                    .cloned()
            })
            .ok()
            .flatten()
    }

    /// Assign a value for the rest of the current scope.
    ///
    /// The returned token restores the previous value when handed to
    /// [`ContextVar::reset`].
    pub fn set(&'static self, value: T) -> Result<Token<T>, ContextError> {
        let value: Arc<dyn Any + Send + Sync> = Arc::new(value);
        STORE
            .try_with(|store| {
                let previous = store.borrow_mut().0[self.index].replace(value);
                Token {
                    var: self,
                    previous,
                }
            })
            .map_err(|_| ContextError::NoScope(self.name))
    }

    /// Restore the value that was current when `token` was created.
    pub fn reset(&self, token: Token<T>) -> Result<(), ContextError> {
        if !std::ptr::eq(self, token.var) {
            return Err(ContextError::ForeignToken {
                expected: self.name,
                found: token.var.name,
            });
        }
        STORE
            .try_with(|store| {
                store.borrow_mut().0[self.index] = token.previous;
            })
            .map_err(|_| ContextError::NoScope(self.name))
    }
}

impl<T> std::fmt::Debug for ContextVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextVar")
            .field("name", &self.name)
            .finish()
    }
}

/// Restore handle returned by [`ContextVar::set`].
#[must_use = "dropping a token makes the assignment permanent for the scope"]
pub struct Token<T: 'static> {
    var: &'static ContextVar<T>,
    previous: Slot,
}

impl<T: 'static> Token<T> {
    /// The variable this token belongs to.
    pub fn var(&self) -> &'static ContextVar<T> {
        self.var
    }
}

impl<T: 'static> std::fmt::Debug for Token<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("var", &self.var.name)
            .field("had_previous", &self.previous.is_some())
            .finish()
    }
}

/// Run `future` with a fresh, empty context store.
pub fn scope<F>(future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    STORE.scope(RefCell::new(Slots::default()), future)
}

/// Whether the caller is running inside a request scope.
pub fn is_active() -> bool {
    STORE.try_with(|_| ()).is_ok()
}

/// True when no variable holds a value (always true outside a scope).
pub fn is_empty() -> bool {
    STORE
        .try_with(|store| store.borrow().is_empty())
        .unwrap_or(true)
}

/// Copy of the current values, for carrying a request's context into tasks it
/// spawns.
#[derive(Clone, Default)]
pub struct Snapshot(Slots);

/// Capture the current values. Empty outside of a scope.
pub fn snapshot() -> Snapshot {
    Snapshot(
        STORE
            .try_with(|store| store.borrow().clone())
            .unwrap_or_default(),
    )
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Run `future` in a new scope seeded with this snapshot.
    pub fn scope<F>(self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        STORE.scope(RefCell::new(self.0), future)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.0.0.iter().filter(|slot| slot.is_some()).count();
        f.debug_struct("Snapshot").field("set", &set).finish()
    }
}

/// Per-request metadata handed to handlers as an axum `Extension`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation identifier, also sent back as `X-Request-ID`.
    pub request_id: String,
    /// When the request was received.
    pub start_time: Instant,
    pub client_ip: String,
}

impl RequestContext {
    pub fn new(client_ip: String) -> Self {
        Self {
            request_id: generate_request_id(),
            start_time: Instant::now(),
            client_ip,
        }
    }

    /// Returns elapsed time since request start.
    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }
}

/// 8 bytes from the thread-local CSPRNG, hex encoded.
pub fn generate_request_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
