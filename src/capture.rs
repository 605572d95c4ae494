//! Capturing events from wrapped functions.
//!
//! A [`Capture`] wraps a function so that every call records a [`CaptureEvent`]. The wrapped
//! function receives a mutable copy of the event template and may fill in properties while it
//! runs; the event is submitted once the function returns.
//!
//! The client is looked up at call time through a [`ClientResolver`], so a function can be
//! wrapped before any client exists (e.g. at startup, with a [`ClientRegistry`] that is filled in
//! later).
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use crate::{CaptureEvent, Client};

/// Boxed future returned by functions wrapped with [`Capture::wrap_async`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Looks up the client that captured events are submitted to.
pub trait ClientResolver: Send + Sync {
    /// Client to submit to, or `None` to drop the event.
    fn resolve(&self) -> Option<Client>;
}

impl ClientResolver for Client {
    fn resolve(&self) -> Option<Client> {
        Some(self.clone())
    }
}

impl<F> ClientResolver for F
where
    F: Fn() -> Option<Client> + Send + Sync,
{
    fn resolve(&self) -> Option<Client> {
        self()
    }
}

/// Holder for a process-wide default client.
///
/// Clones share the same slot.
///
/// ```
/// # use posthog_batch::{ClientConfig, ClientRegistry};
/// let registry = ClientRegistry::new();
/// let signup = registry.capture().event("signed up").wrap(|user: String, event| {
///     event.distinct_id = user;
/// });
///
/// // Not captured: no client registered yet.
/// signup.call("user-1".to_owned());
///
/// registry.register(ClientConfig::from_api_key("phc_key").to_client());
/// ```
#[derive(Clone, Default)]
pub struct ClientRegistry {
    client: Arc<RwLock<Option<Client>>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> ClientRegistry {
        ClientRegistry::default()
    }

    /// Make `client` the default, returning the previous one.
    pub fn register(&self, client: Client) -> Option<Client> {
        self.client
            .write()
            .expect("thread holding client registry lock should not panic")
            .replace(client)
    }

    /// The registered client, if any.
    pub fn get(&self) -> Option<Client> {
        self.client
            .read()
            .expect("thread holding client registry lock should not panic")
            .clone()
    }

    /// Remove the registered client, returning it.
    pub fn clear(&self) -> Option<Client> {
        self.client
            .write()
            .expect("thread holding client registry lock should not panic")
            .take()
    }

    /// Build a [`Capture`] that submits to whichever client is registered at call time.
    pub fn capture(&self) -> Capture {
        Capture::new(self.clone())
    }
}

impl ClientResolver for ClientRegistry {
    fn resolve(&self) -> Option<Client> {
        self.get()
    }
}

/// Builder for wrapping functions so their calls are captured.
#[derive(Clone)]
pub struct Capture {
    template: CaptureEvent,
    resolver: Arc<dyn ClientResolver>,
}

impl Capture {
    /// Create a builder submitting through `resolver`.
    pub fn new(resolver: impl ClientResolver + 'static) -> Capture {
        Capture {
            template: CaptureEvent::default(),
            resolver: Arc::new(resolver),
        }
    }

    /// Event name. Defaults to the wrapped function's name.
    pub fn event(mut self, event: impl Into<String>) -> Capture {
        self.template.event = event.into();
        self
    }

    /// Distinct id used unless the wrapped function sets one.
    pub fn distinct_id(mut self, distinct_id: impl Into<String>) -> Capture {
        self.template.distinct_id = distinct_id.into();
        self
    }

    /// Add a property to every captured event.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Capture {
        self.template.properties.insert(key.into(), value.into());
        self
    }

    /// Add several properties to every captured event.
    pub fn properties(mut self, properties: Map<String, Value>) -> Capture {
        self.template.properties.extend(properties);
        self
    }

    /// Add a top-level field to every captured event.
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Capture {
        self.template.extra.insert(key.into(), value.into());
        self
    }

    /// Wrap a synchronous function.
    pub fn wrap<A, R, F>(self, f: F) -> Captured<F>
    where
        F: Fn(A, &mut CaptureEvent) -> R,
    {
        Captured {
            template: self.template_for::<F>(),
            resolver: self.resolver,
            f,
        }
    }

    /// Wrap an async function. The function gets the event for as long as its future runs.
    ///
    /// ```
    /// # use posthog_batch::{CaptureEvent, ClientRegistry};
    /// let registry = ClientRegistry::new();
    /// let checkout = registry.capture().event("checkout").wrap_async(
    ///     |amount: u64, event: &mut CaptureEvent| {
    ///         Box::pin(async move {
    ///             event.properties.insert("amount".into(), amount.into());
    ///             amount
    ///         })
    ///     },
    /// );
    /// ```
    pub fn wrap_async<A, R, F>(self, f: F) -> CapturedAsync<F>
    where
        F: for<'c> Fn(A, &'c mut CaptureEvent) -> BoxFuture<'c, R>,
    {
        CapturedAsync {
            template: self.template_for::<F>(),
            resolver: self.resolver,
            f,
        }
    }

    fn template_for<F>(&self) -> CaptureEvent {
        let mut template = self.template.clone();
        if template.event.is_empty() {
            template.event = function_name::<F>().to_owned();
        }
        template
    }
}

/// Last path segment of `F`'s type name, skipping closure markers and generic arguments.
fn function_name<F>() -> &'static str {
    let path = std::any::type_name::<F>();
    let path = path.split('<').next().unwrap_or(path);
    path.split("::")
        .filter(|segment| !segment.starts_with('{'))
        .last()
        .unwrap_or(path)
}

fn submit(resolver: &dyn ClientResolver, event: CaptureEvent) {
    match resolver.resolve() {
        Some(client) => client.add_event(event),
        None => {
            log::debug!(target: "posthog", event = event.event.as_str(); "no PostHog client available, event not captured");
        }
    }
}

/// A synchronous function whose calls are captured. See [`Capture::wrap`].
pub struct Captured<F> {
    template: CaptureEvent,
    resolver: Arc<dyn ClientResolver>,
    f: F,
}

impl<F> Captured<F> {
    /// Event every call starts from.
    pub fn template(&self) -> &CaptureEvent {
        &self.template
    }

    /// Call the function and capture the event it produced.
    pub fn call<A, R>(&self, args: A) -> R
    where
        F: Fn(A, &mut CaptureEvent) -> R,
    {
        let mut event = self.template.clone();
        let result = (self.f)(args, &mut event);
        submit(self.resolver.as_ref(), event);
        result
    }

    /// Call a fallible function, capturing the event only if it returns `Ok`.
    pub fn try_call<A, T, E>(&self, args: A) -> std::result::Result<T, E>
    where
        F: Fn(A, &mut CaptureEvent) -> std::result::Result<T, E>,
    {
        let mut event = self.template.clone();
        let result = (self.f)(args, &mut event)?;
        submit(self.resolver.as_ref(), event);
        Ok(result)
    }
}

/// An async function whose calls are captured. See [`Capture::wrap_async`].
pub struct CapturedAsync<F> {
    template: CaptureEvent,
    resolver: Arc<dyn ClientResolver>,
    f: F,
}

impl<F> CapturedAsync<F> {
    /// Event every call starts from.
    pub fn template(&self) -> &CaptureEvent {
        &self.template
    }

    /// Await the function and capture the event it produced.
    pub async fn call<A, R>(&self, args: A) -> R
    where
        F: for<'c> Fn(A, &'c mut CaptureEvent) -> BoxFuture<'c, R>,
    {
        let mut event = self.template.clone();
        let result = (self.f)(args, &mut event).await;
        submit(self.resolver.as_ref(), event);
        result
    }

    /// Await a fallible function, capturing the event only if it returns `Ok`.
    pub async fn try_call<A, T, E>(&self, args: A) -> std::result::Result<T, E>
    where
        F: for<'c> Fn(A, &'c mut CaptureEvent) -> BoxFuture<'c, std::result::Result<T, E>>,
    {
        let mut event = self.template.clone();
        let result = (self.f)(args, &mut event).await?;
        submit(self.resolver.as_ref(), event);
        Ok(result)
    }
}
