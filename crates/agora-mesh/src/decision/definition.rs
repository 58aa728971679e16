//! Typed decision definitions and their type-erased form.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::attempt::AttemptId;
use crate::identity::NodeId;

type Validity<T> = Arc<dyn Fn(T) -> BoxFuture<'static, bool> + Send + Sync>;
type Accept<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;
type Decline = Arc<dyn Fn(AttemptId) -> BoxFuture<'static, ()> + Send + Sync>;
type ForeignAccept<T> = Arc<dyn Fn(T, NodeId) -> BoxFuture<'static, ()> + Send + Sync>;

/// A kind of group decision, registered under a key.
///
/// - `validity` decides how this peer votes on someone else's attempt
/// - `on_accept` runs on the proposer once the decision passes
/// - `on_decline` runs on the proposer when it does not
/// - `on_foreign_accept` runs on every other peer once a verified action
///   arrives; without it `on_accept` runs instead
pub struct Decision<T> {
    key: String,
    validity: Validity<T>,
    on_accept: Accept<T>,
    on_decline: Decline,
    on_foreign_accept: Option<ForeignAccept<T>>,
    timeout: Option<Duration>,
}

impl<T> Decision<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new<F, Fut>(key: impl Into<String>, validity: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            key: key.into(),
            validity: Arc::new(move |data: T| validity(data).boxed()),
            on_accept: Arc::new(|_: T| async {}.boxed()),
            on_decline: Arc::new(|_: AttemptId| async {}.boxed()),
            on_foreign_accept: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn on_accept<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_accept = Arc::new(move |data: T| handler(data).boxed());
        self
    }

    #[must_use]
    pub fn on_decline<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(AttemptId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_decline = Arc::new(move |id: AttemptId| handler(id).boxed());
        self
    }

    #[must_use]
    pub fn on_foreign_accept<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(T, NodeId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_foreign_accept = Some(Arc::new(move |data: T, source: NodeId| {
            handler(data, source).boxed()
        }));
        self
    }

    /// Decline our own attempts that are not fully answered within `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn decode(&self, data: &Value) -> Option<T> {
        match serde_json::from_value(data.clone()) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Malformed payload for decision {}: {}", self.key, e);
                None
            }
        }
    }
}

/// A registered decision with its payload type erased.
pub trait ErasedDecision: Send + Sync {
    fn key(&self) -> &str;

    fn timeout(&self) -> Option<Duration>;

    /// Vote on a payload. Malformed payloads are invalid.
    fn validate(&self, data: &Value) -> BoxFuture<'static, bool>;

    fn accept(&self, data: &Value) -> BoxFuture<'static, ()>;

    fn decline(&self, attempt: AttemptId) -> BoxFuture<'static, ()>;

    fn foreign_accept(&self, data: &Value, source: NodeId) -> BoxFuture<'static, ()>;
}

impl<T> ErasedDecision for Decision<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn validate(&self, data: &Value) -> BoxFuture<'static, bool> {
        match self.decode(data) {
            Some(data) => (self.validity)(data),
            None => async { false }.boxed(),
        }
    }

    fn accept(&self, data: &Value) -> BoxFuture<'static, ()> {
        match self.decode(data) {
            Some(data) => (self.on_accept)(data),
            None => async {}.boxed(),
        }
    }

    fn decline(&self, attempt: AttemptId) -> BoxFuture<'static, ()> {
        (self.on_decline)(attempt)
    }

    fn foreign_accept(&self, data: &Value, source: NodeId) -> BoxFuture<'static, ()> {
        let Some(data) = self.decode(data) else {
            return async {}.boxed();
        };
        match &self.on_foreign_accept {
            Some(handler) => handler(data, source),
            None => (self.on_accept)(data),
        }
    }
}
