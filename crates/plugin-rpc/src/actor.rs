//! Local actors: method name → handler tables built at registration time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ActorError;

pub type HandlerFuture = BoxFuture<'static, Result<Value, ActorError>>;

pub(crate) type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Operations a local actor exposes to its peers.
///
/// Cheap to clone; handlers are shared.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn builder() -> MethodTableBuilder {
        MethodTableBuilder::default()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub(crate) fn handler(&self, method: &str) -> Option<Handler> {
        self.methods.get(method).cloned()
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.method_names().collect();
        names.sort_unstable();
        f.debug_struct("MethodTable").field("methods", &names).finish()
    }
}

impl From<MethodTableBuilder> for MethodTable {
    fn from(builder: MethodTableBuilder) -> Self {
        builder.build()
    }
}

#[derive(Default)]
pub struct MethodTableBuilder {
    methods: HashMap<String, Handler>,
}

impl MethodTableBuilder {
    /// Async handler over the raw argument list.
    pub fn method<F, Fut, R>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActorError>> + Send + 'static,
        R: Serialize + 'static,
    {
        let handler: Handler = Arc::new(move |args| f(args).map(into_value).boxed());
        self.methods.insert(name.into(), handler);
        self
    }

    /// Async handler whose arguments are decoded from the JSON argument array,
    /// typically into a tuple: `|(id, count): (String, u32)| async move { .. }`.
    ///
    /// Arguments that do not decode are reported to the caller as a `TypeError`.
    pub fn typed<A, F, Fut, R>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActorError>> + Send + 'static,
        R: Serialize + 'static,
    {
        let name = name.into();
        let method = name.clone();
        let handler: Handler = Arc::new(move |args| {
            match serde_json::from_value::<A>(Value::Array(args)) {
                Ok(args) => f(args).map(into_value).boxed(),
                Err(e) => {
                    let err = ActorError::new(
                        "TypeError",
                        format!("invalid arguments for {method}: {e}"),
                    );
                    futures::future::ready(Err(err)).boxed()
                }
            }
        });
        self.methods.insert(name, handler);
        self
    }

    /// Synchronous handler; runs as soon as the request is dispatched.
    pub fn sync<F, R>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<R, ActorError> + Send + Sync + 'static,
        R: Serialize,
    {
        let handler: Handler =
            Arc::new(move |args| futures::future::ready(into_value(f(args))).boxed());
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn build(self) -> MethodTable {
        MethodTable {
            methods: self.methods,
        }
    }
}

fn into_value<R: Serialize>(result: Result<R, ActorError>) -> Result<Value, ActorError> {
    let value = result?;
    serde_json::to_value(value)
        .map_err(|e| ActorError::new("SerializationError", format!("failed to encode result: {e}")))
}
