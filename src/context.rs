//! Shared typed context for workflow execution.
//!
//! The context is a key→value store shared by every task in a workflow. Keys
//! are declared once as [`ContextKey`]s carrying the payload type, so reads
//! and writes go through serde instead of hand-rolled casts. Values live as
//! [`serde_json::Value`] internally, which keeps snapshots trivially
//! serializable for the persistence layer.
//!
//! Reads and writes are not ordered across concurrently running tasks;
//! callers that need ordering must serialize externally. In practice tasks
//! run sequentially per workflow, so contention only arises under explicit
//! fan-out, where last-write-wins applies.
//!
//! # Examples
//!
//! ```
//! use taskloom::context::{ContextKey, TypedContext};
//!
//! const QUERY: ContextKey<String> = ContextKey::new("query");
//!
//! let ctx = TypedContext::new();
//! ctx.set(&QUERY, "rust workflow engines".to_string()).unwrap();
//! assert_eq!(ctx.get(&QUERY).as_deref(), Some("rust workflow engines"));
//!
//! // Snapshot and restore round-trip the full store.
//! let snapshot = ctx.snapshot();
//! ctx.restore(snapshot);
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A named context slot tied to a payload type.
///
/// Declaring keys as constants gives every context entry a single place
/// where its name and schema are fixed:
///
/// ```
/// use taskloom::context::ContextKey;
///
/// const SOURCES: ContextKey<Vec<String>> = ContextKey::new("sources");
/// ```
pub struct ContextKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    /// Declare a key with the given wire name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// The key's name as stored in snapshots.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

/// Errors that can occur when encoding or decoding typed context values.
#[derive(Debug, Error, Diagnostic)]
pub enum ContextError {
    /// The value could not be serialized into the store.
    #[error("failed to encode context value for key '{key}': {source}")]
    #[diagnostic(code(taskloom::context::encode))]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The stored value does not match the key's declared type.
    #[error("failed to decode context value for key '{key}': {source}")]
    #[diagnostic(
        code(taskloom::context::decode),
        help("The stored value does not match the key's declared type.")
    )]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Snapshot of every context entry, ready for persistence.
pub type ContextSnapshot = FxHashMap<String, Value>;

/// Shared key→value store with schema-typed keys.
///
/// Cloning is cheap: clones share the same underlying store.
#[derive(Clone, Debug, Default)]
pub struct TypedContext {
    entries: Arc<RwLock<FxHashMap<String, Value>>>,
}

impl TypedContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the current value for `key`, or `None` when unset or when the
    /// stored value no longer decodes as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &ContextKey<T>) -> Option<T> {
        let guard = self.entries.read();
        let value = guard.get(key.name())?.clone();
        drop(guard);
        serde_json::from_value(value).ok()
    }

    /// Replace the value for `key`.
    pub fn set<T: Serialize>(&self, key: &ContextKey<T>, value: T) -> Result<(), ContextError> {
        let encoded = serde_json::to_value(value).map_err(|source| ContextError::Encode {
            key: key.name().to_string(),
            source,
        })?;
        self.entries.write().insert(key.name().to_string(), encoded);
        Ok(())
    }

    /// Functional update: `v' = f(v)`. The closure receives the current
    /// value (if any, decoded) and returns the replacement.
    pub fn update<T>(
        &self,
        key: &ContextKey<T>,
        f: impl FnOnce(Option<T>) -> T,
    ) -> Result<(), ContextError>
    where
        T: Serialize + DeserializeOwned,
    {
        let current = self.get(key);
        self.set(key, f(current))
    }

    /// Fetch a raw value by name, bypassing the typed key.
    pub fn get_raw(&self, name: &str) -> Option<Value> {
        self.entries.read().get(name).cloned()
    }

    /// Store a raw value by name, bypassing the typed key.
    pub fn set_raw(&self, name: impl Into<String>, value: Value) {
        self.entries.write().insert(name.into(), value);
    }

    /// Shallow-merge a map of key→value pairs into the store.
    pub fn merge(&self, partial: FxHashMap<String, Value>) {
        let mut guard = self.entries.write();
        for (k, v) in partial {
            guard.insert(k, v);
        }
    }

    /// Shallow-merge the fields of a JSON object. Non-object values are
    /// ignored; workflow inputs that are not objects stay task-local.
    pub fn merge_object(&self, value: &Value) {
        if let Value::Object(map) = value {
            let mut guard = self.entries.write();
            for (k, v) in map {
                guard.insert(k.clone(), v.clone());
            }
        }
    }

    /// Serialize all entries.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        self.entries.read().clone()
    }

    /// Replace the store with a previously captured snapshot.
    pub fn restore(&self, snapshot: ContextSnapshot) {
        *self.entries.write() = snapshot;
    }

    /// Number of entries currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
