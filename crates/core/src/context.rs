//! Per-worker key/value scratch context

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::worker::WorkerId;

/// Scratch state for the test currently running on one worker.
///
/// Created lazily the first time a worker runs a test, cleared (not dropped)
/// at the end of every test and reused by the next one.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    identity: WorkerId,
    created_at: DateTime<Utc>,
    test_name: Option<String>,
    data: HashMap<String, Value>,
    /// Last timestamp handed out by `unique_id`, in microseconds
    last_unique: i64,
}

impl ExecutionContext {
    pub fn new(identity: WorkerId) -> Self {
        Self {
            identity,
            created_at: Utc::now(),
            test_name: None,
            data: HashMap::new(),
            last_unique: 0,
        }
    }

    pub fn identity(&self) -> WorkerId {
        self.identity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn test_name(&self) -> Option<&str> {
        self.test_name.as_deref()
    }

    pub(crate) fn set_test_name(&mut self, name: impl Into<String>) {
        self.test_name = Some(name.into());
    }

    /// Look up a value. Missing keys are `None`, never an error.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Look up a value and deserialize it into `T`.
    ///
    /// Returns `None` when the key is missing or the value has a different shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop every entry and the test name association
    pub fn clear(&mut self) {
        self.data.clear();
        self.test_name = None;
    }

    /// Collision-resistant id for building test fixtures (usernames, emails).
    ///
    /// Derived from the worker identity and the current time, so no cross-worker
    /// coordination is needed. Successive calls on one context never repeat,
    /// even within a single clock tick.
    pub fn unique_id(&mut self) -> String {
        let now = Utc::now().timestamp_micros();
        let stamp = now.max(self.last_unique + 1);
        self.last_unique = stamp;
        format!("{}-{}", self.identity.as_u64(), stamp)
    }
}
