//! Scripted [`ElectrumApi`] implementations for tests in this and
//! downstream crates.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{api::ElectrumApi, transport::TransportError};

/// A scripted server: canned responses keyed by `(method, first param)`.
/// Anything not programmed times out, which doubles as an offline server.
#[derive(Default)]
pub struct ScriptedElectrum {
    responses: Mutex<HashMap<(String, String), Value>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedElectrum {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Program the response for `(method, first param)`.
    pub fn set(&self, method: &str, key: impl ToString, value: Value) {
        self.responses
            .lock()
            .expect("poisoned")
            .insert((method.to_owned(), key.to_string()), value);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl ElectrumApi for ScriptedElectrum {
    async fn call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        self.calls
            .lock()
            .expect("poisoned")
            .push((method.to_owned(), params.clone()));
        let key = match params.get(0) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        self.responses
            .lock()
            .expect("poisoned")
            .get(&(method.to_owned(), key))
            .cloned()
            .ok_or(TransportError::Timeout)
    }
}
