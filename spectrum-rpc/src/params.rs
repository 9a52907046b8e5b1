//! Binding of JSON-RPC `params` (positional list or named mapping) onto
//! typed per-method arguments.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::RpcError;

/// The parsed `params` of one request.
#[derive(Debug)]
pub struct Params {
    positional: Vec<Value>,
    named: Map<String, Value>,
}

impl Params {
    pub fn parse(params: Value) -> Result<Self, RpcError> {
        match params {
            Value::Null => Ok(Self {
                positional: Vec::new(),
                named: Map::new(),
            }),
            Value::Array(positional) => Ok(Self {
                positional,
                named: Map::new(),
            }),
            Value::Object(named) => Ok(Self {
                positional: Vec::new(),
                named,
            }),
            other => Err(RpcError::BadArgs(format!(
                "params must be a list or a mapping, got {other}"
            ))),
        }
    }

    fn raw(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional
            .get(index)
            .or_else(|| self.named.get(name))
            .filter(|v| !v.is_null())
    }

    /// An optional argument, by position or name.
    pub fn get<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, RpcError> {
        match self.raw(index, name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    RpcError::BadArgs(format!("invalid {name}: {e}"))
                }),
        }
    }

    /// A required argument.
    pub fn require<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<T, RpcError> {
        self.get(index, name)?.ok_or_else(|| {
            RpcError::BadArgs(format!("missing required argument: {name}"))
        })
    }

    /// An optional argument with a default.
    pub fn get_or<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> Result<T, RpcError> {
        Ok(self.get(index, name)?.unwrap_or(default))
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn binds_positional_and_named() {
        let positional = Params::parse(json!(["w", true])).unwrap();
        assert_eq!(
            positional.require::<String>(0, "wallet_name").unwrap(),
            "w",
        );
        assert!(positional
            .get_or(1, "disable_private_keys", false)
            .unwrap());
        assert!(!positional.get_or(2, "blank", false).unwrap());

        let named = Params::parse(json!({
            "wallet_name": "w",
            "blank": true,
        }))
        .unwrap();
        assert_eq!(
            named.require::<String>(0, "wallet_name").unwrap(),
            "w",
        );
        assert!(named.get_or(2, "blank", false).unwrap());
    }

    #[test]
    fn null_is_absent() {
        let params = Params::parse(json!([null, 5])).unwrap();
        assert_eq!(params.get::<String>(0, "a").unwrap(), None);
        assert_eq!(params.get::<u32>(1, "b").unwrap(), Some(5));
    }

    #[test]
    fn missing_required_and_bad_types_error() {
        let params = Params::parse(json!([])).unwrap();
        let err = params.require::<String>(0, "txid").unwrap_err();
        assert_eq!(err.code(), -8);

        let params = Params::parse(json!(["not_a_number"])).unwrap();
        let err = params.require::<u32>(0, "height").unwrap_err();
        assert_eq!(err.code(), -8);

        let err = Params::parse(json!("scalar")).unwrap_err();
        assert_eq!(err.code(), -8);
    }
}
