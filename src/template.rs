//! Flat hash fields to typed configuration
//!
//! Configuration lives in one store hash whose keys are namespaced strings
//! (`gateway:private-port`). A [`HashTemplate`] names the hash key, value kind
//! and default of each config field, producing a JSON object that any
//! `Deserialize` config struct can be read from.

use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::{GatewayError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    String,
    Number,
}

/// How one config field is read from the hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub key: String,
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

impl FieldSpec {
    pub fn string(key: &str) -> Self {
        Self { key: key.to_string(), kind: FieldKind::String, default: None, required: false }
    }

    pub fn number(key: &str) -> Self {
        Self { key: key.to_string(), kind: FieldKind::Number, default: None, required: false }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn convert(&self, raw: &str) -> Result<Value> {
        match self.kind {
            FieldKind::String => Ok(Value::String(raw.to_string())),
            FieldKind::Number => parse_number(raw.trim()).map(Value::Number).ok_or_else(|| {
                GatewayError::config_error(format!("{}: number expected, found {raw:?}", self.key))
            }),
        }
    }
}

fn parse_number(raw: &str) -> Option<Number> {
    match raw.parse::<i64>() {
        Ok(value) => Some(Number::from(value)),
        Err(_) => raw.parse::<f64>().ok().and_then(Number::from_f64),
    }
}

/// Config field name to [`FieldSpec`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashTemplate {
    fields: BTreeMap<String, FieldSpec>,
}

impl HashTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, spec: FieldSpec) -> Self {
        self.fields.insert(name.to_string(), spec);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Gateway proxy addressing. Only the IMEI must be configured.
    pub fn gateway() -> Self {
        Self::new()
            .field("imei", FieldSpec::string("gateway:imei").required())
            .field("primary", FieldSpec::string("gateway:primary").with_default("public"))
            .field("privateHost", FieldSpec::string("gateway:private-host"))
            .field("privatePort", FieldSpec::number("gateway:private-port"))
            .field("privateRelay", FieldSpec::number("gateway:private-relay").with_default(4000))
            .field("publicHost", FieldSpec::string("gateway:public-host"))
            .field("publicPort", FieldSpec::number("gateway:public-port"))
            .field("publicRelay", FieldSpec::number("gateway:public-relay").with_default(4001))
    }

    pub fn ppp() -> Self {
        Self::new()
            .field("subnet", FieldSpec::string("ppp:subnet"))
            .field("mask", FieldSpec::string("ppp:mask"))
            .field("interface", FieldSpec::string("ppp:interface"))
            .field("routeInterval", FieldSpec::number("ppp:route-interval"))
    }

    pub fn modem() -> Self {
        Self::new()
            .field("reportFile", FieldSpec::string("modem:report-file"))
            .field("commandFile", FieldSpec::string("modem:command-file"))
            .field("rssiInterval", FieldSpec::number("modem:rssi-interval"))
    }

    /// Hash keys that must be present before the config is usable.
    pub fn requirements(&self) -> Vec<String> {
        self.fields.values().filter(|spec| spec.required).map(|spec| spec.key.clone()).collect()
    }

    /// Convert hash fields into a config object. Absent fields take their
    /// default, or are left out when they have none.
    pub fn to_config(&self, hash: &HashMap<String, String>) -> Result<Map<String, Value>> {
        let mut config = Map::new();
        for (name, spec) in &self.fields {
            let value = match hash.get(&spec.key) {
                Some(raw) => spec.convert(raw)?,
                None => match &spec.default {
                    Some(default) => default.clone(),
                    None => continue,
                },
            };
            config.insert(name.clone(), value);
        }
        Ok(config)
    }

    /// Convert hash fields straight into a config type.
    pub fn deserialize<T: DeserializeOwned>(&self, hash: &HashMap<String, String>) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.to_config(hash)?))?)
    }
}
