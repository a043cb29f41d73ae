//! Raw shapes of the management API payloads.
//!
//! Every field is optional and decoded leniently: a field of the wrong type
//! becomes `None` instead of failing the whole payload. The rest of the crate
//! only sees the canonical types built from these.

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value;

pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Strings pass through; any other non-null value is kept as its JSON text.
pub(crate) fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    })
}

fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

/// Treats empty strings as missing.
pub(crate) fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|s| !s.trim().is_empty())
}

/// `data` block of the overview endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawOverview {
    #[serde(default, deserialize_with = "lenient")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub remote_count: Option<RawRemoteCount>,
    #[serde(default, deserialize_with = "lenient")]
    pub system: Option<RawPanelSystem>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub remote: Vec<RawNode>,
}

impl RawOverview {
    pub(crate) fn decode(value: &Value) -> Self {
        Self::deserialize(value).unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawRemoteCount {
    #[serde(default, deserialize_with = "lenient")]
    pub available: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub total: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawPanelSystem {
    #[serde(default, deserialize_with = "lenient")]
    pub uptime: Option<f64>,
}

/// One daemon entry of `overview.remote`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawNode {
    #[serde(default, deserialize_with = "lenient")]
    pub uuid: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub remarks: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub hostname: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub available: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub system: Option<RawNodeSystem>,
    #[serde(default, deserialize_with = "lenient")]
    pub instance: Option<RawInstanceCount>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawNodeSystem {
    #[serde(default, deserialize_with = "lenient")]
    pub cpu_usage: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub mem_usage: Option<f64>,
    #[serde(default, rename = "totalmem", deserialize_with = "lenient")]
    pub total_mem: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub release: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawInstanceCount {
    #[serde(default, deserialize_with = "lenient")]
    pub running: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub total: Option<u64>,
}

/// One entry of a node's instance listing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawInstance {
    #[serde(default, deserialize_with = "lenient")]
    pub instance_uuid: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub config: Option<RawInstanceConfig>,
    #[serde(default, deserialize_with = "lenient")]
    pub info: Option<RawInstanceInfo>,
}

impl RawInstance {
    /// Top-level status, else the nested `info.status`.
    pub(crate) fn status_code(&self) -> Option<i64> {
        self.status
            .or_else(|| self.info.as_ref().and_then(|info| info.status))
    }

    pub(crate) fn nickname(&self) -> Option<&str> {
        non_empty(self.config.as_ref().and_then(|c| c.nickname.as_ref()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawInstanceConfig {
    #[serde(default, deserialize_with = "lenient")]
    pub nickname: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawInstanceInfo {
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<i64>,
}

/// Instance listings arrive either as a bare list or wrapped under `data`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum InstancePage {
    Bare(Vec<Value>),
    Wrapped {
        #[serde(default)]
        data: Vec<Value>,
    },
}

impl InstancePage {
    /// Canonical list; any other shape yields no instances. Entries that are
    /// not objects are dropped.
    pub(crate) fn decode(value: Value) -> Vec<RawInstance> {
        let items = match Self::deserialize(value) {
            Ok(Self::Bare(items) | Self::Wrapped { data: items }) => items,
            Err(_) => return Vec::new(),
        };
        items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect()
    }
}
