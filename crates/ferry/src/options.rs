//! Transfer options and wire-shape normalization.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Ordered name/value pair, the shape the wire layer wants when it needs a
/// list rather than a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

/// Flattens an ordered map into `{name, value}` pairs in insertion order,
/// stringifying every value. Pure; used for both extra request headers and
/// multipart form parameters.
pub fn to_name_value_pairs(map: &Map<String, Value>) -> Vec<NameValue> {
    map.iter()
        .map(|(name, value)| NameValue {
            name: name.clone(),
            value: stringify(value),
        })
        .collect()
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Upload request method. Anything that is not an exact case-insensitive
/// match of `PUT` normalizes to POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
}

impl HttpMethod {
    pub fn normalize(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("put") {
            HttpMethod::Put
        } else {
            HttpMethod::Post
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

/// Configuration for one transfer invocation. Immutable once passed in.
///
/// Field names follow the bridge-facing camelCase shapes, so a JSON options
/// object deserializes directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferOptions {
    /// Multipart field name for the file part (upload only). `None`
    /// selects a raw, non-multipart request body.
    pub file_key: Option<String>,
    /// File name reported in the multipart part; defaults to the source
    /// path's file name.
    pub file_name: Option<String>,
    pub mime_type: String,
    /// Extra form fields, sent before the file part (upload only).
    pub params: Map<String, Value>,
    /// Extra request headers.
    pub headers: Map<String, Value>,
    /// Upload method, normalized via [`HttpMethod::normalize`].
    pub http_method: String,
    /// Stream without a precomputed Content-Length. Only an explicit
    /// boolean `false` disables this.
    #[serde(deserialize_with = "bool_or_true")]
    pub chunked_mode: bool,
    /// Relaxes certificate validation for this session's client only.
    pub trust_all_hosts: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            file_key: Some("file".to_string()),
            file_name: None,
            mime_type: "application/octet-stream".to_string(),
            params: Map::new(),
            headers: Map::new(),
            http_method: "POST".to_string(),
            chunked_mode: true,
            trust_all_hosts: false,
        }
    }
}

impl TransferOptions {
    pub fn method(&self) -> HttpMethod {
        HttpMethod::normalize(&self.http_method)
    }
}

// Absent and non-boolean nullish values preserve the chunked default.
fn bool_or_true<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        _ => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pairs_preserve_insertion_order_and_count() {
        let map = json!({"z": 1, "a": "two", "m": true})
            .as_object()
            .cloned()
            .expect("object literal");
        let pairs = to_name_value_pairs(&map);
        assert_eq!(pairs.len(), map.len());
        assert_eq!(pairs[0], NameValue { name: "z".into(), value: "1".into() });
        assert_eq!(pairs[1], NameValue { name: "a".into(), value: "two".into() });
        assert_eq!(pairs[2], NameValue { name: "m".into(), value: "true".into() });
    }

    #[test]
    fn strings_are_not_requoted() {
        let map = json!({"k": "plain"}).as_object().cloned().expect("object");
        assert_eq!(to_name_value_pairs(&map)[0].value, "plain");
    }

    #[test]
    fn put_is_normalized_case_insensitively() {
        assert_eq!(HttpMethod::normalize("put"), HttpMethod::Put);
        assert_eq!(HttpMethod::normalize("PUT"), HttpMethod::Put);
        assert_eq!(HttpMethod::normalize("Put"), HttpMethod::Put);
    }

    #[test]
    fn unsupported_methods_become_post() {
        assert_eq!(HttpMethod::normalize("delete"), HttpMethod::Post);
        assert_eq!(HttpMethod::normalize("GET"), HttpMethod::Post);
        assert_eq!(HttpMethod::normalize(""), HttpMethod::Post);
    }

    #[test]
    fn defaults() {
        let options = TransferOptions::default();
        assert_eq!(options.file_key.as_deref(), Some("file"));
        assert_eq!(options.mime_type, "application/octet-stream");
        assert_eq!(options.method(), HttpMethod::Post);
        assert!(options.chunked_mode);
        assert!(!options.trust_all_hosts);
    }

    #[test]
    fn chunked_mode_only_explicit_false_disables() {
        let absent: TransferOptions = serde_json::from_value(json!({})).expect("deserialize");
        assert!(absent.chunked_mode);

        let explicit: TransferOptions =
            serde_json::from_value(json!({"chunkedMode": false})).expect("deserialize");
        assert!(!explicit.chunked_mode);

        let null: TransferOptions =
            serde_json::from_value(json!({"chunkedMode": null})).expect("deserialize");
        assert!(null.chunked_mode);

        let stringy: TransferOptions =
            serde_json::from_value(json!({"chunkedMode": "no"})).expect("deserialize");
        assert!(stringy.chunked_mode);
    }

    #[test]
    fn null_file_key_selects_raw_body() {
        let options: TransferOptions =
            serde_json::from_value(json!({"fileKey": null})).expect("deserialize");
        assert!(options.file_key.is_none());
    }

    #[test]
    fn options_deserialize_from_bridge_shape() {
        let options: TransferOptions = serde_json::from_value(json!({
            "fileKey": "photo",
            "fileName": "pic.jpg",
            "mimeType": "image/jpeg",
            "httpMethod": "put",
            "params": {"album": "summer"},
            "headers": {"X-Token": "abc"},
            "trustAllHosts": true
        }))
        .expect("deserialize");
        assert_eq!(options.file_key.as_deref(), Some("photo"));
        assert_eq!(options.file_name.as_deref(), Some("pic.jpg"));
        assert_eq!(options.method(), HttpMethod::Put);
        assert!(options.trust_all_hosts);
        assert_eq!(options.params.len(), 1);
        assert_eq!(options.headers.len(), 1);
    }
}
