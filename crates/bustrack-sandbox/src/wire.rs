//! JSON encoding of [`Value`] for the subprocess bridge.
//!
//! Plain JSON for everything except assets, which travel as
//! `{"$asset": {"data": <base64>, "content_type", "name", "url"?, "bucket"?}}`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bustrack_core::{Asset, Value};
use serde_json::json;

use crate::error::ScriptError;

pub const ASSET_TAG: &str = "$asset";

/// Encode a capability reply. Non-finite numbers have no JSON form and are
/// rejected rather than sent as `null`.
pub fn to_wire(value: &Value) -> Result<serde_json::Value, ScriptError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => json!(*n as i64),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| ScriptError::Protocol(format!("{n} cannot be sent as JSON")))?,
        Value::String(s) => json!(s),
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_wire).collect::<Result<_, _>>()?),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_wire(v)?)))
                .collect::<Result<_, ScriptError>>()?,
        ),
        Value::Asset(asset) => {
            let mut body = json!({
                "data": BASE64.encode(&asset.bytes),
                "content_type": asset.content_type,
                "name": asset.name,
            });
            if let Some(url) = &asset.origin_url {
                body["url"] = json!(url);
            }
            if let Some(bucket) = &asset.bucket {
                body["bucket"] = json!(bucket);
            }
            let mut envelope = serde_json::Map::new();
            envelope.insert(ASSET_TAG.to_string(), body);
            serde_json::Value::Object(envelope)
        }
    })
}

pub fn from_wire(json: serde_json::Value) -> Result<Value, ScriptError> {
    match json {
        serde_json::Value::Array(items) => Ok(Value::List(
            items.into_iter().map(from_wire).collect::<Result<_, _>>()?,
        )),
        serde_json::Value::Object(mut map) => {
            if map.len() == 1 {
                if let Some(body) = map.remove(ASSET_TAG) {
                    return decode_asset(body).map(Value::Asset);
                }
            }
            Ok(Value::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((k, from_wire(v)?)))
                    .collect::<Result<_, ScriptError>>()?,
            ))
        }
        scalar => Ok(Value::from(scalar)),
    }
}

fn decode_asset(body: serde_json::Value) -> Result<Asset, ScriptError> {
    let field = |key: &str| body.get(key).and_then(|v| v.as_str());
    let data = field("data")
        .ok_or_else(|| ScriptError::Protocol("asset without 'data'".into()))?;
    let bytes = BASE64
        .decode(data)
        .map_err(|e| ScriptError::Protocol(format!("asset data is not base64: {e}")))?;
    let content_type = field("content_type").unwrap_or("application/octet-stream");
    let mut asset = Asset::new(bytes, content_type, field("name").unwrap_or("asset"));
    asset.origin_url = field("url").map(str::to_string);
    asset.bucket = field("bucket").map(str::to_string);
    Ok(asset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_envelope() {
        let wire = json!({"shot": {"$asset": {
            "data": "iVBORw==",
            "content_type": "image/png",
            "name": "a.png",
            "url": "https://example.com/a.png"
        }}});
        let Value::Map(map) = from_wire(wire).unwrap() else {
            panic!("expected map");
        };
        let Some(Value::Asset(asset)) = map.get("shot") else {
            panic!("expected asset");
        };
        assert_eq!(asset.bytes, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(asset.origin_url.as_deref(), Some("https://example.com/a.png"));
        assert_eq!(asset.bucket(), "images");

        let back = to_wire(&Value::Asset(asset.clone())).unwrap();
        assert_eq!(back["$asset"]["data"], "iVBORw==");
        assert!(back["$asset"].get("bucket").is_none());
    }

    #[test]
    fn test_tag_alongside_other_keys_is_a_map() {
        let value = from_wire(json!({"$asset": 1, "other": 2})).unwrap();
        assert!(matches!(value, Value::Map(ref m) if m.len() == 2));
    }

    #[test]
    fn test_bad_asset_is_protocol_error() {
        let err = from_wire(json!({"$asset": {"data": "!!!"}})).unwrap_err();
        assert!(matches!(err, ScriptError::Protocol(_)));
        assert!(from_wire(json!({"$asset": {}})).is_err());
    }

    #[test]
    fn test_non_finite_numbers_are_rejected() {
        assert_eq!(to_wire(&Value::Number(2.5)).unwrap(), json!(2.5));
        assert_eq!(to_wire(&Value::Number(3.0)).unwrap(), json!(3));

        for n in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = to_wire(&Value::List(vec![Value::Number(n)])).unwrap_err();
            assert!(matches!(err, ScriptError::Protocol(_)), "{err}");
        }
    }
}
