//! Document metadata returned by write operations.

use serde::{Deserialize, Serialize};

/// Identity and revision the server assigns to a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(rename = "_rev")]
    pub rev: String,
}

/// Document types that carry server-assigned metadata.
///
/// The driver calls `apply_meta` with the metadata of a write response so
/// the caller gets its document back with id, key and revision filled in.
pub trait ApplyMeta: Sized {
    fn apply_meta(self, meta: &DocumentMeta) -> Self;
}

impl ApplyMeta for DocumentMeta {
    fn apply_meta(self, meta: &DocumentMeta) -> Self {
        meta.clone()
    }
}

/// Sets `_id`, `_key` and `_rev` on objects; other values are returned
/// unchanged.
impl ApplyMeta for serde_json::Value {
    fn apply_meta(mut self, meta: &DocumentMeta) -> Self {
        if let Some(object) = self.as_object_mut() {
            object.insert("_id".to_string(), meta.id.clone().into());
            object.insert("_key".to_string(), meta.key.clone().into());
            object.insert("_rev".to_string(), meta.rev.clone().into());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> DocumentMeta {
        DocumentMeta {
            id: "orders/42".to_string(),
            key: "42".to_string(),
            rev: "_hV2xO--_".to_string(),
        }
    }

    #[test]
    fn test_parse_from_write_response() {
        let body = r#"{"_id":"orders/42","_key":"42","_rev":"_hV2xO--_","_oldRev":"_hV2xN--_"}"#;
        let parsed: DocumentMeta = serde_json::from_str(body).unwrap();
        assert_eq!(parsed, meta());
    }

    #[test]
    fn test_apply_to_json_object() {
        let doc = json!({"item": "widget", "_key": "stale"});
        let doc = doc.apply_meta(&meta());
        assert_eq!(
            doc,
            json!({"item": "widget", "_id": "orders/42", "_key": "42", "_rev": "_hV2xO--_"})
        );

        let scalar = json!(5).apply_meta(&meta());
        assert_eq!(scalar, json!(5));
    }

    #[derive(Debug, Default, PartialEq)]
    struct Order {
        key: Option<String>,
        rev: Option<String>,
        total: u32,
    }

    impl ApplyMeta for Order {
        fn apply_meta(self, meta: &DocumentMeta) -> Self {
            Self {
                key: Some(meta.key.clone()),
                rev: Some(meta.rev.clone()),
                ..self
            }
        }
    }

    #[test]
    fn test_apply_to_typed_document() {
        let order = Order {
            total: 12,
            ..Order::default()
        }
        .apply_meta(&meta());
        assert_eq!(order.key.as_deref(), Some("42"));
        assert_eq!(order.rev.as_deref(), Some("_hV2xO--_"));
        assert_eq!(order.total, 12);
    }
}
