//! Body serialization.

use crate::error::DriverError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Turns values into request bodies and response bodies into values.
///
/// The transport never looks inside bodies; the driver hands them to its
/// serializer.
pub trait Serializer: Send + Sync {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, DriverError>;

    fn deserialize<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, DriverError>;
}

/// JSON bodies via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, DriverError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, DriverError> {
        if body.is_empty() {
            return Err(DriverError::Serialization("empty body".to_string()));
        }
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        item: String,
    }

    #[test]
    fn test_json_roundtrip() {
        let order = Order {
            id: 7,
            item: "widget".to_string(),
        };
        let body = JsonSerializer.serialize(&order).unwrap();
        assert_eq!(body.as_ref(), br#"{"id":7,"item":"widget"}"#);

        let back: Order = JsonSerializer.deserialize(&body).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn test_deserialize_errors() {
        let err = JsonSerializer.deserialize::<Order>(b"").unwrap_err();
        assert!(matches!(err, DriverError::Serialization(_)));

        let err = JsonSerializer.deserialize::<Order>(b"{\"id\":\"x\"}").unwrap_err();
        assert!(matches!(err, DriverError::Json(_)));
    }
}
