//! # Raw Feed Records
//!
//! Loosely-typed records exactly as the backend delivers them. Field names
//! vary between backends (`battery` vs `batteryPercentage`, `lat` vs
//! `latitude`); normalizing them is the reconciler's job, not ours.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FeedError;

macro_rules! raw_record {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Map<String, Value>);

        impl $name {
            pub const fn new(fields: Map<String, Value>) -> Self {
                Self(fields)
            }

            /// Value of the first key present with a non-null value
            pub fn first(&self, keys: &[&str]) -> Option<&Value> {
                keys.iter()
                    .filter_map(|k| self.0.get(*k))
                    .find(|v| !v.is_null())
            }

            pub fn get(&self, key: &str) -> Option<&Value> {
                self.0.get(key).filter(|v| !v.is_null())
            }

            pub const fn fields(&self) -> &Map<String, Value> {
                &self.0
            }

            pub fn into_fields(self) -> Map<String, Value> {
                self.0
            }

            /// Owner partition key, if the record carries one
            pub fn owner_id(&self) -> Option<&str> {
                self.first(&["owner_id", "ownerId"]).and_then(Value::as_str)
            }
        }

        impl From<Map<String, Value>> for $name {
            fn from(fields: Map<String, Value>) -> Self {
                Self(fields)
            }
        }

        impl TryFrom<Value> for $name {
            type Error = FeedError;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                match value {
                    Value::Object(fields) => Ok(Self(fields)),
                    other => Err(FeedError::Serialization(format!(
                        "expected a JSON object, got {other}"
                    ))),
                }
            }
        }
    };
}

raw_record!(
    /// Full snapshot or partial delta for one device
    RawDeviceEvent
);

raw_record!(
    /// One location fix
    RawLocationEvent
);

raw_record!(
    /// Full geofence record
    RawGeofenceEvent
);

/// Change notification for a keyed collection
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent<R> {
    /// Record inserted or (partially) updated
    Upsert(R),
    /// Record deleted upstream
    Removed { id: String },
}

impl<R> FeedEvent<R> {
    pub fn map<U>(self, f: impl FnOnce(R) -> U) -> FeedEvent<U> {
        match self {
            Self::Upsert(r) => FeedEvent::Upsert(f(r)),
            Self::Removed { id } => FeedEvent::Removed { id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_skips_missing_and_null_keys() {
        let raw = RawDeviceEvent::try_from(json!({
            "battery": null,
            "batteryPercentage": 42,
        }))
        .unwrap();

        assert_eq!(raw.first(&["battery", "batteryPercentage"]), Some(&json!(42)));
        assert!(raw.get("battery").is_none());
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(RawLocationEvent::try_from(json!([1, 2])).is_err());
    }

    #[test]
    fn owner_id_accepts_both_spellings() {
        let a = RawGeofenceEvent::try_from(json!({"owner_id": "u1"})).unwrap();
        let b = RawGeofenceEvent::try_from(json!({"ownerId": "u1"})).unwrap();
        assert_eq!(a.owner_id(), Some("u1"));
        assert_eq!(b.owner_id(), Some("u1"));
    }
}
