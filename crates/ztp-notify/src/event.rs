// ── Event envelope ──
//
// Every server push is a JSON object `{ "type": ..., "payload": ... }`.
// The payload is kept as raw JSON; its shape depends on the type and is
// only checked when a consumer asks for a concrete struct.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::Error;

/// Event types the provisioning server is known to push.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    DeviceDiscovered,
    DeviceOnline,
    DeviceOffline,
    BackupStarted,
    BackupCompleted,
    BackupFailed,
    ConfigPulled,
}

/// A decoded server push.
///
/// `kind` is `None` when the server sent a `type` this client does not
/// know; the raw string is still available from
/// [`event_type`](Self::event_type).
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    kind: Option<EventKind>,
    event_type: String,
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    payload: &'a serde_json::Value,
}

impl Envelope {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind: Some(kind),
            event_type: kind.as_ref().to_owned(),
            payload,
        }
    }

    /// Decode one raw message. Unknown `type` strings are not an error.
    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        let wire: WireEnvelope =
            serde_json::from_slice(raw).map_err(|e| Error::deserialization(&e, raw))?;
        let kind = wire.event_type.parse::<EventKind>().ok();
        Ok(Self {
            kind,
            event_type: wire.event_type,
            payload: wire.payload,
        })
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.kind
    }

    /// The `type` string exactly as received.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, Error> {
        T::deserialize(&self.payload).map_err(|source| Error::Payload {
            event_type: self.event_type.clone(),
            source,
        })
    }
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireEnvelopeRef {
            event_type: &self.event_type,
            payload: &self.payload,
        }
        .serialize(serializer)
    }
}
