use crate::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted unit for a single job instance.
///
/// The wire format is JSON with the field names below; `Payload` bytes are
/// carried as base64 so envelopes stay readable by other runtimes sharing
/// the same backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    /// Queue/task identifier.
    #[serde(rename = "Name")]
    pub name: String,
    /// Locally generated unique job identifier.
    #[serde(rename = "ID")]
    pub id: String,
    /// Maximum attempts, at least 1.
    #[serde(rename = "MaxTries")]
    pub max_tries: i64,
    /// Seconds of delay inserted before a re-attempt after failure.
    #[serde(rename = "RetryInterval")]
    pub retry_interval: i64,
    /// Count of attempts begun so far.
    #[serde(rename = "Attempts")]
    pub attempts: i64,
    /// Opaque user-supplied argument bytes, codec-encoded.
    #[serde(rename = "Payload", with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Unix seconds of the first successful reservation, 0 until then.
    #[serde(rename = "PopTime")]
    pub pop_time: i64,
    /// Seconds of wall-clock execution budget per attempt.
    #[serde(rename = "Timeout")]
    pub timeout: i64,
    /// Unix seconds at which the current reservation expires.
    #[serde(rename = "TimeoutAt")]
    pub timeout_at: i64,
}

impl Payload {
    /// Build a fresh envelope for dispatch. Attempt accounting starts at
    /// zero; `PopTime`/`TimeoutAt` are filled in by the backend on pop.
    pub fn new(
        name: &str,
        max_tries: i64,
        retry_interval: i64,
        timeout_secs: i64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            name: name.to_string(),
            id: Uuid::new_v4().to_string(),
            max_tries: max_tries.max(1),
            retry_interval,
            attempts: 0,
            payload,
            pop_time: 0,
            timeout: timeout_secs,
            timeout_at: 0,
        }
    }

    pub fn raw_body(&self) -> RawBody {
        RawBody {
            queue: self.name.clone(),
            id: self.id.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Encode an envelope into its canonical byte form.
pub fn encode(payload: &Payload) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Decode canonical bytes back into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Payload> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Argument wrapper handed to `Task::execute`.
#[derive(Debug, Clone)]
pub struct RawBody {
    queue: String,
    id: String,
    payload: Vec<u8>,
}

impl RawBody {
    /// Name of the queue the job was dequeued from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Internal job identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Raw payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Payload bytes as a UTF-8 string, lossily converted.
    pub fn as_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Payload parsed as a decimal integer, 0 on failure.
    pub fn to_i64(&self) -> i64 {
        self.as_str().trim().parse().unwrap_or(0)
    }

    /// Decode the payload into the type it was dispatched as.
    pub fn unmarshal<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let payload = Payload::new("emails", 3, 5, 60, br#"{"v":1}"#.to_vec());
        let bytes = encode(&payload).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn wire_field_names_are_stable() {
        let payload = Payload::new("emails", 1, 0, 900, b"x".to_vec());
        let value: serde_json::Value = serde_json::from_slice(&encode(&payload).unwrap()).unwrap();
        for key in [
            "Name",
            "ID",
            "MaxTries",
            "RetryInterval",
            "Attempts",
            "Payload",
            "PopTime",
            "Timeout",
            "TimeoutAt",
        ] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }
        // bytes travel as base64 text
        assert_eq!(value["Payload"], serde_json::json!("eA=="));
    }

    #[test]
    fn max_tries_is_clamped_to_one() {
        let payload = Payload::new("emails", 0, 0, 900, vec![]);
        assert_eq!(payload.max_tries, 1);
    }

    #[test]
    fn raw_body_decoders() {
        let body = RawBody {
            queue: "q".into(),
            id: "j1".into(),
            payload: b"42".to_vec(),
        };
        assert_eq!(body.to_i64(), 42);
        assert_eq!(body.as_str(), "42");
        assert_eq!(body.bytes(), b"42");
        let typed: i64 = body.unmarshal().unwrap();
        assert_eq!(typed, 42);
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        assert!(decode(b"{not json").is_err());
    }
}
