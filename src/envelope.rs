//! The `{status, message, result}` response envelope.
//!
//! Decoding inspects the status discriminator first and only then decodes the
//! branch it selects. On the success sentinel the `result` field is decoded as
//! the caller's payload type; any other status becomes [`Envelope::Failure`].
//!
//! A payload type tolerates a missing or `null` result exactly when it can be
//! deserialized from `null`: [`NoPayload`], `Option<_>` and `()` do, ordinary
//! structs, strings, numbers and sequences do not and produce the fixed
//! missing-result domain error instead.

use bytes::Bytes;
use serde::de::{DeserializeOwned, Error as _, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::util::truncate_body;

pub const DEFAULT_SUCCESS_CODE: &str = "C0000";
pub const DEFAULT_FAILURE_MESSAGE: &str = "request failed";
pub const DEFAULT_MISSING_RESULT_CODE: &str = "KF1000";
const DEFAULT_MISSING_RESULT_MESSAGE: &str = "response envelope has no result field";

/// Decoded envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope<T> {
    Success(T),
    Failure { code: String, message: String },
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn into_result(self) -> crate::Result<T> {
        match self {
            Self::Success(payload) => Ok(payload),
            Self::Failure { code, message } => Err(Error::Domain { code, message }),
        }
    }
}

/// Payload marker for endpoints whose success carries no data.
///
/// Decodes from any `result` value, including an absent one, and encodes as an
/// absent `result`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NoPayload;

impl Serialize for NoPayload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_unit()
    }
}

impl<'de> Deserialize<'de> for NoPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        IgnoredAny::deserialize(deserializer).map(|_| NoPayload)
    }
}

/// Status and message of an envelope, read without touching `result`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeProbe {
    code: String,
    message: Option<String>,
    success: bool,
}

impl EnvelopeProbe {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeFormat {
    status_key: String,
    message_key: String,
    result_key: String,
    success_code: String,
    default_failure_message: String,
    missing_result_code: String,
    missing_result_message: String,
}

impl EnvelopeFormat {
    pub fn standard() -> Self {
        Self {
            status_key: "status".to_owned(),
            message_key: "message".to_owned(),
            result_key: "result".to_owned(),
            success_code: DEFAULT_SUCCESS_CODE.to_owned(),
            default_failure_message: DEFAULT_FAILURE_MESSAGE.to_owned(),
            missing_result_code: DEFAULT_MISSING_RESULT_CODE.to_owned(),
            missing_result_message: DEFAULT_MISSING_RESULT_MESSAGE.to_owned(),
        }
    }

    pub fn status_key(mut self, key: impl Into<String>) -> Self {
        self.status_key = key.into();
        self
    }

    pub fn message_key(mut self, key: impl Into<String>) -> Self {
        self.message_key = key.into();
        self
    }

    pub fn result_key(mut self, key: impl Into<String>) -> Self {
        self.result_key = key.into();
        self
    }

    pub fn success_code(mut self, code: impl Into<String>) -> Self {
        self.success_code = code.into();
        self
    }

    pub fn default_failure_message(mut self, message: impl Into<String>) -> Self {
        self.default_failure_message = message.into();
        self
    }

    pub fn missing_result_code(mut self, code: impl Into<String>) -> Self {
        self.missing_result_code = code.into();
        self
    }

    pub fn missing_result_message(mut self, message: impl Into<String>) -> Self {
        self.missing_result_message = message.into();
        self
    }

    pub fn is_success_code(&self, code: &str) -> bool {
        self.success_code == code
    }

    pub fn configured_missing_result_code(&self) -> &str {
        &self.missing_result_code
    }

    pub fn decode_envelope<T>(&self, body: &[u8]) -> crate::Result<Envelope<T>>
    where
        T: DeserializeOwned,
    {
        let mut object = parse_object(body)?;
        let code = match object.remove(&self.status_key) {
            Some(Value::String(code)) => code,
            Some(_) => {
                return Err(decode_error(
                    serde_json::Error::custom(format!(
                        "envelope field `{}` must be a string",
                        self.status_key
                    )),
                    body,
                ));
            }
            None => {
                return Err(decode_error(
                    serde_json::Error::custom(format!(
                        "missing envelope field `{}`",
                        self.status_key
                    )),
                    body,
                ));
            }
        };

        if !self.is_success_code(&code) {
            let message = match object.remove(&self.message_key) {
                Some(Value::String(message)) => message,
                _ => self.default_failure_message.clone(),
            };
            return Ok(Envelope::Failure { code, message });
        }

        match object
            .remove(&self.result_key)
            .filter(|value| !value.is_null())
        {
            Some(result) => serde_json::from_value(result)
                .map(Envelope::Success)
                .map_err(|source| decode_error(source, body)),
            None => serde_json::from_value(Value::Null)
                .map(Envelope::Success)
                .map_err(|_| Error::Domain {
                    code: self.missing_result_code.clone(),
                    message: self.missing_result_message.clone(),
                }),
        }
    }

    pub fn decode<T>(&self, body: &[u8]) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        self.decode_envelope(body)?.into_result()
    }

    /// `Success` carries no message, so a success body's `message` does not
    /// survive a decode/encode cycle.
    pub fn encode<T>(&self, envelope: &Envelope<T>) -> crate::Result<Bytes>
    where
        T: Serialize,
    {
        let mut object = Map::new();
        match envelope {
            Envelope::Success(payload) => {
                object.insert(
                    self.status_key.clone(),
                    Value::String(self.success_code.clone()),
                );
                let result = serde_json::to_value(payload)
                    .map_err(|source| Error::SerializeJson { source })?;
                if !result.is_null() {
                    object.insert(self.result_key.clone(), result);
                }
            }
            Envelope::Failure { code, message } => {
                object.insert(self.status_key.clone(), Value::String(code.clone()));
                object.insert(self.message_key.clone(), Value::String(message.clone()));
            }
        }
        serde_json::to_vec(&Value::Object(object))
            .map(Bytes::from)
            .map_err(|source| Error::SerializeJson { source })
    }

    pub fn probe(&self, body: &[u8]) -> Option<EnvelopeProbe> {
        let mut object = parse_object(body).ok()?;
        let Some(Value::String(code)) = object.remove(&self.status_key) else {
            return None;
        };
        let message = match object.remove(&self.message_key) {
            Some(Value::String(message)) => Some(message),
            _ => None,
        };
        Some(EnvelopeProbe {
            success: self.is_success_code(&code),
            code,
            message,
        })
    }

    pub(crate) fn failure_message(&self, probe: &EnvelopeProbe) -> String {
        probe
            .message()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| self.default_failure_message.clone())
    }
}

impl Default for EnvelopeFormat {
    fn default() -> Self {
        Self::standard()
    }
}

fn parse_object(body: &[u8]) -> crate::Result<Map<String, Value>> {
    match serde_json::from_slice(body) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(decode_error(
            serde_json::Error::custom("response envelope must be a json object"),
            body,
        )),
        Err(source) => Err(decode_error(source, body)),
    }
}

fn decode_error(source: serde_json::Error, body: &[u8]) -> Error {
    Error::Decode {
        source,
        body: truncate_body(body),
    }
}
