//! User-data payloads for the config drive
//!
//! User data is literal text (cloud-config, shell script), bytes taken from
//! disk as they are (an ignition document, a gzipped multipart archive) or a
//! JSON mapping built in code.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::DeployError;

/// Indentation used for mapping user data
const JSON_INDENT: &[u8] = b"    ";

/// Contents of the `user_data` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserData {
    /// Raw text, written byte for byte
    Text(String),
    /// Arbitrary bytes, written unmodified
    Raw(Vec<u8>),
    /// Structured data, written as indented JSON
    Map(Map<String, Value>),
}

impl UserData {
    /// Serialize to the exact bytes of the `user_data` file
    ///
    /// Text and raw bytes are never transformed. Maps are rendered as JSON indented with
    /// four spaces.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DeployError> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Raw(bytes) => Ok(bytes.clone()),
            Self::Map(map) => {
                let mut buf = Vec::new();
                let formatter = serde_json::ser::PrettyFormatter::with_indent(JSON_INDENT);
                let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
                map.serialize(&mut serializer)?;
                Ok(buf)
            }
        }
    }
}

impl From<String> for UserData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for UserData {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for UserData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Raw(bytes)
    }
}

impl From<Map<String, Value>> for UserData {
    fn from(map: Map<String, Value>) -> Self {
        Self::Map(map)
    }
}

impl TryFrom<Value> for UserData {
    type Error = DeployError;

    /// Objects become maps and strings become text; nothing else is user data
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self::Map(map)),
            Value::String(text) => Ok(Self::Text(text)),
            other => Err(DeployError::Serialization(format!(
                "user data must be a string or an object, got {}",
                other
            ))),
        }
    }
}
