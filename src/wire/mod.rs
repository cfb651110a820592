//! Wire formats.
//!
//! Every message is a UTF-8 JSON object. Two shapes share the transport:
//! - event messages: a flat object describing one domain fact
//! - chunk messages: one fragment of a binary transfer, content base64-encoded
//!
//! Chunk fields are written in camelCase; the PascalCase names emitted by the
//! older publishers (`UserId`, `SequenceNumber`, `FileName`, `Content`,
//! `EndOfFile`) are accepted on input.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Natural key of a message: the id retries are counted against.
///
/// This is a field of the payload (an entity or correlation id), never a
/// broker delivery tag.
pub trait Keyed {
    fn message_key(&self) -> String;
}

/// Encode a payload as a JSON body.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(payload).map(Bytes::from)
}

/// Decode a JSON body.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Fallback key for payloads without a natural key: hex SHA-256 of the body.
pub fn message_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

// ============================================================================
// Event messages
// ============================================================================

/// Untyped event: a flat mapping of named fields.
pub type EventMessage = serde_json::Map<String, serde_json::Value>;

/// A rider profile published by the identity service on sign-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiderInfo {
    #[serde(rename = "UserId")]
    pub user_id: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "CNPJ")]
    pub cnpj: String,
    /// ISO-8601 timestamp, passed through untouched.
    #[serde(rename = "DateOfBirth")]
    pub date_of_birth: String,
    #[serde(rename = "CNHNumber")]
    pub cnh_number: String,
    #[serde(rename = "CNHType")]
    pub cnh_type: String,
}

impl Keyed for RiderInfo {
    fn message_key(&self) -> String {
        self.user_id.clone()
    }
}

/// A motorcycle licence plate was renamed in the fleet service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicencePlateUpdate {
    #[serde(rename = "oldLicencePlate")]
    pub old_licence_plate: String,
    #[serde(rename = "newLicencePlate")]
    pub new_licence_plate: String,
}

impl Keyed for LicencePlateUpdate {
    fn message_key(&self) -> String {
        self.new_licence_plate.clone()
    }
}

// ============================================================================
// Chunk messages
// ============================================================================

/// One fragment of a binary transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMessage {
    /// Identifies one logical transfer.
    #[serde(alias = "UserId")]
    pub correlation_id: String,
    /// Total order of fragments within the transfer, starting at 0.
    #[serde(alias = "SequenceNumber")]
    pub sequence_number: u32,
    #[serde(alias = "FileName", default)]
    pub file_name: String,
    #[serde(
        alias = "Content",
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64",
        default
    )]
    pub content: Bytes,
    /// Marks the final fragment.
    #[serde(alias = "EndOfFile")]
    pub is_last: bool,
}

impl ChunkMessage {
    pub fn new(
        correlation_id: impl Into<String>,
        sequence_number: u32,
        file_name: impl Into<String>,
        content: impl Into<Bytes>,
        is_last: bool,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            sequence_number,
            file_name: file_name.into(),
            content: content.into(),
            is_last,
        }
    }
}

impl Keyed for ChunkMessage {
    fn message_key(&self) -> String {
        format!("{}#{}", self.correlation_id, self.sequence_number)
    }
}

fn serialize_base64<S: Serializer>(content: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(content))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    // Older publishers send null for empty fragments
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    match encoded {
        Some(s) => STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom),
        None => Ok(Bytes::new()),
    }
}
