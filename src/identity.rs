//! Request and response shapes for the identify operation.
//!
//! `IdentifyRequest` is the lenient wire shape. `IdentityQuery` is the
//! validated form the core accepts: trimmed, blank fields dropped, and at
//! least one key present.

use serde::{Deserialize, Deserializer, Serialize};

use crate::contact::ContactId;
use crate::error::ValidationError;

/// Longest accepted email or phone value, in bytes.
pub const MAX_FIELD_LEN: usize = 320;

/// Incoming identify request as it appears on the wire.
///
/// `phoneNumber` is accepted as a JSON string or integer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "string_or_integer")]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    /// Creates a request from optional string values.
    #[must_use]
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        }
    }

    /// Validates the request into a query the core can run.
    ///
    /// # Errors
    /// `EmptyIdentity` when neither field carries a non-blank value,
    /// `FieldTooLong` when a value exceeds [`MAX_FIELD_LEN`].
    pub fn validate(&self) -> Result<IdentityQuery, ValidationError> {
        IdentityQuery::new(self.email.as_deref(), self.phone_number.as_deref())
    }
}

fn string_or_integer<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Signed(n) => n.to_string(),
        Raw::Unsigned(n) => n.to_string(),
    }))
}

fn normalize_field(field: &'static str, value: Option<&str>) -> Result<Option<String>, ValidationError> {
    let Some(v) = value.map(str::trim) else {
        return Ok(None);
    };
    if v.is_empty() {
        return Ok(None);
    }
    if v.len() > MAX_FIELD_LEN {
        return Err(ValidationError::FieldTooLong {
            field: field.to_string(),
            max_length: MAX_FIELD_LEN,
        });
    }
    Ok(Some(v.to_string()))
}

/// A validated identity query: at least one of `email` / `phone` is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityQuery {
    email: Option<String>,
    phone: Option<String>,
}

impl IdentityQuery {
    /// Builds a query from raw optional values.
    ///
    /// # Errors
    /// See [`IdentifyRequest::validate`].
    pub fn new(email: Option<&str>, phone: Option<&str>) -> Result<Self, ValidationError> {
        let email = normalize_field("email", email)?;
        let phone = normalize_field("phoneNumber", phone)?;
        if email.is_none() && phone.is_none() {
            return Err(ValidationError::EmptyIdentity);
        }
        Ok(Self { email, phone })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }
}

/// The consolidated view of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    pub primary_contact_id: ContactId,
    /// Deduplicated; the primary's email first if it has one.
    pub emails: Vec<String>,
    /// Deduplicated; the primary's phone first if it has one.
    pub phone_numbers: Vec<String>,
    /// Every member except the primary, in ascending creation order.
    pub secondary_contact_ids: Vec<ContactId>,
}

/// JSON envelope returned by the identify endpoint: `{"contact": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: IdentityView,
}

impl From<IdentityView> for IdentifyResponse {
    fn from(contact: IdentityView) -> Self {
        Self { contact }
    }
}
