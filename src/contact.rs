//! Contact records and link precedence.
//!
//! A `Contact` is the only stored entity. Its `email`, `phone_number`, `id` and
//! `created_at` never change after creation; only the link fields move when a
//! component is merged.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonically assigned, immutable contact identifier.
///
/// # Examples
///
/// ```
/// use contactlink::ContactId;
///
/// let id = ContactId::new(42);
/// assert_eq!(id.get(), 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(i64);

impl ContactId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ContactId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl From<ContactId> for i64 {
    fn from(id: ContactId) -> Self {
        id.0
    }
}

/// Whether a contact is the authoritative record of its component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    /// The canonical record of a component.
    Primary,
    /// A record linked to the component's primary.
    Secondary,
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

/// A stored contact record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Unique identifier.
    pub id: ContactId,
    /// Email address, if the record carries one.
    pub email: Option<String>,
    /// Phone number, if the record carries one.
    pub phone_number: Option<String>,
    /// Primary or secondary.
    pub link_precedence: LinkPrecedence,
    /// The owning primary; present iff `link_precedence` is secondary.
    pub linked_id: Option<ContactId>,
    /// Creation time. Sole ordering key for canonical-primary selection.
    pub created_at: DateTime<Utc>,
    /// Time of the last link change (equals `created_at` until then).
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Returns true if this record is a primary.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Returns the id of the primary this record belongs to.
    ///
    /// For a primary this is its own id. For a secondary without a
    /// `linked_id` (corrupted data) this falls back to its own id as well;
    /// integrity checks catch that case separately.
    #[must_use]
    pub fn owner_id(&self) -> ContactId {
        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Secondary, Some(linked)) => linked,
            _ => self.id,
        }
    }

    /// Total order used for canonical selection and response assembly:
    /// `created_at` ascending, lower id on ties.
    #[must_use]
    pub fn creation_key(&self) -> (DateTime<Utc>, ContactId) {
        (self.created_at, self.id)
    }

    /// Returns true if the record's email equals `email`.
    #[must_use]
    pub fn has_email(&self, email: &str) -> bool {
        self.email.as_deref() == Some(email)
    }

    /// Returns true if the record's phone number equals `phone`.
    #[must_use]
    pub fn has_phone(&self, phone: &str) -> bool {
        self.phone_number.as_deref() == Some(phone)
    }
}

/// The payload of a record to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
}

impl NewContact {
    /// A fresh primary with no link.
    #[must_use]
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            link_precedence: LinkPrecedence::Primary,
            linked_id: None,
        }
    }

    /// A secondary linked to `primary_id`.
    #[must_use]
    pub fn secondary(
        email: Option<String>,
        phone_number: Option<String>,
        primary_id: ContactId,
    ) -> Self {
        Self {
            email,
            phone_number,
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(primary_id),
        }
    }

    /// Materializes the record with its assigned id and timestamp.
    #[must_use]
    pub fn into_contact(self, id: ContactId, created_at: DateTime<Utc>) -> Contact {
        Contact {
            id,
            email: self.email,
            phone_number: self.phone_number,
            link_precedence: self.link_precedence,
            linked_id: self.linked_id,
            created_at,
            updated_at: created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_serializes_camel_case() {
        let contact = NewContact::secondary(
            Some("a@x.com".to_string()),
            None,
            ContactId::new(1),
        )
        .into_contact(ContactId::new(2), Utc::now());

        let json = serde_json::to_value(&contact).unwrap();
        assert_eq!(json["linkPrecedence"], "secondary");
        assert_eq!(json["linkedId"], 1);
        assert_eq!(json["phoneNumber"], serde_json::Value::Null);
    }

    #[test]
    fn test_owner_id() {
        let now = Utc::now();
        let primary = NewContact::primary(Some("a".into()), None).into_contact(ContactId::new(1), now);
        let secondary = NewContact::secondary(None, Some("1".into()), ContactId::new(1))
            .into_contact(ContactId::new(2), now);

        assert_eq!(primary.owner_id(), ContactId::new(1));
        assert_eq!(secondary.owner_id(), ContactId::new(1));
        assert!(primary.is_primary());
        assert!(!secondary.is_primary());
    }

    #[test]
    fn test_creation_key_breaks_ties_by_id() {
        let now = Utc::now();
        let a = NewContact::primary(None, Some("1".into())).into_contact(ContactId::new(5), now);
        let b = NewContact::primary(None, Some("2".into())).into_contact(ContactId::new(3), now);
        assert!(b.creation_key() < a.creation_key());
    }
}
