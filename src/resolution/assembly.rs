//! Identity view assembly and final component checks.

use crate::contact::{Contact, ContactId};
use crate::error::IntegrityError;
use crate::identity::IdentityView;
use crate::ordered_set::OrderedSet;

/// Verifies that `members` form one consistent component under `primary_id`.
///
/// # Errors
/// - `MissingPrimary` if `primary_id` is not a primary member
/// - `MultiplePrimaries` if any other member is still primary
/// - `UnlinkedSecondary` / `NonCanonicalLink` for secondaries not linked to
///   `primary_id`
pub fn verify_component(primary_id: ContactId, members: &[Contact]) -> Result<(), IntegrityError> {
    let primaries = members.iter().filter(|c| c.is_primary()).count();
    if !members.iter().any(|c| c.id == primary_id && c.is_primary()) {
        return Err(IntegrityError::MissingPrimary {
            members: members.len(),
        });
    }
    if primaries > 1 {
        return Err(IntegrityError::MultiplePrimaries { count: primaries });
    }

    for contact in members.iter().filter(|c| !c.is_primary()) {
        match contact.linked_id {
            None => return Err(IntegrityError::UnlinkedSecondary { id: contact.id }),
            Some(linked_id) if linked_id != primary_id => {
                return Err(IntegrityError::NonCanonicalLink {
                    id: contact.id,
                    linked_id,
                    primary_id,
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Builds the response view for a consistent component.
///
/// Emails and phone numbers are deduplicated, the primary's values first and
/// the rest in creation order. Secondary ids follow creation order.
#[must_use]
pub fn assemble(primary_id: ContactId, members: &[Contact]) -> IdentityView {
    let mut ordered: Vec<&Contact> = members.iter().collect();
    ordered.sort_by_key(|c| (c.id != primary_id, c.creation_key()));

    let mut emails = OrderedSet::new();
    let mut phone_numbers = OrderedSet::new();
    let mut secondary_contact_ids = Vec::with_capacity(members.len().saturating_sub(1));
    for contact in ordered {
        if let Some(email) = contact.email.as_ref().filter(|e| !e.is_empty()) {
            emails.insert(email.clone());
        }
        if let Some(phone) = contact.phone_number.as_ref().filter(|p| !p.is_empty()) {
            phone_numbers.insert(phone.clone());
        }
        if contact.id != primary_id {
            secondary_contact_ids.push(contact.id);
        }
    }

    IdentityView {
        primary_contact_id: primary_id,
        emails: emails.into_vec(),
        phone_numbers: phone_numbers.into_vec(),
        secondary_contact_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::contact::NewContact;

    fn members() -> Vec<Contact> {
        let t0 = Utc::now();
        vec![
            NewContact::secondary(Some("b@x".into()), Some("222".into()), ContactId::new(5))
                .into_contact(ContactId::new(8), t0 + Duration::seconds(2)),
            NewContact::primary(Some("a@x".into()), None).into_contact(ContactId::new(5), t0 + Duration::seconds(1)),
            NewContact::secondary(Some("a@x".into()), Some("111".into()), ContactId::new(5))
                .into_contact(ContactId::new(3), t0),
        ]
    }

    #[test]
    fn primary_values_come_first() {
        let view = assemble(ContactId::new(5), &members());
        assert_eq!(view.primary_contact_id, ContactId::new(5));
        assert_eq!(view.emails, vec!["a@x", "b@x"]);
        // The primary has no phone, so phones follow creation order.
        assert_eq!(view.phone_numbers, vec!["111", "222"]);
        assert_eq!(view.secondary_contact_ids, vec![ContactId::new(3), ContactId::new(8)]);
    }

    #[test]
    fn verify_accepts_consistent_component() {
        verify_component(ContactId::new(5), &members()).unwrap();
    }

    #[test]
    fn verify_rejects_leftover_primary() {
        let mut m = members();
        m.push(NewContact::primary(None, Some("9".into())).into_contact(ContactId::new(9), Utc::now()));
        let err = verify_component(ContactId::new(5), &m).unwrap_err();
        assert!(matches!(err, IntegrityError::MultiplePrimaries { count: 2 }));
    }

    #[test]
    fn verify_rejects_wrong_primary() {
        let err = verify_component(ContactId::new(8), &members()).unwrap_err();
        assert!(matches!(err, IntegrityError::MissingPrimary { .. }));
    }
}
