//! Candidate discovery.

use std::collections::BTreeSet;

use crate::contact::{Contact, ContactId};
use crate::identity::IdentityQuery;
use crate::storage::{StorageError, UnitOfWork};

/// Finds every record in the component(s) touched by `query`.
///
/// Seeds are the records matching the supplied email or phone. Their own ids
/// and link targets are then expanded to every record that is, or links to,
/// one of them. Because secondaries only ever point at primaries, one hop
/// reaches the whole component.
///
/// The result is ordered by `(created_at, id)`.
///
/// # Errors
/// Propagates store failures unchanged.
pub fn resolve_candidates(
    uow: &mut dyn UnitOfWork,
    query: &IdentityQuery,
) -> Result<Vec<Contact>, StorageError> {
    let seeds = uow.find_by_email_or_phone(query.email(), query.phone())?;
    if seeds.is_empty() {
        return Ok(seeds);
    }

    let anchors = anchor_ids(&seeds);
    let mut members = uow.find_by_ids_or_linked_ids(&anchors)?;
    members.sort_by_key(Contact::creation_key);
    Ok(members)
}

fn anchor_ids(seeds: &[Contact]) -> BTreeSet<ContactId> {
    seeds
        .iter()
        .flat_map(|seed| [seed.id, seed.owner_id()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::contact::NewContact;
    use crate::storage::{ContactStore, InMemoryContactStore};

    fn fixture() -> InMemoryContactStore {
        let t0 = Utc::now();
        let at = |secs| t0 + Duration::seconds(secs);
        InMemoryContactStore::with_contacts(vec![
            NewContact::primary(Some("a@x".into()), Some("111".into())).into_contact(ContactId::new(1), at(0)),
            NewContact::secondary(Some("b@x".into()), Some("111".into()), ContactId::new(1))
                .into_contact(ContactId::new(2), at(1)),
            NewContact::secondary(Some("c@x".into()), Some("333".into()), ContactId::new(1))
                .into_contact(ContactId::new(3), at(2)),
            NewContact::primary(Some("d@x".into()), Some("444".into())).into_contact(ContactId::new(4), at(3)),
        ])
        .unwrap()
    }

    fn ids(contacts: &[Contact]) -> Vec<i64> {
        contacts.iter().map(|c| c.id.get()).collect()
    }

    #[test]
    fn secondary_seed_expands_to_whole_component() {
        let store = fixture();
        let mut uow = store.begin().unwrap();
        let query = IdentityQuery::new(None, Some("333")).unwrap();
        let found = resolve_candidates(uow.as_mut(), &query).unwrap();
        assert_eq!(ids(&found), vec![1, 2, 3]);
    }

    #[test]
    fn bridging_query_returns_both_components() {
        let store = fixture();
        let mut uow = store.begin().unwrap();
        let query = IdentityQuery::new(Some("d@x"), Some("111")).unwrap();
        let found = resolve_candidates(uow.as_mut(), &query).unwrap();
        assert_eq!(ids(&found), vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_keys_return_nothing() {
        let store = fixture();
        let mut uow = store.begin().unwrap();
        let query = IdentityQuery::new(Some("nobody@x"), None).unwrap();
        assert!(resolve_candidates(uow.as_mut(), &query).unwrap().is_empty());
    }

    #[test]
    fn absent_field_does_not_match_null_columns() {
        let t0 = Utc::now();
        let store = InMemoryContactStore::with_contacts(vec![
            NewContact::primary(None, Some("111".into())).into_contact(ContactId::new(1), t0),
            NewContact::primary(Some("e@x".into()), None).into_contact(ContactId::new(2), t0),
        ])
        .unwrap();
        let mut uow = store.begin().unwrap();
        let query = IdentityQuery::new(Some("e@x"), None).unwrap();
        assert_eq!(ids(&resolve_candidates(uow.as_mut(), &query).unwrap()), vec![2]);
    }
}
