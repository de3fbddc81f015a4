//! End-to-end identify scenarios against the in-memory store.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use contactlink::{
    Contact, ContactId, ContactStore, ErrorKind, IdentifyRequest, IdentifyResponse, IdentityEngine,
    IdentityView, InMemoryContactStore, IntegrityError, LinkError, LinkPrecedence, NewContact,
};

fn setup() -> (IdentityEngine, InMemoryContactStore) {
    let store = InMemoryContactStore::new();
    (IdentityEngine::new(Arc::new(store.clone())), store)
}

fn identify(engine: &IdentityEngine, email: Option<&str>, phone: Option<&str>) -> IdentityView {
    engine.identify(&IdentifyRequest::new(email, phone)).unwrap()
}

fn ids(raw: &[i64]) -> Vec<ContactId> {
    raw.iter().copied().map(ContactId::new).collect()
}

/// Stored record `id` created `offset` seconds after the first one.
fn seeded(id: i64, offset: i64, email: &str, linked_to: Option<i64>) -> Contact {
    let email = Some(email.to_string());
    let new = match linked_to {
        Some(primary) => NewContact::secondary(email, None, ContactId::new(primary)),
        None => NewContact::primary(email, None),
    };
    new.into_contact(ContactId::new(id), Utc::now() + Duration::seconds(offset))
}

/// Member ids of the component containing `id`, primary included.
fn component_of(store: &InMemoryContactStore, id: ContactId) -> BTreeSet<ContactId> {
    let all = store.all().unwrap();
    let owner = all.iter().find(|c| c.id == id).unwrap().owner_id();
    all.iter().filter(|c| c.owner_id() == owner).map(|c| c.id).collect()
}

#[test]
fn test_bootstrap_creates_single_primary() {
    let (engine, store) = setup();

    let view = identify(&engine, Some("a@x.com"), None);

    assert_eq!(view.primary_contact_id, ContactId::new(1));
    assert_eq!(view.emails, vec!["a@x.com"]);
    assert!(view.phone_numbers.is_empty());
    assert!(view.secondary_contact_ids.is_empty());

    let stored = store.get(ContactId::new(1)).unwrap().unwrap();
    assert_eq!(stored.link_precedence, LinkPrecedence::Primary);
    assert_eq!(stored.linked_id, None);
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn test_partial_match_creates_one_secondary() {
    let (engine, store) = setup();
    identify(&engine, Some("a@x.com"), Some("111"));

    let view = identify(&engine, Some("a@x.com"), Some("222"));

    assert_eq!(store.len().unwrap(), 2);
    assert_eq!(view.primary_contact_id, ContactId::new(1));
    assert_eq!(view.phone_numbers, vec!["111", "222"]);
    assert_eq!(view.secondary_contact_ids, ids(&[2]));

    let secondary = store.get(ContactId::new(2)).unwrap().unwrap();
    assert_eq!(secondary.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(secondary.linked_id, Some(ContactId::new(1)));
}

#[test]
fn test_full_match_creates_nothing() {
    let (engine, store) = setup();
    identify(&engine, Some("a@x.com"), Some("111"));
    identify(&engine, Some("a@x.com"), Some("222"));

    identify(&engine, Some("a@x.com"), Some("111"));
    identify(&engine, None, Some("222"));
    identify(&engine, Some("a@x.com"), None);

    assert_eq!(store.len().unwrap(), 2);
}

#[test]
fn test_repeat_request_is_idempotent() {
    let (engine, store) = setup();
    identify(&engine, Some("lorraine@hillvalley.edu"), Some("123456"));
    identify(&engine, Some("mcfly@hillvalley.edu"), Some("123456"));

    let first = identify(&engine, Some("mcfly@hillvalley.edu"), Some("123456"));
    let second = identify(&engine, Some("mcfly@hillvalley.edu"), Some("123456"));

    assert_eq!(first, second);
    assert_eq!(store.len().unwrap(), 2);
}

#[test]
fn test_bridge_demotes_younger_primary() {
    let (engine, store) = setup();
    identify(&engine, Some("a"), Some("1"));
    identify(&engine, Some("b"), Some("2"));

    let view = identify(&engine, Some("a"), Some("2"));

    assert_eq!(view.primary_contact_id, ContactId::new(1));
    assert_eq!(view.emails, vec!["a", "b"]);
    assert_eq!(view.phone_numbers, vec!["1", "2"]);
    assert!(view.secondary_contact_ids.contains(&ContactId::new(2)));

    let demoted = store.get(ContactId::new(2)).unwrap().unwrap();
    assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(demoted.linked_id, Some(ContactId::new(1)));
}

#[test]
fn test_bridge_is_order_independent() {
    let forward = {
        let (engine, store) = setup();
        identify(&engine, Some("a"), Some("1"));
        identify(&engine, Some("b"), Some("2"));
        let view = identify(&engine, Some("a"), Some("2"));
        (view.primary_contact_id, component_of(&store, ContactId::new(1)))
    };
    let reverse = {
        let (engine, store) = setup();
        identify(&engine, Some("a"), Some("1"));
        identify(&engine, Some("b"), Some("2"));
        let view = identify(&engine, Some("b"), Some("1"));
        (view.primary_contact_id, component_of(&store, ContactId::new(1)))
    };

    assert_eq!(forward.0, ContactId::new(1));
    assert_eq!(forward.0, reverse.0);
    assert_eq!(forward.1, reverse.1);
}

#[test]
fn test_demoted_primary_secondaries_are_relinked() {
    let (engine, store) = setup();
    identify(&engine, Some("a"), Some("1"));
    identify(&engine, Some("b"), Some("2"));
    // Contact 3 hangs off primary 2.
    identify(&engine, Some("c"), Some("2"));

    let view = identify(&engine, Some("a"), Some("2"));

    assert_eq!(view.primary_contact_id, ContactId::new(1));
    for id in [2, 3] {
        let contact = store.get(ContactId::new(id)).unwrap().unwrap();
        assert_eq!(contact.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(contact.linked_id, Some(ContactId::new(1)), "contact {id}");
    }
    assert_eq!(view.emails, vec!["a", "b", "c"]);
}

#[test]
fn test_merged_component_answers_from_any_key() {
    let (engine, _store) = setup();
    identify(&engine, Some("lorraine@hillvalley.edu"), Some("123456"));
    identify(&engine, Some("mcfly@hillvalley.edu"), Some("123456"));
    identify(&engine, Some("george@hillvalley.edu"), Some("919191"));
    identify(&engine, Some("biffsucks@hillvalley.edu"), Some("717171"));
    let merged = identify(&engine, Some("george@hillvalley.edu"), Some("123456"));

    let by_phone = identify(&engine, None, Some("919191"));
    let by_email = identify(&engine, Some("mcfly@hillvalley.edu"), None);

    assert_eq!(by_phone, merged);
    assert_eq!(by_email, merged);
    assert_eq!(merged.primary_contact_id, ContactId::new(1));
    assert!(!merged.emails.contains(&"biffsucks@hillvalley.edu".to_string()));
}

#[test]
fn test_empty_request_is_invalid() {
    let (engine, store) = setup();

    let err = engine.identify(&IdentifyRequest::new(Some(""), None)).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(err.to_string().contains("Provide email or phoneNumber"));
    assert!(store.is_empty().unwrap());
}

#[test]
fn test_json_contract() {
    let (engine, _store) = setup();
    identify(&engine, Some("lorraine@hillvalley.edu"), Some("123456"));

    let request: IdentifyRequest =
        serde_json::from_str(r#"{"email":"mcfly@hillvalley.edu","phoneNumber":123456}"#).unwrap();
    let view = engine.identify(&request).unwrap();
    let json = serde_json::to_value(IdentifyResponse::from(view)).unwrap();

    assert_eq!(
        json,
        serde_json::json!({
            "contact": {
                "primaryContactId": 1,
                "emails": ["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"],
                "phoneNumbers": ["123456"],
                "secondaryContactIds": [2]
            }
        })
    );
}

#[test]
fn test_dangling_link_is_an_integrity_violation() {
    let store = InMemoryContactStore::with_contacts(vec![
        seeded(1, 0, "a@x.com", None),
        seeded(2, 1, "a@x.com", Some(99)),
    ])
    .unwrap();
    let engine = IdentityEngine::new(Arc::new(store.clone()));

    let err = engine
        .identify(&IdentifyRequest::new(Some("a@x.com"), None))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
    assert!(matches!(
        err,
        LinkError::Integrity(IntegrityError::DanglingLink { id, .. }) if id == ContactId::new(2)
    ));
    assert!(!err.is_retryable());
    assert_eq!(store.len().unwrap(), 2);
}

#[test]
fn test_chained_link_is_an_integrity_violation() {
    // Contact 3 points at secondary 2 instead of primary 1.
    let store = InMemoryContactStore::with_contacts(vec![
        seeded(1, 0, "a@x.com", None),
        seeded(2, 1, "b@x.com", Some(1)),
        seeded(3, 2, "c@x.com", Some(2)),
    ])
    .unwrap();
    let engine = IdentityEngine::new(Arc::new(store.clone()));

    let err = engine
        .identify(&IdentifyRequest::new(Some("b@x.com"), Some("555")))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
    assert!(matches!(
        err,
        LinkError::Integrity(IntegrityError::NonCanonicalLink { id, .. }) if id == ContactId::new(3)
    ));
    // Nothing from the failed request was written.
    assert_eq!(store.len().unwrap(), 3);
    let chained = store.get(ContactId::new(3)).unwrap().unwrap();
    assert_eq!(chained.linked_id, Some(ContactId::new(2)));
}
