//! Indexed contact table and unit-of-work bookkeeping shared by backends.
//!
//! Concurrency control is optimistic. A unit of work remembers the table
//! version it started at and every predicate it read through (emails, phones,
//! id/linked-id sets). Each commit leaves a footprint of the values it wrote.
//! At commit time a unit is rejected if any commit newer than its snapshot
//! wrote a record matching one of its predicates (first committer wins).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::storage::traits::StorageError;

/// Number of commit footprints retained for validation. A unit of work whose
/// snapshot predates the oldest retained footprint always conflicts.
pub(crate) const COMMIT_LOG_CAPACITY: usize = 4096;

/// A link change applied by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecedenceUpdate {
    pub id: ContactId,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
    pub updated_at: DateTime<Utc>,
}

/// Everything one unit of work writes. Applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBatch {
    pub created: Vec<Contact>,
    pub updates: Vec<PrecedenceUpdate>,
}

impl CommitBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updates.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
struct KeySet {
    emails: HashSet<String>,
    phones: HashSet<String>,
    ids: HashSet<ContactId>,
}

impl KeySet {
    fn add_contact(&mut self, contact: &Contact) {
        if let Some(email) = &contact.email {
            self.emails.insert(email.clone());
        }
        if let Some(phone) = &contact.phone_number {
            self.phones.insert(phone.clone());
        }
        self.ids.insert(contact.id);
        if let Some(linked) = contact.linked_id {
            self.ids.insert(linked);
        }
    }

    /// Describes the first key shared with `other`, if any.
    fn first_overlap(&self, other: &Self) -> Option<String> {
        if let Some(email) = self.emails.iter().find(|e| other.emails.contains(*e)) {
            return Some(format!("email {email}"));
        }
        if let Some(phone) = self.phones.iter().find(|p| other.phones.contains(*p)) {
            return Some(format!("phone {phone}"));
        }
        self.ids
            .iter()
            .find(|id| other.ids.contains(*id))
            .map(|id| format!("contact {id}"))
    }
}

#[derive(Debug)]
struct CommitRecord {
    version: u64,
    footprint: KeySet,
}

fn check_link(
    id: ContactId,
    precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Result<(), StorageError> {
    match (precedence, linked_id) {
        (LinkPrecedence::Primary, None) => Ok(()),
        (LinkPrecedence::Primary, Some(linked)) => Err(StorageError::InvalidRecord(format!(
            "primary contact {id} cannot link to {linked}"
        ))),
        (LinkPrecedence::Secondary, None) => Err(StorageError::InvalidRecord(format!(
            "secondary contact {id} requires a linked id"
        ))),
        (LinkPrecedence::Secondary, Some(linked)) if linked == id => Err(
            StorageError::InvalidRecord(format!("contact {id} cannot link to itself")),
        ),
        (LinkPrecedence::Secondary, Some(_)) => Ok(()),
    }
}

fn by_creation(contacts: &mut [Contact]) {
    contacts.sort_by(|a, b| a.creation_key().cmp(&b.creation_key()));
}

/// In-memory indexed table of committed contacts.
#[derive(Debug, Default)]
pub(crate) struct ContactTable {
    by_id: BTreeMap<ContactId, Contact>,
    by_email: HashMap<String, BTreeSet<ContactId>>,
    by_phone: HashMap<String, BTreeSet<ContactId>>,
    by_linked: HashMap<ContactId, BTreeSet<ContactId>>,
    version: u64,
    log: VecDeque<CommitRecord>,
}

impl ContactTable {
    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn get(&self, id: ContactId) -> Option<&Contact> {
        self.by_id.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.by_id.values()
    }

    pub(crate) fn max_id(&self) -> i64 {
        self.by_id.keys().next_back().map_or(0, |id| id.get())
    }

    fn index(&mut self, contact: &Contact) {
        if let Some(email) = &contact.email {
            self.by_email.entry(email.clone()).or_default().insert(contact.id);
        }
        if let Some(phone) = &contact.phone_number {
            self.by_phone.entry(phone.clone()).or_default().insert(contact.id);
        }
        if let Some(linked) = contact.linked_id {
            self.by_linked.entry(linked).or_default().insert(contact.id);
        }
    }

    fn unlink(&mut self, id: ContactId, linked: ContactId) {
        if let Some(set) = self.by_linked.get_mut(&linked) {
            set.remove(&id);
            if set.is_empty() {
                self.by_linked.remove(&linked);
            }
        }
    }

    /// Replaces the table content with `contacts`. Used when loading a
    /// snapshot; resets the commit log.
    pub(crate) fn load(&mut self, contacts: Vec<Contact>) -> Result<(), StorageError> {
        let mut fresh = Self::default();
        for contact in contacts {
            check_link(contact.id, contact.link_precedence, contact.linked_id)?;
            if fresh.by_id.contains_key(&contact.id) {
                return Err(StorageError::DuplicateKey(contact.id.to_string()));
            }
            fresh.index(&contact);
            fresh.by_id.insert(contact.id, contact);
        }
        fresh.version = self.version;
        *self = fresh;
        Ok(())
    }

    pub(crate) fn find_by_email_or_phone(&self, email: Option<&str>, phone: Option<&str>) -> Vec<Contact> {
        let mut ids = BTreeSet::new();
        if let Some(set) = email.and_then(|e| self.by_email.get(e)) {
            ids.extend(set.iter().copied());
        }
        if let Some(set) = phone.and_then(|p| self.by_phone.get(p)) {
            ids.extend(set.iter().copied());
        }
        ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect()
    }

    pub(crate) fn find_by_ids_or_linked_ids(&self, ids: &BTreeSet<ContactId>) -> Vec<Contact> {
        let mut found = BTreeSet::new();
        for id in ids {
            if self.by_id.contains_key(id) {
                found.insert(*id);
            }
            if let Some(children) = self.by_linked.get(id) {
                found.extend(children.iter().copied());
            }
        }
        found.iter().filter_map(|id| self.by_id.get(id).cloned()).collect()
    }

    /// Rejects the unit of work if a commit after `snapshot` touched any of
    /// the predicates in `reads`.
    pub(crate) fn validate(&self, snapshot: u64, reads: &ReadSet) -> Result<(), StorageError> {
        if snapshot == self.version {
            return Ok(());
        }
        if let Some(oldest) = self.log.front() {
            if oldest.version > snapshot + 1 {
                return Err(StorageError::Conflict {
                    reason: format!(
                        "snapshot version {snapshot} is older than retained history ({})",
                        oldest.version
                    ),
                });
            }
        }
        for record in self.log.iter().filter(|r| r.version > snapshot) {
            if let Some(key) = reads.keys.first_overlap(&record.footprint) {
                return Err(StorageError::Conflict {
                    reason: format!("{key} changed at version {}", record.version),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn check_batch(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        let mut created_ids = HashSet::with_capacity(batch.created.len());
        for contact in &batch.created {
            check_link(contact.id, contact.link_precedence, contact.linked_id)?;
            if self.by_id.contains_key(&contact.id) || !created_ids.insert(contact.id) {
                return Err(StorageError::DuplicateKey(contact.id.to_string()));
            }
        }
        for update in &batch.updates {
            check_link(update.id, update.link_precedence, update.linked_id)?;
            if !self.by_id.contains_key(&update.id) && !created_ids.contains(&update.id) {
                return Err(StorageError::ContactNotFound(update.id));
            }
        }
        Ok(())
    }

    /// Applies `batch` atomically and returns the new table version.
    ///
    /// The batch is checked in full before anything is mutated.
    pub(crate) fn apply(&mut self, batch: &CommitBatch) -> Result<u64, StorageError> {
        self.check_batch(batch)?;

        let mut footprint = KeySet::default();
        for contact in &batch.created {
            footprint.add_contact(contact);
            self.index(contact);
            self.by_id.insert(contact.id, contact.clone());
        }
        for update in &batch.updates {
            let Some(existing) = self.by_id.get(&update.id).cloned() else {
                return Err(StorageError::ContactNotFound(update.id));
            };
            footprint.add_contact(&existing);
            if let Some(old) = existing.linked_id {
                self.unlink(existing.id, old);
            }

            let mut updated = existing;
            updated.link_precedence = update.link_precedence;
            updated.linked_id = update.linked_id;
            updated.updated_at = update.updated_at;
            footprint.add_contact(&updated);
            if let Some(linked) = updated.linked_id {
                self.by_linked.entry(linked).or_default().insert(updated.id);
            }
            self.by_id.insert(updated.id, updated);
        }

        self.version += 1;
        self.log.push_back(CommitRecord {
            version: self.version,
            footprint,
        });
        while self.log.len() > COMMIT_LOG_CAPACITY {
            self.log.pop_front();
        }
        Ok(self.version)
    }
}

/// Predicates a unit of work has read through.
#[derive(Debug, Default, Clone)]
pub(crate) struct ReadSet {
    keys: KeySet,
}

/// Buffered state of an open unit of work.
#[derive(Debug)]
pub(crate) struct PendingWork {
    snapshot: u64,
    reads: ReadSet,
    created: Vec<Contact>,
    updates: BTreeMap<ContactId, PrecedenceUpdate>,
}

impl PendingWork {
    pub(crate) fn new(snapshot: u64) -> Self {
        Self {
            snapshot,
            reads: ReadSet::default(),
            created: Vec::new(),
            updates: BTreeMap::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub(crate) fn reads(&self) -> &ReadSet {
        &self.reads
    }

    fn overlay(&self, mut contact: Contact) -> Contact {
        if let Some(update) = self.updates.get(&contact.id) {
            contact.link_precedence = update.link_precedence;
            contact.linked_id = update.linked_id;
            contact.updated_at = update.updated_at;
        }
        contact
    }

    pub(crate) fn find_by_email_or_phone(
        &mut self,
        table: &ContactTable,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Vec<Contact> {
        if let Some(e) = email {
            self.reads.keys.emails.insert(e.to_string());
        }
        if let Some(p) = phone {
            self.reads.keys.phones.insert(p.to_string());
        }

        let mut out: Vec<Contact> = table
            .find_by_email_or_phone(email, phone)
            .into_iter()
            .map(|c| self.overlay(c))
            .collect();
        out.extend(
            self.created
                .iter()
                .filter(|c| {
                    email.is_some_and(|e| c.has_email(e)) || phone.is_some_and(|p| c.has_phone(p))
                })
                .cloned(),
        );
        by_creation(&mut out);
        out
    }

    pub(crate) fn find_by_ids_or_linked_ids(
        &mut self,
        table: &ContactTable,
        ids: &BTreeSet<ContactId>,
    ) -> Vec<Contact> {
        self.reads.keys.ids.extend(ids.iter().copied());

        let matches = |c: &Contact| ids.contains(&c.id) || c.linked_id.is_some_and(|l| ids.contains(&l));

        let mut found: BTreeMap<ContactId, Contact> = table
            .find_by_ids_or_linked_ids(ids)
            .into_iter()
            .map(|c| self.overlay(c))
            .filter(|c| matches(c))
            .map(|c| (c.id, c))
            .collect();

        // Buffered relinks can pull in records the committed indexes do not
        // associate with `ids` yet.
        for update in self.updates.values() {
            if found.contains_key(&update.id) {
                continue;
            }
            if let Some(existing) = table.get(update.id) {
                let contact = self.overlay(existing.clone());
                if matches(&contact) {
                    found.insert(contact.id, contact);
                }
            }
        }
        for contact in self.created.iter().filter(|c| matches(c)) {
            found.insert(contact.id, contact.clone());
        }

        let mut out: Vec<Contact> = found.into_values().collect();
        by_creation(&mut out);
        out
    }

    pub(crate) fn create(
        &mut self,
        id: ContactId,
        contact: NewContact,
        now: DateTime<Utc>,
    ) -> Result<Contact, StorageError> {
        check_link(id, contact.link_precedence, contact.linked_id)?;
        let contact = contact.into_contact(id, now);
        self.created.push(contact.clone());
        Ok(contact)
    }

    pub(crate) fn update_precedence(
        &mut self,
        table: &ContactTable,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        check_link(id, precedence, linked_id)?;

        if let Some(created) = self.created.iter_mut().find(|c| c.id == id) {
            created.link_precedence = precedence;
            created.linked_id = linked_id;
            created.updated_at = now;
            return Ok(());
        }

        if table.get(id).is_none() {
            return Err(StorageError::ContactNotFound(id));
        }
        self.updates.insert(
            id,
            PrecedenceUpdate {
                id,
                link_precedence: precedence,
                linked_id,
                updated_at: now,
            },
        );
        Ok(())
    }

    pub(crate) fn into_batch(self) -> CommitBatch {
        CommitBatch {
            created: self.created,
            updates: self.updates.into_values().collect(),
        }
    }
}
