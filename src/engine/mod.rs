//! Identify engine.
//!
//! [`IdentityEngine`] is the synchronous entry point of the crate. Each call
//! runs candidate discovery, reconciliation and the new-record decision in one
//! serializable unit of work through the [`ConsistencyGuard`].

mod guard;

/// Bounded worker-pool runtime for identify requests.
pub mod runtime;

pub use guard::{ConsistencyGuard, RetryPolicy};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info_span};
use uuid::Uuid;

use crate::error::{IntegrityError, LinkResult, ValidationError};
use crate::identity::{IdentifyRequest, IdentityQuery, IdentityView};
use crate::resolution::{assemble, merge_if_needed, reconcile, resolve_candidates, verify_component};
use crate::storage::{ContactStore, UnitOfWork};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backoff schedule for conflicted units of work.
    pub retry: RetryPolicy,
    /// Deadline for one identify call, retries included. `None` disables it.
    pub request_timeout: Option<Duration>,
    /// Check the final component before answering.
    pub verify_integrity: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: Some(Duration::from_secs(5)),
            verify_integrity: true,
        }
    }
}

impl EngineConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` for inverted retry delays or a zero timeout.
    pub fn validate(self) -> Result<Self, ValidationError> {
        self.retry.validate()?;
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ValidationError::InvalidConfig {
                reason: "request_timeout must be non-zero".to_string(),
            });
        }
        Ok(self)
    }
}

/// Resolves identify requests against a contact store.
pub struct IdentityEngine {
    store: Arc<dyn ContactStore>,
    guard: ConsistencyGuard,
    config: EngineConfig,
}

impl std::fmt::Debug for IdentityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IdentityEngine {
    /// Create an engine with the default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        let config = EngineConfig::default();
        Self {
            guard: ConsistencyGuard::new(Arc::clone(&store), config.retry.clone(), config.request_timeout),
            store,
            config,
        }
    }

    /// Create an engine with a custom configuration.
    ///
    /// # Errors
    /// Returns a validation error if `config` is invalid.
    pub fn with_config(store: Arc<dyn ContactStore>, config: EngineConfig) -> LinkResult<Self> {
        let config = config.validate()?;
        Ok(Self {
            guard: ConsistencyGuard::new(Arc::clone(&store), config.retry.clone(), config.request_timeout),
            store,
            config,
        })
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates `request` and resolves it.
    ///
    /// # Errors
    /// - `InvalidRequest` if neither field carries a value; the store is not
    ///   touched
    /// - `TransientStoreFailure` on store errors, exhausted retries or timeout
    /// - `IntegrityViolation` if stored links are inconsistent
    pub fn identify(&self, request: &IdentifyRequest) -> LinkResult<IdentityView> {
        let query = request.validate()?;
        self.identify_query(&query)
    }

    /// Resolves an already validated query.
    ///
    /// # Errors
    /// See [`IdentityEngine::identify`].
    pub fn identify_query(&self, query: &IdentityQuery) -> LinkResult<IdentityView> {
        let request_id = Uuid::new_v4();
        let span = info_span!("identify", request_id = %request_id);
        let _entered = span.enter();

        let result = self.guard.run(|uow| self.identify_in(uow, query));
        match &result {
            Ok(view) => debug!(
                primary = %view.primary_contact_id,
                secondaries = view.secondary_contact_ids.len(),
                "identity resolved"
            ),
            Err(err) if err.is_integrity() => error!(error = %err, "integrity violation"),
            Err(err) => debug!(error = %err, "identify failed"),
        }
        result
    }

    fn identify_in(&self, uow: &mut dyn UnitOfWork, query: &IdentityQuery) -> LinkResult<IdentityView> {
        let mut candidates = resolve_candidates(uow, query)?;
        debug!(candidates = candidates.len(), "candidates resolved");

        let plan = reconcile(uow, &mut candidates)?;
        if let Some(plan) = plan.as_ref().filter(|p| !p.is_noop()) {
            debug!(
                primary = %plan.primary_id,
                demoted = ?plan.demoted,
                relinked = ?plan.relinked,
                "components merged"
            );
        }

        let primary_id = plan.map(|p| p.primary_id);
        let created = merge_if_needed(uow, query, primary_id, &mut candidates)?;
        if let Some(contact) = &created {
            debug!(id = %contact.id, precedence = %contact.link_precedence, "contact created");
        }

        let primary_id = match (primary_id, &created) {
            (Some(id), _) => id,
            (None, Some(contact)) => contact.id,
            (None, None) => {
                return Err(IntegrityError::MissingPrimary {
                    members: candidates.len(),
                }
                .into())
            }
        };

        if self.config.verify_integrity {
            verify_component(primary_id, &candidates)?;
        }
        Ok(assemble(primary_id, &candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::contact::{ContactId, LinkPrecedence};
    use crate::error::ErrorKind;
    use crate::storage::InMemoryContactStore;

    fn engine() -> (IdentityEngine, InMemoryContactStore) {
        let store = InMemoryContactStore::new();
        (IdentityEngine::new(Arc::new(store.clone())), store)
    }

    fn identify(engine: &IdentityEngine, email: Option<&str>, phone: Option<&str>) -> IdentityView {
        engine.identify(&IdentifyRequest::new(email, phone)).unwrap()
    }

    #[test]
    fn empty_request_is_rejected_before_store_access() {
        let (engine, store) = engine();
        let err = engine.identify(&IdentifyRequest::new(None, Some("  "))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn bootstrap_then_secondary_then_merge() {
        let (engine, store) = engine();

        let first = identify(&engine, Some("lorraine@hillvalley.edu"), Some("123456"));
        assert_eq!(first.primary_contact_id, ContactId::new(1));
        assert!(first.secondary_contact_ids.is_empty());

        let second = identify(&engine, Some("mcfly@hillvalley.edu"), Some("123456"));
        assert_eq!(second.primary_contact_id, ContactId::new(1));
        assert_eq!(second.emails, vec!["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"]);
        assert_eq!(second.phone_numbers, vec!["123456"]);
        assert_eq!(second.secondary_contact_ids, vec![ContactId::new(2)]);

        identify(&engine, Some("george@hillvalley.edu"), Some("919191"));
        let merged = identify(&engine, Some("george@hillvalley.edu"), Some("123456"));
        assert_eq!(merged.primary_contact_id, ContactId::new(1));
        // Contact 3 is demoted and the new combination is recorded as 4.
        assert_eq!(
            merged.secondary_contact_ids,
            vec![ContactId::new(2), ContactId::new(3), ContactId::new(4)]
        );
        assert_eq!(store.len().unwrap(), 4);

        let demoted = store.get(ContactId::new(3)).unwrap().unwrap();
        assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(demoted.linked_id, Some(ContactId::new(1)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            request_timeout: Some(Duration::ZERO),
            ..EngineConfig::default()
        };
        let err = IdentityEngine::with_config(Arc::new(InMemoryContactStore::new()), config).unwrap_err();
        assert!(err.is_validation());
    }
}
