//! gRPC transport layer for contactlink.
//!
//! `Identify` carries typed protobuf fields; `IdentifyJson` carries the JSON
//! wire shape (`{"email", "phoneNumber"}` in, `{"contact": {...}}` out) as
//! bytes. Both run the synchronous engine on tokio's blocking pool.

use std::sync::Arc;

use serde::Serialize;
use tonic::{Request, Response, Status};

use crate::engine::IdentityEngine;
use crate::error::{ErrorKind, LinkError};
use crate::identity::{IdentifyRequest, IdentifyResponse, IdentityView};

pub mod proto {
    tonic::include_proto!("contactlink");
}

use proto::contact_link_server::{ContactLink, ContactLinkServer};

/// Maximum size of an identify request JSON payload.
const MAX_REQUEST_JSON_BYTES: usize = 64 * 1024; // 64 KiB

/// Maximum size of a response JSON payload.
const MAX_RESPONSE_JSON_BYTES: usize = 4 * 1024 * 1024; // 4 MiB

/// gRPC service implementation.
pub struct ContactLinkServiceImpl {
    engine: Arc<IdentityEngine>,
}

impl ContactLinkServiceImpl {
    #[must_use]
    pub fn new(engine: Arc<IdentityEngine>) -> Self {
        Self { engine }
    }

    #[must_use]
    pub fn into_server(self) -> ContactLinkServer<Self> {
        ContactLinkServer::new(self)
    }

    async fn run_identify(&self, request: IdentifyRequest) -> Result<IdentityView, Status> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.identify(&request))
            .await
            .map_err(|e| Status::internal(format!("identify task failed: {e}")))?
            .map_err(status_from_link_error)
    }
}

fn invalid_argument(msg: impl Into<String>) -> Status {
    Status::invalid_argument(msg.into())
}

fn parse_request_json(bytes: &[u8]) -> Result<IdentifyRequest, Status> {
    if bytes.is_empty() {
        return Err(invalid_argument("request_json is required"));
    }
    if bytes.len() > MAX_REQUEST_JSON_BYTES {
        return Err(invalid_argument("request_json exceeds maximum size"));
    }
    serde_json::from_slice(bytes).map_err(|e| invalid_argument(format!("invalid identify JSON: {e}")))
}

fn encode_json<T: Serialize>(value: &T, max: usize) -> Result<Vec<u8>, Status> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Status::internal(format!("failed to serialize response JSON: {e}")))?;
    if bytes.len() > max {
        return Err(Status::resource_exhausted("serialized JSON exceeds size limit"));
    }
    Ok(bytes)
}

/// Maps an engine error onto a gRPC status by its kind.
#[must_use]
pub fn status_from_link_error(err: LinkError) -> Status {
    match err.kind() {
        ErrorKind::InvalidRequest => Status::invalid_argument(err.to_string()),
        ErrorKind::TransientStoreFailure => Status::unavailable(err.to_string()),
        ErrorKind::IntegrityViolation => Status::internal(err.to_string()),
    }
}

impl From<IdentityView> for proto::IdentifyResponse {
    fn from(view: IdentityView) -> Self {
        Self {
            primary_contact_id: view.primary_contact_id.get(),
            emails: view.emails,
            phone_numbers: view.phone_numbers,
            secondary_contact_ids: view.secondary_contact_ids.into_iter().map(|id| id.get()).collect(),
        }
    }
}

#[tonic::async_trait]
impl ContactLink for ContactLinkServiceImpl {
    async fn identify(
        &self,
        request: Request<proto::IdentifyRequest>,
    ) -> Result<Response<proto::IdentifyResponse>, Status> {
        let req = request.into_inner();
        let view = self
            .run_identify(IdentifyRequest {
                email: req.email,
                phone_number: req.phone_number,
            })
            .await?;
        Ok(Response::new(view.into()))
    }

    async fn identify_json(
        &self,
        request: Request<proto::IdentifyJsonRequest>,
    ) -> Result<Response<proto::IdentifyJsonResponse>, Status> {
        let req = parse_request_json(&request.into_inner().request_json)?;
        let view = self.run_identify(req).await?;
        let response_json = encode_json(&IdentifyResponse::from(view), MAX_RESPONSE_JSON_BYTES)?;
        Ok(Response::new(proto::IdentifyJsonResponse { response_json }))
    }

    async fn health(
        &self,
        _request: Request<proto::HealthRequest>,
    ) -> Result<Response<proto::HealthResponse>, Status> {
        let engine = Arc::clone(&self.engine);
        let contacts = tokio::task::spawn_blocking(move || engine.store().len())
            .await
            .map_err(|e| Status::internal(format!("health task failed: {e}")))?
            .map_err(|e| status_from_link_error(e.into()))?;
        Ok(Response::new(proto::HealthResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            contacts: u64::try_from(contacts).unwrap_or(u64::MAX),
        }))
    }
}

pub use proto::contact_link_client::ContactLinkClient;

#[cfg(test)]
mod tests {
    use super::*;

    use crate::contact::ContactId;
    use crate::error::{IntegrityError, ValidationError};
    use crate::storage::{InMemoryContactStore, StorageError};

    fn service() -> ContactLinkServiceImpl {
        let store = Arc::new(InMemoryContactStore::new());
        ContactLinkServiceImpl::new(Arc::new(IdentityEngine::new(store)))
    }

    #[tokio::test]
    async fn identify_returns_typed_view() {
        let svc = service();
        let resp = svc
            .identify(Request::new(proto::IdentifyRequest {
                email: Some("a@x".into()),
                phone_number: Some("111".into()),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.primary_contact_id, 1);
        assert_eq!(resp.emails, vec!["a@x"]);
        assert!(resp.secondary_contact_ids.is_empty());
    }

    #[tokio::test]
    async fn identify_json_accepts_numeric_phone() {
        let svc = service();
        let _ = svc
            .identify_json(Request::new(proto::IdentifyJsonRequest {
                request_json: br#"{"email":"a@x","phoneNumber":"123456"}"#.to_vec(),
            }))
            .await
            .unwrap();

        let resp = svc
            .identify_json(Request::new(proto::IdentifyJsonRequest {
                request_json: br#"{"email":"b@x","phoneNumber":123456}"#.to_vec(),
            }))
            .await
            .unwrap()
            .into_inner();
        let v: serde_json::Value = serde_json::from_slice(&resp.response_json).unwrap();
        assert_eq!(v["contact"]["primaryContactId"], 1);
        assert_eq!(v["contact"]["emails"], serde_json::json!(["a@x", "b@x"]));
        assert_eq!(v["contact"]["phoneNumbers"], serde_json::json!(["123456"]));
        assert_eq!(v["contact"]["secondaryContactIds"], serde_json::json!([2]));
    }

    #[tokio::test]
    async fn empty_identity_is_invalid_argument() {
        let svc = service();
        let status = svc
            .identify_json(Request::new(proto::IdentifyJsonRequest {
                request_json: br#"{"email":null,"phoneNumber":""}"#.to_vec(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("Provide email or phoneNumber"));
    }

    #[tokio::test]
    async fn health_reports_contact_count() {
        let svc = service();
        svc.identify(Request::new(proto::IdentifyRequest {
            email: Some("a@x".into()),
            phone_number: None,
        }))
        .await
        .unwrap();
        let health = svc
            .health(Request::new(proto::HealthRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(health.contacts, 1);
    }

    #[test]
    fn status_mapping_follows_error_kind() {
        let invalid = status_from_link_error(ValidationError::EmptyIdentity.into());
        assert_eq!(invalid.code(), tonic::Code::InvalidArgument);

        let transient = status_from_link_error(StorageError::ConnectionError("down".into()).into());
        assert_eq!(transient.code(), tonic::Code::Unavailable);

        let integrity = status_from_link_error(
            IntegrityError::DanglingLink {
                id: ContactId::new(2),
                linked_id: ContactId::new(1),
            }
            .into(),
        );
        assert_eq!(integrity.code(), tonic::Code::Internal);
    }
}
