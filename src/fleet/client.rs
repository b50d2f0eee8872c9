//! HTTP client for the fleet API.
//!
//! Every request carries a bearer token and, when the credential is scoped to
//! an account, an `accountId` query parameter. Responses arrive in a shared
//! envelope; a 400 or 404 carrying one of the "doesn't exist" codes is an
//! empty result for the operations that tolerate absence.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::config::CpiConfig;
use crate::types::{InstanceId, VmId};

use super::types::{
    ApiErrorItem, DeleteOptions, Envelope, FleetInstance, GroupMember, GroupRecord, GroupSpec,
    GroupUpdate,
};

/// Error codes meaning the addressed resource is already gone.
pub const ABSENT_CODES: [&str; 3] = [
    "GROUP_DOESNT_EXIST",
    "INSTANCE_DOESNT_EXIST",
    "RESOURCE_DOESNT_EXIST",
];

/// Future returned by fleet API operations.
pub type FleetFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FleetError>> + Send + 'a>>;

/// Errors raised by the fleet API client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FleetError {
    /// The request exceeded its transport deadline.
    #[error("{operation} timed out")]
    Timeout {
        /// Request being made.
        operation: String,
    },
    /// The request could not be sent or its body could not be read.
    #[error("{operation} request failed: {message}")]
    Request {
        /// Request being made.
        operation: String,
        /// Transport error message.
        message: String,
    },
    /// The API answered with a non-success status.
    #[error("{operation} returned {status} ({code}): {message}")]
    Api {
        /// Request being made.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// First structured error code, or `UNKNOWN`.
        code: String,
        /// First structured error message, or the raw body.
        message: String,
    },
    /// The response body did not match the envelope.
    #[error("failed to decode {operation} response: {message}")]
    Decode {
        /// Request being made.
        operation: String,
        /// Decoder error message.
        message: String,
    },
}

impl FleetError {
    /// Returns `true` when the API reported the resource as already absent.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Api { status, code, .. } => {
                (*status == StatusCode::BAD_REQUEST.as_u16()
                    || *status == StatusCode::NOT_FOUND.as_u16())
                    && ABSENT_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }
}

/// Fleet API verbs.
///
/// [`FleetManager`](super::FleetManager) resolves instances through
/// `group_status` only. `read_group` and `lookup_instance` complete the verb
/// set for embedders and diagnostics; no manager calls them.
pub trait FleetApi: Send + Sync {
    /// Creates a pool (`POST /group`).
    fn create_group<'a>(&'a self, spec: &'a GroupSpec) -> FleetFuture<'a, GroupRecord>;

    /// Reads a pool (`GET /group/{id}`); `None` when it no longer exists.
    fn read_group<'a>(&'a self, group_id: &'a VmId) -> FleetFuture<'a, Option<GroupRecord>>;

    /// Applies a sparse update to a pool (`PUT /group/{id}`).
    fn update_group<'a>(
        &'a self,
        group_id: &'a VmId,
        update: &'a GroupUpdate,
    ) -> FleetFuture<'a, GroupRecord>;

    /// Deletes a pool (`DELETE /group/{id}`), returning whether it existed.
    fn delete_group<'a>(
        &'a self,
        group_id: &'a VmId,
        options: &'a DeleteOptions,
    ) -> FleetFuture<'a, bool>;

    /// Lists the pool's members (`GET /group/{id}/status`); empty when the
    /// pool no longer exists.
    fn group_status<'a>(&'a self, group_id: &'a VmId) -> FleetFuture<'a, Vec<GroupMember>>;

    /// Looks up an instance (`GET /instance/{id}`); `None` when unknown.
    fn lookup_instance<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> FleetFuture<'a, Option<FleetInstance>>;
}

/// Bearer token plus optional account scope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FleetCredentials {
    /// API token.
    pub token: String,
    /// Account the token is scoped to.
    pub account_id: Option<String>,
}

/// `reqwest`-backed implementation of [`FleetApi`].
#[derive(Clone, Debug)]
pub struct FleetClient {
    http: reqwest::Client,
    base_url: String,
    credentials: FleetCredentials,
}

impl FleetClient {
    /// Builds a client against `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Request`] when the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        credentials: FleetCredentials,
        timeout: Duration,
    ) -> Result<Self, FleetError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FleetError::Request {
                operation: String::from("build client"),
                message: err.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            credentials,
        })
    }

    /// Builds a client from loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Request`] when the HTTP client cannot be built.
    pub fn from_config(config: &CpiConfig) -> Result<Self, FleetError> {
        Self::new(
            config.fleet_api_url.clone(),
            FleetCredentials {
                token: config.fleet_token.clone(),
                account_id: config.fleet_account_id.clone(),
            },
            config.request_timeout(),
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.credentials.token);
        match self.credentials.account_id.as_deref() {
            Some(account) if !account.is_empty() => builder.query(&[("accountId", account)]),
            _ => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<Vec<T>, FleetError> {
        debug!(operation, "sending fleet request");
        let response = builder
            .send()
            .await
            .map_err(|err| transport_error(operation, &err))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(operation, &err))?;
        decode_response(operation, status, &body)
    }

    async fn send_json<B, T>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Vec<T>, FleetError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        self.send(operation, self.request(method, path).json(body))
            .await
    }
}

impl FleetApi for FleetClient {
    fn create_group<'a>(&'a self, spec: &'a GroupSpec) -> FleetFuture<'a, GroupRecord> {
        Box::pin(async move {
            let operation = "POST /group";
            let items = self
                .send_json(operation, Method::POST, "/group", &GroupBody { group: spec })
                .await?;
            first_item(operation, items)
        })
    }

    fn read_group<'a>(&'a self, group_id: &'a VmId) -> FleetFuture<'a, Option<GroupRecord>> {
        Box::pin(async move {
            let operation = format!("GET /group/{group_id}");
            let result = self
                .send(&operation, self.request(Method::GET, &group_path(group_id)))
                .await;
            absent_as_empty(result).map(|items| items.into_iter().next())
        })
    }

    fn update_group<'a>(
        &'a self,
        group_id: &'a VmId,
        update: &'a GroupUpdate,
    ) -> FleetFuture<'a, GroupRecord> {
        Box::pin(async move {
            let operation = format!("PUT /group/{group_id}");
            let items = self
                .send_json(
                    &operation,
                    Method::PUT,
                    &group_path(group_id),
                    &GroupBody { group: update },
                )
                .await?;
            first_item(&operation, items)
        })
    }

    fn delete_group<'a>(
        &'a self,
        group_id: &'a VmId,
        options: &'a DeleteOptions,
    ) -> FleetFuture<'a, bool> {
        Box::pin(async move {
            let operation = format!("DELETE /group/{group_id}");
            let result: Result<Vec<serde_json::Value>, FleetError> = self
                .send_json(&operation, Method::DELETE, &group_path(group_id), options)
                .await;
            match result {
                Ok(_) => Ok(true),
                Err(err) if err.is_absent() => Ok(false),
                Err(err) => Err(err),
            }
        })
    }

    fn group_status<'a>(&'a self, group_id: &'a VmId) -> FleetFuture<'a, Vec<GroupMember>> {
        Box::pin(async move {
            let operation = format!("GET /group/{group_id}/status");
            let path = format!("{}/status", group_path(group_id));
            absent_as_empty(
                self.send(&operation, self.request(Method::GET, &path))
                    .await,
            )
        })
    }

    fn lookup_instance<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> FleetFuture<'a, Option<FleetInstance>> {
        Box::pin(async move {
            let operation = format!("GET /instance/{instance_id}");
            let path = format!("/instance/{instance_id}");
            let result = self
                .send(&operation, self.request(Method::GET, &path))
                .await;
            absent_as_empty(result).map(|items| items.into_iter().next())
        })
    }
}

#[derive(Serialize)]
struct GroupBody<'a, T> {
    group: &'a T,
}

fn group_path(group_id: &VmId) -> String {
    format!("/group/{group_id}")
}

fn transport_error(operation: &str, err: &reqwest::Error) -> FleetError {
    if err.is_timeout() {
        FleetError::Timeout {
            operation: operation.to_owned(),
        }
    } else {
        FleetError::Request {
            operation: operation.to_owned(),
            message: err.to_string(),
        }
    }
}

fn first_item<T>(operation: &str, items: Vec<T>) -> Result<T, FleetError> {
    items
        .into_iter()
        .next()
        .ok_or_else(|| FleetError::Decode {
            operation: operation.to_owned(),
            message: String::from("response contained no items"),
        })
}

/// Maps an "already absent" API error onto an empty item list.
///
/// # Errors
///
/// Propagates every other error unchanged.
pub fn absent_as_empty<T>(result: Result<Vec<T>, FleetError>) -> Result<Vec<T>, FleetError> {
    match result {
        Err(err) if err.is_absent() => {
            debug!(error = %err, "fleet resource already absent");
            Ok(Vec::new())
        }
        other => other,
    }
}

/// Decodes a fleet API response body given its HTTP status.
///
/// Success statuses yield the envelope's items; an empty body is an empty
/// list. Failure statuses yield [`FleetError::Api`] carrying the first
/// structured error, or the raw body when none can be parsed.
///
/// # Errors
///
/// Returns [`FleetError::Api`] for non-success statuses and
/// [`FleetError::Decode`] when a success body is not a valid envelope.
pub fn decode_response<T: DeserializeOwned>(
    operation: &str,
    status: u16,
    body: &str,
) -> Result<Vec<T>, FleetError> {
    let success = StatusCode::from_u16(status).is_ok_and(|code| code.is_success());
    if !success {
        let item = first_error(body).unwrap_or_else(|| ApiErrorItem {
            code: String::from("UNKNOWN"),
            message: body.trim().to_owned(),
        });
        return Err(FleetError::Api {
            operation: operation.to_owned(),
            status,
            code: item.code,
            message: item.message,
        });
    }
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<Envelope<T>>(body)
        .map(|envelope| envelope.response.items)
        .map_err(|err| FleetError::Decode {
            operation: operation.to_owned(),
            message: err.to_string(),
        })
}

fn first_error(body: &str) -> Option<ApiErrorItem> {
    serde_json::from_str::<Envelope<serde_json::Value>>(body)
        .ok()?
        .response
        .errors
        .into_iter()
        .next()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn api_error(status: u16, code: &str) -> FleetError {
        FleetError::Api {
            operation: String::from("DELETE /group/sig-1"),
            status,
            code: code.to_owned(),
            message: String::from("gone"),
        }
    }

    #[test]
    fn decodes_items_from_success_envelope() {
        let body = json!({
            "response": {"items": [{"instanceId": "i-1", "status": "fulfilled"}]}
        })
        .to_string();
        let members: Vec<GroupMember> =
            decode_response("GET /group/sig-1/status", 200, &body).unwrap_or_else(|err| {
                panic!("decode: {err}");
            });
        let instance_ids: Vec<_> = members
            .iter()
            .map(|member| member.instance_id.as_deref())
            .collect();
        assert_eq!(instance_ids, vec![Some("i-1")]);
    }

    #[test]
    fn empty_success_body_is_an_empty_list() {
        let members: Vec<GroupMember> = decode_response("DELETE /group/sig-1", 200, "")
            .unwrap_or_else(|err| panic!("decode: {err}"));
        assert!(members.is_empty());
    }

    #[test]
    fn failure_status_carries_first_structured_error() {
        let body = json!({
            "response": {"errors": [
                {"code": "GROUP_DOESNT_EXIST", "message": "group sig-1 does not exist"}
            ]}
        })
        .to_string();
        let err = decode_response::<GroupRecord>("DELETE /group/sig-1", 400, &body)
            .expect_err("400 should fail");
        assert_eq!(
            err,
            FleetError::Api {
                operation: String::from("DELETE /group/sig-1"),
                status: 400,
                code: String::from("GROUP_DOESNT_EXIST"),
                message: String::from("group sig-1 does not exist"),
            }
        );
        assert!(err.is_absent());
    }

    #[test]
    fn unparseable_failure_body_keeps_raw_text() {
        let err = decode_response::<GroupRecord>("POST /group", 502, "bad gateway\n")
            .expect_err("502 should fail");
        assert_eq!(
            err,
            FleetError::Api {
                operation: String::from("POST /group"),
                status: 502,
                code: String::from("UNKNOWN"),
                message: String::from("bad gateway"),
            }
        );
        assert!(!err.is_absent());
    }

    #[test]
    fn absence_requires_known_code_and_client_error_status() {
        assert!(api_error(404, "INSTANCE_DOESNT_EXIST").is_absent());
        assert!(api_error(400, "RESOURCE_DOESNT_EXIST").is_absent());
        assert!(!api_error(500, "GROUP_DOESNT_EXIST").is_absent());
        assert!(!api_error(400, "VALIDATION_ERROR").is_absent());
        assert!(
            !FleetError::Timeout {
                operation: String::from("GET /group/sig-1"),
            }
            .is_absent()
        );
    }

    #[test]
    fn absent_errors_become_empty_results() {
        let absent: Result<Vec<GroupMember>, FleetError> =
            Err(api_error(400, "GROUP_DOESNT_EXIST"));
        assert_eq!(absent_as_empty(absent), Ok(Vec::new()));

        let fatal: Result<Vec<GroupMember>, FleetError> = Err(api_error(400, "BAD_REQUEST"));
        assert_eq!(
            absent_as_empty(fatal),
            Err(api_error(400, "BAD_REQUEST"))
        );
    }

    #[test]
    fn malformed_success_body_is_a_decode_error() {
        let err = decode_response::<GroupRecord>("POST /group", 200, "{not json")
            .expect_err("malformed body should fail");
        assert!(matches!(err, FleetError::Decode { .. }));
    }
}
