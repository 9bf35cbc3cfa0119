use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::ClusterError;

/// Seconds clients are told to wait before retrying a transient failure.
const RETRY_AFTER_SECONDS: u32 = 5;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://drover.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            retry_after_seconds: 0,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, code, message)
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::GATEWAY_TIMEOUT, code, message)
            .with_retry_after_seconds(RETRY_AFTER_SECONDS)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message)
            .with_retry_after_seconds(RETRY_AFTER_SECONDS)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }
}

impl From<ClusterError> for ApiError {
    fn from(e: ClusterError) -> Self {
        let code = e.code();
        let message = e.to_string();
        match e {
            ClusterError::InvalidAddress { .. }
            | ClusterError::InvalidToken(_)
            | ClusterError::InvalidRequest(_) => Self::bad_request(code, message),

            ClusterError::UnknownGroup(_)
            | ClusterError::MemberNotFound(_)
            | ClusterError::ResourceNotFound(_) => Self::not_found(code, message),

            ClusterError::NotClusterMember(_) | ClusterError::UntrustedCertificate(_) => {
                Self::forbidden(code, message)
            }

            ClusterError::DuplicateName(_)
            | ClusterError::MemberNotEvacuated(_)
            | ClusterError::TargetUnavailable(_)
            | ClusterError::NoEligibleMembers(_)
            | ClusterError::InvalidState(_)
            | ClusterError::Cancelled => Self::conflict(code, message),

            ClusterError::JoinTimeout(_) => Self::gateway_timeout(code, message),

            ClusterError::MemberUnreachable(_) | ClusterError::TransferFailed(_) => {
                Self::service_unavailable(code, message)
            }
            ClusterError::Store(ref store) if store.is_conflict() => {
                Self::service_unavailable(code, message)
            }

            ClusterError::Runtime(_) | ClusterError::Storage(_) | ClusterError::Store(_) => {
                tracing::error!(error = %message, "Internal error while handling request");
                Self::internal(code, message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::store::StoreError;

    #[rstest]
    #[case(ClusterError::DuplicateName("m1".into()), StatusCode::CONFLICT, false)]
    #[case(ClusterError::InvalidToken("expired".into()), StatusCode::BAD_REQUEST, false)]
    #[case(ClusterError::UnknownGroup("gpu".into()), StatusCode::NOT_FOUND, false)]
    #[case(ClusterError::UntrustedCertificate("fp".into()), StatusCode::FORBIDDEN, false)]
    #[case(ClusterError::JoinTimeout("m3".into()), StatusCode::GATEWAY_TIMEOUT, true)]
    #[case(ClusterError::MemberUnreachable("m2".into()), StatusCode::SERVICE_UNAVAILABLE, true)]
    #[case(
        ClusterError::Store(StoreError::Conflict { expected: 1, actual: 2 }),
        StatusCode::SERVICE_UNAVAILABLE,
        true
    )]
    #[case(
        ClusterError::Store(StoreError::Corrupt("bad row".into())),
        StatusCode::INTERNAL_SERVER_ERROR,
        false
    )]
    fn test_cluster_error_mapping(
        #[case] error: ClusterError,
        #[case] status: StatusCode,
        #[case] retryable: bool,
    ) {
        let code = error.code();
        let api = ApiError::from(error);
        assert_eq!(api.status, status);
        assert_eq!(api.problem.code, code);
        assert_eq!(api.problem.retryable, retryable);
    }

    #[test]
    fn test_problem_content_type() {
        let response = ApiError::not_found("member_not_found", "m9")
            .with_request_id("req_1")
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
