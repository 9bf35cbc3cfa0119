//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use drover_id::RequestId;

use crate::api::error::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Name of the cluster member a request is made on behalf of.
pub const MEMBER_HEADER: &str = "x-drover-member";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub member: Option<String>,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| RequestId::new().to_string());

        let member = header_string(&parts.headers, MEMBER_HEADER);
        if let Some(name) = &member {
            if name.len() > 63 {
                return Err(ApiError::bad_request(
                    "invalid_member_header",
                    format!("{MEMBER_HEADER} must be at most 63 characters"),
                )
                .with_request_id(request_id));
            }
        }

        Ok(Self { request_id, member })
    }
}

impl RequestContext {
    /// Attaches the request ID to an error.
    pub fn error(&self, e: impl Into<ApiError>) -> ApiError {
        e.into().with_request_id(self.request_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    async fn extract(builder: axum::http::request::Builder) -> Result<RequestContext, ApiError> {
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        RequestContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_request_id_from_header() {
        let ctx = extract(Request::builder().header(REQUEST_ID_HEADER, "req_abc"))
            .await
            .unwrap();
        assert_eq!(ctx.request_id, "req_abc");
        assert!(ctx.member.is_none());
    }

    #[tokio::test]
    async fn test_request_id_generated() {
        let ctx = extract(Request::builder().header(MEMBER_HEADER, "m1"))
            .await
            .unwrap();
        assert!(ctx.request_id.starts_with("req_"));
        assert_eq!(ctx.member.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_rejects_oversized_member() {
        let err = extract(Request::builder().header(MEMBER_HEADER, "m".repeat(64)))
            .await
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }
}
