//! The gateway error taxonomy.
//!
//! Every failure, whether produced locally or mapped from a provider
//! response, is normalized into an [`ErrorKind`]. The router makes its
//! retry/fallback decisions on the kind, never on raw HTTP status codes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::http::{Body, Response, StatusCode, json_response};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
	BadRequest,
	AuthenticationError,
	PermissionDenied,
	NotFound,
	RequestTooLarge,
	RateLimited,
	BudgetExceeded,
	ContextWindowExceeded,
	ContentFiltered,
	Timeout,
	UpstreamError,
	StreamAborted,
	/// The caller went away before the call finished. Never sent on the
	/// wire; recorded for audit.
	ClientCancelled,
	InternalError,
}

impl ErrorKind {
	pub fn status(&self) -> StatusCode {
		match self {
			ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
			ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
			ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
			ErrorKind::NotFound => StatusCode::NOT_FOUND,
			ErrorKind::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
			ErrorKind::BudgetExceeded => StatusCode::TOO_MANY_REQUESTS,
			ErrorKind::ContextWindowExceeded => StatusCode::BAD_REQUEST,
			ErrorKind::ContentFiltered => StatusCode::BAD_REQUEST,
			ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
			ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
			ErrorKind::StreamAborted => StatusCode::BAD_GATEWAY,
			// The nginx convention; there is no client left to answer.
			ErrorKind::ClientCancelled => {
				StatusCode::from_u16(499).expect("static status code")
			},
			ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Whether the router may retry the same deployment on this kind.
	/// `StreamAborted` is additionally gated on zero bytes having been
	/// delivered downstream; the router enforces that separately.
	pub fn retriable(&self) -> bool {
		matches!(
			self,
			ErrorKind::RateLimited
				| ErrorKind::Timeout
				| ErrorKind::UpstreamError
				| ErrorKind::StreamAborted
		)
	}

	/// Whether this kind should put the serving deployment into cooldown.
	pub fn cools_down(&self) -> bool {
		matches!(
			self,
			ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::UpstreamError
		)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::BadRequest => "BadRequest",
			ErrorKind::AuthenticationError => "AuthenticationError",
			ErrorKind::PermissionDenied => "PermissionDenied",
			ErrorKind::NotFound => "NotFound",
			ErrorKind::RequestTooLarge => "RequestTooLarge",
			ErrorKind::RateLimited => "RateLimited",
			ErrorKind::BudgetExceeded => "BudgetExceeded",
			ErrorKind::ContextWindowExceeded => "ContextWindowExceeded",
			ErrorKind::ContentFiltered => "ContentFiltered",
			ErrorKind::Timeout => "Timeout",
			ErrorKind::UpstreamError => "UpstreamError",
			ErrorKind::StreamAborted => "StreamAborted",
			ErrorKind::ClientCancelled => "ClientCancelled",
			ErrorKind::InternalError => "InternalError",
		}
	}

	/// Map a provider HTTP status to the taxonomy. Adapters refine this with
	/// body inspection (e.g. context window and content filter subcodes).
	pub fn from_provider_status(status: StatusCode) -> ErrorKind {
		match status {
			StatusCode::BAD_REQUEST => ErrorKind::BadRequest,
			StatusCode::UNAUTHORIZED => ErrorKind::AuthenticationError,
			StatusCode::FORBIDDEN => ErrorKind::PermissionDenied,
			StatusCode::NOT_FOUND => ErrorKind::NotFound,
			StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout,
			StatusCode::PAYLOAD_TOO_LARGE => ErrorKind::RequestTooLarge,
			StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
			StatusCode::GATEWAY_TIMEOUT => ErrorKind::Timeout,
			_ => ErrorKind::UpstreamError,
		}
	}
}

#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct GatewayError {
	pub kind: ErrorKind,
	pub message: String,
	pub param: Option<String>,
	pub code: Option<String>,
}

impl GatewayError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			param: None,
			code: None,
		}
	}

	pub fn with_param(mut self, param: impl Into<String>) -> Self {
		self.param = Some(param.into());
		self
	}

	pub fn with_code(mut self, code: impl Into<String>) -> Self {
		self.code = Some(code.into());
		self
	}

	pub fn bad_request(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::BadRequest, message)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::InternalError, message)
	}

	pub fn upstream(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::UpstreamError, message)
	}

	pub fn retriable(&self) -> bool {
		self.kind.retriable()
	}

	pub fn wire(&self) -> ErrorBody {
		ErrorBody {
			error: ErrorDetail {
				message: self.message.clone(),
				r#type: self.kind.as_str().to_string(),
				param: self.param.clone(),
				code: self.code.clone(),
			},
		}
	}

	pub fn into_response(&self) -> Response {
		json_response(self.kind.status(), &self.wire())
	}

	/// Terminal SSE frames for a failure after streaming has begun:
	/// an `error` event followed by the `[DONE]` sentinel.
	pub fn sse_events(&self) -> Bytes {
		let data = serde_json::to_string(&self.wire()).unwrap_or_default();
		Bytes::from(format!("event: error\ndata: {data}\n\ndata: [DONE]\n\n"))
	}

	pub fn sse_response(&self) -> Response {
		::http::Response::builder()
			.status(StatusCode::OK)
			.header(::http::header::CONTENT_TYPE, "text/event-stream")
			.body(Body::from(self.sse_events()))
			.expect("static response should build")
	}
}

/// The OpenAI-compatible error wire shape. Every gateway error response has
/// this form, streaming or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
	pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
	pub message: String,
	pub r#type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub param: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[rstest]
	#[case(ErrorKind::RateLimited, true)]
	#[case(ErrorKind::Timeout, true)]
	#[case(ErrorKind::UpstreamError, true)]
	#[case(ErrorKind::StreamAborted, true)]
	#[case(ErrorKind::BadRequest, false)]
	#[case(ErrorKind::ContextWindowExceeded, false)]
	#[case(ErrorKind::ContentFiltered, false)]
	#[case(ErrorKind::BudgetExceeded, false)]
	#[case(ErrorKind::ClientCancelled, false)]
	#[case(ErrorKind::InternalError, false)]
	fn retriable_kinds(#[case] kind: ErrorKind, #[case] retriable: bool) {
		assert_eq!(kind.retriable(), retriable);
	}

	#[rstest]
	#[case(ErrorKind::BadRequest, 400)]
	#[case(ErrorKind::AuthenticationError, 401)]
	#[case(ErrorKind::PermissionDenied, 403)]
	#[case(ErrorKind::NotFound, 404)]
	#[case(ErrorKind::RequestTooLarge, 413)]
	#[case(ErrorKind::RateLimited, 429)]
	#[case(ErrorKind::ContextWindowExceeded, 400)]
	#[case(ErrorKind::Timeout, 504)]
	#[case(ErrorKind::UpstreamError, 502)]
	#[case(ErrorKind::StreamAborted, 502)]
	#[case(ErrorKind::InternalError, 500)]
	fn wire_status_codes(#[case] kind: ErrorKind, #[case] status: u16) {
		assert_eq!(kind.status().as_u16(), status);
	}

	#[test]
	fn wire_shape() {
		let e = GatewayError::new(ErrorKind::ContentFiltered, "blocked by guardrail")
			.with_code("content_filtered");
		let v = serde_json::to_value(e.wire()).unwrap();
		assert_eq!(v["error"]["type"], "ContentFiltered");
		assert_eq!(v["error"]["message"], "blocked by guardrail");
		assert_eq!(v["error"]["code"], "content_filtered");
	}

	#[test]
	fn budget_exceeded_maps_to_429() {
		assert_eq!(
			ErrorKind::BudgetExceeded.status(),
			StatusCode::TOO_MANY_REQUESTS
		);
	}
}
