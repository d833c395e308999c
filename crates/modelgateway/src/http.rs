//! Thin aliases and helpers over the `http` / `axum` body types used on every
//! request path.

use ::http::header::CONTENT_TYPE;
use bytes::Bytes;

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};

pub type Body = axum::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

/// Default cap applied when buffering upstream bodies.
pub const DEFAULT_BODY_LIMIT: usize = 2_097_152;

/// How much of a response we are willing to buffer for translation. Streaming
/// paths never buffer the full body; this bounds individual frames.
pub fn response_buffer_limit(headers: &HeaderMap) -> usize {
	headers
		.get(::http::header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<usize>().ok())
		.map(|l| l.min(DEFAULT_BODY_LIMIT))
		.unwrap_or(DEFAULT_BODY_LIMIT)
}

pub async fn to_bytes(body: Body, limit: usize) -> anyhow::Result<Bytes> {
	let bytes = axum::body::to_bytes(body, limit).await?;
	Ok(bytes)
}

pub fn json_response(status: StatusCode, value: &impl serde::Serialize) -> Response {
	let body = serde_json::to_vec(value).unwrap_or_default();
	::http::Response::builder()
		.status(status)
		.header(CONTENT_TYPE, "application/json")
		.body(Body::from(body))
		.expect("static response should build")
}

/// Copy only the named headers from `src`.
pub fn project_headers(src: &HeaderMap, names: &[impl AsRef<str>]) -> HeaderMap {
	let mut out = HeaderMap::new();
	for name in names {
		let Ok(name) = name.as_ref().parse::<HeaderName>() else {
			continue;
		};
		for v in src.get_all(&name) {
			out.append(name.clone(), v.clone());
		}
	}
	out
}
