//! Decoding for the AWS EventStream binary framing used by Bedrock's
//! streaming endpoints, bridged into an SSE body.

use aws_smithy_eventstream::frame::{DecodedFrame, MessageFrameDecoder};
pub use aws_smithy_types::event_stream::Message;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::codec::Decoder;

use crate::http::Body;
use crate::parse::sse;

/// Error type for EventStream decoding.
///
/// Wraps AWS Smithy's eventstream errors and satisfies the
/// `tokio_util::codec::Decoder` requirement of implementing
/// `From<io::Error>`.
#[derive(Debug)]
pub enum EventStreamError {
	/// AWS EventStream protocol error (CRC mismatch, invalid headers, etc.)
	Protocol(aws_smithy_eventstream::error::Error),
	/// I/O error during decoding
	Io(std::io::Error),
}

impl std::fmt::Display for EventStreamError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Protocol(e) => write!(f, "{e}"),
			Self::Io(e) => write!(f, "{e}"),
		}
	}
}

impl std::error::Error for EventStreamError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Protocol(e) => Some(e),
			Self::Io(e) => Some(e),
		}
	}
}

impl From<std::io::Error> for EventStreamError {
	fn from(err: std::io::Error) -> Self {
		Self::Io(err)
	}
}

impl From<aws_smithy_eventstream::error::Error> for EventStreamError {
	fn from(err: aws_smithy_eventstream::error::Error) -> Self {
		Self::Protocol(err)
	}
}

/// A `tokio_util::codec::Decoder` wrapper around AWS Smithy's
/// `MessageFrameDecoder`.
#[derive(Default)]
pub struct EventStreamCodec {
	inner: MessageFrameDecoder,
}

impl EventStreamCodec {
	pub fn new() -> Self {
		Self::default()
	}
}

impl Decoder for EventStreamCodec {
	type Item = Message;
	type Error = EventStreamError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.inner.decode_frame(src)? {
			DecodedFrame::Complete(message) => Ok(Some(message)),
			DecodedFrame::Incomplete => Ok(None),
		}
	}
}

/// The `:event-type` header of a decoded message.
pub fn event_type(message: &Message) -> Option<String> {
	message
		.headers()
		.iter()
		.find(|h| h.name().as_str() == ":event-type")
		.and_then(|h| h.value().as_string().ok())
		.map(|s| s.as_str().to_string())
}

/// Like [`transform`], but each mapped value carries an SSE event name
/// (needed when re-emitting Anthropic-shaped event streams).
pub fn transform_named<O: Serialize + Send>(
	body: Body,
	mut f: impl FnMut(&str, Bytes) -> Vec<(&'static str, O)> + Send + 'static,
) -> Body {
	let mut codec = EventStreamCodec::new();
	let mut buf = BytesMut::new();
	let stream = async_stream::stream! {
		let mut stream = body.into_data_stream();
		while let Some(chunk) = stream.next().await {
			match chunk {
				Ok(bytes) => {
					buf.extend_from_slice(&bytes);
					loop {
						match codec.decode(&mut buf) {
							Ok(Some(message)) => {
								let Some(event) = event_type(&message) else {
									continue;
								};
								let payload = Bytes::copy_from_slice(&message.payload()[..]);
								for (name, out) in f(&event, payload) {
									yield Ok(sse::encode_frame(Some(name), &out));
								}
							},
							Ok(None) => break,
							Err(e) => {
								yield Err(axum::Error::new(e));
								return;
							},
						}
					}
				},
				Err(e) => {
					yield Err(e);
					return;
				},
			}
		}
	};
	Body::from_stream(stream)
}

/// Decode an EventStream body, map each `(event_type, payload)` through `f`,
/// and emit the mapped values as SSE data frames terminated by `[DONE]`.
pub fn transform<O: Serialize + Send>(
	body: Body,
	mut f: impl FnMut(&str, Bytes) -> Vec<O> + Send + 'static,
) -> Body {
	let mut codec = EventStreamCodec::new();
	let mut buf = BytesMut::new();
	let stream = async_stream::stream! {
		let mut stream = body.into_data_stream();
		while let Some(chunk) = stream.next().await {
			match chunk {
				Ok(bytes) => {
					buf.extend_from_slice(&bytes);
					loop {
						match codec.decode(&mut buf) {
							Ok(Some(message)) => {
								let Some(event) = event_type(&message) else {
									continue;
								};
								let payload = Bytes::copy_from_slice(&message.payload()[..]);
								for out in f(&event, payload) {
									yield Ok(sse::encode_frame(None, &out));
								}
							},
							Ok(None) => break,
							Err(e) => {
								yield Err(axum::Error::new(e));
								return;
							},
						}
					}
				},
				Err(e) => {
					yield Err(e);
					return;
				},
			}
		}
		yield Ok(sse::done_frame());
	};
	Body::from_stream(stream)
}
