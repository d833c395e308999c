//! Server-sent-events parsing and re-emission for streaming bodies.
//!
//! Two bridges are provided:
//! - [`json_passthrough`]: forward the upstream bytes unchanged (byte-exact,
//!   whitespace preserved) while feeding parsed events to an observer;
//! - [`json_transform`]: parse upstream events, map them through a function,
//!   and emit a new SSE stream of the mapped events.
//!
//! Both treat `data: [DONE]` as the stream sentinel and tolerate providers
//! that never send one.

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::debug;
use crate::http::Body;

pub const DONE: &str = "[DONE]";

/// One parsed SSE event: the (optional) event name and the joined data
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
	pub name: Option<String>,
	pub data: String,
}

impl Event {
	pub fn is_done(&self) -> bool {
		self.data == DONE
	}
}

/// Incremental SSE frame parser over raw bytes.
#[derive(Default)]
pub struct Parser {
	buffer: BytesMut,
}

impl Parser {
	pub fn push(&mut self, bytes: &[u8]) {
		self.buffer.extend_from_slice(bytes);
	}

	pub fn buffered(&self) -> usize {
		self.buffer.len()
	}

	/// Pop the next complete event from the buffer, if any.
	pub fn next_event(&mut self) -> Option<Event> {
		let boundary = find_boundary(&self.buffer)?;
		let raw = self.buffer.split_to(boundary.end);
		let block = &raw[..boundary.start];
		let mut name = None;
		let mut data_lines: Vec<&str> = Vec::new();
		for line in std::str::from_utf8(block).ok()?.lines() {
			if let Some(rest) = field(line, "event") {
				name = Some(rest.to_string());
			} else if let Some(rest) = field(line, "data") {
				data_lines.push(rest);
			}
			// comments (`:`), `id:` and `retry:` fields are ignored
		}
		Some(Event {
			name,
			// Per the SSE spec multiple data lines join with a newline. The
			// join is exact; no trimming beyond the single leading space.
			data: data_lines.join("\n"),
		})
	}
}

struct Boundary {
	/// Length of the event block, excluding the separator.
	start: usize,
	/// Length including the separator.
	end: usize,
}

fn find_boundary(buf: &[u8]) -> Option<Boundary> {
	// Events are delimited by a blank line: \n\n or \r\n\r\n.
	let mut i = 0;
	while i + 1 < buf.len() {
		if buf[i] == b'\n' && buf[i + 1] == b'\n' {
			return Some(Boundary {
				start: i + 1,
				end: i + 2,
			});
		}
		if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
			return Some(Boundary {
				start: i + 2,
				end: i + 4,
			});
		}
		i += 1;
	}
	None
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
	let rest = line.strip_prefix(name)?.strip_prefix(':')?;
	// A single leading space is part of the field syntax, everything after is
	// payload.
	Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Serialize a value as one SSE frame.
pub fn encode_frame<T: Serialize>(name: Option<&str>, value: &T) -> Bytes {
	let data = serde_json::to_string(value).unwrap_or_default();
	match name {
		Some(n) => Bytes::from(format!("event: {n}\ndata: {data}\n\n")),
		None => Bytes::from(format!("data: {data}\n\n")),
	}
}

pub fn done_frame() -> Bytes {
	Bytes::from_static(b"data: [DONE]\n\n")
}

/// Forward the upstream body unchanged while observing each parsed event.
/// The observer receives `Some(parse_result)` per data event and a final
/// `None` when the stream closes.
pub fn json_passthrough<T: DeserializeOwned>(
	body: Body,
	buffer_limit: usize,
	mut observe: impl FnMut(Option<Result<T, serde_json::Error>>) + Send + 'static,
) -> Body {
	let mut parser = Parser::default();
	let stream = async_stream::stream! {
		let mut stream = body.into_data_stream();
		while let Some(chunk) = stream.next().await {
			match chunk {
				Ok(bytes) => {
					parser.push(&bytes);
					if parser.buffered() > buffer_limit.max(crate::http::DEFAULT_BODY_LIMIT) {
						debug!("dropping oversized SSE event");
						yield Err(axum::Error::new("sse event over buffer limit"));
						return;
					}
					while let Some(event) = parser.next_event() {
						if event.data.is_empty() || event.is_done() {
							continue;
						}
						observe(Some(serde_json::from_str::<T>(&event.data)));
					}
					// Bytes are forwarded exactly as received.
					yield Ok(bytes);
				},
				Err(e) => {
					observe(None);
					yield Err(e);
					return;
				},
			}
		}
		observe(None);
	};
	Body::from_stream(stream)
}

/// Parse upstream events as `I`, map through `transform`, and emit the mapped
/// events as a fresh SSE stream terminated with `[DONE]`. The transform
/// receives `Some(parse_result)` per event and a final `None` at end of
/// stream, where it may emit one last frame (e.g. a synthetic terminal chunk
/// for an empty stream).
pub fn json_transform<I: DeserializeOwned, O: Serialize + Send>(
	body: Body,
	buffer_limit: usize,
	mut transform: impl FnMut(Option<Result<I, serde_json::Error>>) -> Option<O> + Send + 'static,
) -> Body {
	let mut parser = Parser::default();
	let stream = async_stream::stream! {
		let mut stream = body.into_data_stream();
		while let Some(chunk) = stream.next().await {
			match chunk {
				Ok(bytes) => {
					parser.push(&bytes);
					if parser.buffered() > buffer_limit.max(crate::http::DEFAULT_BODY_LIMIT) {
						yield Err(axum::Error::new("sse event over buffer limit"));
						return;
					}
					while let Some(event) = parser.next_event() {
						if event.data.is_empty() || event.is_done() {
							continue;
						}
						if let Some(out) = transform(Some(serde_json::from_str::<I>(&event.data))) {
							yield Ok(encode_frame(None, &out));
						}
					}
				},
				Err(e) => {
					yield Err(e);
					return;
				},
			}
		}
		if let Some(out) = transform(None) {
			yield Ok(encode_frame(None, &out));
		}
		yield Ok(done_frame());
	};
	Body::from_stream(stream)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_events_across_chunk_boundaries() {
		let mut p = Parser::default();
		p.push(b"event: message_start\nda");
		assert!(p.next_event().is_none());
		p.push(b"ta: {\"a\":1}\n\ndata: [DONE]\n\n");
		let e = p.next_event().unwrap();
		assert_eq!(e.name.as_deref(), Some("message_start"));
		assert_eq!(e.data, "{\"a\":1}");
		let done = p.next_event().unwrap();
		assert!(done.is_done());
		assert!(p.next_event().is_none());
	}

	#[test]
	fn crlf_delimiters() {
		let mut p = Parser::default();
		p.push(b"data: {\"b\":2}\r\n\r\n");
		assert_eq!(p.next_event().unwrap().data, "{\"b\":2}");
	}

	#[test]
	fn data_whitespace_is_preserved() {
		// Only the single space after the colon is syntax; the rest of the
		// payload is byte-exact.
		let mut p = Parser::default();
		p.push(b"data:  {\"c\": \" padded \"}\n\n");
		assert_eq!(p.next_event().unwrap().data, " {\"c\": \" padded \"}");
	}

	#[test]
	fn multiline_data_joins_with_newline() {
		let mut p = Parser::default();
		p.push(b"data: line1\ndata: line2\n\n");
		assert_eq!(p.next_event().unwrap().data, "line1\nline2");
	}

	#[tokio::test]
	async fn transform_emits_done() {
		let body = Body::from("data: {\"v\":1}\n\ndata: {\"v\":2}\n\ndata: [DONE]\n\n");
		let out = json_transform::<serde_json::Value, serde_json::Value>(body, 0, |v| {
			let v = v?.ok()?;
			(v["v"] == 2).then_some(v)
		});
		let bytes = http_body_util::BodyExt::collect(out).await.unwrap().to_bytes();
		let s = std::str::from_utf8(&bytes).unwrap();
		assert_eq!(s, "data: {\"v\":2}\n\ndata: [DONE]\n\n");
	}

	#[tokio::test]
	async fn passthrough_is_byte_exact() {
		let raw = "data: {\"v\": 1}\n\ndata: [DONE]\n\n";
		let body = Body::from(raw);
		let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let seen2 = seen.clone();
		let out = json_passthrough::<serde_json::Value>(body, 0, move |e| {
			if matches!(e, Some(Ok(_))) {
				seen2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			}
		});
		let bytes = http_body_util::BodyExt::collect(out).await.unwrap().to_bytes();
		assert_eq!(std::str::from_utf8(&bytes).unwrap(), raw);
		assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
	}
}
