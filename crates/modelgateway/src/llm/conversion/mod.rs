//! Request/response/stream translation between the unified shapes and each
//! provider's wire format.

pub mod bedrock;
pub mod completions;
pub mod gemini;
pub mod messages;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Strip JSON-Schema keywords a target provider rejects. All of these
/// transformations are idempotent.
pub fn scrub_schema(schema: &mut Value, remove_keys: &[&str], strip_type_with_any_of: bool) {
	match schema {
		Value::Object(map) => {
			for key in remove_keys {
				map.remove(*key);
			}
			if strip_type_with_any_of && (map.contains_key("anyOf") || map.contains_key("any_of")) {
				map.remove("type");
			}
			for (_, v) in map.iter_mut() {
				scrub_schema(v, remove_keys, strip_type_with_any_of);
			}
		},
		Value::Array(items) => {
			for v in items.iter_mut() {
				scrub_schema(v, remove_keys, strip_type_with_any_of);
			}
		},
		_ => {},
	}
}

/// Anthropic rejects `$id`/`$schema`.
pub fn scrub_schema_for_anthropic(schema: &mut Value) {
	scrub_schema(schema, &["$id", "$schema"], false);
}

/// Gemini rejects `type` alongside `anyOf`, and schema metadata keys.
pub fn scrub_schema_for_gemini(schema: &mut Value) {
	scrub_schema(schema, &["$id", "$schema", "additionalProperties"], true);
}

/// Bedrock accepts a Draft-7 subset.
pub fn scrub_schema_for_bedrock(schema: &mut Value) {
	scrub_schema(schema, &["$id", "$schema", "$defs"], false);
}

/// Deterministic OpenAI-style id for providers that key tool calls by
/// numeric index. Bridging back re-maps by this id.
pub fn tool_call_id(index: usize, name: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(name.as_bytes());
	hasher.update(index.to_le_bytes());
	let digest = hasher.finalize();
	let mut hex = String::with_capacity(8);
	for b in &digest[..4] {
		hex.push_str(&format!("{b:02x}"));
	}
	format!("call_{index}_{hex}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn schema_scrub_is_idempotent() {
		let mut schema = serde_json::json!({
			"$schema": "http://json-schema.org/draft-07/schema#",
			"$id": "weather",
			"type": "object",
			"properties": {
				"location": {"anyOf": [{"type": "string"}, {"type": "null"}], "type": "string"}
			}
		});
		scrub_schema_for_gemini(&mut schema);
		let once = schema.clone();
		scrub_schema_for_gemini(&mut schema);
		assert_eq!(once, schema);
		assert!(schema.get("$schema").is_none());
		assert!(schema["properties"]["location"].get("type").is_none());
	}

	#[test]
	fn anthropic_scrub_keeps_types() {
		let mut schema = serde_json::json!({"$id": "x", "type": "object"});
		scrub_schema_for_anthropic(&mut schema);
		assert_eq!(schema, serde_json::json!({"type": "object"}));
	}

	#[test]
	fn tool_call_ids_are_deterministic() {
		let a = tool_call_id(0, "get_weather");
		let b = tool_call_id(0, "get_weather");
		let c = tool_call_id(1, "get_weather");
		assert_eq!(a, b);
		assert_ne!(a, c);
		assert!(a.starts_with("call_0_"));
	}
}
