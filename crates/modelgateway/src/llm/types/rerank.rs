//! The `/v1/rerank` shape (Cohere-compatible, which the ecosystem has
//! standardized on).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	pub query: String,
	pub documents: Vec<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_n: Option<u32>,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	pub results: Vec<RerankResult>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub meta: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResult {
	pub index: u32,
	pub relevance_score: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub document: Option<Value>,
}
