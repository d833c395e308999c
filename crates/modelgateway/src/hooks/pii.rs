//! Builtin PII recognizers for the bundled regex guardrail backend.

use once_cell::sync::Lazy;
use regex::Regex;

pub struct RecognizerResult {
	pub entity_type: &'static str,
	pub start: usize,
	pub end: usize,
}

pub struct PatternRecognizer {
	entity_type: &'static str,
	pattern: Regex,
}

impl PatternRecognizer {
	fn new(entity_type: &'static str, pattern: &str) -> Self {
		Self {
			entity_type,
			pattern: Regex::new(pattern).expect("static regex"),
		}
	}

	pub fn recognize(&self, text: &str) -> Vec<RecognizerResult> {
		self
			.pattern
			.find_iter(text)
			.map(|m| RecognizerResult {
				entity_type: self.entity_type,
				start: m.start(),
				end: m.end(),
			})
			.collect()
	}
}

pub static SSN: Lazy<PatternRecognizer> = Lazy::new(|| {
	PatternRecognizer::new("ssn", r"\b\d{3}-\d{2}-\d{4}\b")
});

pub static CREDIT_CARD: Lazy<PatternRecognizer> = Lazy::new(|| {
	PatternRecognizer::new(
		"credit_card",
		r"\b(?:\d[ -]*?){13,16}\b",
	)
});

pub static EMAIL: Lazy<PatternRecognizer> = Lazy::new(|| {
	PatternRecognizer::new(
		"email",
		r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
	)
});

pub static PHONE: Lazy<PatternRecognizer> = Lazy::new(|| {
	PatternRecognizer::new(
		"phone_number",
		r"\b(?:\+?1[-. ]?)?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b",
	)
});

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ssn_matches() {
		let hits = SSN.recognize("my ssn is 123-45-6789 ok");
		assert_eq!(hits.len(), 1);
		assert_eq!(hits[0].entity_type, "ssn");
	}

	#[test]
	fn email_matches() {
		assert_eq!(EMAIL.recognize("mail me at a.b@example.com").len(), 1);
		assert!(EMAIL.recognize("no address here").is_empty());
	}
}
