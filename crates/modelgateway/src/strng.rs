//! Cheap, cloneable, immutable strings used throughout the gateway.
//!
//! Configuration and routing state is read-mostly and shared across many
//! in-flight calls, so we use reference-counted strings everywhere instead of
//! `String`.

pub use arcstr::{ArcStr, Substr, format, literal};

pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

pub const EMPTY: Strng = literal!("");

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn literal_and_new_compare_equal() {
		let a = literal!("openai");
		let b = new("openai");
		assert_eq!(a, b);
	}
}
