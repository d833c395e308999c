//! Serde helpers shared across wire and config types.

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}
