//! The key capability protocol (Design Note 9: an explicit trait bound,
//! not an inheritance relationship).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// What the table requires from a key: equality, and a 32-bit hash code.
///
/// A blanket impl supplies this for any `Hash + Eq` type via
/// [`DefaultHasher`], truncated to its low 32 bits. Implement it directly
/// if a type needs a different hash than the one `std::hash::Hash` would
/// give it.
pub trait TableKey: Eq {
    fn hash_code(&self) -> u32;
}

impl<T: Hash + Eq> TableKey for T {
    fn hash_code(&self) -> u32 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_code_is_stable() {
        assert_eq!(42i32.hash_code(), 42i32.hash_code());
        assert_eq!("hello".hash_code(), "hello".to_string().hash_code());
    }
}
