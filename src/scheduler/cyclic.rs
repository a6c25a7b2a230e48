//! Candidate iteration with cyclic reset
//!
//! `reset(cur)` restarts iteration at the element after `cur`, wraps to the
//! beginning, and stops at the original position, so successive schedule
//! calls round-robin across candidates instead of hammering a hot prefix.
//! An unknown `cur` leaves the order unchanged.

/// Ordered candidate ids yielded by a prefilter.
#[derive(Debug, Clone, Default)]
pub struct CyclicKeys {
    keys: Vec<String>,
    start: usize,
}

impl CyclicKeys {
    #[must_use]
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys, start: 0 }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Restarts iteration at the element after `cur`.
    pub fn reset(&mut self, cur: &str) {
        if let Some(index) = self.keys.iter().position(|key| key == cur) {
            self.start = (index + 1) % self.keys.len();
        }
    }

    /// The full permutation in current order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let (tail, head) = self.keys.split_at(self.start.min(self.keys.len()));
        head.iter().chain(tail.iter()).map(String::as_str)
    }
}

impl<'a> IntoIterator for &'a CyclicKeys {
    type Item = &'a str;
    type IntoIter = Box<dyn Iterator<Item = &'a str> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys(items: &[&str]) -> CyclicKeys {
        CyclicKeys::new(items.iter().map(ToString::to_string).collect())
    }

    fn collect(cyclic: &CyclicKeys) -> Vec<String> {
        cyclic.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_reset_starts_after_cursor_and_wraps() {
        let mut cyclic = keys(&["a", "b", "c", "d"]);
        cyclic.reset("b");
        assert_eq!(collect(&cyclic), ["c", "d", "a", "b"]);
    }

    #[test]
    fn test_reset_at_last_key_keeps_original_order() {
        let mut cyclic = keys(&["a", "b", "c"]);
        cyclic.reset("c");
        assert_eq!(collect(&cyclic), ["a", "b", "c"]);
    }

    #[test]
    fn test_unknown_cursor_keeps_order() {
        let mut cyclic = keys(&["a", "b", "c"]);
        cyclic.reset("zz");
        assert_eq!(collect(&cyclic), ["a", "b", "c"]);
    }

    proptest! {
        /// The reset order is always the n-element rotation starting at the
        /// element after `cur`.
        #[test]
        fn prop_reset_is_a_rotation(len in 1usize..12, cursor in 0usize..12) {
            let items: Vec<String> = (0..len).map(|i| format!("k{i}")).collect();
            let cursor = cursor % len;
            let mut cyclic = CyclicKeys::new(items.clone());
            cyclic.reset(&items[cursor]);

            let got: Vec<String> = cyclic.iter().map(ToString::to_string).collect();
            let mut expected = items.clone();
            expected.rotate_left((cursor + 1) % len);
            prop_assert_eq!(got.len(), len);
            prop_assert_eq!(got, expected);
        }
    }
}
