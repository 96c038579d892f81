//! Round-robin ring over the replica set

use parking_lot::Mutex;

/// Cycles over a fixed set of items. The cursor survives rebuilds only by
/// replacing the whole ring, which resets it; distribution stays unbiased
/// because the cursor always wraps over the current length.
pub struct Ring<T> {
    items: Vec<T>,
    cursor: Mutex<usize>,
}

impl<T: Clone> Ring<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            cursor: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// The next item in rotation, or `None` for an empty ring.
    pub fn next(&self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let item = self.items[*cursor % self.items.len()].clone();
        *cursor = (*cursor + 1) % self.items.len();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ring_yields_nothing() {
        let ring: Ring<u32> = Ring::new(Vec::new());
        assert!(ring.is_empty());
        assert_eq!(ring.next(), None);
    }

    #[test]
    fn test_rotation_wraps() {
        let ring = Ring::new(vec![1, 2, 3]);
        let seen: Vec<u32> = (0..7).filter_map(|_| ring.next()).collect();
        assert_eq!(seen, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn test_single_item_repeats() {
        let ring = Ring::new(vec!["only"]);
        assert_eq!(ring.next(), Some("only"));
        assert_eq!(ring.next(), Some("only"));
        assert_eq!(ring.len(), 1);
    }
}
