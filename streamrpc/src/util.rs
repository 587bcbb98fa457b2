// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::{
    collections::HashMap,
    hash::{BuildHasher, Hash},
};

/// Maps of calls in flight never shrink below this many slots.
const MIN_CAPACITY: usize = 1000;
/// A map shrinks once its capacity is more than this many times its length.
const MAX_SLACK: usize = 10;

/// Releases the memory a map of calls in flight grew into during a burst of calls.
pub trait Compact {
    /// Shrinks the map iff most of its capacity is unused.
    fn compact(&mut self);
}

impl<K, V, H> Compact for HashMap<K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    fn compact(&mut self) {
        let target = self.len().saturating_mul(MAX_SLACK).max(MIN_CAPACITY);
        if self.capacity() > target {
            self.shrink_to(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Compact;
    use std::collections::HashMap;

    #[test]
    fn compact_shrinks_sparse_maps_only() {
        let mut map = HashMap::with_capacity(8192);
        for i in 0..10 {
            map.insert(i, i);
        }
        map.compact();
        assert_eq!(map.len(), 10);
        assert!(map.capacity() >= 1000);
        assert!(map.capacity() < 8192);

        let mut small = HashMap::with_capacity(16);
        small.insert(1, 1);
        let capacity = small.capacity();
        small.compact();
        assert_eq!(small.capacity(), capacity);
    }
}
