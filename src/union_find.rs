//! Union-Find (Disjoint Set Union) data structure.
//!
//! Used by the network builder to cluster intersections that fall within
//! the merge tolerance: every pair of nearby nodes is unioned, and each
//! resulting group is collapsed into a single junction node.

use std::collections::HashMap;
use std::hash::Hash;

/// Union-Find with path compression and union by rank.
///
/// # Example
/// ```
/// use run_coverage::union_find::UnionFind;
///
/// let mut uf = UnionFind::new();
/// uf.make_set(101);
/// uf.make_set(102);
/// uf.make_set(103);
///
/// uf.union(&101, &102);
/// assert!(uf.connected(&101, &102));
/// assert!(!uf.connected(&101, &103));
/// ```
#[derive(Debug, Clone)]
pub struct UnionFind<T: Eq + Hash + Clone> {
    parent: HashMap<T, T>,
    rank: HashMap<T, usize>,
}

impl<T: Eq + Hash + Clone> Default for UnionFind<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> UnionFind<T> {
    /// Create a new empty Union-Find structure.
    pub fn new() -> Self {
        Self {
            parent: HashMap::new(),
            rank: HashMap::new(),
        }
    }

    /// Create a Union-Find with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            parent: HashMap::with_capacity(capacity),
            rank: HashMap::with_capacity(capacity),
        }
    }

    /// Add a new element as its own singleton set. No-op if already present.
    pub fn make_set(&mut self, item: T) {
        if !self.parent.contains_key(&item) {
            self.parent.insert(item.clone(), item.clone());
            self.rank.insert(item, 0);
        }
    }

    /// Find the representative (root) of the set containing `item`,
    /// compressing the path as it goes. Auto-creates a singleton set for
    /// unseen items.
    pub fn find(&mut self, item: &T) -> T {
        if !self.parent.contains_key(item) {
            self.make_set(item.clone());
            return item.clone();
        }

        let current = self.parent[item].clone();
        if &current == item {
            return current;
        }

        let root = self.find(&current);
        self.parent.insert(item.clone(), root.clone());
        root
    }

    /// Union the sets containing `a` and `b`.
    ///
    /// Returns true if the sets were distinct (a merge happened).
    pub fn union(&mut self, a: &T, b: &T) -> bool {
        let root_a = self.find(a);
        let root_b = self.find(b);

        if root_a == root_b {
            return false;
        }

        let rank_a = *self.rank.get(&root_a).unwrap_or(&0);
        let rank_b = *self.rank.get(&root_b).unwrap_or(&0);

        if rank_a < rank_b {
            self.parent.insert(root_a, root_b);
        } else if rank_a > rank_b {
            self.parent.insert(root_b, root_a);
        } else {
            self.parent.insert(root_b, root_a.clone());
            self.rank.insert(root_a, rank_a + 1);
        }

        true
    }

    /// Check if two elements are in the same set.
    pub fn connected(&mut self, a: &T, b: &T) -> bool {
        self.find(a) == self.find(b)
    }

    /// All sets as a map from representative to members.
    ///
    /// Singleton sets are included, so the result covers every element
    /// that was ever added.
    pub fn groups(&mut self) -> HashMap<T, Vec<T>> {
        let items: Vec<T> = self.parent.keys().cloned().collect();
        let mut groups: HashMap<T, Vec<T>> = HashMap::new();

        for item in items {
            let root = self.find(&item);
            groups.entry(root).or_default().push(item);
        }

        groups
    }

    /// Number of elements in the structure.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// Check if the structure is empty.
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}
