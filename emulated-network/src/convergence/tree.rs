use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Union-find over arbitrary keys
struct Components<K> {
    index: HashMap<K, usize>,
    parent: Vec<usize>,
}

impl<K: Eq + Hash + Clone> Components<K> {
    fn new(keys: impl IntoIterator<Item = K>) -> Self {
        let index: HashMap<K, usize> = keys
            .into_iter()
            .enumerate()
            .map(|(i, k)| (k, i))
            .collect();
        let parent = (0..index.len()).collect();
        Self { index, parent }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    /// Returns false if both keys were already connected (or unknown)
    fn union(&mut self, a: &K, b: &K) -> bool {
        let (Some(&a), Some(&b)) = (self.index.get(a), self.index.get(b)) else {
            return false;
        };
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return false;
        }
        self.parent[a] = b;
        true
    }
}

/// Labels every vertex with the index of the connected component it belongs to
pub fn components<K: Eq + Hash + Clone>(vertices: &[K], edges: &[(K, K)]) -> HashMap<K, usize> {
    let mut components = Components::new(vertices.iter().cloned());
    for (a, b) in edges {
        components.union(a, b);
    }

    let mut labels = HashMap::with_capacity(vertices.len());
    let mut representatives = HashMap::new();
    for vertex in vertices {
        let Some(&i) = components.index.get(vertex) else {
            continue;
        };
        let representative = components.find(i);
        let next = representatives.len();
        let label = *representatives.entry(representative).or_insert(next);
        labels.insert(vertex.clone(), label);
    }
    labels
}

/// Whether `chosen`, a subset of `edges`, connects every component of the graph without
/// forming any cycle
pub fn is_spanning_forest<K: Eq + Hash + Clone>(
    vertices: &[K],
    edges: &[(K, K)],
    chosen: &[(K, K)],
) -> bool {
    let labels = components(vertices, edges);
    let count = labels.values().collect::<HashSet<_>>().len();
    if chosen.len() + count != labels.len() {
        return false;
    }

    let mut forest = Components::new(vertices.iter().cloned());
    chosen.iter().all(|(a, b)| forest.union(a, b))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_spanning_tree_of_ring() {
        let vertices = ["s1", "s2", "s3", "s4"];
        let ring = [
            ("s1", "s2"),
            ("s2", "s3"),
            ("s3", "s4"),
            ("s4", "s1"),
            ("s1", "s3"),
        ];

        let chain = [("s1", "s2"), ("s2", "s3"), ("s3", "s4")];
        assert!(is_spanning_forest(&vertices, &ring, &chain));

        // Right number of edges, but a cycle leaves s4 out
        let cycle = [("s1", "s2"), ("s2", "s3"), ("s1", "s3")];
        assert!(!is_spanning_forest(&vertices, &ring, &cycle));

        let parallel = [("s1", "s2"), ("s1", "s2"), ("s3", "s4")];
        assert!(!is_spanning_forest(&vertices, &ring, &parallel));

        assert!(!is_spanning_forest(&vertices, &ring, &chain[..2]));
        assert!(is_spanning_forest(&["s1"], &[], &[]));
    }

    #[test]
    fn test_spanning_forest_detection() {
        let vertices = ["s1", "s2", "s3", "s4", "s5"];
        // A triangle and a separate pair
        let edges = [
            ("s1", "s2"),
            ("s2", "s3"),
            ("s3", "s1"),
            ("s4", "s5"),
        ];

        let labels = components(&vertices, &edges);
        assert_eq!(labels["s1"], labels["s3"]);
        assert_ne!(labels["s1"], labels["s4"]);
        assert_eq!(labels["s4"], labels["s5"]);

        assert!(is_spanning_forest(
            &vertices,
            &edges,
            &[("s1", "s2"), ("s2", "s3"), ("s4", "s5")]
        ));
        assert!(!is_spanning_forest(&vertices, &edges, &edges));
        // The pair is left disconnected
        assert!(!is_spanning_forest(
            &vertices,
            &edges,
            &[("s1", "s2"), ("s2", "s3")]
        ));
    }
}
