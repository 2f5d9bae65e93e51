//! Gold tree distances from dependency heads

use std::collections::VecDeque;

use crate::corpus::Relation;

/// All-pairs path lengths in the undirected dependency tree.
///
/// Row/column `i` is the word with dependency id `i + 1`. Words in different
/// components (sentences with several roots) are assigned the sentence length,
/// which is larger than any in-tree distance.
pub fn tree_distances(relations: &[Relation]) -> Vec<Vec<f32>> {
    let n = relations.len();
    let mut adjacency = vec![Vec::new(); n];
    for &(dep, head) in relations {
        if head == 0 || dep == 0 || dep > n || head > n {
            continue;
        }
        adjacency[dep - 1].push(head - 1);
        adjacency[head - 1].push(dep - 1);
    }

    let unreachable = n as f32;
    let mut distances = vec![vec![unreachable; n]; n];
    let mut queue = VecDeque::with_capacity(n);
    for (source, row) in distances.iter_mut().enumerate() {
        row[source] = 0.0;
        queue.clear();
        queue.push_back(source);
        let mut seen = vec![false; n];
        seen[source] = true;
        while let Some(node) = queue.pop_front() {
            let next = row[node] + 1.0;
            for &neighbour in &adjacency[node] {
                if !seen[neighbour] {
                    seen[neighbour] = true;
                    row[neighbour] = next;
                    queue.push_back(neighbour);
                }
            }
        }
    }
    distances
}
