// Copyright 2024 The Gantry Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! DAG ordering for the term evaluator.

use std::collections::HashSet;
use std::hash::Hash;

/// Orders the nodes reachable from `start` so that every node's neighbors
/// come before the node itself. Post-order DFS driven by an explicit frame
/// list, so deep graphs cannot overflow the call stack.
///
/// Panics if the graph has a cycle.
pub fn topo_order_forward<T, ID, II, NI>(
    start: II,
    id_fn: impl Fn(&T) -> ID,
    mut neighbors_fn: impl FnMut(&T) -> NI,
) -> Vec<T>
where
    ID: Hash + Eq + Clone,
    II: IntoIterator<Item = T>,
    NI: IntoIterator<Item = T>,
{
    // A node is pushed as Enter, and re-pushed as Exit underneath its
    // neighbors; by the time the Exit frame surfaces, everything it
    // depends on has been emitted.
    enum Frame<T> {
        Enter(T),
        Exit(T),
    }
    let mut frames: Vec<Frame<T>> = start.into_iter().map(Frame::Enter).collect();
    // `open` holds the current DFS path; re-entering an open node means a
    // neighbor chain led back to an ancestor.
    let mut open: HashSet<ID> = HashSet::new();
    let mut done: HashSet<ID> = HashSet::new();
    let mut order = vec![];
    while let Some(frame) = frames.pop() {
        match frame {
            Frame::Enter(node) => {
                let id = id_fn(&node);
                if done.contains(&id) {
                    continue;
                }
                assert!(open.insert(id), "dependency graph contains a cycle");
                let neighbors = neighbors_fn(&node);
                frames.push(Frame::Exit(node));
                frames.extend(neighbors.into_iter().map(Frame::Enter));
            }
            Frame::Exit(node) => {
                let id = id_fn(&node);
                open.remove(&id);
                done.insert(id);
                order.push(node);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbors(edges: &[(char, char)], node: &char) -> Vec<char> {
        edges
            .iter()
            .filter(|(from, _)| from == node)
            .map(|(_, to)| *to)
            .collect()
    }

    #[test]
    fn test_topo_order_forward_linear() {
        let edges = [('a', 'b'), ('b', 'c')];
        let order = topo_order_forward(['a'], |n| *n, |n| neighbors(&edges, n));
        assert_eq!(order, vec!['c', 'b', 'a']);
    }

    #[test]
    fn test_topo_order_forward_diamond() {
        // a depends on b and c, which both depend on d.
        let edges = [('a', 'b'), ('a', 'c'), ('b', 'd'), ('c', 'd')];
        let order = topo_order_forward(['a'], |n| *n, |n| neighbors(&edges, n));
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], 'd');
        assert_eq!(order[3], 'a');
    }

    #[test]
    fn test_topo_order_forward_duplicate_starts() {
        let order = topo_order_forward(['a', 'a'], |n| *n, |_| Vec::new());
        assert_eq!(order, vec!['a']);
    }

    #[test]
    #[should_panic(expected = "dependency graph contains a cycle")]
    fn test_topo_order_forward_cycle() {
        let edges = [('a', 'b'), ('b', 'a')];
        topo_order_forward(['a'], |n| *n, |n| neighbors(&edges, n));
    }
}
