//! Closed strongly connected components of the cell-dependency graph.
//!
//! A closed SCC is a maximal set of nodes that are mutually reachable and
//! from which no edge leaves the set. These are exactly the dependency
//! tangles a quiescent engine can never advance on its own and must resolve
//! through a [`crate::key::Key`] policy.

use std::{
	collections::{HashMap, HashSet},
	hash::Hash,
};

use tracing::trace;

/// Computes the strongly connected components of `nodes` under `succ`, then
/// returns only the *closed* ones: components with no edge leaving the
/// component. Each node appears in at most one returned component; open
/// (non-closed) components are omitted entirely.
///
/// Linear in the number of nodes and edges. Handles self-loops and
/// multi-edges; `succ` may return duplicate or repeated neighbors.
pub fn closed_sccs<N, I, S>(nodes: &[N], mut succ: S) -> Vec<Vec<N>>
where
	N: Clone + Eq + Hash,
	I: IntoIterator<Item = N>,
	S: FnMut(&N) -> I,
{
	let components = tarjan_sccs(nodes, &mut succ);

	let mut owner: HashMap<N, usize> = HashMap::new();
	for (idx, comp) in components.iter().enumerate() {
		for n in comp {
			owner.insert(n.clone(), idx);
		}
	}

	let closed: Vec<Vec<N>> = components
		.into_iter()
		.filter(|comp| {
			let comp_idx = owner[&comp[0]];
			comp.iter().all(|n| {
				succ(n)
					.into_iter()
					.all(|m| owner.get(&m).copied() == Some(comp_idx))
			})
		})
		.collect();
	trace!(nodes = nodes.len(), closed = closed.len(), "scc discovery");
	closed
}

/// Iterative (non-recursive) Tarjan's algorithm, to avoid blowing the stack
/// on deep dependency chains.
fn tarjan_sccs<N, I, S>(nodes: &[N], succ: &mut S) -> Vec<Vec<N>>
where
	N: Clone + Eq + Hash,
	I: IntoIterator<Item = N>,
	S: FnMut(&N) -> I,
{
	struct Frame<N> {
		node: N,
		neighbors: std::vec::IntoIter<N>,
	}

	let mut index: HashMap<N, usize> = HashMap::new();
	let mut lowlink: HashMap<N, usize> = HashMap::new();
	let mut on_stack: HashSet<N> = HashSet::new();
	let mut stack: Vec<N> = Vec::new();
	let mut next_index = 0usize;
	let mut result = Vec::new();

	for start in nodes {
		if index.contains_key(start) {
			continue;
		}

		let mut work: Vec<Frame<N>> = vec![Frame {
			node: start.clone(),
			neighbors: succ(start).into_iter().collect::<Vec<_>>().into_iter(),
		}];
		index.insert(start.clone(), next_index);
		lowlink.insert(start.clone(), next_index);
		next_index += 1;
		stack.push(start.clone());
		on_stack.insert(start.clone());

		while let Some(frame) = work.last_mut() {
			if let Some(w) = frame.neighbors.next() {
				if !index.contains_key(&w) {
					index.insert(w.clone(), next_index);
					lowlink.insert(w.clone(), next_index);
					next_index += 1;
					stack.push(w.clone());
					on_stack.insert(w.clone());
					let w_neighbors = succ(&w).into_iter().collect::<Vec<_>>().into_iter();
					work.push(Frame {
						node: w,
						neighbors: w_neighbors,
					});
				} else if on_stack.contains(&w) {
					let w_index = index[&w];
					let v_lowlink = lowlink[&frame.node];
					if w_index < v_lowlink {
						lowlink.insert(frame.node.clone(), w_index);
					}
				}
			} else {
				let v = frame.node.clone();
				work.pop();
				if let Some(parent) = work.last() {
					let v_lowlink = lowlink[&v];
					let p_lowlink = lowlink[&parent.node];
					if v_lowlink < p_lowlink {
						lowlink.insert(parent.node.clone(), v_lowlink);
					}
				}
				if lowlink[&v] == index[&v] {
					let mut component = Vec::new();
					loop {
						let w = stack.pop().expect("unreachable: component root on stack");
						on_stack.remove(&w);
						let is_root = w == v;
						component.push(w);
						if is_root {
							break;
						}
					}
					result.push(component);
				}
			}
		}
	}

	result
}

#[cfg(test)]
mod tests {
	use super::*;

	fn edges(graph: &[(i32, i32)], n: &i32) -> Vec<i32> {
		graph
			.iter()
			.filter(|(from, _)| from == n)
			.map(|(_, to)| *to)
			.collect()
	}

	#[test]
	fn singleton_self_loop_is_closed() {
		let nodes = vec![1];
		let graph = vec![(1, 1)];
		let sccs = closed_sccs(&nodes, |n| edges(&graph, n));
		assert_eq!(sccs, vec![vec![1]]);
	}

	#[test]
	fn singleton_without_edges_is_closed() {
		let nodes = vec![1];
		let sccs = closed_sccs::<i32, _, _>(&nodes, |_| Vec::new());
		assert_eq!(sccs, vec![vec![1]]);
	}

	#[test]
	fn three_cycle_is_closed() {
		let nodes = vec![1, 2, 3];
		let graph = vec![(1, 2), (2, 3), (3, 1)];
		let mut sccs = closed_sccs(&nodes, |n| edges(&graph, n));
		assert_eq!(sccs.len(), 1);
		sccs[0].sort_unstable();
		assert_eq!(sccs[0], vec![1, 2, 3]);
	}

	#[test]
	fn cycle_with_outgoing_edge_is_not_closed() {
		let nodes = vec![1, 2, 3, 4];
		// 1 <-> 2 form a cycle, but 1 also points to 3, which is outside.
		let graph = vec![(1, 2), (2, 1), (1, 3), (3, 4)];
		let sccs = closed_sccs(&nodes, |n| edges(&graph, n));
		// {1, 2} is open (1 -> 3 escapes). {3} and {4} are singletons without
		// self-loops, each open because they point outward or are a leaf with
		// no outgoing edge (which is in fact closed for 4).
		let mut closed: Vec<Vec<i32>> = sccs
			.into_iter()
			.map(|mut c| {
				c.sort_unstable();
				c
			})
			.collect();
		closed.sort();
		assert_eq!(closed, vec![vec![4]]);
	}

	#[test]
	fn two_disjoint_cycles_are_both_closed() {
		let nodes = vec![1, 2, 3, 4];
		let graph = vec![(1, 2), (2, 1), (3, 4), (4, 3)];
		let mut sccs = closed_sccs(&nodes, |n| edges(&graph, n));
		for c in &mut sccs {
			c.sort_unstable();
		}
		sccs.sort();
		assert_eq!(sccs, vec![vec![1, 2], vec![3, 4]]);
	}

	#[test]
	fn multi_edges_and_duplicates_do_not_confuse_closure() {
		let nodes = vec![1, 2];
		// Duplicate edges between 1 and 2 in both directions.
		let graph = vec![(1, 2), (1, 2), (2, 1), (2, 1)];
		let mut sccs = closed_sccs(&nodes, |n| edges(&graph, n));
		sccs[0].sort_unstable();
		assert_eq!(sccs, vec![vec![1, 2]]);
	}
}
