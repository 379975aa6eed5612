//! Lazy hypothesis enumeration.
//!
//! Two ordered producers drive hypothesis generation:
//! - [`Murty`] streams the k-best solutions of an assignment problem in
//!   non-decreasing cost order by partitioning on forced/forbidden edges.
//! - [`PermGen`] streams cross-product selections from sorted lists in
//!   non-decreasing summed cost order.
//!
//! Both are plain iterators over internal heaps: enumeration stops when the
//! consumer drops them.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use nalgebra::DMatrix;
use ordered_float::NotNan;

use crate::assignment::lap;
use crate::error::MhtError;
use crate::LARGE;

/// One partial problem in the Murty partition tree.
///
/// `fixed_*` are edges forced into every completion, `excluded_*` are edges
/// forbidden for this subtree. Ties on cost break by insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MurtyNode {
    cost: NotNan<f64>,
    seq: u64,
    assignment: Vec<usize>,
    fixed_rows: Vec<usize>,
    fixed_cols: Vec<usize>,
    excluded_rows: Vec<usize>,
    excluded_cols: Vec<usize>,
}

impl Ord for MurtyNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.cost, self.seq).cmp(&(other.cost, other.seq))
    }
}

impl PartialOrd for MurtyNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Lazy k-best assignment enumerator.
///
/// Yields `(cost, assignment)` pairs in non-decreasing cost order; for an
/// M×N matrix without forbidden entries the stream is exhaustive over all
/// N!/(N−M)! row-to-column injections.
pub struct Murty {
    cost: DMatrix<f64>,
    rows: usize,
    heap: BinaryHeap<Reverse<MurtyNode>>,
    seq: u64,
}

impl Murty {
    /// Solve the root problem and seed the partition heap.
    pub fn new(cost: DMatrix<f64>) -> Result<Self, MhtError> {
        let rows = cost.nrows();
        let (root_cost, assignment) = lap(&cost)?;
        let mut murty = Murty { cost, rows, heap: BinaryHeap::new(), seq: 0 };
        murty.push(root_cost, assignment, vec![], vec![], vec![], vec![]);
        Ok(murty)
    }

    fn push(
        &mut self,
        cost: f64,
        assignment: Vec<usize>,
        fixed_rows: Vec<usize>,
        fixed_cols: Vec<usize>,
        excluded_rows: Vec<usize>,
        excluded_cols: Vec<usize>,
    ) {
        if let Ok(cost) = NotNan::new(cost) {
            let node = MurtyNode {
                cost,
                seq: self.seq,
                assignment,
                fixed_rows,
                fixed_cols,
                excluded_rows,
                excluded_cols,
            };
            self.seq += 1;
            self.heap.push(Reverse(node));
        }
    }

    /// Partition a popped node into children, one per free row whose solved
    /// edge gets forbidden while all previously considered edges are forced.
    fn partition(&mut self, node: &MurtyNode) {
        let m = self.rows;
        let n = self.cost.ncols();
        let ni = node.fixed_rows.len();

        let row_map: Vec<usize> = (0..m).filter(|r| !node.fixed_rows.contains(r)).collect();
        let mut col_map: Vec<usize> = node
            .assignment
            .iter()
            .copied()
            .filter(|c| !node.fixed_cols.contains(c))
            .collect();
        col_map.extend(
            (0..n).filter(|c| !node.fixed_cols.contains(c) && !node.assignment.contains(c)),
        );

        // Mask this subtree's forbidden edges in place; restored below.
        let saved: Vec<f64> = node
            .excluded_rows
            .iter()
            .zip(&node.excluded_cols)
            .map(|(&r, &c)| std::mem::replace(&mut self.cost[(r, c)], LARGE))
            .collect();

        let mut sub = DMatrix::from_fn(m - ni, n - ni, |i, j| self.cost[(row_map[i], col_map[j])]);
        for t in 0..(m - ni) {
            let diag = std::mem::replace(&mut sub[(t, t)], LARGE);

            if let Ok((mut child_cost, sub_assignment)) = lap(&sub.view((t, t), (m - ni - t, n - ni - t))) {
                let feasible = sub_assignment
                    .iter()
                    .enumerate()
                    .all(|(r, &j)| sub[(t + r, t + j)] < LARGE);
                if feasible {
                    child_cost += node
                        .fixed_rows
                        .iter()
                        .zip(&node.fixed_cols)
                        .map(|(&r, &c)| self.cost[(r, c)])
                        .sum::<f64>();
                    child_cost += (0..t).map(|r| sub[(r, r)]).sum::<f64>();

                    let mut assignment = vec![0usize; m];
                    for (&r, &c) in node.fixed_rows.iter().zip(&node.fixed_cols) {
                        assignment[r] = c;
                    }
                    for r in 0..t {
                        assignment[row_map[r]] = col_map[r];
                    }
                    for (r, &j) in sub_assignment.iter().enumerate() {
                        assignment[row_map[r + t]] = col_map[j + t];
                    }

                    let mut fixed_rows = node.fixed_rows.clone();
                    fixed_rows.extend_from_slice(&row_map[..t]);
                    let mut fixed_cols = node.fixed_cols.clone();
                    fixed_cols.extend_from_slice(&col_map[..t]);
                    let mut excluded_rows = node.excluded_rows.clone();
                    excluded_rows.push(row_map[t]);
                    let mut excluded_cols = node.excluded_cols.clone();
                    excluded_cols.push(col_map[t]);

                    self.push(child_cost, assignment, fixed_rows, fixed_cols, excluded_rows, excluded_cols);
                }
            }

            sub[(t, t)] = diag;
        }

        for ((&r, &c), old) in node.excluded_rows.iter().zip(&node.excluded_cols).zip(saved) {
            self.cost[(r, c)] = old;
        }
    }
}

impl Iterator for Murty {
    type Item = (f64, Vec<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(node) = self.heap.pop()?;
        self.partition(&node);
        Some((node.cost.into_inner(), node.assignment[..self.rows].to_vec()))
    }
}

/// Heap entry for [`PermGen`]: an index tuple into the sorted lists.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PermNode {
    cost: NotNan<f64>,
    seq: u64,
    state: Vec<usize>,
}

impl Ord for PermNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.cost, self.seq).cmp(&(other.cost, other.seq))
    }
}

impl PartialOrd for PermNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered cross-product enumerator over sorted `(cost, datum)` lists.
///
/// Emits every selection of one datum per list, in non-decreasing summed
/// cost, each exactly once. Duplicate heap states arise because distinct
/// predecessors reach the same index tuple; they are filtered by remembering
/// the states already emitted at the current cost level.
pub struct PermGen<T: Clone> {
    lists: Vec<Vec<(f64, T)>>,
    bounds: Vec<usize>,
    heap: BinaryHeap<Reverse<PermNode>>,
    seq: u64,
    prev_cost: Option<NotNan<f64>>,
    prev_states: Vec<Vec<usize>>,
}

impl<T: Clone> PermGen<T> {
    /// Build an enumerator, sorting each list by cost first.
    pub fn new(mut lists: Vec<Vec<(f64, T)>>) -> Self {
        for list in &mut lists {
            list.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        }
        Self::presorted(lists)
    }

    /// Build an enumerator over lists already sorted by cost.
    pub fn presorted(lists: Vec<Vec<(f64, T)>>) -> Self {
        let bounds: Vec<usize> = lists.iter().map(|l| l.len().saturating_sub(1)).collect();
        let mut gen = PermGen {
            bounds,
            heap: BinaryHeap::new(),
            seq: 0,
            prev_cost: None,
            prev_states: Vec::new(),
            lists,
        };
        if gen.lists.iter().all(|l| !l.is_empty()) {
            let state = vec![0usize; gen.lists.len()];
            gen.push_state(state);
        }
        gen
    }

    fn state_cost(&self, state: &[usize]) -> f64 {
        state.iter().enumerate().map(|(i, &s)| self.lists[i][s].0).sum()
    }

    fn push_state(&mut self, state: Vec<usize>) {
        if let Ok(cost) = NotNan::new(self.state_cost(&state)) {
            let node = PermNode { cost, seq: self.seq, state };
            self.seq += 1;
            self.heap.push(Reverse(node));
        }
    }
}

impl<T: Clone> Iterator for PermGen<T> {
    type Item = (f64, Vec<T>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Reverse(node) = self.heap.pop()?;
            if self.prev_cost == Some(node.cost) {
                if self.prev_states.contains(&node.state) {
                    continue;
                }
            } else {
                self.prev_states.clear();
            }
            self.prev_cost = Some(node.cost);
            self.prev_states.push(node.state.clone());

            for i in 0..node.state.len() {
                if node.state[i] < self.bounds[i] {
                    let mut succ = node.state.clone();
                    succ[i] += 1;
                    self.push_state(succ);
                }
            }

            let selection = node
                .state
                .iter()
                .enumerate()
                .map(|(i, &s)| self.lists[i][s].1.clone())
                .collect();
            return Some((node.cost.into_inner(), selection));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Zero-rich square cost matrix with a wide spread of optima.
    fn murty_cost() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            10,
            10,
            &[
                7.0, 51.0, 52.0, 87.0, 38.0, 60.0, 74.0, 66.0, 0.0, 20.0, //
                50.0, 12.0, 0.0, 64.0, 8.0, 53.0, 0.0, 46.0, 76.0, 42.0, //
                27.0, 77.0, 0.0, 18.0, 22.0, 48.0, 44.0, 13.0, 0.0, 57.0, //
                62.0, 0.0, 3.0, 8.0, 5.0, 6.0, 14.0, 0.0, 26.0, 39.0, //
                0.0, 97.0, 0.0, 5.0, 13.0, 0.0, 41.0, 31.0, 62.0, 48.0, //
                79.0, 68.0, 0.0, 0.0, 15.0, 12.0, 17.0, 47.0, 35.0, 43.0, //
                76.0, 99.0, 48.0, 27.0, 34.0, 0.0, 0.0, 0.0, 28.0, 0.0, //
                0.0, 20.0, 9.0, 27.0, 46.0, 15.0, 84.0, 19.0, 3.0, 24.0, //
                56.0, 10.0, 45.0, 39.0, 0.0, 93.0, 67.0, 79.0, 19.0, 38.0, //
                27.0, 0.0, 39.0, 53.0, 46.0, 24.0, 69.0, 46.0, 23.0, 1.0,
            ],
        )
    }

    fn check_stream(c: &DMatrix<f64>, expected_count: usize) {
        let m = c.nrows();
        let mut previous = f64::NEG_INFINITY;
        let mut count = 0usize;
        for (cost, assignment) in Murty::new(c.clone()).unwrap() {
            assert_eq!(assignment.len(), m);
            // Consistency: cost equals the sum of covered entries
            let direct: f64 = assignment.iter().enumerate().map(|(i, &j)| c[(i, j)]).sum();
            assert_relative_eq!(cost, direct, epsilon = 1e-9);
            // Distinct columns
            let mut cols = assignment.clone();
            cols.sort_unstable();
            cols.dedup();
            assert_eq!(cols.len(), m);
            // Monotonicity
            assert!(cost >= previous - 1e-9, "cost {} after {}", cost, previous);
            previous = cost;
            count += 1;
        }
        assert_eq!(count, expected_count);
    }

    #[test]
    fn test_murty_two_rows() {
        // 2 rows over 10 columns: 10 * 9 ordered injections
        check_stream(&murty_cost().rows(0, 2).clone_owned(), 90);
    }

    #[test]
    fn test_murty_three_rows() {
        check_stream(&murty_cost().rows(0, 3).clone_owned(), 720);
    }

    #[test]
    fn test_murty_asymmetric() {
        // 10!/5! = 30240
        check_stream(&murty_cost().rows(0, 5).clone_owned(), 30240);
    }

    #[test]
    #[ignore = "full 10x10 enumeration (3628800 assignments) takes minutes"]
    fn test_murty_exhaustive_square() {
        check_stream(&murty_cost(), 3628800);
    }

    #[test]
    fn test_murty_respects_forbidden_entries() {
        // One column fully forbidden: only injections avoiding it survive
        let mut c = DMatrix::from_element(2, 3, 1.0);
        c[(0, 2)] = LARGE;
        c[(1, 2)] = LARGE;
        let results: Vec<_> = Murty::new(c).unwrap().collect();
        assert_eq!(results.len(), 2);
        for (_, assignment) in results {
            assert!(assignment.iter().all(|&j| j != 2));
        }
    }

    #[test]
    fn test_murty_is_cancellable() {
        let mut stream = Murty::new(murty_cost()).unwrap();
        let first = stream.next().unwrap();
        let second = stream.next().unwrap();
        assert!(second.0 >= first.0);
        drop(stream);
    }

    #[test]
    fn test_permgen_counts_and_order() {
        let lists = vec![
            vec![(1.0, 'a'), (1.0, 'b'), (2.0, 'c')],
            vec![(1.0, 'd'), (2.0, 'e'), (3.0, 'f')],
            vec![(3.0, 'g')],
        ];
        let mut previous = f64::NEG_INFINITY;
        let mut seen = Vec::new();
        for (cost, selection) in PermGen::new(lists) {
            assert!(cost >= previous);
            previous = cost;
            assert!(!seen.contains(&selection));
            seen.push(selection);
        }
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_permgen_empty_input_yields_one_empty_selection() {
        let lists: Vec<Vec<(f64, char)>> = vec![];
        let all: Vec<_> = PermGen::new(lists).collect();
        assert_eq!(all.len(), 1);
        assert_relative_eq!(all[0].0, 0.0);
        assert!(all[0].1.is_empty());
    }

    #[test]
    fn test_permgen_empty_list_yields_nothing() {
        let lists: Vec<Vec<(f64, char)>> = vec![vec![(1.0, 'a')], vec![]];
        assert_eq!(PermGen::new(lists).count(), 0);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        #[test]
        fn prop_murty_ordered_and_exhaustive(values in proptest::collection::vec(0.0f64..50.0, 24)) {
            let c = DMatrix::from_row_slice(4, 6, &values);
            let mut previous = f64::NEG_INFINITY;
            let mut count = 0usize;
            for (cost, assignment) in Murty::new(c.clone()).unwrap() {
                let direct: f64 = assignment.iter().enumerate().map(|(i, &j)| c[(i, j)]).sum();
                proptest::prop_assert!((cost - direct).abs() < 1e-6);
                proptest::prop_assert!(cost >= previous - 1e-9);
                previous = cost;
                count += 1;
            }
            // 6!/2! = 360
            proptest::prop_assert_eq!(count, 360);
        }

        #[test]
        fn prop_permgen_complete(costs in proptest::collection::vec(0.0f64..9.0, 6)) {
            let lists: Vec<Vec<(f64, usize)>> = costs
                .chunks(2)
                .map(|pair| pair.iter().enumerate().map(|(i, &c)| (c, i)).collect())
                .collect();
            let total: usize = lists.iter().map(|l| l.len()).product();
            let mut previous = f64::NEG_INFINITY;
            let mut count = 0usize;
            for (cost, _) in PermGen::new(lists) {
                proptest::prop_assert!(cost >= previous - 1e-9);
                previous = cost;
                count += 1;
            }
            proptest::prop_assert_eq!(count, total);
        }
    }
}
