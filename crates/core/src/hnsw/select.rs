//! Neighbor selection policies (Algorithm 4 from the HNSW paper and variants).
//!
//! Candidates are `(distance_to_base, id)` pairs. Every policy sorts them by
//! distance, ties by id, so selection is deterministic for a given input set.

use crate::hnsw::graph::NeighborPolicy;

/// Sort candidates closest-first with id as tie-breaker.
pub(crate) fn sort_candidates(candidates: &mut [(f32, u32)]) {
    candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
}

/// Choose at most `cap` neighbors out of `candidates` according to `policy`.
///
/// `pair_distance(a, b)` returns the distance between two candidate nodes and is
/// only consulted by the heuristic policies. The returned list is closest-first.
pub(crate) fn select_neighbors<D>(
    policy: NeighborPolicy,
    mut candidates: Vec<(f32, u32)>,
    cap: usize,
    pair_distance: D,
) -> Vec<(f32, u32)>
where
    D: Fn(u32, u32) -> f32,
{
    sort_candidates(&mut candidates);
    if candidates.len() <= cap {
        return candidates;
    }
    match policy {
        NeighborPolicy::Naive => {
            candidates.truncate(cap);
            candidates
        }
        NeighborPolicy::Heuristic => select_heuristic(&candidates, cap, pair_distance, false),
        NeighborPolicy::HeuristicSaveRemains => {
            select_heuristic(&candidates, cap, pair_distance, true)
        }
    }
}

/// Prefers diverse neighbors: a candidate is selected only if it is no farther
/// from the base node than from any already-selected neighbor. With
/// `save_remains`, free slots are refilled with the closest skipped candidates.
fn select_heuristic<D>(
    sorted: &[(f32, u32)],
    cap: usize,
    pair_distance: D,
    save_remains: bool,
) -> Vec<(f32, u32)>
where
    D: Fn(u32, u32) -> f32,
{
    let mut selected: Vec<(f32, u32)> = Vec::with_capacity(cap);
    let mut skipped: Vec<(f32, u32)> = Vec::new();

    for &(dist_to_base, cid) in sorted {
        if selected.len() >= cap {
            break;
        }
        let is_diverse = selected
            .iter()
            .all(|&(_, sid)| pair_distance(cid, sid) >= dist_to_base);
        if is_diverse {
            selected.push((dist_to_base, cid));
        } else if save_remains {
            skipped.push((dist_to_base, cid));
        }
    }

    if save_remains && selected.len() < cap {
        // skipped is already closest-first
        let free = cap - selected.len();
        selected.extend(skipped.into_iter().take(free));
        sort_candidates(&mut selected);
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Points on a line; pair distance is |a - b|.
    fn line(points: &[f32]) -> impl Fn(u32, u32) -> f32 + '_ {
        move |a, b| (points[a as usize] - points[b as usize]).abs()
    }

    #[test]
    fn test_under_cap_returns_all_sorted() {
        let pts = [0.0, 1.0, 2.0];
        for policy in [
            NeighborPolicy::Naive,
            NeighborPolicy::Heuristic,
            NeighborPolicy::HeuristicSaveRemains,
        ] {
            let out = select_neighbors(policy, vec![(2.0, 2), (1.0, 1)], 4, line(&pts));
            assert_eq!(out, vec![(1.0, 1), (2.0, 2)]);
        }
    }

    #[test]
    fn test_naive_keeps_closest_with_id_tiebreak() {
        let pts = [0.0; 4];
        let out = select_neighbors(
            NeighborPolicy::Naive,
            vec![(1.0, 3), (1.0, 1), (0.5, 2), (4.0, 0)],
            2,
            line(&pts),
        );
        assert_eq!(out, vec![(0.5, 2), (1.0, 1)]);
    }

    #[test]
    fn test_heuristic_skips_clustered_candidates() {
        // base at 0; ids 1 and 2 sit together on the right, id 3 on the left
        let pts = [0.0, 1.0, 1.1, -2.0];
        let cands = vec![(1.0, 1), (1.1, 2), (2.0, 3)];
        let out = select_neighbors(NeighborPolicy::Heuristic, cands.clone(), 2, line(&pts));
        // id 2 is closer to id 1 (0.1) than to the base (1.1)
        assert_eq!(out, vec![(1.0, 1), (2.0, 3)]);

        let naive = select_neighbors(NeighborPolicy::Naive, cands, 2, line(&pts));
        assert_eq!(naive, vec![(1.0, 1), (1.1, 2)]);
    }

    #[test]
    fn test_save_remains_refills_from_skipped() {
        let pts = [0.0, 1.0, 1.1, 1.2, 1.3];
        let cands = vec![(1.0, 1), (1.1, 2), (1.2, 3), (1.3, 4)];
        let plain = select_neighbors(NeighborPolicy::Heuristic, cands.clone(), 3, line(&pts));
        assert_eq!(plain, vec![(1.0, 1)]);
        let saved = select_neighbors(NeighborPolicy::HeuristicSaveRemains, cands, 3, line(&pts));
        assert_eq!(saved, vec![(1.0, 1), (1.1, 2), (1.2, 3)]);
    }
}
