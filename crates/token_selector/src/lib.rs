use core_types::{AssetAllocation, Units};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Selection {
    pub asset_address: String,
    pub symbol: String,
    pub allocated_units: Units,
    pub index: usize,
    pub candidate_count: usize,
}

/// Non-deferred allocations that cover the per-asset processing reserve, sorted by address.
pub fn eligible(allocations: &[AssetAllocation], min_allocation_units: Units) -> Vec<&AssetAllocation> {
    let mut out = allocations
        .iter()
        .filter(|a| !a.deferred && a.allocated_units >= min_allocation_units)
        .collect::<Vec<_>>();
    out.sort_by(|a, b| a.asset_address.cmp(&b.asset_address));
    out
}

/// Pick one asset for this cycle. The slot acts as the randomness source, so
/// over many cycles each of K candidates is picked about 1/K of the time.
pub fn select_for_cycle(
    allocations: &[AssetAllocation],
    current_slot: u64,
    min_allocation_units: Units,
) -> Option<Selection> {
    let candidates = eligible(allocations, min_allocation_units);
    if candidates.is_empty() {
        return None;
    }
    let index = (current_slot % candidates.len() as u64) as usize;
    let picked = candidates[index];
    tracing::debug!(
        asset = %picked.symbol,
        index,
        candidates = candidates.len(),
        slot = current_slot,
        "asset selected for cycle"
    );
    Some(Selection {
        asset_address: picked.asset_address.clone(),
        symbol: picked.symbol.clone(),
        allocated_units: picked.allocated_units,
        index,
        candidate_count: candidates.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn alloc(address: &str, allocated: Units, deferred: bool) -> AssetAllocation {
        AssetAllocation {
            asset_address: address.to_string(),
            symbol: address.to_string(),
            is_root: false,
            pending_units: allocated,
            preliminary_units: allocated,
            allocated_units: allocated,
            deferred,
        }
    }

    #[test]
    fn filters_and_orders_by_address() {
        let input = vec![
            alloc("C", 100, false),
            alloc("A", 100, false),
            alloc("B", 5, false),
            alloc("D", 100, true),
        ];
        let got = eligible(&input, 10)
            .into_iter()
            .map(|a| a.asset_address.as_str())
            .collect::<Vec<_>>();
        assert_eq!(got, vec!["A", "C"]);
    }

    #[test]
    fn slot_modulo_picks_index() {
        let input = vec![alloc("C", 100, false), alloc("A", 100, false)];
        let pick = select_for_cycle(&input, 7, 1).expect("selection");
        assert_eq!(pick.index, 1);
        assert_eq!(pick.asset_address, "C");
        assert_eq!(pick.candidate_count, 2);
        assert!(select_for_cycle(&input, 7, 1_000).is_none());
    }

    #[test]
    fn selection_is_fair_over_consecutive_slots() {
        let input = vec![
            alloc("A", 100, false),
            alloc("B", 100, false),
            alloc("C", 100, false),
            alloc("D", 100, false),
        ];
        let mut counts: HashMap<String, usize> = HashMap::new();
        let rounds = 10_000u64;
        for slot in 250_000_000..250_000_000 + rounds {
            let pick = select_for_cycle(&input, slot, 1).expect("selection");
            *counts.entry(pick.asset_address).or_default() += 1;
        }
        for count in counts.values() {
            let share = *count as f64 / rounds as f64;
            assert!((share - 0.25).abs() < 0.01, "share {share}");
        }
        assert_eq!(counts.len(), 4);
    }
}
