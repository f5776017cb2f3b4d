use core_types::{AssetAllocation, Units};
use serde::{Deserialize, Serialize};

pub const BPS_DENOMINATOR: Units = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Rent-exempt minimum every touched account must keep.
    pub rent_exempt_units: u64,
    pub safety_buffer_units: u64,
    /// Rent for creating the associated token account on a first buy.
    pub associated_account_rent_units: u64,
    /// Smallest buy the pool accepts.
    pub minimum_trade_units: u64,
    /// Network fees and compute budget set aside per processed asset.
    pub per_asset_reserve_units: u64,
    /// Share of a secondary allocation forwarded to the root asset, in bps.
    pub root_share_bps: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            rent_exempt_units: 890_880,
            safety_buffer_units: 50_000,
            associated_account_rent_units: 2_039_280,
            minimum_trade_units: 10_000_000,
            per_asset_reserve_units: 7_000_000,
            root_share_bps: 4_480,
        }
    }
}

impl AllocatorConfig {
    /// An allocation below this cannot pay for its own buy.
    pub fn minimum_viable_units(&self) -> Units {
        Units::from(self.rent_exempt_units)
            + Units::from(self.safety_buffer_units)
            + Units::from(self.associated_account_rent_units)
            + Units::from(self.minimum_trade_units)
    }

    pub fn per_asset_reserve(&self) -> Units {
        Units::from(self.per_asset_reserve_units)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AllocationPlan {
    pub allocations: Vec<AssetAllocation>,
    pub total_pending_units: Units,
    pub actual_collected_units: Units,
    pub deferred_units: Units,
    pub viable_count: usize,
    pub deferred_count: usize,
}

impl AllocationPlan {
    pub fn allocated_total(&self) -> Units {
        self.allocations.iter().map(|a| a.allocated_units).sum()
    }

    pub fn viable(&self) -> impl Iterator<Item = &AssetAllocation> {
        self.allocations.iter().filter(|a| !a.deferred)
    }

    pub fn get(&self, asset_address: &str) -> Option<&AssetAllocation> {
        self.allocations
            .iter()
            .find(|a| a.asset_address == asset_address)
    }
}

/// floor(a × b / d) without overflowing the intermediate product.
pub fn mul_div(a: Units, b: Units, d: Units) -> Units {
    if d == 0 {
        return 0;
    }
    match a.checked_mul(b) {
        Some(product) => product / d,
        None => (a / d).saturating_mul(b).saturating_add((a % d).saturating_mul(b) / d),
    }
}

/// Scale pending counters to what was actually collected, defer shares that
/// cannot pay for a trade and hand their value to the viable ones. The sum of
/// allocated units equals `actual_collected` whenever any share is viable.
pub fn normalize(
    allocations: &[AssetAllocation],
    actual_collected: Units,
    cfg: &AllocatorConfig,
) -> AllocationPlan {
    let total_pending: Units = allocations.iter().map(|a| a.pending_units).sum();
    let minimum = cfg.minimum_viable_units();

    let mut out = allocations
        .iter()
        .cloned()
        .map(|mut a| {
            a.preliminary_units = mul_div(a.pending_units, actual_collected, total_pending);
            a.allocated_units = 0;
            a.deferred = a.preliminary_units == 0 || a.preliminary_units < minimum;
            a
        })
        .collect::<Vec<_>>();

    let deferred_units: Units = out.iter().filter(|a| a.deferred).map(|a| a.preliminary_units).sum();
    let viable_units: Units = out.iter().filter(|a| !a.deferred).map(|a| a.preliminary_units).sum();
    let viable_count = out.iter().filter(|a| !a.deferred).count();

    if viable_count > 0 {
        for a in out.iter_mut().filter(|a| !a.deferred) {
            a.allocated_units =
                a.preliminary_units + mul_div(deferred_units, a.preliminary_units, viable_units);
        }
        let assigned: Units = out.iter().map(|a| a.allocated_units).sum();
        let remainder = actual_collected.saturating_sub(assigned);
        if remainder > 0 {
            let largest = out
                .iter_mut()
                .filter(|a| !a.deferred)
                .max_by(|x, y| {
                    x.allocated_units
                        .cmp(&y.allocated_units)
                        .then_with(|| y.asset_address.cmp(&x.asset_address))
                });
            if let Some(largest) = largest {
                largest.allocated_units += remainder;
            }
        }
    }

    AllocationPlan {
        deferred_count: out.len() - viable_count,
        allocations: out,
        total_pending_units: total_pending,
        actual_collected_units: actual_collected,
        deferred_units,
        viable_count,
    }
}

/// Size one asset's share of `available` while keeping enough back for the
/// assets still to run. The last remaining asset takes everything.
pub fn calculate_dynamic_allocation(
    available: Units,
    this_pending: Units,
    total_remaining_pending: Units,
    remaining_count: usize,
    cfg: &AllocatorConfig,
) -> Units {
    if remaining_count <= 1 {
        return available;
    }
    let others = (remaining_count - 1) as Units;
    let reserve = others.saturating_mul(
        cfg.minimum_viable_units()
            .saturating_add(cfg.per_asset_reserve()),
    );
    let spendable = available.saturating_sub(reserve);
    if total_remaining_pending == 0 {
        return spendable / remaining_count as Units;
    }
    mul_div(spendable, this_pending.min(total_remaining_pending), total_remaining_pending)
}

/// Split a secondary allocation into (kept for the buy, forwarded to root).
pub fn split_root_share(allocation: Units, bps: u32) -> (Units, Units) {
    let bps = (bps as Units).min(BPS_DENOMINATOR);
    let root_share = mul_div(allocation, bps, BPS_DENOMINATOR);
    (allocation - root_share, root_share)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOL: Units = 1_000_000_000;

    fn alloc(address: &str, pending: Units) -> AssetAllocation {
        AssetAllocation {
            asset_address: address.to_string(),
            symbol: address.to_string(),
            is_root: false,
            pending_units: pending,
            preliminary_units: 0,
            allocated_units: 0,
            deferred: false,
        }
    }

    #[test]
    fn minimum_viable_sums_components() {
        assert_eq!(AllocatorConfig::default().minimum_viable_units(), 12_980_160);
    }

    #[test]
    fn conserves_actual_collected_exactly() {
        let cfg = AllocatorConfig::default();
        let input = vec![alloc("A", 333_333_333), alloc("B", 333_333_333), alloc("C", 333_333_334)];
        let plan = normalize(&input, 2 * SOL + 7, &cfg);
        assert_eq!(plan.viable_count, 3);
        assert_eq!(plan.allocated_total(), 2 * SOL + 7);
        for a in plan.viable() {
            assert!(a.allocated_units >= cfg.minimum_viable_units());
        }
    }

    #[test]
    fn deferred_share_moves_to_viable_asset() {
        let cfg = AllocatorConfig::default();
        // B's scaled share lands under the minimum and is deferred.
        let input = vec![alloc("A", 900_000_000), alloc("B", 5_000_000)];
        let plan = normalize(&input, 905_000_000, &cfg);
        let a = plan.get("A").expect("A");
        let b = plan.get("B").expect("B");
        assert!(b.deferred);
        assert_eq!(b.allocated_units, 0);
        assert_eq!(b.preliminary_units, 5_000_000);
        assert!(!a.deferred);
        assert_eq!(a.allocated_units, 905_000_000);
        assert_eq!(plan.deferred_units, 5_000_000);
        assert_eq!(plan.deferred_count, 1);
    }

    #[test]
    fn remainder_goes_to_largest_then_lowest_address() {
        let cfg = AllocatorConfig {
            minimum_trade_units: 0,
            rent_exempt_units: 0,
            safety_buffer_units: 0,
            associated_account_rent_units: 0,
            ..AllocatorConfig::default()
        };
        let input = vec![alloc("Z", 1), alloc("M", 1), alloc("Q", 1)];
        let plan = normalize(&input, 100, &cfg);
        assert_eq!(plan.get("M").map(|a| a.allocated_units), Some(34));
        assert_eq!(plan.get("Q").map(|a| a.allocated_units), Some(33));
        assert_eq!(plan.get("Z").map(|a| a.allocated_units), Some(33));
    }

    #[test]
    fn nothing_viable_allocates_nothing() {
        let cfg = AllocatorConfig::default();
        let plan = normalize(&[alloc("A", 10), alloc("B", 10)], 1_000, &cfg);
        assert_eq!(plan.viable_count, 0);
        assert_eq!(plan.allocated_total(), 0);
        let empty = normalize(&[alloc("A", 0)], 5 * SOL, &cfg);
        assert!(empty.allocations[0].deferred);
    }

    #[test]
    fn dynamic_allocation_reserves_for_remaining_assets() {
        let cfg = AllocatorConfig::default();
        let per_other = cfg.minimum_viable_units() + cfg.per_asset_reserve();
        let available = SOL;
        let got = calculate_dynamic_allocation(available, 1, 2, 2, &cfg);
        assert_eq!(got, (available - per_other) / 2);
        assert_eq!(calculate_dynamic_allocation(available, 1, 2, 1, &cfg), available);
        assert_eq!(calculate_dynamic_allocation(per_other, 5, 10, 2, &cfg), 0);
    }

    #[test]
    fn root_share_split() {
        assert_eq!(split_root_share(1_000_000, 4_480), (552_000, 448_000));
        assert_eq!(split_root_share(10, 20_000), (0, 10));
        assert_eq!(split_root_share(999, 0), (999, 0));
    }

    #[test]
    fn mul_div_survives_large_products() {
        let big = Units::MAX / 2;
        assert_eq!(mul_div(big, 4, 4), big);
        assert_eq!(mul_div(7, 3, 0), 0);
    }
}
