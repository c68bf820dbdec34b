use std::collections::BTreeMap;

use crate::cat::config::AllocationConfig;
use crate::cat::types::CategoryId;

/// Decide how many items each category contributes to a quiz of `total`
/// items. Weaker categories get more: the share of category `k` is
/// proportional to `1 / (ability_k + 1)`, truncated to an integer and capped
/// at the category's pool size. The sum never exceeds `total`.
///
/// The denominator is floored at `config.min_denominator`, so every ability
/// at or below `min_denominator - 1` shares the largest weight.
///
/// `pool_sizes` lists the candidate categories; abilities missing from
/// `abilities` count as 0.0.
pub fn allocate_categories(
    pool_sizes: &BTreeMap<CategoryId, usize>,
    abilities: &BTreeMap<CategoryId, f64>,
    total: usize,
    config: &AllocationConfig,
) -> BTreeMap<CategoryId, usize> {
    if pool_sizes.len() == 1 {
        return pool_sizes
            .iter()
            .map(|(category, available)| (*category, total.min(*available)))
            .collect();
    }

    let weights: BTreeMap<CategoryId, f64> = pool_sizes
        .keys()
        .map(|category| {
            let ability = abilities.get(category).copied().unwrap_or(0.0);
            (*category, category_weight(ability, config.min_denominator))
        })
        .collect();
    let total_weight: f64 = weights.values().sum();

    weights
        .into_iter()
        .map(|(category, weight)| {
            let share = if total_weight > 0.0 {
                weight / total_weight
            } else {
                0.0
            };
            let count = (total as f64 * share).floor() as usize;
            let available = pool_sizes.get(&category).copied().unwrap_or(0);
            (category, count.min(available))
        })
        .collect()
}

fn category_weight(ability: f64, min_denominator: f64) -> f64 {
    if !ability.is_finite() {
        return 1.0;
    }
    1.0 / (ability + 1.0).max(min_denominator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pools(entries: &[(CategoryId, usize)]) -> BTreeMap<CategoryId, usize> {
        entries.iter().copied().collect()
    }

    fn abilities(entries: &[(CategoryId, f64)]) -> BTreeMap<CategoryId, f64> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_weaker_category_gets_more() {
        let allocation = allocate_categories(
            &pools(&[(1, 50), (2, 50)]),
            &abilities(&[(1, 0.0), (2, 2.0)]),
            10,
            &AllocationConfig::default(),
        );
        assert!(allocation[&1] > allocation[&2]);
        assert!(allocation.values().sum::<usize>() <= 10);
    }

    #[test]
    fn test_inverse_ability_split() {
        // weights 1 and 1/3: shares 7.5 and 2.5 truncate to 7 and 2
        let allocation = allocate_categories(
            &pools(&[(1, 50), (2, 50)]),
            &abilities(&[(1, 0.0), (2, 2.0)]),
            10,
            &AllocationConfig::default(),
        );
        assert_eq!(allocation, BTreeMap::from([(1, 7), (2, 2)]));
    }

    #[test]
    fn test_low_abilities_share_floored_weight() {
        let config = AllocationConfig { min_denominator: 0.5 };
        let allocation = allocate_categories(
            &pools(&[(1, 50), (2, 50), (3, 50)]),
            &abilities(&[(1, -1.0), (2, -2.5), (3, 1.0)]),
            12,
            &config,
        );
        // weights 2, 2, 0.5
        assert_eq!(allocation[&1], allocation[&2]);
        assert_eq!(allocation, BTreeMap::from([(1, 5), (2, 5), (3, 1)]));
    }

    #[test]
    fn test_capped_at_pool_size() {
        let allocation = allocate_categories(
            &pools(&[(1, 2), (2, 50)]),
            &abilities(&[(1, -3.0), (2, 3.0)]),
            20,
            &AllocationConfig::default(),
        );
        assert_eq!(allocation[&1], 2);
    }

    #[test]
    fn test_single_category_takes_total() {
        let allocation =
            allocate_categories(&pools(&[(4, 30)]), &BTreeMap::new(), 12, &AllocationConfig::default());
        assert_eq!(allocation[&4], 12);
    }

    #[test]
    fn test_negative_abilities_stay_ordered() {
        let allocation = allocate_categories(
            &pools(&[(1, 100), (2, 100)]),
            &abilities(&[(1, -0.8), (2, -0.5)]),
            40,
            &AllocationConfig::default(),
        );
        assert!(allocation[&1] > allocation[&2]);
    }

    proptest! {
        #[test]
        fn prop_allocation_bounded(
            sizes in prop::collection::vec(0usize..30, 1..6),
            thetas in prop::collection::vec(-3.0f64..3.0, 6),
            total in 0usize..60,
        ) {
            let pool_sizes: BTreeMap<CategoryId, usize> =
                sizes.iter().enumerate().map(|(i, s)| (i as CategoryId, *s)).collect();
            let ability_map: BTreeMap<CategoryId, f64> =
                thetas.iter().enumerate().map(|(i, t)| (i as CategoryId, *t)).collect();
            let allocation =
                allocate_categories(&pool_sizes, &ability_map, total, &AllocationConfig::default());
            prop_assert!(allocation.values().sum::<usize>() <= total);
            for (category, count) in &allocation {
                prop_assert!(*count <= pool_sizes[category]);
            }
        }
    }
}
