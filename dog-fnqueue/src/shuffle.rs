//! Weighted random ordering, used to spread shared-nothing workers across
//! partitions and accounts instead of having them all race for the head.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::constants::PRIORITY_MIN;

/// Weight of a priority: lower priority numbers get heavier weights.
pub fn priority_weight(priority: u8) -> f64 {
    f64::from(10 - priority.min(PRIORITY_MIN))
}

/// Orders `items` by weighted sampling without replacement
/// (Efraimidis-Spirakis): each item draws `u^(1/w)` and the largest keys win.
/// Items with a non-positive weight go last.
pub fn weighted_shuffle<T, F>(items: Vec<T>, weight: F) -> Vec<T>
where
    F: Fn(&T) -> f64,
{
    let mut rng = SmallRng::from_entropy();
    weighted_shuffle_with(items, weight, &mut rng)
}

pub fn weighted_shuffle_with<T, F, R>(items: Vec<T>, weight: F, rng: &mut R) -> Vec<T>
where
    F: Fn(&T) -> f64,
    R: Rng + ?Sized,
{
    let mut keyed: Vec<(f64, T)> = items
        .into_iter()
        .map(|item| {
            let w = weight(&item);
            let key = if w > 0.0 {
                let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                u.powf(1.0 / w)
            } else {
                -1.0
            };
            (key, item)
        })
        .collect();

    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    keyed.into_iter().map(|(_, item)| item).collect()
}

/// Uniform random order.
pub fn shuffle<T>(items: Vec<T>) -> Vec<T> {
    weighted_shuffle(items, |_| 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_priority_weights() {
        assert_eq!(priority_weight(0), 10.0);
        assert_eq!(priority_weight(5), 5.0);
        assert_eq!(priority_weight(9), 1.0);
        assert_eq!(priority_weight(200), 1.0);
    }

    #[test]
    fn test_heavier_items_lead_more_often() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut heavy_first = 0;
        for _ in 0..2_000 {
            let order = weighted_shuffle_with(vec![("light", 1.0), ("heavy", 10.0)], |i| i.1, &mut rng);
            if order[0].0 == "heavy" {
                heavy_first += 1;
            }
        }
        // P(heavy first) = 10 / 11
        assert!(heavy_first > 1_600, "heavy first {} times", heavy_first);
    }

    #[test]
    fn test_zero_weight_goes_last() {
        let order = weighted_shuffle(vec![0, 1, 2], |i| if *i == 0 { 0.0 } else { 1.0 });
        assert_eq!(order[2], 0);
    }

    proptest! {
        #[test]
        fn prop_shuffle_is_a_permutation(mut items in proptest::collection::vec(0u32..1000, 0..64)) {
            let mut shuffled = weighted_shuffle(items.clone(), |i| f64::from(*i % 10 + 1));
            items.sort();
            shuffled.sort();
            prop_assert_eq!(items, shuffled);
        }
    }
}
