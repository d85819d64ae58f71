use std::collections::BTreeMap;

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SplitConfig {
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.25,
            seed: 42,
        }
    }
}

/// Disjoint train/test index sets over the original sample order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Test-set size of every class, in class order.
///
/// The test set holds `ceil(n * test_fraction)` samples overall. Each class gets the
/// floor of its proportional share and the leftover goes to the largest remainders,
/// earlier classes first on ties. Every class then keeps at least one sample on each
/// side.
fn allocate(counts: &[usize], test_fraction: f64) -> Vec<usize> {
    let total: usize = counts.iter().sum();
    let test_total = (total as f64 * test_fraction).ceil() as usize;

    let mut allocation: Vec<usize> = counts
        .iter()
        .map(|&count| count * test_total / total)
        .collect();
    let mut by_remainder: Vec<usize> = (0..counts.len()).collect();
    by_remainder.sort_by_key(|&class| std::cmp::Reverse(counts[class] * test_total % total));

    let assigned: usize = allocation.iter().sum();
    for &class in by_remainder.iter().take(test_total.saturating_sub(assigned)) {
        allocation[class] += 1;
    }

    allocation
        .iter()
        .zip(counts)
        .map(|(&test, &count)| test.clamp(1, count - 1))
        .collect()
}

/// Splits sample indices so that every class keeps its share in both subsets.
///
/// `classes[i]` is the class of sample `i`.
pub fn stratified_split(classes: &[usize], config: &SplitConfig) -> Result<Split> {
    if !(0.0..1.0).contains(&config.test_fraction) || config.test_fraction == 0.0 {
        return Err(Error::Config(format!(
            "test fraction must be in (0, 1), got {}",
            config.test_fraction
        )));
    }
    if classes.is_empty() {
        return Err(Error::Split("no samples to split".to_string()));
    }

    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, &class) in classes.iter().enumerate() {
        by_class.entry(class).or_default().push(index);
    }

    if let Some((class, members)) = by_class.iter().find(|(_, members)| members.len() < 2) {
        return Err(Error::Split(format!(
            "class {class} has {} sample(s), at least 2 are needed",
            members.len()
        )));
    }

    let counts: Vec<usize> = by_class.values().map(Vec::len).collect();
    let test_counts = allocate(&counts, config.test_fraction);

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut train = Vec::with_capacity(classes.len());
    let mut test = Vec::new();

    for (mut members, test_count) in by_class.into_values().zip(test_counts) {
        members.shuffle(&mut rng);
        test.extend_from_slice(&members[..test_count]);
        train.extend_from_slice(&members[test_count..]);
    }

    train.shuffle(&mut rng);
    test.shuffle(&mut rng);

    Ok(Split { train, test })
}
