//! Diff engine - what must change to turn observed membership into desired.

use crate::model::{Target, TargetSet};

/// Changes needed to move from an observed set to a desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDiff {
    /// Desired targets with no observed counterpart.
    pub add: Vec<Target>,
    /// Observed targets that are no longer desired.
    pub remove: Vec<Target>,
    /// Targets present on both sides whose weight differs, at the desired weight.
    pub update: Vec<Target>,
}

impl TargetDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.update.is_empty()
    }

    /// Apply adds, then removes, then weight updates to `observed`.
    pub fn apply_to(&self, observed: &TargetSet) -> TargetSet {
        let mut result = observed.clone();
        for target in &self.add {
            result.upsert(target.clone());
        }
        for target in &self.remove {
            result.remove(&target.key());
        }
        for target in &self.update {
            result.upsert(target.clone());
        }
        result
    }
}

/// Compute the add, remove and update sets between `desired` and `observed`.
///
/// Pure: the same inputs always produce the same diff, in key order.
pub fn diff(desired: &TargetSet, observed: &TargetSet) -> TargetDiff {
    let mut result = TargetDiff::default();

    for target in desired.iter() {
        match observed.get(&target.key()) {
            None => result.add.push(target.clone()),
            Some(current) if current.weight() != target.weight() => {
                result.update.push(target.clone())
            }
            Some(_) => {}
        }
    }

    result.remove = observed
        .iter()
        .filter(|t| !desired.contains(&t.key()))
        .cloned()
        .collect();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Target;

    fn set(targets: &[(&str, u16, u8)]) -> TargetSet {
        TargetSet::from_targets(
            targets
                .iter()
                .map(|(id, port, weight)| Target::instance(*id, *port).unwrap().with_weight(*weight).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn test_add_remove_scenario() {
        let desired = set(&[("A", 80, 10), ("B", 81, 10)]);
        let observed = set(&[("B", 81, 10), ("C", 82, 10)]);

        let d = diff(&desired, &observed);
        assert_eq!(d.add, set(&[("A", 80, 10)]).to_vec());
        assert_eq!(d.remove, set(&[("C", 82, 10)]).to_vec());
        assert!(d.update.is_empty());
    }

    #[test]
    fn test_weight_change_is_update() {
        let desired = set(&[("A", 80, 50)]);
        let observed = set(&[("A", 80, 10)]);

        let d = diff(&desired, &observed);
        assert!(d.add.is_empty());
        assert!(d.remove.is_empty());
        assert_eq!(d.update, set(&[("A", 80, 50)]).to_vec());
    }

    #[test]
    fn test_same_endpoint_different_port_is_distinct() {
        let desired = set(&[("A", 80, 10)]);
        let observed = set(&[("A", 8080, 10)]);

        let d = diff(&desired, &observed);
        assert_eq!(d.add.len(), 1);
        assert_eq!(d.remove.len(), 1);
    }

    #[test]
    fn test_diff_of_identical_sets_is_empty() {
        let s = set(&[("A", 80, 10), ("B", 81, 20), ("C", 82, 0)]);
        assert!(diff(&s, &s).is_empty());
        assert!(diff(&TargetSet::new(), &TargetSet::new()).is_empty());
    }

    #[test]
    fn test_diff_is_deterministic() {
        let desired = set(&[("A", 80, 10), ("D", 83, 30)]);
        let observed = set(&[("D", 83, 10), ("C", 82, 10)]);
        assert_eq!(diff(&desired, &observed), diff(&desired, &observed));
    }

    #[test]
    fn test_apply_reproduces_desired() {
        let cases = [
            (set(&[]), set(&[("A", 80, 10)])),
            (set(&[("A", 80, 10)]), set(&[])),
            (
                set(&[("A", 80, 10), ("B", 81, 60), ("E", 90, 100)]),
                set(&[("B", 81, 10), ("C", 82, 10), ("E", 90, 0)]),
            ),
        ];

        for (desired, observed) in cases {
            let d = diff(&desired, &observed);
            assert_eq!(d.apply_to(&observed), desired);
        }
    }

    #[test]
    fn test_apply_reproduces_desired_generated() {
        // Deterministic LCG-generated sets.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as u32
        };

        for _ in 0..50 {
            let mut desired = TargetSet::new();
            let mut observed = TargetSet::new();
            for i in 0..12u16 {
                let target = Target::instance(format!("ins-{}", i % 5), 80 + i % 3).unwrap();
                match next() % 4 {
                    0 => {
                        desired.upsert(target.with_weight((next() % 101) as u8).unwrap());
                    }
                    1 => {
                        observed.upsert(target.with_weight((next() % 101) as u8).unwrap());
                    }
                    2 => {
                        desired.upsert(target.clone().with_weight((next() % 101) as u8).unwrap());
                        observed.upsert(target.with_weight((next() % 101) as u8).unwrap());
                    }
                    _ => {}
                }
            }

            let d = diff(&desired, &observed);
            assert_eq!(d.apply_to(&observed), desired);
            assert!(diff(&desired, &d.apply_to(&observed)).is_empty());
        }
    }
}
