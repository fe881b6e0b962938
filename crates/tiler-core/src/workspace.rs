use derive_new::new;

/// Size of the fixed system area every kernel launch reserves in global memory.
pub const SYSTEM_WORKSPACE: usize = 16 * 1024 * 1024;

/// Extra bytes charged per spilled element, plus a fixed amount per unit.
#[derive(Debug, Clone, Copy, new, PartialEq, Eq, Hash)]
pub struct SpillRule {
    pub bytes_per_element: usize,
    pub per_unit: usize,
}

#[derive(Debug, Clone, Copy, new, PartialEq, Eq, Hash)]
pub struct WorkspacePolicy {
    pub base: usize,
    pub spill: Option<SpillRule>,
}

impl WorkspacePolicy {
    pub fn fixed(base: usize) -> Self {
        Self { base, spill: None }
    }

    pub fn spilling(base: usize, rule: SpillRule) -> Self {
        Self {
            base,
            spill: Some(rule),
        }
    }
}

pub struct WorkspaceSizer;

impl WorkspaceSizer {
    /// Global workspace in bytes. Non-decreasing in both `spill_elements` and `units`.
    pub fn size(policy: &WorkspacePolicy, spill_elements: usize, units: usize) -> usize {
        match policy.spill {
            None => policy.base,
            Some(SpillRule {
                bytes_per_element,
                per_unit,
            }) => policy.base + spill_elements * bytes_per_element + units * per_unit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::{proptest, Arbitrary};

    #[test]
    fn fixed_ignores_spill() {
        let policy = WorkspacePolicy::fixed(32);
        assert_eq!(WorkspaceSizer::size(&policy, 1 << 20, 64), 32);
    }

    #[test]
    fn spill_adds_up() {
        let policy = WorkspacePolicy::spilling(SYSTEM_WORKSPACE, SpillRule::new(4, 0));
        assert_eq!(WorkspaceSizer::size(&policy, 0, 48), SYSTEM_WORKSPACE);
        assert_eq!(WorkspaceSizer::size(&policy, 1000, 48), SYSTEM_WORKSPACE + 4000);
    }

    #[derive(Arbitrary, Debug)]
    struct GrowthProblem {
        #[strategy(0..=1_000_000usize)]
        base: usize,
        #[strategy(0..=16usize)]
        bytes_per_element: usize,
        #[strategy(0..=1024usize)]
        per_unit: usize,
        #[strategy(0..=64usize)]
        units: usize,
        #[strategy(0..=100_000usize)]
        per_unit_work: usize,
        #[strategy(0..=1000usize)]
        more: usize,
    }

    #[proptest(cases = 256)]
    fn workspace_is_monotonic(prob: GrowthProblem) {
        let policy = WorkspacePolicy::spilling(
            prob.base,
            SpillRule::new(prob.bytes_per_element, prob.per_unit),
        );
        let small = WorkspaceSizer::size(&policy, prob.units * prob.per_unit_work, prob.units);
        let grown = WorkspaceSizer::size(
            &policy,
            (prob.units + 1) * (prob.per_unit_work + prob.more),
            prob.units + 1,
        );
        assert!(small <= grown);
        assert!(small >= prob.base);
    }
}
