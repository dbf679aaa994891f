//! Dependency and parallelism analysis
//!
//! The planner makes one forward pass over a block of recorded steps and cuts
//! it into parallel groups. A new group starts when:
//!
//! - auto-parallelism is disabled
//! - the step, or the group so far, is a barrier (branches, loops, and
//!   transforms without declared access)
//! - the step reads a key written earlier in the group
//! - the step writes a key already written in the group
//!
//! Steps never move: groups are consecutive runs in declaration order, so
//! merging a group's results in index order is deterministic.
//!
//! ```text
//! steps:   map{w:a}  map{w:b}  execute{r:a,b}  map{w:c}
//! groups:  [0, 1]              [2, 3]
//! ```

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{FlowError, Result};
use crate::state::Access;
use crate::step::{Block, Step, StepKind};

/// Cut `steps` into parallel groups of consecutive indices
pub(crate) fn plan_groups(steps: &[Step], auto_parallel: bool) -> Vec<Vec<usize>> {
    let mut groups = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut group_writes = Access::none();
    let mut group_is_barrier = false;

    for (index, step) in steps.iter().enumerate() {
        let split = !current.is_empty()
            && (!auto_parallel
                || group_is_barrier
                || step.barrier
                || step.reads.intersects(&group_writes)
                || step.writes.intersects(&group_writes));
        if split {
            groups.push(std::mem::take(&mut current));
            group_writes = Access::none();
        }
        current.push(index);
        group_writes.extend(&step.writes);
        group_is_barrier = step.barrier;
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Plan a block and every block nested inside its steps
pub(crate) fn plan_block(steps: Vec<Step>, auto_parallel: bool) -> Block {
    let steps: Vec<Step> = steps
        .into_iter()
        .map(|step| plan_nested(step, auto_parallel))
        .collect();
    let groups = plan_groups(&steps, auto_parallel);
    Block { steps, groups }
}

fn plan_nested(mut step: Step, auto_parallel: bool) -> Step {
    let replan = |block: &mut Block| {
        *block = plan_block(std::mem::take(&mut block.steps), auto_parallel);
    };
    match &mut step.kind {
        StepKind::Branch { cases, .. } => cases.iter_mut().for_each(|(_, block)| replan(block)),
        StepKind::Parallel { branches, .. } => branches.iter_mut().for_each(replan),
        StepKind::While { body, .. } => replan(body),
        StepKind::Map(_) | StepKind::MapMany { .. } | StepKind::Execute { .. } => {}
    }
    step
}

/// Check every declared read against the flow inputs and earlier writes
pub(crate) fn validate_reads(steps: &[Step], inputs: &BTreeSet<String>) -> Result<()> {
    let mut available = Access::Keys(inputs.clone());
    for step in steps {
        if available.is_all() {
            return Ok(());
        }
        if let Some(keys) = step.reads.key_set() {
            if let Some(missing) = keys.iter().find(|key| !available.contains(key)) {
                return Err(FlowError::construction(format!(
                    "step '{}' reads '{}', which is neither a flow input nor written by an earlier step",
                    step.label, missing
                )));
            }
        }
        available.extend(&step.writes);
    }
    Ok(())
}

/// A step as it appears in the execution plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    pub index: usize,
    pub kind: String,
    pub label: String,
    /// `None` when the step may read any key
    pub reads: Option<Vec<String>>,
    /// `None` when the step may write any key
    pub writes: Option<Vec<String>>,
}

/// Steps that run concurrently
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedGroup {
    pub level: usize,
    pub steps: Vec<PlannedStep>,
}

/// Immutable summary of how a flow will run, computed once at build time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub total_steps: usize,
    pub parallel_groups: usize,
    pub max_parallelism: usize,
    pub auto_parallel_enabled: bool,
    pub groups: Vec<PlannedGroup>,
}

impl ExecutionPlan {
    pub(crate) fn from_block(block: &Block, auto_parallel: bool) -> Self {
        let key_list = |access: &Access| {
            access
                .key_set()
                .map(|keys| keys.iter().cloned().collect::<Vec<_>>())
        };
        let groups: Vec<PlannedGroup> = block
            .groups
            .iter()
            .enumerate()
            .map(|(level, indices)| PlannedGroup {
                level,
                steps: indices
                    .iter()
                    .map(|&index| {
                        let step = &block.steps[index];
                        PlannedStep {
                            index,
                            kind: step.kind.name().to_string(),
                            label: step.label.clone(),
                            reads: key_list(&step.reads),
                            writes: key_list(&step.writes),
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            total_steps: block.steps.len(),
            parallel_groups: groups.len(),
            max_parallelism: groups.iter().map(|g| g.steps.len()).max().unwrap_or(0),
            auto_parallel_enabled: auto_parallel,
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FlowState;
    use crate::step::Transform;
    use proptest::prelude::*;

    fn map(reads: &[&str], writes: &[&str]) -> Step {
        let t = Transform::new(|s: &FlowState| s.clone())
            .reads(reads.iter().copied())
            .writes(writes.iter().copied());
        let (r, w) = (t.reads.clone(), t.writes.clone());
        Step::new(StepKind::Map(t), r, w)
    }

    fn opaque() -> Step {
        let t = Transform::new(|s: &FlowState| s.clone());
        Step::new(StepKind::Map(t), Access::All, Access::All)
    }

    #[test]
    fn test_independent_steps_share_a_group() {
        let steps = vec![map(&["q"], &["a"]), map(&["q"], &["b"]), map(&["a", "b"], &["c"])];
        assert_eq!(plan_groups(&steps, true), vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_disabled_auto_parallel_is_sequential() {
        let steps = vec![map(&[], &["a"]), map(&[], &["b"])];
        assert_eq!(plan_groups(&steps, false), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_write_write_overlap_splits() {
        let steps = vec![map(&[], &["a"]), map(&[], &["a"])];
        assert_eq!(plan_groups(&steps, true), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_barriers_stand_alone() {
        let steps = vec![map(&[], &["a"]), map(&[], &["b"]).barrier(), map(&[], &["c"])];
        assert_eq!(plan_groups(&steps, true), vec![vec![0], vec![1], vec![2]]);

        let steps = vec![opaque(), map(&[], &["x"])];
        assert_eq!(plan_groups(&steps, true).len(), 2);
    }

    #[test]
    fn test_opaque_transform_never_joins_a_group() {
        // a step writing nothing leaves the group's write set empty
        let steps = vec![map(&[], &[]), opaque(), map(&[], &[])];
        assert!(steps[1].barrier);
        assert_eq!(plan_groups(&steps, true), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_plan_summary() {
        let block = plan_block(vec![map(&[], &["a"]), map(&[], &["b"]), map(&["a"], &["c"])], true);
        let plan = ExecutionPlan::from_block(&block, true);
        assert_eq!(plan.total_steps, 3);
        assert_eq!(plan.parallel_groups, 2);
        assert_eq!(plan.max_parallelism, 2);
        assert_eq!(plan.groups[1].steps[0].reads, Some(vec!["a".to_string()]));
    }

    #[test]
    fn test_empty_plan() {
        let plan = ExecutionPlan::from_block(&plan_block(Vec::new(), true), true);
        assert_eq!(plan.total_steps, 0);
        assert_eq!(plan.max_parallelism, 0);
    }

    #[test]
    fn test_validate_reads() {
        let inputs: BTreeSet<String> = ["q".to_string()].into_iter().collect();
        let ok = vec![map(&["q"], &["a"]), map(&["a"], &["b"])];
        assert!(validate_reads(&ok, &inputs).is_ok());

        let bad = vec![map(&["q"], &["a"]), map(&["z"], &["b"])];
        let err = validate_reads(&bad, &inputs).unwrap_err().to_string();
        assert!(err.contains("'z'"));
    }

    fn arb_step() -> impl Strategy<Value = (Vec<u8>, Vec<u8>, bool)> {
        (
            proptest::collection::vec(0u8..6, 0..3),
            proptest::collection::vec(0u8..6, 0..3),
            proptest::bool::weighted(0.1),
        )
    }

    proptest! {
        #[test]
        fn prop_groups_cover_steps_in_order(
            specs in proptest::collection::vec(arb_step(), 0..24),
            auto in any::<bool>(),
        ) {
            let steps: Vec<Step> = specs
                .iter()
                .map(|(reads, writes, barrier)| {
                    let reads: Vec<String> = reads.iter().map(|k| format!("k{k}")).collect();
                    let writes: Vec<String> = writes.iter().map(|k| format!("k{k}")).collect();
                    let step = Step::new(
                        StepKind::Map(Transform::new(|s: &FlowState| s.clone())),
                        Access::keys(reads),
                        Access::keys(writes),
                    );
                    if *barrier { step.barrier() } else { step }
                })
                .collect();

            let block = plan_block(steps, auto);
            let plan = ExecutionPlan::from_block(&block, auto);

            let flattened: Vec<usize> = block.groups.iter().flatten().copied().collect();
            prop_assert_eq!(flattened, (0..specs.len()).collect::<Vec<_>>());
            prop_assert_eq!(plan.total_steps, specs.len());
            prop_assert_eq!(
                plan.max_parallelism,
                block.groups.iter().map(Vec::len).max().unwrap_or(0)
            );

            for group in &block.groups {
                if !auto {
                    prop_assert_eq!(group.len(), 1);
                }
                let mut written = Access::none();
                for &index in group {
                    let step = &block.steps[index];
                    prop_assert!(!step.reads.intersects(&written));
                    prop_assert!(!step.writes.intersects(&written));
                    if step.barrier {
                        prop_assert_eq!(group.len(), 1);
                    }
                    written.extend(&step.writes);
                }
            }
        }
    }
}
