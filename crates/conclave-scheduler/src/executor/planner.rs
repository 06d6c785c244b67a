//! Partitioning of a session's tasks into resource-compatible groups.

use super::task::ExpertExecutionTask;
use crate::ledger::ResourceLedger;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Splits tasks into groups that can each run together within capacity.
///
/// Each round asks the ledger for the compatible subset of the remaining
/// tasks and peels it off as one group. A task the ledger can never place
/// (unknown model, or a cost larger than its category) becomes a singleton
/// group so planning always terminates. Input order is preserved within and
/// across groups.
#[must_use]
pub fn group_by_resource_compatibility(
    ledger: &ResourceLedger,
    tasks: Vec<ExpertExecutionTask>,
) -> Vec<Vec<ExpertExecutionTask>> {
    let mut remaining = tasks;
    let mut groups = Vec::new();

    while !remaining.is_empty() {
        let pairs: Vec<(String, String)> =
            remaining.iter().map(|t| (t.task_id.clone(), t.model.clone())).collect();
        let compatible: HashSet<String> = ledger
            .get_compatible_agents_for_parallel_execution(&pairs)
            .into_iter()
            .map(|(task_id, _)| task_id)
            .collect();

        if compatible.is_empty() {
            let task = remaining.remove(0);
            warn!(task_id = %task.task_id, model = %task.model, "Task fits no group, planning it alone");
            groups.push(vec![task]);
            continue;
        }

        let (group, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|t| compatible.contains(&t.task_id));
        debug!(group = groups.len(), size = group.len(), deferred = rest.len(), "Planned task group");
        groups.push(group);
        remaining = rest;
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ModelCatalog, ModelCategory, ModelDescriptor};
    use crate::executor::task::ExpertTaskSpec;
    use std::collections::BTreeMap;

    fn ledger() -> ResourceLedger {
        let catalog = ModelCatalog::new([
            ModelDescriptor::new("big", ModelCategory::Large),
            ModelDescriptor::new("mid", ModelCategory::Medium),
            ModelDescriptor::new("huge", ModelCategory::Large).with_cost(5),
        ]);
        ResourceLedger::new(catalog, BTreeMap::from([(ModelCategory::Large, 1), (ModelCategory::Medium, 2)]))
    }

    fn tasks(models: &[&str]) -> Vec<ExpertExecutionTask> {
        models
            .iter()
            .enumerate()
            .map(|(i, m)| ExpertExecutionTask::from_spec(ExpertTaskSpec::new(format!("e{i}"), "r", *m)))
            .collect()
    }

    fn experts(groups: &[Vec<ExpertExecutionTask>]) -> Vec<Vec<String>> {
        groups.iter().map(|g| g.iter().map(|t| t.expert_id.clone()).collect()).collect()
    }

    #[test]
    fn test_groups_respect_capacity() {
        let groups = group_by_resource_compatibility(&ledger(), tasks(&["big", "mid", "big", "mid", "mid"]));
        assert_eq!(
            experts(&groups),
            vec![vec!["e0", "e1", "e3"], vec!["e2", "e4"]]
        );
    }

    #[test]
    fn test_unplaceable_tasks_become_singletons() {
        let groups = group_by_resource_compatibility(&ledger(), tasks(&["ghost", "huge", "mid"]));
        assert_eq!(experts(&groups), vec![vec!["e2"], vec!["e0"], vec!["e1"]]);
    }

    #[test]
    fn test_empty_input() {
        assert!(group_by_resource_compatibility(&ledger(), Vec::new()).is_empty());
    }
}
