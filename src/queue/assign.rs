//! Round-robin distribution of models over `(workspace, thread)` queues.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::info;

use crate::error::QueueError;

/// One workspace/thread slot and the models it will test, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Queue {
    pub workspace: String,
    pub thread: usize,
    pub models: Vec<String>,
}

impl Queue {
    /// `<workspace>-<thread>`, used for file names and workflow inputs.
    pub fn label(&self) -> String {
        queue_label(&self.workspace, self.thread)
    }
}

pub fn queue_label(workspace: &str, thread: usize) -> String {
    format!("{workspace}-{thread}")
}

/// Queues keyed by workspace, then thread, both in cycle order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct QueueAssignment {
    by_workspace: IndexMap<String, IndexMap<usize, Vec<String>>>,
}

impl QueueAssignment {
    pub fn total_models(&self) -> usize {
        self.by_workspace
            .values()
            .flat_map(|threads| threads.values())
            .map(Vec::len)
            .sum()
    }

    pub fn queue_count(&self) -> usize {
        self.by_workspace.values().map(IndexMap::len).sum()
    }

    pub fn get(&self, workspace: &str, thread: usize) -> Option<&[String]> {
        self.by_workspace
            .get(workspace)
            .and_then(|threads| threads.get(&thread))
            .map(Vec::as_slice)
    }

    /// Flattened queues in cycle order.
    pub fn queues(&self) -> Vec<Queue> {
        self.by_workspace
            .iter()
            .flat_map(|(workspace, threads)| {
                threads.iter().map(move |(thread, models)| Queue {
                    workspace: workspace.clone(),
                    thread: *thread,
                    models: models.clone(),
                })
            })
            .collect()
    }

    fn push(&mut self, workspace: &str, thread: usize, model: String) {
        self.by_workspace
            .entry(workspace.to_string())
            .or_default()
            .entry(thread)
            .or_default()
            .push(model);
    }
}

/// Assign `models` in input order to W0/T0, W0/T1, ..., W(n-1)/T(t-1), wrapping
/// until every model is placed. Slots that receive nothing are not created.
///
/// Fails with [`QueueError::CountMismatch`] if the placed total differs from
/// the input count.
pub fn assign_models_to_queues<S: AsRef<str>>(
    models: &[String],
    workspaces: &[S],
    threads: usize,
) -> Result<QueueAssignment, QueueError> {
    let slots = workspaces.len() * threads;
    if slots == 0 && !models.is_empty() {
        return Err(QueueError::NoCapacity {
            workspaces: workspaces.len(),
            threads,
            models: models.len(),
        });
    }

    let mut seen = HashSet::with_capacity(models.len());
    if let Some(dup) = models.iter().find(|m| !seen.insert(m.as_str())) {
        return Err(QueueError::DuplicateModel(dup.clone()));
    }

    let mut assignment = QueueAssignment::default();
    for (i, model) in models.iter().enumerate() {
        let slot = i % slots;
        let workspace = workspaces[slot / threads].as_ref();
        assignment.push(workspace, slot % threads, model.clone());
    }

    let found = assignment.total_models();
    if found != models.len() {
        return Err(QueueError::CountMismatch {
            expected: models.len(),
            found,
        });
    }
    info!(
        models = found,
        queues = assignment.queue_count(),
        "assigned models to queues"
    );
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("m{i}")).collect()
    }

    #[test]
    fn five_models_two_workspaces_two_threads() {
        let a = assign_models_to_queues(&names(5), &["A", "B"], 2).unwrap();
        assert_eq!(a.get("A", 0).unwrap(), ["m1", "m5"]);
        assert_eq!(a.get("A", 1).unwrap(), ["m2"]);
        assert_eq!(a.get("B", 0).unwrap(), ["m3"]);
        assert_eq!(a.get("B", 1).unwrap(), ["m4"]);
        assert_eq!(a.queue_count(), 4);
    }

    #[test]
    fn partial_cycle_leaves_trailing_slots_empty() {
        let a = assign_models_to_queues(&names(3), &["A", "B"], 3).unwrap();
        let labels: Vec<String> = a.queues().iter().map(Queue::label).collect();
        assert_eq!(labels, ["A-0", "A-1", "A-2"]);
        assert!(a.get("B", 0).is_none());
    }

    #[test]
    fn total_matches_input_for_many_shapes() {
        for n in 0..40 {
            for w in 1..4 {
                for t in 1..4 {
                    let workspaces: Vec<String> = (0..w).map(|i| format!("ws{i}")).collect();
                    let a = assign_models_to_queues(&names(n), &workspaces, t).unwrap();
                    assert_eq!(a.total_models(), n, "n={n} w={w} t={t}");
                    assert!(a.queue_count() <= w * t);
                }
            }
        }
    }

    #[test]
    fn assignment_is_deterministic() {
        let models = names(17);
        let first = assign_models_to_queues(&models, &["east", "west", "north"], 2).unwrap();
        let second = assign_models_to_queues(&models, &["east", "west", "north"], 2).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn queue_sizes_differ_by_at_most_one() {
        let a = assign_models_to_queues(&names(23), &["A", "B", "C"], 2).unwrap();
        let sizes: Vec<usize> = a.queues().iter().map(|q| q.models.len()).collect();
        let min = *sizes.iter().min().unwrap();
        let max = *sizes.iter().max().unwrap();
        assert!(max - min <= 1, "sizes {sizes:?}");
    }

    #[test]
    fn repeated_model_is_rejected() {
        let models = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let err = assign_models_to_queues(&models, &["A"], 2).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateModel(ref m) if m == "a"));
    }

    #[test]
    fn zero_threads_is_rejected() {
        let err = assign_models_to_queues(&names(2), &["A"], 0).unwrap_err();
        assert!(matches!(err, QueueError::NoCapacity { threads: 0, .. }));
    }

    #[test]
    fn empty_input_produces_no_queues() {
        let a = assign_models_to_queues::<&str>(&[], &[], 0).unwrap();
        assert_eq!(a.queue_count(), 0);
    }

    #[test]
    fn serializes_as_nested_map() {
        let a = assign_models_to_queues(&names(2), &["A"], 2).unwrap();
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["A"]["0"][0], "m1");
        assert_eq!(json["A"]["1"][0], "m2");
    }
}
