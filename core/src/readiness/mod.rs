/// Dependency/Readiness Query (C14, §2): a pure function over the dependency DAG's edge
/// list and a completed-task set. Kept separate from [`crate::coordinator`], which tracks
/// handoffs as stateful records — this module answers the simpler "given these edges and
/// this completed set, what's ready" question without owning any state itself.
use std::collections::{HashMap, HashSet};

/// One producer -> consumer edge in the dependency DAG.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub consumer_task: String,
    pub producer_task: String,
}

/// Returns every task in `dependencies` (as a consumer) whose producers are all present in
/// `completed`. A consumer task with zero listed producers is vacuously ready.
pub fn ready_tasks(dependencies: &[Dependency], completed: &HashSet<String>) -> HashSet<String> {
    let mut producers_by_consumer: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in dependencies {
        producers_by_consumer
            .entry(dep.consumer_task.as_str())
            .or_default()
            .push(dep.producer_task.as_str());
    }

    producers_by_consumer
        .into_iter()
        .filter(|(_, producers)| producers.iter().all(|p| completed.contains(*p)))
        .map(|(consumer, _)| consumer.to_string())
        .collect()
}

/// True iff `task`'s producers (if it appears as a consumer at all) are all in `completed`.
pub fn is_ready(task: &str, dependencies: &[Dependency], completed: &HashSet<String>) -> bool {
    dependencies
        .iter()
        .filter(|d| d.consumer_task == task)
        .all(|d| completed.contains(&d.producer_task))
}
