//! C3: Task picker and dependency resolver.
//!
//! `list_ready` on the store already filters to tasks whose dependencies
//! are all `Done`; what it cannot see is a dependency *cycle*, since a
//! cyclic group of tasks never becomes ready and would otherwise stall
//! silently forever. [`detect_cycle`] walks the full task graph with an
//! iterative DFS (no recursion, so it cannot blow the stack on a
//! pathological input) and reports the first cycle it finds.

use std::collections::{HashMap, HashSet};

use deespec_store::models::{FeedbackDraft, Task, TaskId, TaskStatus};

/// One ready task to hand to the worker pool, in priority order.
#[derive(Debug, Clone)]
pub struct PickResult {
    pub ready: Vec<Task>,
    pub blocked_by_cycle: Vec<TaskId>,
}

/// Colors for the iterative DFS cycle check.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Find a dependency cycle in `tasks`, if one exists.
///
/// Returns the ids that participate in the first cycle found, in
/// traversal order. An empty result means the dependency graph is a DAG.
pub fn detect_cycle(tasks: &[Task]) -> Vec<TaskId> {
    let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
    let mut marks: HashMap<&TaskId, Mark> = HashMap::new();

    for task in tasks {
        if marks.contains_key(&task.id) {
            continue;
        }
        if let Some(cycle) = dfs_from(&task.id, &by_id, &mut marks) {
            return cycle;
        }
    }

    Vec::new()
}

fn dfs_from<'a>(
    start: &'a TaskId,
    by_id: &HashMap<&'a TaskId, &'a Task>,
    marks: &mut HashMap<&'a TaskId, Mark>,
) -> Option<Vec<TaskId>> {
    // Explicit stack of (node, next-dependency-index) frames; `path` tracks
    // the current root-to-node chain so a back edge can be reported as the
    // exact cycle rather than just "a cycle exists somewhere".
    let mut stack: Vec<(&TaskId, usize)> = vec![(start, 0)];
    let mut path: Vec<&TaskId> = vec![start];
    marks.insert(start, Mark::Visiting);

    while let Some(frame) = stack.last_mut() {
        let node = frame.0;
        let Some(task) = by_id.get(node) else {
            marks.insert(node, Mark::Done);
            stack.pop();
            path.pop();
            continue;
        };

        let deps: Vec<&TaskId> = task.metadata.dependencies.iter().collect();

        if frame.1 >= deps.len() {
            marks.insert(node, Mark::Done);
            stack.pop();
            path.pop();
            continue;
        }

        let dep = deps[frame.1];
        frame.1 += 1;

        match marks.get(dep) {
            Some(Mark::Done) => continue,
            Some(Mark::Visiting) => {
                let start_pos = path.iter().position(|id| *id == dep).unwrap_or(0);
                let mut cycle: Vec<TaskId> = path[start_pos..].iter().map(|id| (*id).clone()).collect();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            None => {
                marks.insert(dep, Mark::Visiting);
                path.push(dep);
                stack.push((dep, 0));
            }
        }
    }

    None
}

/// Partition `ready` (already dependency-satisfied tasks) from `all`
/// (every task, used for cycle detection) into a [`PickResult`].
pub fn pick(all: &[Task], ready: Vec<Task>) -> PickResult {
    let cycle = detect_cycle(all);
    let blocked_by_cycle: HashSet<TaskId> = cycle.iter().cloned().collect();

    PickResult {
        ready: ready
            .into_iter()
            .filter(|t| !blocked_by_cycle.contains(&t.id))
            .collect(),
        blocked_by_cycle: cycle,
    }
}

/// Checks a path the way the incomplete-instruction detector does: a path
/// is invalid if it climbs out of its root, is absolute, or carries an
/// embedded NUL.
fn invalid_path(path: &str) -> bool {
    path.split('/').any(|seg| seg == "..") || path.starts_with('/') || path.contains('\0')
}

/// C3 collaborator hook: before a task is handed to a worker, flag
/// anything about it that looks like an incomplete or malformed
/// instruction. None of these findings block the pick -- they are
/// surfaced as [`FeedbackDraft`]s for a human or a later round to act on.
pub fn detect_incomplete(task: &Task, all: &[Task], cycle: &[TaskId]) -> Vec<FeedbackDraft> {
    let mut drafts = Vec::new();
    let by_id: HashMap<&TaskId, &Task> = all.iter().map(|t| (&t.id, t)).collect();

    for dep in &task.metadata.dependencies {
        match by_id.get(dep) {
            None => drafts.push(FeedbackDraft {
                task_id: task.id.clone(),
                reason: "unresolved-dependency".into(),
                detail: format!("depends on unknown task {dep}"),
            }),
            Some(dep_task) if dep_task.status != TaskStatus::Done => drafts.push(FeedbackDraft {
                task_id: task.id.clone(),
                reason: "unresolved-dependency".into(),
                detail: format!("depends on {dep}, still {}", dep_task.status),
            }),
            Some(_) => {}
        }
    }

    if cycle.contains(&task.id) {
        drafts.push(FeedbackDraft {
            task_id: task.id.clone(),
            reason: "dependency-cycle".into(),
            detail: "participates in a dependency cycle".into(),
        });
    }

    if task.title.trim().is_empty() {
        drafts.push(FeedbackDraft {
            task_id: task.id.clone(),
            reason: "empty-metadata".into(),
            detail: "title is empty".into(),
        });
    }

    for path in &task.metadata.file_paths {
        if invalid_path(path) {
            drafts.push(FeedbackDraft {
                task_id: task.id.clone(),
                reason: "invalid-path".into(),
                detail: format!("file path {path:?} is absolute, escapes its root, or contains NUL"),
            });
        }
    }

    drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use deespec_store::models::{Step, TaskKind, TaskMetadata, TaskStatus};

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: TaskId::from(id),
            kind: TaskKind::Sbi,
            parent_id: None,
            title: id.into(),
            description: String::new(),
            labels: Default::default(),
            assigned_agent: None,
            status: TaskStatus::Pending,
            step: Step::Pick,
            execution: None,
            metadata: TaskMetadata {
                dependencies: deps.iter().map(|d| TaskId::from(*d)).collect(),
                ..TaskMetadata::default()
            },
        }
    }

    #[test]
    fn dag_has_no_cycle() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])];
        assert!(detect_cycle(&tasks).is_empty());
    }

    #[test]
    fn direct_self_cycle_detected() {
        let tasks = vec![task("a", &["a"])];
        let cycle = detect_cycle(&tasks);
        assert!(!cycle.is_empty());
    }

    #[test]
    fn three_node_cycle_detected() {
        let tasks = vec![task("a", &["b"]), task("b", &["c"]), task("c", &["a"])];
        let cycle = detect_cycle(&tasks);
        assert!(cycle.contains(&TaskId::from("a")));
        assert!(cycle.contains(&TaskId::from("b")));
        assert!(cycle.contains(&TaskId::from("c")));
    }

    #[test]
    fn pick_excludes_cyclic_tasks_from_ready() {
        let all = vec![task("a", &["b"]), task("b", &["a"]), task("c", &[])];
        let ready = vec![all[2].clone()];
        let result = pick(&all, ready);
        assert_eq!(result.ready.len(), 1);
        assert_eq!(result.ready[0].id, TaskId::from("c"));
    }

    #[test]
    fn detect_incomplete_flags_unresolved_dependency() {
        let t = task("a", &["missing"]);
        let drafts = detect_incomplete(&t, &[t.clone()], &[]);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].reason, "unresolved-dependency");
    }

    #[test]
    fn detect_incomplete_flags_a_not_yet_done_dependency() {
        let mut dep = task("b", &[]);
        dep.status = TaskStatus::Implementing;
        let t = task("a", &["b"]);
        let drafts = detect_incomplete(&t, &[t.clone(), dep], &[]);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].reason, "unresolved-dependency");
    }

    #[test]
    fn detect_incomplete_is_quiet_for_a_done_dependency() {
        let mut dep = task("b", &[]);
        dep.status = TaskStatus::Done;
        let t = task("a", &["b"]);
        let drafts = detect_incomplete(&t, &[t.clone(), dep], &[]);
        assert!(drafts.is_empty());
    }

    #[test]
    fn detect_incomplete_flags_membership_in_a_cycle() {
        let t = task("a", &[]);
        let drafts = detect_incomplete(&t, &[t.clone()], &[TaskId::from("a")]);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].reason, "dependency-cycle");
    }

    #[test]
    fn detect_incomplete_flags_empty_title() {
        let mut t = task("a", &[]);
        t.title = "  ".into();
        let drafts = detect_incomplete(&t, &[t.clone()], &[]);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].reason, "empty-metadata");
    }

    #[test]
    fn detect_incomplete_flags_traversal_absolute_and_nul_paths() {
        let mut t = task("a", &[]);
        t.metadata.file_paths = vec!["../etc/passwd".into(), "/etc/shadow".into(), "bad\0path".into()];
        let drafts = detect_incomplete(&t, &[t.clone()], &[]);
        assert_eq!(drafts.len(), 3);
        assert!(drafts.iter().all(|d| d.reason == "invalid-path"));
    }

    #[test]
    fn detect_incomplete_is_quiet_for_a_well_formed_task() {
        let mut t = task("a", &[]);
        t.metadata.file_paths = vec!["src/lib.rs".into()];
        let drafts = detect_incomplete(&t, &[t.clone()], &[]);
        assert!(drafts.is_empty());
    }
}
