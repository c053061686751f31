// ===========================================================================
// Task graph tests
//
// Plan validation, FIFO readiness, the per-task lifecycle, and the retry /
// exhaustion / cascade bookkeeping the scheduler leans on.
// ===========================================================================

use fm_core::types::{Phase, Prd, TaskId, TaskSpec, TaskStatus};
use fm_engine::graph::{FailureOutcome, GraphError, TaskGraph};

fn spec(id: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec {
        id: TaskId::new(id),
        description: format!("do {id}"),
        depends_on: deps.iter().map(|d| TaskId::new(*d)).collect(),
        criteria: Vec::new(),
    }
}

fn prd_of(specs: &[(&str, &[&str])]) -> Prd {
    Prd {
        version: 1,
        phases: vec![Phase {
            name: "all".into(),
            tasks: specs.iter().map(|(id, deps)| spec(id, deps)).collect(),
        }],
    }
}

fn id(s: &str) -> TaskId {
    TaskId::new(s)
}

/// Walk a task through dispatch so it can fail or finish.
fn dispatch(graph: &mut TaskGraph, task: &str) {
    graph.mark_dispatched(&id(task)).unwrap();
}

fn finish(graph: &mut TaskGraph, task: &str) {
    dispatch(graph, task);
    graph.mark(&id(task), TaskStatus::Verifying).unwrap();
    graph.mark(&id(task), TaskStatus::Done).unwrap();
}

#[test]
fn build_flattens_phases_in_declaration_order() {
    let prd = Prd {
        version: 3,
        phases: vec![
            Phase {
                name: "scaffold".into(),
                tasks: vec![spec("init", &[]), spec("schema", &["init"])],
            },
            Phase {
                name: "features".into(),
                tasks: vec![spec("api", &["schema"])],
            },
        ],
    };
    let graph = TaskGraph::build(&prd).unwrap();
    assert_eq!(graph.version(), 3);
    assert_eq!(graph.len(), 3);
    let order: Vec<&str> = graph.tasks().map(|t| t.id.as_str()).collect();
    assert_eq!(order, ["init", "schema", "api"]);
}

#[test]
fn empty_plan_is_rejected() {
    let prd = Prd {
        version: 1,
        phases: vec![],
    };
    assert!(matches!(TaskGraph::build(&prd), Err(GraphError::Empty)));

    let prd = prd_of(&[]);
    assert!(matches!(TaskGraph::build(&prd), Err(GraphError::Empty)));
}

#[test]
fn duplicate_id_is_rejected() {
    let prd = prd_of(&[("a", &[]), ("a", &[])]);
    match TaskGraph::build(&prd) {
        Err(GraphError::DuplicateTask(t)) => assert_eq!(t.as_str(), "a"),
        other => panic!("expected DuplicateTask, got {other:?}"),
    }
}

#[test]
fn colliding_branch_names_are_rejected() {
    // Distinct ids, identical slugs: both would become branch task/auth-api.
    let prd = prd_of(&[("auth_api", &[]), ("auth-api", &["auth_api"])]);
    match TaskGraph::build(&prd) {
        Err(GraphError::DuplicateBranch { task, other }) => {
            assert_eq!(task.as_str(), "auth-api");
            assert_eq!(other.as_str(), "auth_api");
        }
        other => panic!("expected DuplicateBranch, got {other:?}"),
    }
}

#[test]
fn unknown_dependency_is_rejected() {
    let prd = prd_of(&[("a", &["ghost"])]);
    match TaskGraph::build(&prd) {
        Err(GraphError::UnknownDependency { task, dependency }) => {
            assert_eq!(task.as_str(), "a");
            assert_eq!(dependency.as_str(), "ghost");
        }
        other => panic!("expected UnknownDependency, got {other:?}"),
    }
}

#[test]
fn dependency_cycle_is_rejected() {
    let prd = prd_of(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
    assert!(matches!(TaskGraph::build(&prd), Err(GraphError::Cycle(_))));
}

#[test]
fn self_dependency_is_rejected() {
    let prd = prd_of(&[("a", &["a"])]);
    assert!(matches!(TaskGraph::build(&prd), Err(GraphError::Cycle(_))));
}

#[test]
fn ready_tasks_respect_dependencies_in_declaration_order() {
    let prd = prd_of(&[("a", &[]), ("b", &["a"]), ("c", &[])]);
    let mut graph = TaskGraph::build(&prd).unwrap();

    assert_eq!(graph.ready_tasks(), [id("a"), id("c")]);

    finish(&mut graph, "a");
    assert_eq!(graph.ready_tasks(), [id("b"), id("c")]);
    assert!(!graph.is_complete());

    finish(&mut graph, "b");
    finish(&mut graph, "c");
    assert!(graph.ready_tasks().is_empty());
    assert!(graph.is_complete());
}

#[test]
fn lifecycle_transitions_are_enforced() {
    let prd = prd_of(&[("a", &[])]);
    let mut graph = TaskGraph::build(&prd).unwrap();

    // Straight to Done from Pending is not a legal edge.
    match graph.mark(&id("a"), TaskStatus::Done) {
        Err(GraphError::InvalidTransition { task, from, to }) => {
            assert_eq!(task.as_str(), "a");
            assert_eq!(from, TaskStatus::Pending);
            assert_eq!(to, TaskStatus::Done);
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }

    // A task already under verification cannot be blocked, only pass or fail.
    dispatch(&mut graph, "a");
    graph.mark(&id("a"), TaskStatus::Verifying).unwrap();
    assert!(matches!(
        graph.mark(&id("a"), TaskStatus::Blocked),
        Err(GraphError::InvalidTransition { .. })
    ));

    assert!(matches!(
        graph.mark(&id("nope"), TaskStatus::Ready),
        Err(GraphError::UnknownTask(_))
    ));
}

#[test]
fn record_failure_retries_then_exhausts() {
    let prd = prd_of(&[("a", &[])]);
    let mut graph = TaskGraph::build(&prd).unwrap();

    dispatch(&mut graph, "a");
    let outcome = graph
        .record_failure(&id("a"), vec!["missing file out.txt".into()], 2)
        .unwrap();
    assert_eq!(outcome, FailureOutcome::Retry { attempt: 1 });
    let task = graph.task(&id("a")).unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.feedback, ["missing file out.txt"]);

    // The second attempt spends the budget; feedback is replaced, not
    // appended.
    dispatch(&mut graph, "a");
    let outcome = graph
        .record_failure(&id("a"), vec!["command failed: exit 1".into()], 2)
        .unwrap();
    assert_eq!(outcome, FailureOutcome::Exhausted { blocked: vec![] });
    let task = graph.task(&id("a")).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.feedback, ["command failed: exit 1"]);
    assert!(graph.ready_tasks().is_empty());
}

#[test]
fn exhaustion_blocks_transitive_dependents() {
    let prd = prd_of(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
    let mut graph = TaskGraph::build(&prd).unwrap();

    dispatch(&mut graph, "a");
    let outcome = graph
        .record_failure(&id("a"), vec!["stalled after 3 iterations".into()], 1)
        .unwrap();
    assert_eq!(
        outcome,
        FailureOutcome::Exhausted {
            blocked: vec![id("b"), id("c")]
        }
    );
    assert_eq!(graph.task(&id("b")).unwrap().status, TaskStatus::Blocked);
    assert_eq!(graph.task(&id("c")).unwrap().status, TaskStatus::Blocked);
    assert_eq!(graph.task(&id("d")).unwrap().status, TaskStatus::Pending);

    // The independent task is untouched and still runs to completion.
    assert_eq!(graph.ready_tasks(), [id("d")]);
    assert!(!graph.is_complete());
    finish(&mut graph, "d");
    assert!(graph.is_complete());

    assert_eq!(graph.ids_with_status(TaskStatus::Blocked), [id("b"), id("c")]);
    assert_eq!(graph.ids_with_status(TaskStatus::Failed), [id("a")]);
    assert_eq!(graph.ids_with_status(TaskStatus::Done), [id("d")]);
}
