//! Integration tests for propagation, dispatch and the client operations.
//!
//! Time is passed explicitly, so every scenario drives the sweep and the
//! claim/report cycle by hand.

use serde_json::{Value, json};
use task_graph_engine::config::EngineConfig;
use task_graph_engine::db::{Database, now_ms};
use task_graph_engine::engine::{Engine, ExecutionRequest};
use task_graph_engine::error::ErrorCode;
use task_graph_engine::types::{
    AttemptId, AttemptStatus, Queue, TASK_FLAG_CANCEL_REQUESTED, TASK_FLAG_RESUMED, Task,
    TaskFailure, TaskResult, TaskState, TaskTreeInput,
};

/// Helper to create a fresh in-memory database for testing.
fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

fn setup_engine() -> Engine {
    Engine::new(setup_db(), EngineConfig::default())
}

fn tree(value: Value) -> TaskTreeInput {
    serde_json::from_value(value).expect("Invalid task tree")
}

fn submit(engine: &Engine, value: Value) -> AttemptId {
    engine
        .submit("test", &json!({"run": 1}), &tree(value))
        .expect("Failed to submit")
}

fn default_queue(engine: &Engine) -> Queue {
    engine
        .db()
        .get_queue_by_name("default")
        .unwrap()
        .expect("default queue not created")
}

fn task(engine: &Engine, attempt_id: AttemptId, name: &str) -> Task {
    engine
        .db()
        .get_attempt_tasks(attempt_id)
        .unwrap()
        .into_iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("no task {}", name))
}

fn state(engine: &Engine, attempt_id: AttemptId, name: &str) -> TaskState {
    task(engine, attempt_id, name).state
}

fn claim(engine: &Engine, agent: &str, now: i64) -> Option<ExecutionRequest> {
    let queue = default_queue(engine);
    engine.claim(agent, queue.id, now).unwrap()
}

fn succeed(engine: &Engine, agent: &str, request: &ExecutionRequest, carry: Value) {
    let result = TaskResult {
        carry_params: carry,
        output: json!("ok"),
        ..TaskResult::default()
    };
    assert!(engine.report_success(agent, request, &result).unwrap());
}

fn fail(engine: &Engine, agent: &str, request: &ExecutionRequest, now: i64) {
    assert!(
        engine
            .report_failure(agent, request, &TaskFailure::new("boom"), now)
            .unwrap()
    );
}

/// Claim every runnable task, report success, and sweep until nothing moves.
fn drain(engine: &Engine, now: i64) {
    for _ in 0..100 {
        engine.run_until_idle(now, 100).unwrap();
        let Some(request) = claim(engine, "drain", now) else {
            return;
        };
        succeed(engine, "drain", &request, Value::Null);
    }
    panic!("attempt did not settle");
}

mod dependency_tests {
    use super::*;

    fn small_batch_engine() -> Engine {
        let config = EngineConfig {
            sweep_batch_size: 3,
            ..EngineConfig::default()
        };
        Engine::new(setup_db(), config)
    }

    #[test]
    fn blocked_waiters_do_not_starve_later_attempts() {
        let engine = small_batch_engine();
        let chain = submit(
            &engine,
            json!({
                "name": "chain",
                "children": [
                    {"name": "c0"},
                    {"name": "c1", "upstreams": [{"key": "c0"}]},
                    {"name": "c2", "upstreams": [{"key": "c1"}]},
                    {"name": "c3", "upstreams": [{"key": "c2"}]},
                    {"name": "c4", "upstreams": [{"key": "c3"}]}
                ]
            }),
        );
        let other = submit(&engine, json!({"name": "r2", "children": [{"name": "solo"}]}));
        let now = now_ms();

        // More tasks wait on c0 than fit in one page.
        let report = engine.run_sweep(now).unwrap();
        assert_eq!(report.groups_planned, 2);
        assert_eq!(report.enqueued, 2);
        assert_eq!(state(&engine, chain, "+chain+c0"), TaskState::Ready);
        assert_eq!(state(&engine, chain, "+chain+c4"), TaskState::Blocked);
        assert_eq!(state(&engine, other, "+r2"), TaskState::Planned);
        assert_eq!(state(&engine, other, "+r2+solo"), TaskState::Ready);

        drain(&engine, now);
        assert_eq!(engine.status(chain).unwrap().status, AttemptStatus::Success);
        assert_eq!(engine.status(other).unwrap().status, AttemptStatus::Success);
    }

    #[test]
    fn planned_waiters_do_not_starve_finished_tasks() {
        let engine = small_batch_engine();
        let quick = submit(&engine, json!({"name": "quick", "children": [{"name": "q"}]}));
        let deep = submit(
            &engine,
            json!({
                "name": "deep",
                "children": [{"name": "g1", "children": [
                    {"name": "g2", "children": [{"name": "g3", "children": [{"name": "x"}]}]}
                ]}]
            }),
        );
        let now = now_ms();
        engine.run_until_idle(now, 10).unwrap();

        let rq = claim(&engine, "w1", now).unwrap();
        let rx = claim(&engine, "w2", now).unwrap();
        assert_eq!(rq.task_name, "+quick+q");
        assert_eq!(rx.task_name, "+deep+g1+g2+g3+x");
        succeed(&engine, "w1", &rq, Value::Null);

        // Four groups of the later attempt are PLANNED above q.
        let report = engine.run_sweep(now).unwrap();
        assert_eq!(report.finished, 2);
        assert_eq!(report.attempts_done, 1);
        assert_eq!(engine.status(quick).unwrap().status, AttemptStatus::Success);
        assert_eq!(state(&engine, deep, "+deep+g1"), TaskState::Planned);

        succeed(&engine, "w2", &rx, Value::Null);
        engine.run_sweep(now).unwrap();
        assert_eq!(engine.status(deep).unwrap().status, AttemptStatus::Success);
    }

    #[test]
    fn downstream_waits_for_upstream() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "children": [
                    {"name": "a"},
                    {"name": "b", "upstreams": [{"key": "a"}]},
                    {"name": "c"}
                ]
            }),
        );
        let now = now_ms();

        let report = engine.run_sweep(now).unwrap();
        assert_eq!(report.groups_planned, 1);
        assert_eq!(report.enqueued, 2);
        assert_eq!(state(&engine, attempt, "+root"), TaskState::Planned);
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Ready);
        assert_eq!(state(&engine, attempt, "+root+b"), TaskState::Blocked);
        assert_eq!(state(&engine, attempt, "+root+c"), TaskState::Ready);

        let ra = claim(&engine, "w1", now).unwrap();
        let rc = claim(&engine, "w2", now).unwrap();
        assert_eq!(ra.task_name, "+root+a");
        assert_eq!(rc.task_name, "+root+c");
        assert_eq!(ra.params, json!({"run": 1}));
        assert!(claim(&engine, "w3", now).is_none());
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Running);

        succeed(&engine, "w1", &ra, json!({"from_a": true}));
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Planned);
        engine.run_until_idle(now, 10).unwrap();
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Success);
        assert_eq!(state(&engine, attempt, "+root+b"), TaskState::Ready);

        let rb = claim(&engine, "w1", now).unwrap();
        assert_eq!(rb.task_name, "+root+b");
        assert_eq!(rb.params, json!({"run": 1, "from_a": true}));

        succeed(&engine, "w1", &rb, Value::Null);
        succeed(&engine, "w2", &rc, json!({"from_c": 3}));
        let report = engine.run_until_idle(now, 10).unwrap();
        assert_eq!(report.attempts_done, 1);

        let summary = engine.status(attempt).unwrap();
        assert_eq!(summary.status, AttemptStatus::Success);
        assert!(summary.tasks.iter().all(|t| t.state == TaskState::Success));
        let root = task(&engine, attempt, "+root");
        assert_eq!(root.carry_params, json!({"from_a": true, "from_c": 3}));
        assert_eq!(default_queue(&engine).max_concurrency, 16);
        assert_eq!(engine.db().queue_depth(default_queue(&engine).id).unwrap(), 0);
    }

    #[test]
    fn nested_groups_pass_carry_params_down() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "children": [
                    {"name": "g", "children": [
                        {"name": "x"},
                        {"name": "y", "upstreams": [{"key": "x"}]}
                    ]},
                    {"name": "z", "upstreams": [{"key": "g"}]}
                ]
            }),
        );
        let now = now_ms();
        engine.run_until_idle(now, 10).unwrap();
        assert_eq!(state(&engine, attempt, "+root+g"), TaskState::Planned);

        let rx = claim(&engine, "w", now).unwrap();
        assert_eq!(rx.task_name, "+root+g+x");
        succeed(&engine, "w", &rx, json!({"x": 1}));
        engine.run_until_idle(now, 10).unwrap();

        let ry = claim(&engine, "w", now).unwrap();
        assert_eq!(ry.task_name, "+root+g+y");
        assert_eq!(ry.params, json!({"run": 1, "x": 1}));
        succeed(&engine, "w", &ry, json!({"y": 2}));
        engine.run_until_idle(now, 10).unwrap();

        assert_eq!(state(&engine, attempt, "+root+g"), TaskState::Success);
        let rz = claim(&engine, "w", now).unwrap();
        assert_eq!(rz.task_name, "+root+z");
        assert_eq!(rz.params, json!({"run": 1, "x": 1, "y": 2}));
        succeed(&engine, "w", &rz, Value::Null);
        engine.run_until_idle(now, 10).unwrap();

        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Success);
    }

    #[test]
    fn empty_group_finishes_in_one_sweep() {
        let engine = setup_engine();
        let attempt = submit(&engine, json!({"name": "root", "type": "group"}));

        let report = engine.run_sweep(now_ms()).unwrap();
        assert_eq!(report.groups_planned, 1);
        assert_eq!(report.finished, 1);
        assert_eq!(report.attempts_done, 1);
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Success);
    }

    #[test]
    fn single_action_root_runs() {
        let engine = setup_engine();
        let attempt = submit(&engine, json!({"name": "only", "config": {"sh": "true"}}));
        let now = now_ms();

        engine.run_sweep(now).unwrap();
        let request = claim(&engine, "w", now).unwrap();
        assert_eq!(request.task_name, "+only");
        assert_eq!(request.config, json!({"sh": "true"}));
        succeed(&engine, "w", &request, Value::Null);
        engine.run_until_idle(now, 10).unwrap();

        let summary = engine.status(attempt).unwrap();
        assert_eq!(summary.status, AttemptStatus::Success);
        assert!(summary.attempt.finished_at.is_some());
    }

    #[test]
    fn submit_rejects_unknown_upstream() {
        let engine = setup_engine();
        let err = engine
            .submit(
                "bad",
                &Value::Null,
                &tree(json!({"name": "root", "children": [{"name": "a", "upstreams": [{"key": "a"}]}]})),
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownUpstream);
    }

    #[test]
    fn tasks_go_to_their_named_queue_and_resource_type() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "children": [{"name": "load", "queue": "etl", "resource_type": "warehouse", "priority": 3}]
            }),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();

        let queue = engine.db().get_queue_by_name("etl").unwrap().unwrap();
        let resource_types = engine.db().list_resource_types(queue.id).unwrap();
        assert_eq!(resource_types.len(), 1);
        assert_eq!(resource_types[0].name, "warehouse");

        let load = task(&engine, attempt, "+root+load");
        let (item, lock) = engine.db().get_task_lock(load.id).unwrap().unwrap();
        assert_eq!(item.queue_id, queue.id);
        assert_eq!(item.priority, 3);
        assert_eq!(lock.resource_type_id, Some(resource_types[0].id));
        assert_eq!(item.data["task_name"], json!("+root+load"));

        assert!(engine.db().get_queue_by_name("default").unwrap().is_none());
        let request = engine.claim("w", queue.id, now).unwrap().unwrap();
        assert_eq!(request.task_id, load.id);
    }
}

mod retry_tests {
    use super::*;

    #[test]
    fn retries_until_success_within_limit() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "children": [{"name": "flaky", "retry": {"limit": 2, "interval_secs": 0}}]
            }),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();

        let first = claim(&engine, "w", now).unwrap();
        assert_eq!(first.retry_count, 0);
        fail(&engine, "w", &first, now);
        let flaky = task(&engine, attempt, "+root+flaky");
        assert_eq!(flaky.state, TaskState::RetryWaiting);
        assert_eq!(flaky.retry_at, Some(now));
        assert_eq!(flaky.error.unwrap().entries[0].message, "boom");

        let second = claim(&engine, "w", now).unwrap();
        assert_eq!(second.task_id, first.task_id);
        assert_eq!(second.retry_count, 1);
        fail(&engine, "w", &second, now);

        // The sweep may move the task back to READY before the claim.
        let report = engine.run_sweep(now).unwrap();
        assert_eq!(report.retries_resumed, 1);
        assert_eq!(state(&engine, attempt, "+root+flaky"), TaskState::Ready);

        let third = claim(&engine, "w", now).unwrap();
        assert_eq!(third.retry_count, 2);
        let (_, lock) = engine.db().get_task_lock(third.task_id).unwrap().unwrap();
        assert_eq!(lock.retry_count, 2);

        succeed(&engine, "w", &third, Value::Null);
        engine.run_until_idle(now, 10).unwrap();

        let flaky = task(&engine, attempt, "+root+flaky");
        assert_eq!(flaky.state, TaskState::Success);
        assert_eq!(flaky.error, None);
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Success);
    }

    #[test]
    fn backoff_parks_the_lock() {
        let engine = setup_engine();
        submit(
            &engine,
            json!({
                "name": "root",
                "children": [{"name": "slow", "retry": {"limit": 1, "interval_secs": 30}}]
            }),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();

        let request = claim(&engine, "w", now).unwrap();
        fail(&engine, "w", &request, now);

        assert!(claim(&engine, "w", now + 29_999).is_none());
        assert_eq!(engine.run_sweep(now + 29_999).unwrap().retries_resumed, 0);
        let again = claim(&engine, "w", now + 30_000).unwrap();
        assert_eq!(again.task_id, request.task_id);
    }

    #[test]
    fn exhausted_retries_fail_the_group() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({"name": "root", "children": [{"name": "a"}, {"name": "b"}]}),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();

        let ra = claim(&engine, "w", now).unwrap();
        let rb = claim(&engine, "w", now).unwrap();
        fail(&engine, "w", &ra, now);
        succeed(&engine, "w", &rb, Value::Null);

        let a = task(&engine, attempt, "+root+a");
        assert_eq!(a.state, TaskState::Planned);
        engine.run_until_idle(now, 10).unwrap();

        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Error);
        assert_eq!(state(&engine, attempt, "+root+b"), TaskState::Success);
        let summary = engine.status(attempt).unwrap();
        assert_eq!(summary.status, AttemptStatus::Error);
        let root = task(&engine, attempt, "+root");
        assert_eq!(root.state, TaskState::GroupError);
        let error = summary.error.unwrap();
        assert_eq!(error.entries.len(), 1);
        assert_eq!(error.entries[0].task_name, "+root+a");
    }

    #[test]
    fn executor_interval_overrides_policy() {
        let engine = setup_engine();
        submit(
            &engine,
            json!({
                "name": "root",
                "children": [{"name": "a", "retry": {"limit": 1, "interval_secs": 600}}]
            }),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();

        let request = claim(&engine, "w", now).unwrap();
        let failure = TaskFailure {
            retry_interval_secs: Some(5),
            ..TaskFailure::new("rate limited")
        };
        assert!(engine.report_failure("w", &request, &failure, now).unwrap());
        assert!(claim(&engine, "w", now + 5_000).is_some());
    }
}

mod short_circuit_tests {
    use super::*;

    #[test]
    fn failed_upstream_skips_downstream_chain() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "children": [
                    {"name": "a"},
                    {"name": "b", "upstreams": [{"key": "a"}]},
                    {"name": "c", "upstreams": [{"key": "b"}]}
                ]
            }),
        );
        let now = now_ms();
        let first = engine.run_sweep(now).unwrap();
        assert_eq!(first.enqueued, 1);

        let ra = claim(&engine, "w", now).unwrap();
        fail(&engine, "w", &ra, now);
        let report = engine.run_until_idle(now, 10).unwrap();
        assert_eq!(report.short_circuited, 2);
        assert_eq!(report.enqueued, 0);

        assert_eq!(state(&engine, attempt, "+root+b"), TaskState::Error);
        assert_eq!(state(&engine, attempt, "+root+c"), TaskState::Error);
        assert_eq!(engine.db().queue_depth(default_queue(&engine).id).unwrap(), 0);

        let error = engine.status(attempt).unwrap().error.unwrap();
        let names: Vec<&str> = error.entries.iter().map(|e| e.task_name.as_str()).collect();
        assert_eq!(names, vec!["+root+a", "+root+b", "+root+c"]);
        assert!(error.entries[1].message.contains("+root+a"));
    }

    #[test]
    fn ignored_error_edge_lets_downstream_run() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "children": [
                    {"name": "a"},
                    {"name": "cleanup", "upstreams": [{"key": "a", "on_error": "ignore"}]}
                ]
            }),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();
        let ra = claim(&engine, "w", now).unwrap();
        fail(&engine, "w", &ra, now);
        engine.run_until_idle(now, 10).unwrap();

        let cleanup = claim(&engine, "w", now).unwrap();
        assert_eq!(cleanup.task_name, "+root+cleanup");
        succeed(&engine, "w", &cleanup, Value::Null);
        engine.run_until_idle(now, 10).unwrap();

        // The error still reaches the parent.
        assert_eq!(state(&engine, attempt, "+root"), TaskState::GroupError);
    }

    #[test]
    fn ignore_child_errors_keeps_group_successful() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "ignore_child_errors": true,
                "children": [{"name": "a"}, {"name": "b"}]
            }),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();
        let ra = claim(&engine, "w", now).unwrap();
        let rb = claim(&engine, "w", now).unwrap();
        fail(&engine, "w", &ra, now);
        succeed(&engine, "w", &rb, json!({"b": true}));
        engine.run_until_idle(now, 10).unwrap();

        let root = task(&engine, attempt, "+root");
        assert_eq!(root.state, TaskState::Success);
        assert_eq!(root.carry_params, json!({"b": true}));
        assert_eq!(root.error.unwrap().entries.len(), 1);
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Success);
    }

    #[test]
    fn canceled_upstream_follows_edge_policy() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "children": [
                    {"name": "a"},
                    {"name": "strict", "upstreams": [{"key": "a", "on_canceled": "fail"}]},
                    {"name": "lenient", "upstreams": [{"key": "a"}]},
                    {"name": "anyway", "upstreams": [{"key": "a", "on_canceled": "ignore"}]}
                ]
            }),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();
        let a = task(&engine, attempt, "+root+a");
        assert!(engine.db().set_state(a.id, TaskState::Ready, TaskState::Canceled).unwrap());

        let report = engine.run_sweep(now).unwrap();
        assert_eq!(report.short_circuited, 2);
        assert_eq!(report.enqueued, 1);
        assert_eq!(state(&engine, attempt, "+root+strict"), TaskState::Error);
        assert_eq!(state(&engine, attempt, "+root+lenient"), TaskState::Canceled);
        assert_eq!(state(&engine, attempt, "+root+anyway"), TaskState::Ready);
    }

    #[test]
    fn attempt_cancel_reaches_blocked_downstream() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "children": [
                    {"name": "a"},
                    {"name": "b", "upstreams": [{"key": "a", "on_canceled": "fail"}]}
                ]
            }),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();
        engine.cancel(attempt).unwrap();
        engine.run_until_idle(now, 10).unwrap();

        // b is canceled directly, before its edge is judged.
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Canceled);
        assert_eq!(state(&engine, attempt, "+root+b"), TaskState::Canceled);
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Canceled);
    }
}

mod cancel_tests {
    use super::*;

    #[test]
    fn cancel_skips_pending_and_flags_running() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({"name": "root", "children": [{"name": "a"}, {"name": "b"}, {"name": "c"}]}),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();
        let ra = claim(&engine, "w", now).unwrap();

        assert!(engine.cancel(attempt).unwrap());
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Canceling);

        let report = engine.run_sweep(now).unwrap();
        assert_eq!(report.canceled, 2);
        assert_eq!(state(&engine, attempt, "+root+b"), TaskState::Canceled);
        assert_eq!(state(&engine, attempt, "+root+c"), TaskState::Canceled);

        let a = task(&engine, attempt, "+root+a");
        assert_eq!(a.state, TaskState::Running);
        assert!(a.has_flag(TASK_FLAG_CANCEL_REQUESTED));
        assert!(claim(&engine, "w2", now).is_none());

        // The running task finishes on its own.
        succeed(&engine, "w", &ra, Value::Null);
        engine.run_until_idle(now, 10).unwrap();
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Success);
        assert_eq!(state(&engine, attempt, "+root"), TaskState::Canceled);
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Canceled);
        assert_eq!(engine.db().queue_depth(default_queue(&engine).id).unwrap(), 0);

        assert!(!engine.cancel(attempt).unwrap());
    }

    #[test]
    fn cancel_unknown_attempt() {
        let engine = setup_engine();
        assert_eq!(engine.cancel(7).unwrap_err().code, ErrorCode::AttemptNotFound);
        assert_eq!(engine.status(7).unwrap_err().code, ErrorCode::AttemptNotFound);
    }

    #[test]
    fn cancel_discards_retry_waiting_task() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "children": [{"name": "a", "retry": {"limit": 3, "interval_secs": 60}}]
            }),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();
        let ra = claim(&engine, "w", now).unwrap();
        fail(&engine, "w", &ra, now);
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::RetryWaiting);

        engine.cancel(attempt).unwrap();
        engine.run_until_idle(now, 10).unwrap();
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Canceled);
        assert!(engine.db().get_task_lock(ra.task_id).unwrap().is_none());
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Canceled);
    }
}

mod lease_tests {
    use super::*;

    fn short_lease_engine() -> Engine {
        let config = EngineConfig {
            lease_duration_secs: 0,
            ..EngineConfig::default()
        };
        Engine::new(setup_db(), config)
    }

    #[test]
    fn report_from_lost_lease_is_dropped() {
        let engine = short_lease_engine();
        let attempt = submit(
            &engine,
            json!({"name": "root", "children": [{"name": "a", "retry": {"limit": 1}}]}),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();

        let stale = claim(&engine, "w1", now).unwrap();
        let taken = claim(&engine, "w2", now).unwrap();
        assert_eq!(taken.task_id, stale.task_id);
        assert_eq!(stale.retry_count, 0);
        assert_eq!(taken.retry_count, 1);
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Running);

        let result = TaskResult::default();
        assert!(!engine.report_success("w1", &stale, &result).unwrap());
        assert!(
            !engine
                .report_failure("w1", &stale, &TaskFailure::new("late"), now)
                .unwrap()
        );
        assert!(!engine.heartbeat("w1", &stale, now).unwrap());
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Running);

        assert!(engine.report_success("w2", &taken, &result).unwrap());
        engine.run_until_idle(now, 10).unwrap();
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Success);
    }

    #[test]
    fn repeated_lease_loss_fails_the_task() {
        let engine = short_lease_engine();
        let attempt = submit(
            &engine,
            json!({"name": "root", "children": [{"name": "a", "retry": {"limit": 1}}]}),
        );
        let now = now_ms();
        engine.run_sweep(now).unwrap();

        let first = claim(&engine, "w1", now).unwrap();
        let second = claim(&engine, "w2", now).unwrap();
        assert_eq!(second.task_id, first.task_id);

        // The second takeover exceeds the retry limit.
        assert!(claim(&engine, "w3", now).is_none());
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Planned);
        assert!(engine.db().get_task_lock(first.task_id).unwrap().is_none());
        assert!(!engine.report_success("w2", &second, &TaskResult::default()).unwrap());

        engine.run_until_idle(now, 10).unwrap();
        let a = task(&engine, attempt, "+root+a");
        assert_eq!(a.state, TaskState::Error);
        assert_eq!(a.error.unwrap().entries[0].message, "lease expired 2 times");
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Error);
    }

    #[test]
    fn lease_loss_without_retries_fails_on_takeover() {
        let engine = short_lease_engine();
        let attempt = submit(&engine, json!({"name": "root", "children": [{"name": "a"}]}));
        let now = now_ms();
        engine.run_sweep(now).unwrap();

        assert!(claim(&engine, "w1", now).is_some());
        assert!(claim(&engine, "w2", now).is_none());
        engine.run_until_idle(now, 10).unwrap();
        assert_eq!(state(&engine, attempt, "+root+a"), TaskState::Error);
    }

    #[test]
    fn claim_discards_items_of_finished_tasks() {
        let engine = setup_engine();
        let attempt = submit(&engine, json!({"name": "root", "children": [{"name": "a"}]}));
        let now = now_ms();
        engine.run_sweep(now).unwrap();

        // Another process finished the task without releasing the lock.
        let a = task(&engine, attempt, "+root+a");
        assert!(engine.db().set_state(a.id, TaskState::Ready, TaskState::Canceled).unwrap());

        assert!(claim(&engine, "w", now).is_none());
        assert!(engine.db().get_task_lock(a.id).unwrap().is_none());
    }
}

mod attempt_lifecycle_tests {
    use super::*;

    #[test]
    fn retry_attempt_resumes_succeeded_subtrees() {
        let engine = setup_engine();
        let first = submit(
            &engine,
            json!({
                "name": "root",
                "children": [
                    {"name": "a"},
                    {"name": "g", "children": [{"name": "b"}, {"name": "c"}]},
                    {"name": "d", "upstreams": [{"key": "g"}]}
                ]
            }),
        );
        let now = now_ms();
        engine.run_until_idle(now, 10).unwrap();
        while let Some(request) = claim(&engine, "w", now) {
            match request.task_name.as_str() {
                "+root+g+c" => fail(&engine, "w", &request, now),
                "+root+g+b" => succeed(&engine, "w", &request, json!({"b": 1})),
                _ => succeed(&engine, "w", &request, json!({"a": 1})),
            }
            engine.run_until_idle(now, 10).unwrap();
        }
        assert_eq!(engine.status(first).unwrap().status, AttemptStatus::Error);
        assert_eq!(state(&engine, first, "+root+d"), TaskState::Error);

        let second = engine.retry(first, Some("second"), None).unwrap();
        let summary = engine.status(second).unwrap();
        assert_eq!(summary.attempt.name, "second");
        assert_eq!(summary.attempt.params, json!({"run": 1}));

        let a = task(&engine, second, "+root+a");
        assert_eq!(a.state, TaskState::Success);
        assert!(a.has_flag(TASK_FLAG_RESUMED));
        assert_eq!(a.carry_params, json!({"a": 1}));
        let b = task(&engine, second, "+root+g+b");
        assert_eq!(b.state, TaskState::Success);
        assert!(b.has_flag(TASK_FLAG_RESUMED));
        for name in ["+root", "+root+g", "+root+g+c", "+root+d"] {
            assert_eq!(state(&engine, second, name), TaskState::Blocked, "{}", name);
        }
        let d = task(&engine, second, "+root+d");
        let g = task(&engine, second, "+root+g");
        assert_eq!(engine.db().get_upstreams(d.id).unwrap(), vec![g.id]);

        engine.run_until_idle(now, 10).unwrap();
        let rc = claim(&engine, "w", now).unwrap();
        assert_eq!(rc.task_name, "+root+g+c");
        succeed(&engine, "w", &rc, json!({"c": 1}));
        engine.run_until_idle(now, 10).unwrap();

        let rd = claim(&engine, "w", now).unwrap();
        assert_eq!(rd.task_name, "+root+d");
        assert_eq!(rd.params, json!({"run": 1, "b": 1, "c": 1}));
        succeed(&engine, "w", &rd, Value::Null);
        engine.run_until_idle(now, 10).unwrap();
        assert_eq!(engine.status(second).unwrap().status, AttemptStatus::Success);
    }

    /// Runs every task of `attempt` to success, handing each the carry
    /// `{<short name>: 1}`.
    fn succeed_all(engine: &Engine, attempt: AttemptId, now: i64) {
        engine.run_until_idle(now, 10).unwrap();
        while let Some(request) = claim(engine, "w", now) {
            let short = request.task_name.rsplit('+').next().unwrap().to_string();
            let mut carry = serde_json::Map::new();
            carry.insert(short, json!(1));
            succeed(engine, "w", &request, Value::Object(carry));
            engine.run_until_idle(now, 10).unwrap();
        }
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Success);
    }

    #[test]
    fn retry_from_task_reruns_it_and_everything_after() {
        let engine = setup_engine();
        let first = submit(
            &engine,
            json!({
                "name": "root",
                "children": [
                    {"name": "a"},
                    {"name": "b", "upstreams": [{"key": "a"}]},
                    {"name": "c", "upstreams": [{"key": "b"}]},
                    {"name": "d"}
                ]
            }),
        );
        let now = now_ms();
        succeed_all(&engine, first, now);

        let second = engine.retry(first, None, Some("+root+b")).unwrap();
        let a = task(&engine, second, "+root+a");
        assert_eq!(a.state, TaskState::Success);
        assert!(a.has_flag(TASK_FLAG_RESUMED));
        for name in ["+root", "+root+b", "+root+c", "+root+d"] {
            assert_eq!(state(&engine, second, name), TaskState::Blocked, "{}", name);
        }

        engine.run_until_idle(now, 10).unwrap();
        let rb = claim(&engine, "w", now).unwrap();
        assert_eq!(rb.task_name, "+root+b");
        assert_eq!(rb.params, json!({"run": 1, "a": 1}));
        succeed(&engine, "w", &rb, Value::Null);
        drain(&engine, now);
        assert_eq!(engine.status(second).unwrap().status, AttemptStatus::Success);
    }

    #[test]
    fn retry_from_nested_task_keeps_earlier_subtrees() {
        let engine = setup_engine();
        let first = submit(
            &engine,
            json!({
                "name": "root",
                "children": [
                    {"name": "a"},
                    {"name": "g", "children": [{"name": "b"}, {"name": "c"}]},
                    {"name": "d"}
                ]
            }),
        );
        let now = now_ms();
        succeed_all(&engine, first, now);

        let second = engine.retry(first, None, Some("+root+g+c")).unwrap();
        for name in ["+root+a", "+root+g+b"] {
            assert_eq!(state(&engine, second, name), TaskState::Success, "{}", name);
        }
        for name in ["+root", "+root+g", "+root+g+c", "+root+d"] {
            assert_eq!(state(&engine, second, name), TaskState::Blocked, "{}", name);
        }

        let err = engine.retry(first, None, Some("+root+zz")).unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskNotFound);
    }

    #[test]
    fn generated_subtasks_run_under_their_action() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({
                "name": "root",
                "children": [
                    {"name": "gen"},
                    {"name": "after", "upstreams": [{"key": "gen"}]}
                ]
            }),
        );
        let now = now_ms();
        engine.run_until_idle(now, 10).unwrap();

        let rg = claim(&engine, "w", now).unwrap();
        let result = TaskResult {
            carry_params: json!({"gen": 1}),
            subtasks: vec![
                tree(json!({"name": "x"})),
                tree(json!({"name": "y", "upstreams": [{"key": "x"}]})),
            ],
            ..TaskResult::default()
        };
        assert!(engine.report_success("w", &rg, &result).unwrap());
        assert_eq!(state(&engine, attempt, "+root+gen"), TaskState::Planned);
        let gen_id = task(&engine, attempt, "+root+gen").id;
        let children = engine.db().get_children(gen_id).unwrap();
        let names: Vec<&str> = children.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["+root+gen+x", "+root+gen+y"]);

        engine.run_until_idle(now, 10).unwrap();
        assert_eq!(state(&engine, attempt, "+root+gen+y"), TaskState::Blocked);
        let rx = claim(&engine, "w", now).unwrap();
        assert_eq!(rx.task_name, "+root+gen+x");
        succeed(&engine, "w", &rx, json!({"x": 1}));
        engine.run_until_idle(now, 10).unwrap();

        let ry = claim(&engine, "w", now).unwrap();
        assert_eq!(ry.task_name, "+root+gen+y");
        succeed(&engine, "w", &ry, json!({"y": 2}));
        engine.run_until_idle(now, 10).unwrap();

        let generator = task(&engine, attempt, "+root+gen");
        assert_eq!(generator.state, TaskState::Success);
        assert_eq!(generator.carry_params, json!({"gen": 1, "x": 1, "y": 2}));
        let ra = claim(&engine, "w", now).unwrap();
        assert_eq!(ra.task_name, "+root+after");
        assert_eq!(ra.params, json!({"run": 1, "gen": 1, "x": 1, "y": 2}));
    }

    #[test]
    fn invalid_subtasks_fail_the_action() {
        let engine = setup_engine();
        let attempt = submit(&engine, json!({"name": "root", "children": [{"name": "gen"}]}));
        let now = now_ms();
        engine.run_until_idle(now, 10).unwrap();

        let rg = claim(&engine, "w", now).unwrap();
        let result = TaskResult {
            subtasks: vec![tree(json!({"name": "y", "upstreams": [{"key": "nope"}]}))],
            ..TaskResult::default()
        };
        assert!(engine.report_success("w", &rg, &result).unwrap());
        let generator = task(&engine, attempt, "+root+gen");
        assert!(engine.db().get_children(generator.id).unwrap().is_empty());

        engine.run_until_idle(now, 10).unwrap();
        let generator = task(&engine, attempt, "+root+gen");
        assert_eq!(generator.state, TaskState::Error);
        assert!(generator.error.unwrap().entries[0].message.starts_with("invalid subtasks"));
    }

    #[test]
    fn retry_drops_subtasks_of_rerun_actions() {
        let engine = setup_engine();
        let first = submit(&engine, json!({"name": "root", "children": [{"name": "gen"}]}));
        let now = now_ms();
        engine.run_until_idle(now, 10).unwrap();

        let rg = claim(&engine, "w", now).unwrap();
        let result = TaskResult {
            subtasks: vec![tree(json!({"name": "x"}))],
            ..TaskResult::default()
        };
        assert!(engine.report_success("w", &rg, &result).unwrap());
        engine.run_until_idle(now, 10).unwrap();
        let rx = claim(&engine, "w", now).unwrap();
        fail(&engine, "w", &rx, now);
        engine.run_until_idle(now, 10).unwrap();
        assert_eq!(state(&engine, first, "+root+gen"), TaskState::GroupError);
        assert_eq!(engine.status(first).unwrap().status, AttemptStatus::Error);

        let second = engine.retry(first, None, None).unwrap();
        let names: Vec<String> = engine
            .status(second)
            .unwrap()
            .tasks
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["+root", "+root+gen"]);
    }

    #[test]
    fn retry_of_running_attempt_is_rejected() {
        let engine = setup_engine();
        let attempt = submit(&engine, json!({"name": "root"}));
        assert_eq!(engine.retry(attempt, None, None).unwrap_err().code, ErrorCode::InvalidState);
    }

    #[test]
    fn archive_after_completion() {
        let engine = setup_engine();
        let attempt = submit(
            &engine,
            json!({"name": "root", "children": [{"name": "a"}, {"name": "b"}]}),
        );
        assert_eq!(engine.archive(attempt).unwrap_err().code, ErrorCode::InvalidState);

        drain(&engine, now_ms());
        assert_eq!(engine.status(attempt).unwrap().status, AttemptStatus::Success);
        assert_eq!(engine.archive(attempt).unwrap(), 3);

        let summary = engine.status(attempt).unwrap();
        assert!(summary.tasks.is_empty());
        assert_eq!(summary.status, AttemptStatus::Success);
        assert_eq!(engine.db().get_archived_tasks(attempt).unwrap().unwrap().len(), 3);
        assert_eq!(engine.retry(attempt, None, None).unwrap_err().code, ErrorCode::InvalidState);
    }

    #[test]
    fn define_resource_type_requires_queue() {
        let engine = setup_engine();
        let err = engine
            .define_resource_type("missing", "db", 2, Default::default())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::QueueNotFound);

        assert_eq!(engine.define_queue("q", 0).unwrap_err().code, ErrorCode::InvalidInput);
        let queue = engine.define_queue("q", 4).unwrap();
        let rt = engine.define_resource_type("q", "db", 2, Default::default()).unwrap();
        assert_eq!(rt.queue_id, queue.id);
        assert_eq!(engine.ensure_queue("q").unwrap().max_concurrency, 4);
    }
}

mod multi_process_tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use task_graph_engine::engine::SweepReport;

    fn add(total: &mut SweepReport, report: SweepReport) {
        total.enqueued += report.enqueued;
        total.groups_planned += report.groups_planned;
        total.finished += report.finished;
        total.attempts_done += report.attempts_done;
    }

    #[test]
    fn concurrent_sweeps_move_each_task_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let engines: Vec<Engine> = (0..3)
            .map(|_| Engine::new(Database::open(&path).unwrap(), EngineConfig::default()))
            .collect();
        let attempt = submit(
            &engines[0],
            json!({"name": "root", "children": [{"name": "a"}, {"name": "b"}, {"name": "c"}]}),
        );

        let now = now_ms();
        let barrier = Arc::new(Barrier::new(engines.len()));
        let joins: Vec<_> = engines
            .iter()
            .cloned()
            .map(|engine| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    engine.run_until_idle(now, 10).expect("sweep failed")
                })
            })
            .collect();

        let mut total = SweepReport::default();
        for join in joins {
            add(&mut total, join.join().expect("thread panicked"));
        }
        add(&mut total, engines[0].run_until_idle(now, 10).unwrap());

        assert_eq!(total.groups_planned, 1);
        assert_eq!(total.enqueued, 3);
        assert_eq!(engines[1].db().queue_depth(default_queue(&engines[1]).id).unwrap(), 3);

        drain(&engines[2], now);
        assert_eq!(engines[1].status(attempt).unwrap().status, AttemptStatus::Success);
    }
}
