//! Restart recovery against an on-disk store.

use std::collections::BTreeSet;
use std::path::Path;

use taskgrid_coordinator::Pool;
use taskgrid_core::{GridConfig, Resources};
use taskgrid_health::Liveness;
use taskgrid_state::{AgentStatus, MetricsSample, ScalingDirection, StateStore, TaskSpec, TaskStatus};

const SEC: u64 = 1000;

fn open(path: &Path, now: u64) -> Pool {
    let store = StateStore::open(path).unwrap();
    Pool::open(GridConfig::default(), store, now).unwrap()
}

#[test]
fn restart_restores_state_and_waits_for_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskgrid.redb");

    let (running, queued, done) = {
        let pool = open(&path, 0);
        pool.register("a", Resources::cpu(2), BTreeSet::new(), 0).unwrap();
        let done = pool.submit(TaskSpec::new(0, Resources::cpu(1)), 0).unwrap();
        let running = pool.submit(TaskSpec::new(1, Resources::cpu(1)), 0).unwrap();
        let queued = pool.submit(TaskSpec::new(2, Resources::cpu(1)), 0).unwrap();
        assert_eq!(pool.assign_next_batch(SEC).len(), 2);
        pool.notify_completed(&done, Some("r".into()), 2 * SEC).unwrap();
        pool.notify_started(&running, "a", 3 * SEC).unwrap();
        pool.heartbeat("a", 4 * SEC).unwrap();
        (running, queued, done)
    };

    let pool = open(&path, 10 * SEC);
    let restored = pool.restored();
    assert_eq!(restored.agents, 1);
    assert_eq!(restored.tasks, 3);
    assert_eq!(restored.reservations, 1);
    assert_eq!(restored.requeued, 0);

    assert_eq!(pool.status(&done), Some(TaskStatus::Completed));
    assert_eq!(pool.status(&running), Some(TaskStatus::Running));
    assert_eq!(pool.status(&queued), Some(TaskStatus::Pending));
    assert_eq!(pool.agent("a").unwrap().last_heartbeat, 4 * SEC);
    assert!(pool.ledger().reservation_for_task(&running).is_some());

    // Unconfirmed agents receive no work.
    assert_eq!(pool.health().liveness("a"), Some(Liveness::Unconfirmed));
    assert!(pool.assign_next_batch(11 * SEC).is_empty());

    pool.heartbeat("a", 12 * SEC).unwrap();
    assert_eq!(pool.health().liveness("a"), Some(Liveness::Healthy));
    let made = pool.assign_next_batch(13 * SEC);
    assert_eq!(made.len(), 1);
    assert_eq!(made[0].task_id, queued);

    // New registrations continue the sequence.
    let b = pool.register("b", Resources::cpu(1), BTreeSet::new(), 14 * SEC).unwrap();
    assert_eq!(b.registration_seq, 1);
}

#[test]
fn agent_silent_after_restart_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskgrid.redb");

    let task = {
        let pool = open(&path, 0);
        pool.register("a", Resources::cpu(2), BTreeSet::new(), 0).unwrap();
        let task = pool.submit(TaskSpec::new(1, Resources::cpu(1)), 0).unwrap();
        pool.assign_next_batch(SEC);
        task
    };

    // Heartbeat interval is 10s: the deadline is one interval after restart.
    let pool = open(&path, 100 * SEC);
    assert!(pool.sweep_health(110 * SEC).unhealthy.is_empty());
    let report = pool.sweep_health(110 * SEC + 1);
    assert_eq!(report.unhealthy, vec!["a".to_string()]);
    assert_eq!(report.requeued, vec![task.clone()]);
    assert_eq!(pool.agent("a").unwrap().status, AgentStatus::Unhealthy);

    let record = pool.task(&task).unwrap();
    assert_eq!(record.status, TaskStatus::Pending);
    assert_eq!(record.retry_count, 1);
    assert!(pool.ledger().reservations_for("a").is_empty());
}

#[test]
fn scaling_decision_and_metrics_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskgrid.redb");

    let decision = {
        let pool = open(&path, 0);
        for i in 0..=6u64 {
            pool.metrics().record_sample(MetricsSample {
                at: i * 10 * SEC,
                utilization: 0.95,
                queue_depth: 0,
                agents: 2,
                schedulable_agents: 2,
            });
        }
        pool.evaluate_scaling(60 * SEC)
    };
    assert_eq!(decision.direction, ScalingDirection::Up);

    let pool = open(&path, 70 * SEC);
    let latest = pool.latest_decision().unwrap();
    assert_eq!(latest.at, decision.at);
    assert_eq!(latest.direction, ScalingDirection::Up);
    assert_eq!(latest.magnitude, decision.magnitude);
    assert_eq!(latest.cooldown_until, decision.cooldown_until);
    assert_eq!(pool.metrics().window(0).len(), 7);

    // The restored cooldown still applies.
    assert!(pool.evaluate_scaling(80 * SEC).is_none());
    assert!(80 * SEC < decision.cooldown_until);
}

#[test]
fn orphaned_reservations_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskgrid.redb");

    let task = {
        let pool = open(&path, 0);
        pool.register("a", Resources::cpu(2), BTreeSet::new(), 0).unwrap();
        let task = pool.submit(TaskSpec::new(1, Resources::cpu(1)), 0).unwrap();
        pool.assign_next_batch(SEC);
        task
    };

    // Simulate a crash between the task update and the reservation release.
    {
        let store = StateStore::open(&path).unwrap();
        let mut record = store.get_task(&task).unwrap().unwrap();
        record.status = TaskStatus::Completed;
        store.put_task(&record).unwrap();
    }

    let pool = open(&path, 5 * SEC);
    assert_eq!(pool.restored().orphaned, 1);
    assert!(pool.ledger().reservations_for("a").is_empty());
    assert_eq!(pool.ledger().free_for("a"), Some(Resources::cpu(2)));
}
