//! StateStore: redb-backed state persistence for TaskGrid.
//!
//! Provides typed CRUD operations over agents, tasks, reservations,
//! scaling decisions, and metrics samples. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [AGENTS, TASKS, RESERVATIONS, DECISIONS, METRICS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }

    /// Newest-first scan of a time-keyed table.
    fn list_recent<T: DeserializeOwned>(&self, table: Table, limit: usize) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))?.rev() {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Insert or update an agent record.
    pub fn put_agent(&self, agent: &AgentRecord) -> StateResult<()> {
        self.put(AGENTS, &agent.id, agent)
    }

    pub fn get_agent(&self, agent_id: &str) -> StateResult<Option<AgentRecord>> {
        self.get(AGENTS, agent_id)
    }

    pub fn list_agents(&self) -> StateResult<Vec<AgentRecord>> {
        self.list(AGENTS)
    }

    /// Delete an agent by ID. Returns true if it existed.
    pub fn delete_agent(&self, agent_id: &str) -> StateResult<bool> {
        let existed = self.delete(AGENTS, agent_id)?;
        debug!(%agent_id, existed, "agent deleted");
        Ok(existed)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or update a task record.
    pub fn put_task(&self, task: &TaskRecord) -> StateResult<()> {
        self.put(TASKS, &task.id, task)
    }

    pub fn get_task(&self, task_id: &str) -> StateResult<Option<TaskRecord>> {
        self.get(TASKS, task_id)
    }

    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        self.list(TASKS)
    }

    pub fn delete_task(&self, task_id: &str) -> StateResult<bool> {
        self.delete(TASKS, task_id)
    }

    // ── Reservations ───────────────────────────────────────────────

    pub fn put_reservation(&self, reservation: &Reservation) -> StateResult<()> {
        self.put(RESERVATIONS, &reservation.task_id, reservation)
    }

    pub fn get_reservation(&self, task_id: &str) -> StateResult<Option<Reservation>> {
        self.get(RESERVATIONS, task_id)
    }

    pub fn list_reservations(&self) -> StateResult<Vec<Reservation>> {
        self.list(RESERVATIONS)
    }

    /// Delete the reservation held for a task. Returns true if it existed.
    pub fn delete_reservation(&self, task_id: &str) -> StateResult<bool> {
        self.delete(RESERVATIONS, task_id)
    }

    // ── Scaling decisions ──────────────────────────────────────────

    pub fn put_decision(&self, decision: &ScalingDecision) -> StateResult<()> {
        self.put(DECISIONS, &decision.table_key(), decision)
    }

    /// The most recent decisions, newest first.
    pub fn list_decisions(&self, limit: usize) -> StateResult<Vec<ScalingDecision>> {
        self.list_recent(DECISIONS, limit)
    }

    pub fn latest_decision(&self) -> StateResult<Option<ScalingDecision>> {
        Ok(self.list_recent(DECISIONS, 1)?.into_iter().next())
    }

    // ── Metrics ────────────────────────────────────────────────────

    pub fn put_metrics(&self, sample: &MetricsSample) -> StateResult<()> {
        self.put(METRICS, &sample.table_key(), sample)
    }

    /// The most recent samples, newest first.
    pub fn list_metrics(&self, limit: usize) -> StateResult<Vec<MetricsSample>> {
        self.list_recent(METRICS, limit)
    }

    /// Drop samples older than `before` (ms). Returns number deleted.
    pub fn prune_metrics_before(&self, before: u64) -> StateResult<u32> {
        let cutoff = format!("{before:020}");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let t = txn.open_table(METRICS).map_err(map_err!(Table))?;
            t.iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    (k < cutoff).then_some(k)
                })
                .collect()
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut t = txn.open_table(METRICS).map_err(map_err!(Table))?;
            for key in &keys {
                t.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use taskgrid_core::Resources;

    fn test_agent(id: &str) -> AgentRecord {
        AgentRecord {
            id: id.to_string(),
            status: AgentStatus::Idle,
            tags: BTreeSet::from(["gpu".to_string()]),
            capacity: Resources::new(4000, 8192, 100_000, 1000),
            registration_seq: 0,
            last_heartbeat: 1000,
            registered_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_task(id: &str) -> TaskRecord {
        TaskRecord::from_spec(
            id.to_string(),
            TaskSpec::new(1, Resources::cpu(2)),
            0,
            1000,
        )
    }

    fn test_sample(at: u64) -> MetricsSample {
        MetricsSample {
            at,
            utilization: 0.5,
            queue_depth: 3,
            agents: 2,
            schedulable_agents: 2,
        }
    }

    // ── Agent CRUD ─────────────────────────────────────────────────

    #[test]
    fn agent_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let agent = test_agent("agent-1");

        store.put_agent(&agent).unwrap();
        assert_eq!(store.get_agent("agent-1").unwrap(), Some(agent));
    }

    #[test]
    fn agent_update_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let mut agent = test_agent("agent-1");
        store.put_agent(&agent).unwrap();

        agent.status = AgentStatus::Draining;
        store.put_agent(&agent).unwrap();
        let stored = store.get_agent("agent-1").unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Draining);

        assert!(store.delete_agent("agent-1").unwrap());
        assert!(!store.delete_agent("agent-1").unwrap());
        assert!(store.list_agents().unwrap().is_empty());
    }

    // ── Task CRUD ──────────────────────────────────────────────────

    #[test]
    fn task_put_list_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_task(&test_task("t-1")).unwrap();
        store.put_task(&test_task("t-2")).unwrap();

        assert_eq!(store.list_tasks().unwrap().len(), 2);
        assert!(store.delete_task("t-1").unwrap());
        assert!(store.get_task("t-1").unwrap().is_none());
        assert!(store.get_task("t-2").unwrap().is_some());
    }

    // ── Reservations ───────────────────────────────────────────────

    #[test]
    fn reservation_keyed_by_task() {
        let store = StateStore::open_in_memory().unwrap();
        let res = Reservation {
            id: "r-1".to_string(),
            agent_id: "agent-1".to_string(),
            task_id: "t-1".to_string(),
            amounts: Resources::cpu(2),
            created_at: 1000,
        };
        store.put_reservation(&res).unwrap();

        assert_eq!(store.get_reservation("t-1").unwrap(), Some(res));
        assert!(store.delete_reservation("t-1").unwrap());
        assert!(!store.delete_reservation("t-1").unwrap());
    }

    // ── Decisions ──────────────────────────────────────────────────

    #[test]
    fn latest_decision_is_newest() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.latest_decision().unwrap().is_none());

        for at in [9_000u64, 10_000, 2_000] {
            let mut d = ScalingDecision::none(at, ScalingTrigger::default());
            d.direction = ScalingDirection::Up;
            d.magnitude = 1;
            store.put_decision(&d).unwrap();
        }

        let latest = store.latest_decision().unwrap().unwrap();
        assert_eq!(latest.at, 10_000);

        let recent = store.list_decisions(2).unwrap();
        let ats: Vec<u64> = recent.iter().map(|d| d.at).collect();
        assert_eq!(ats, vec![10_000, 9_000]);
    }

    // ── Metrics ────────────────────────────────────────────────────

    #[test]
    fn metrics_list_and_prune() {
        let store = StateStore::open_in_memory().unwrap();
        for at in [1_000u64, 2_000, 3_000] {
            store.put_metrics(&test_sample(at)).unwrap();
        }

        let recent = store.list_metrics(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].at, 3_000);

        assert_eq!(store.prune_metrics_before(2_500).unwrap(), 2);
        let left = store.list_metrics(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].at, 3_000);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_agent(&test_agent("agent-1")).unwrap();
            store.put_task(&test_task("t-1")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_agent("agent-1").unwrap().is_some());
        assert_eq!(store.get_task("t-1").unwrap().unwrap().demand, Resources::cpu(2));
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_agents().unwrap().is_empty());
        assert!(store.list_tasks().unwrap().is_empty());
        assert!(store.list_reservations().unwrap().is_empty());
        assert!(store.list_decisions(10).unwrap().is_empty());
        assert!(store.list_metrics(10).unwrap().is_empty());
        assert!(!store.delete_agent("nope").unwrap());
        assert!(!store.delete_task("nope").unwrap());
    }
}
