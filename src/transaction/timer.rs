use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

#[derive(Debug, PartialEq, Eq, Clone)]
struct TimerKey {
    execute_at: Instant,
    task_id: u64,
}

// Ordered by deadline; the task id breaks ties so tasks scheduled for
// the same instant keep distinct map entries.
impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.execute_at
            .cmp(&other.execute_at)
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A polled timer wheel. `timeout` hands back a task id; `cancel` with
/// that id returns the payload if the task has not fired yet; `poll`
/// pops every task whose deadline passed. The owner decides when to
/// poll, so the wheel itself never spawns or sleeps.
pub struct Timer<T> {
    tasks: RwLock<BTreeMap<TimerKey, T>>,
    id_to_deadline: RwLock<HashMap<u64, Instant>>,
    last_task_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            id_to_deadline: RwLock::new(HashMap::new()),
            last_task_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, execute_at: Instant, value: T) -> u64 {
        let task_id = self.last_task_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.write().unwrap().insert(
            TimerKey {
                execute_at,
                task_id,
            },
            value,
        );
        self.id_to_deadline
            .write()
            .unwrap()
            .insert(task_id, execute_at);
        task_id
    }

    /// Remove a pending task. Returns its payload, or `None` when the
    /// task already fired or was cancelled before. Safe to call with a
    /// stale id.
    pub fn cancel(&self, task_id: u64) -> Option<T> {
        let deadline = self.id_to_deadline.write().unwrap().remove(&task_id)?;
        self.tasks.write().unwrap().remove(&TimerKey {
            execute_at: deadline,
            task_id,
        })
    }

    /// Pop every payload whose deadline is at or before `now`, in
    /// deadline order.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut result = Vec::new();
        let fired = {
            let mut tasks = self.tasks.write().unwrap();
            let fired = tasks
                .range(
                    ..=TimerKey {
                        execute_at: now,
                        task_id: u64::MAX,
                    },
                )
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();

            if fired.is_empty() {
                return result;
            }
            result.reserve(fired.len());
            for key in fired.iter() {
                if let Some(value) = tasks.remove(key) {
                    result.push(value);
                }
            }
            fired
        };
        let mut id_to_deadline = self.id_to_deadline.write().unwrap();
        for key in fired {
            id_to_deadline.remove(&key.task_id);
        }
        result
    }
}
