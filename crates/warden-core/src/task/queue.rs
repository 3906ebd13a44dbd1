use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::error::{Result, WardenError};
use crate::task::archive::TaskArchive;
use crate::task::{Priority, Task, TaskState};
use crate::template::SAVE_ACTION;

/// Heap entry. Ordered by `(priority, created, seq)`; `seq` breaks ties
/// between tasks created within the same microsecond.
struct Queued {
    priority: Priority,
    created: DateTime<Utc>,
    seq: u64,
    task: Task,
}

impl Queued {
    fn key(&self) -> (Priority, DateTime<Utc>, u64) {
        (self.priority, self.created, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Queued>>,
    seq: u64,
    current: Option<Task>,
    watchers: HashMap<String, watch::Sender<TaskState>>,
}

impl Inner {
    fn queued(&self) -> Vec<&Task> {
        let mut entries: Vec<&Queued> = self.heap.iter().map(|r| &r.0).collect();
        entries.sort();
        entries.into_iter().map(|q| &q.task).collect()
    }
}

/// Per-service priority queue plus the service's task archive.
///
/// Lower priority values dequeue first; equal priorities dequeue in creation
/// order. At most one dequeued task is tracked as `current` at a time.
/// Archive calls run on the blocking pool.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    available: Notify,
    archive: Arc<Mutex<Box<dyn TaskArchive>>>,
}

impl TaskQueue {
    pub fn new(archive: Box<dyn TaskArchive>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: Notify::new(),
            archive: Arc::new(Mutex::new(archive)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `task` at `priority`. Never blocks.
    pub fn put(&self, mut task: Task, priority: Priority) -> TaskWaiter {
        task.priority = priority;
        let (tx, rx) = watch::channel(task.state);
        let guid = task.guid.clone();
        {
            let mut inner = self.lock();
            let seq = inner.seq;
            inner.seq += 1;
            inner.watchers.insert(guid.clone(), tx);
            inner.heap.push(Reverse(Queued {
                priority,
                created: task.created,
                seq,
                task,
            }));
        }
        self.available.notify_one();
        TaskWaiter { guid, rx }
    }

    /// Wait up to `timeout` for a task. The returned task is `running` and
    /// becomes the queue's current task until [`finish`](Self::finish).
    pub async fn get(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_take() {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    fn try_take(&self) -> Option<Task> {
        let mut inner = self.lock();
        let Reverse(entry) = inner.heap.pop()?;
        let mut task = entry.task;
        // queued tasks are always `new`; anything else is left as found
        let _ = task.transition(TaskState::Running);
        if let Some(tx) = inner.watchers.get(&task.guid) {
            tx.send_replace(task.state);
        }
        inner.current = Some(task.clone());
        Some(task)
    }

    /// Archive a task that finished executing and release it as current.
    ///
    /// Watchers are notified even when archiving fails.
    pub async fn finish(&self, task: Task) -> Result<()> {
        let record = task.clone();
        let archived = self.with_archive(move |a| a.add(&record)).await;
        let mut inner = self.lock();
        if inner.current.as_ref().is_some_and(|c| c.guid == task.guid) {
            inner.current = None;
        }
        if let Some(tx) = inner.watchers.remove(&task.guid) {
            tx.send_replace(task.state);
        }
        archived
    }

    /// Archive a task that never went through the queue (interrupted recovery).
    pub async fn archive_task(&self, task: Task) -> Result<()> {
        self.with_archive(move |a| a.add(&task)).await
    }

    pub fn current(&self) -> Option<Task> {
        self.lock().current.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current task, then queued tasks in dequeue order, then (optionally)
    /// the archive.
    pub async fn list_tasks(&self, include_archived: bool) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        {
            let inner = self.lock();
            tasks.extend(inner.current.clone());
            tasks.extend(inner.queued().into_iter().cloned());
        }
        if include_archived {
            tasks.extend(self.with_archive(|a| a.list(None, None)).await?);
        }
        Ok(tasks)
    }

    /// Tasks that belong in a snapshot: current and queued, minus `save`.
    pub fn pending_tasks(&self) -> Vec<Task> {
        let inner = self.lock();
        inner
            .current
            .iter()
            .chain(inner.queued())
            .filter(|t| t.action_name != SAVE_ACTION)
            .cloned()
            .collect()
    }

    /// Search current, queued, then archived tasks.
    pub async fn get_by_guid(&self, guid: &str) -> Result<Task> {
        {
            let inner = self.lock();
            if let Some(t) = inner.current.as_ref().filter(|t| t.guid == guid) {
                return Ok(t.clone());
            }
            if let Some(t) = inner.queued().into_iter().find(|t| t.guid == guid) {
                return Ok(t.clone());
            }
        }
        let wanted = guid.to_string();
        self.with_archive(move |a| a.get(&wanted))
            .await
            .map_err(|e| match e {
                WardenError::TaskNotFound(_) => WardenError::TaskNotFound(guid.to_string()),
                other => other,
            })
    }

    /// Whether an instance of `action` is waiting in the queue. The current
    /// task does not count.
    pub fn contains_action(&self, action: &str) -> bool {
        self.lock()
            .heap
            .iter()
            .any(|Reverse(q)| q.task.action_name == action)
    }

    /// Subscribe to a task still in the queue or running. `None` once it
    /// has been archived.
    pub fn waiter(&self, guid: &str) -> Option<TaskWaiter> {
        self.lock().watchers.get(guid).map(|tx| TaskWaiter {
            guid: guid.to_string(),
            rx: tx.subscribe(),
        })
    }

    /// Drop every queued task without archiving it. Waiters resolve to `None`.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let drained = inner.heap.len();
        let queued: Vec<String> = inner.heap.drain().map(|Reverse(q)| q.task.guid).collect();
        for guid in queued {
            inner.watchers.remove(&guid);
        }
        drained
    }

    /// Run `f` against the archive off the async worker threads.
    pub async fn with_archive<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn TaskArchive) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let archive = self.archive.clone();
        tokio::task::spawn_blocking(move || {
            let mut archive = archive.lock().unwrap_or_else(|e| e.into_inner());
            f(archive.as_mut())
        })
        .await
        .map_err(|e| WardenError::Archive(format!("archive worker failed: {e}")))?
    }
}

/// Resolves when a queued task reaches a terminal state.
pub struct TaskWaiter {
    guid: String,
    rx: watch::Receiver<TaskState>,
}

impl TaskWaiter {
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// The task's terminal state, or `None` if it was cleared from the queue.
    pub async fn wait(mut self) -> Option<TaskState> {
        self.rx.wait_for(|s| s.is_terminal()).await.ok().map(|s| *s)
    }
}
