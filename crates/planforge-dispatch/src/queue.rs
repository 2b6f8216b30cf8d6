use planforge_core::Role;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// One queue slot: strict priority (lower value first), FIFO tiebreak by
/// enqueue sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    enqueue_seq: u64,
    task_id: Uuid,
}

// BinaryHeap is a max-heap; invert the comparison so the smallest
// (priority, enqueue_seq) pair pops first.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.enqueue_seq).cmp(&(self.priority, self.enqueue_seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueIndex {
    queues: HashMap<Role, BinaryHeap<QueueEntry>>,
    fallback: BinaryHeap<QueueEntry>,
}

/// Priority queue index: one queue per role plus a shared fallback queue
/// for roles no worker has registered.
///
/// The index holds task ids only; task state lives in the State Store, and
/// poppers re-validate against it (which is how cancelled entries vanish
/// lazily).
pub struct RoleQueues {
    index: Mutex<QueueIndex>,
    seq: AtomicU64,
    soft_cap: usize,
    notify: Notify,
}

impl RoleQueues {
    /// Creates an empty index with the given per-role soft cap.
    pub fn new(soft_cap: usize) -> Self {
        Self {
            index: Mutex::new(QueueIndex::default()),
            seq: AtomicU64::new(0),
            soft_cap: soft_cap.max(1),
            notify: Notify::new(),
        }
    }

    /// Pushes a task onto its role queue (or the fallback when the role is
    /// unregistered) and wakes one waiting popper. Returns the new depth of
    /// the queue pushed to.
    pub async fn push(&self, role: Role, registered: bool, priority: i32, task_id: Uuid) -> usize {
        let entry = QueueEntry {
            priority,
            enqueue_seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            task_id,
        };
        let depth = {
            let mut index = self.index.lock().await;
            let queue = if registered {
                index.queues.entry(role).or_default()
            } else {
                &mut index.fallback
            };
            queue.push(entry);
            queue.len()
        };
        self.notify.notify_one();
        depth
    }

    /// Pops the best entry across the given role queues and the fallback
    /// queue: globally smallest (priority, enqueue_seq).
    pub async fn pop_any(&self, roles: &[Role]) -> Option<(Role, Uuid)> {
        let mut index = self.index.lock().await;

        let mut best: Option<(Option<Role>, QueueEntry)> = None;
        for role in roles {
            if let Some(entry) = index.queues.get(role).and_then(|q| q.peek()).copied() {
                if best.as_ref().map_or(true, |(_, b)| entry > *b) {
                    best = Some((Some(*role), entry));
                }
            }
        }
        if let Some(entry) = index.fallback.peek().copied() {
            if best.as_ref().map_or(true, |(_, b)| entry > *b) {
                best = Some((None, entry));
            }
        }

        match best {
            Some((Some(role), _)) => {
                let entry = index.queues.get_mut(&role)?.pop()?;
                Some((role, entry.task_id))
            }
            Some((None, _)) => {
                // Fallback entries carry no role on the queue side; the
                // popper reads it from the task record.
                let role = roles.first().copied()?;
                let entry = index.fallback.pop()?;
                Some((role, entry.task_id))
            }
            None => None,
        }
    }

    /// Current depth of a role queue.
    pub async fn depth(&self, role: Role) -> usize {
        let index = self.index.lock().await;
        index.queues.get(&role).map_or(0, BinaryHeap::len)
    }

    /// All role-queue depths plus the fallback depth under the `None` key.
    pub async fn depths(&self) -> HashMap<Option<Role>, usize> {
        let index = self.index.lock().await;
        let mut out: HashMap<Option<Role>, usize> = index
            .queues
            .iter()
            .map(|(role, q)| (Some(*role), q.len()))
            .collect();
        out.insert(None, index.fallback.len());
        out
    }

    /// Whether a role queue exceeds the soft cap.
    pub async fn is_saturated(&self, role: Role) -> bool {
        self.depth(role).await >= self.soft_cap
    }

    /// Waits until a push wakes the caller.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}
