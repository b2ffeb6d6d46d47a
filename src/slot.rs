use std::collections::HashMap;

use parking_lot::Mutex;

use crate::task::{Task, TaskId};

const NONE: usize = usize::MAX;

/// Node handle retained by the id index.
///
/// The generation distinguishes a live node from a later occupant of the
/// same slab position, so removal and traversal go by node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Key {
    index: usize,
    generation: u64,
}

enum Entry {
    Vacant {
        next_free: usize,
    },
    Occupied {
        task: Task,
        generation: u64,
        prev: usize,
        next: usize,
    },
}

/// Growable slab threaded by a doubly linked list in insertion order.
struct Nodes {
    entries: Vec<Entry>,
    free_head: usize,
    head: usize,
    tail: usize,
    len: usize,
    generation: u64,
    index: HashMap<TaskId, Vec<Key>>,
}

impl Nodes {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: NONE,
            head: NONE,
            tail: NONE,
            len: 0,
            generation: 0,
            index: HashMap::new(),
        }
    }

    fn push_back(&mut self, task: Task) -> Key {
        self.generation += 1;
        let generation = self.generation;
        let id = task.id().clone();

        let entry = Entry::Occupied {
            task,
            generation,
            prev: self.tail,
            next: NONE,
        };

        let index = if self.free_head != NONE {
            let index = self.free_head;
            let Entry::Vacant { next_free } = self.entries[index] else {
                unreachable!("free list points at occupied entry {index}");
            };
            self.free_head = next_free;
            self.entries[index] = entry;
            index
        } else {
            self.entries.push(entry);
            self.entries.len() - 1
        };

        if self.tail != NONE {
            self.set_next(self.tail, index);
        } else {
            self.head = index;
        }
        self.tail = index;
        self.len += 1;

        let key = Key { index, generation };
        self.index.entry(id).or_default().push(key);
        key
    }

    fn remove(&mut self, key: Key) -> Option<Task> {
        match self.entries.get(key.index) {
            Some(Entry::Occupied { generation, .. }) if *generation == key.generation => {}
            _ => return None,
        }

        let old = std::mem::replace(
            &mut self.entries[key.index],
            Entry::Vacant {
                next_free: self.free_head,
            },
        );
        self.free_head = key.index;
        self.len -= 1;

        let Entry::Occupied {
            task, prev, next, ..
        } = old
        else {
            unreachable!("entry {} checked occupied", key.index);
        };

        if prev != NONE {
            self.set_next(prev, next);
        } else {
            self.head = next;
        }
        if next != NONE {
            self.set_prev(next, prev);
        } else {
            self.tail = prev;
        }

        if let Some(keys) = self.index.get_mut(task.id()) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.index.remove(task.id());
            }
        }

        Some(task)
    }

    fn get(&self, key: Key) -> Option<&Task> {
        match self.entries.get(key.index) {
            Some(Entry::Occupied {
                task, generation, ..
            }) if *generation == key.generation => Some(task),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<Key> {
        let mut keys = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while cursor != NONE {
            let Entry::Occupied {
                generation, next, ..
            } = &self.entries[cursor]
            else {
                unreachable!("list links vacant entry {cursor}");
            };
            keys.push(Key {
                index: cursor,
                generation: *generation,
            });
            cursor = *next;
        }
        keys
    }

    fn take_all(&mut self) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        let entries = std::mem::take(&mut self.entries);

        let mut entries: Vec<Option<Entry>> = entries.into_iter().map(Some).collect();
        while cursor != NONE {
            match entries[cursor].take() {
                Some(Entry::Occupied { task, next, .. }) => {
                    tasks.push(task);
                    cursor = next;
                }
                _ => unreachable!("list links vacant entry {cursor}"),
            }
        }

        self.free_head = NONE;
        self.head = NONE;
        self.tail = NONE;
        self.len = 0;
        self.index.clear();
        tasks
    }

    #[inline(always)]
    fn set_next(&mut self, at: usize, to: usize) {
        if let Entry::Occupied { next, .. } = &mut self.entries[at] {
            *next = to;
        }
    }

    #[inline(always)]
    fn set_prev(&mut self, at: usize, to: usize) {
        if let Entry::Occupied { prev, .. } = &mut self.entries[at] {
            *prev = to;
        }
    }
}

/// Tasks assigned to one (level, bucket) pair.
///
/// The id index and the ordered list live under a single lock so they are
/// always updated together. Safe to share between the roll thread and
/// inserting callers.
pub struct Slot {
    nodes: Mutex<Nodes>,
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

impl Slot {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(Nodes::new()),
        }
    }

    /// Append a task. O(1).
    ///
    /// A slot may hold several entries with one id, such as a cyclic task
    /// and its retry.
    pub fn add(&self, task: Task) -> TaskId {
        let id = task.id().clone();
        self.nodes.lock().push_back(task);
        id
    }

    /// Remove every entry with this id. Returns `false` if there was none.
    pub fn delete(&self, id: &TaskId) -> bool {
        let mut nodes = self.nodes.lock();
        let Some(keys) = nodes.index.remove(id) else {
            return false;
        };
        for key in keys {
            nodes.remove(key);
        }
        true
    }

    /// Remove the oldest entry with this id and hand it back.
    pub fn take(&self, id: &TaskId) -> Option<Task> {
        let mut nodes = self.nodes.lock();
        let key = *nodes.index.get(id)?.first()?;
        nodes.remove(key)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.lock().index.contains_key(id)
    }

    /// Visit tasks in insertion order, stopping at the first error.
    ///
    /// The walk runs over a snapshot of node handles taken on entry and the
    /// lock is not held while `f` runs, so `f` may add or delete tasks in
    /// this slot. Tasks deleted before they are reached are skipped; tasks
    /// added during the walk are not visited.
    pub fn traverse<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&Task) -> Result<(), E>,
    {
        let keys = self.nodes.lock().keys();

        for key in keys {
            let task = match self.nodes.lock().get(key) {
                Some(task) => task.clone(),
                None => continue,
            };
            f(&task)?;
        }

        Ok(())
    }

    /// Remove every task, returned in insertion order.
    pub fn drain(&self) -> Vec<Task> {
        let mut nodes = self.nodes.lock();
        if nodes.len == 0 {
            return Vec::new();
        }
        nodes.take_all()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.nodes.lock().len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOptions;
    use std::sync::Arc;

    fn task(id: &str) -> Task {
        Task::create(TaskOptions::new().id(id).callback(|| Ok(()))).unwrap()
    }

    fn ids(slot: &Slot) -> Vec<String> {
        let mut out = Vec::new();
        slot.traverse::<_, ()>(|t| {
            out.push(t.id().to_string());
            Ok(())
        })
        .unwrap();
        out
    }

    // ==================== Basic Operations ====================

    #[test]
    fn test_new_empty() {
        let slot = Slot::new();
        assert!(slot.is_empty());
        assert_eq!(slot.len(), 0);
        assert!(slot.drain().is_empty());
    }

    #[test]
    fn test_add_returns_id() {
        let slot = Slot::new();
        let id = slot.add(task("a"));

        assert_eq!(id.as_str(), "a");
        assert_eq!(slot.len(), 1);
        assert!(slot.contains(&id));
    }

    #[test]
    fn test_insertion_order() {
        let slot = Slot::new();
        for id in ["a", "b", "c", "d"] {
            slot.add(task(id));
        }
        assert_eq!(ids(&slot), ["a", "b", "c", "d"]);
    }

    #[test]
    fn test_delete_middle() {
        let slot = Slot::new();
        for id in ["a", "b", "c"] {
            slot.add(task(id));
        }

        assert!(slot.delete(&"b".into()));
        assert_eq!(ids(&slot), ["a", "c"]);
        assert_eq!(slot.len(), 2);
    }

    #[test]
    fn test_delete_head_and_tail() {
        let slot = Slot::new();
        for id in ["a", "b", "c"] {
            slot.add(task(id));
        }

        assert!(slot.delete(&"a".into()));
        assert!(slot.delete(&"c".into()));
        assert_eq!(ids(&slot), ["b"]);

        slot.add(task("d"));
        assert_eq!(ids(&slot), ["b", "d"]);
    }

    #[test]
    fn test_delete_missing() {
        let slot = Slot::new();
        slot.add(task("a"));

        assert!(!slot.delete(&"zzz".into()));
        assert!(slot.delete(&"a".into()));
        assert!(!slot.delete(&"a".into()));
        assert!(slot.is_empty());
    }

    #[test]
    fn test_delete_by_identity_not_lookalike() {
        let slot = Slot::new();
        let callback: crate::task::Callback = Arc::new(|| Ok(()));

        // Same callback, same shape; only the id differs.
        for id in ["twin-1", "twin-2"] {
            let t = Task::create(TaskOptions::new().id(id).shared_callback(Arc::clone(&callback)))
                .unwrap();
            slot.add(t);
        }

        assert!(slot.delete(&"twin-2".into()));
        assert_eq!(ids(&slot), ["twin-1"]);
    }

    #[test]
    fn test_free_list_reuse_keeps_order() {
        let slot = Slot::new();
        for id in ["a", "b", "c"] {
            slot.add(task(id));
        }
        slot.delete(&"a".into());
        slot.delete(&"b".into());

        // Reuses freed positions but appends at the tail.
        slot.add(task("d"));
        slot.add(task("e"));
        assert_eq!(ids(&slot), ["c", "d", "e"]);
    }

    #[test]
    fn test_delete_removes_every_entry_with_id() {
        let slot = Slot::new();
        slot.add(task("a"));
        slot.add(task("b"));
        slot.add(task("a"));

        assert_eq!(ids(&slot), ["a", "b", "a"]);
        assert!(slot.delete(&"a".into()));
        assert_eq!(ids(&slot), ["b"]);
        assert!(!slot.contains(&"a".into()));
    }

    #[test]
    fn test_take_oldest_duplicate() {
        let slot = Slot::new();
        slot.add(task("a"));
        slot.add(task("b"));
        slot.add(task("a"));

        assert!(slot.take(&"a".into()).is_some());
        assert_eq!(ids(&slot), ["b", "a"]);
        assert!(slot.contains(&"a".into()));
    }

    #[test]
    fn test_take() {
        let slot = Slot::new();
        slot.add(task("a"));

        let t = slot.take(&"a".into()).unwrap();
        assert_eq!(t.id().as_str(), "a");
        assert!(slot.take(&"a".into()).is_none());
    }

    // ==================== Drain ====================

    #[test]
    fn test_drain_in_order() {
        let slot = Slot::new();
        for id in ["a", "b", "c"] {
            slot.add(task(id));
        }
        slot.delete(&"b".into());

        let drained: Vec<_> = slot.drain().iter().map(|t| t.id().to_string()).collect();
        assert_eq!(drained, ["a", "c"]);
        assert!(slot.is_empty());
        assert!(!slot.contains(&"a".into()));
    }

    #[test]
    fn test_drain_then_refill() {
        let slot = Slot::new();
        for round in 0..10 {
            for i in 0..8 {
                slot.add(task(&format!("{round}-{i}")));
            }
            assert_eq!(slot.drain().len(), 8);
            assert!(slot.is_empty());
        }
    }

    // ==================== Traverse ====================

    #[test]
    fn test_traverse_stops_on_error() {
        let slot = Slot::new();
        for id in ["a", "b", "c"] {
            slot.add(task(id));
        }

        let mut seen = Vec::new();
        let result = slot.traverse(|t| {
            seen.push(t.id().to_string());
            if t.id().as_str() == "b" {
                Err("stop")
            } else {
                Ok(())
            }
        });

        assert_eq!(result, Err("stop"));
        assert_eq!(seen, ["a", "b"]);
    }

    #[test]
    fn test_traverse_delete_current() {
        let slot = Slot::new();
        for id in ["a", "b", "c", "d"] {
            slot.add(task(id));
        }

        let mut seen = Vec::new();
        slot.traverse::<_, ()>(|t| {
            seen.push(t.id().to_string());
            assert!(slot.delete(t.id()));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, ["a", "b", "c", "d"]);
        assert!(slot.is_empty());
    }

    #[test]
    fn test_traverse_delete_others() {
        let slot = Slot::new();
        for id in ["a", "b", "c", "d"] {
            slot.add(task(id));
        }

        let mut seen = Vec::new();
        slot.traverse::<_, ()>(|t| {
            seen.push(t.id().to_string());
            if t.id().as_str() == "a" {
                slot.delete(&"c".into());
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, ["a", "b", "d"]);
    }

    #[test]
    fn test_traverse_skips_reused_position() {
        let slot = Slot::new();
        for id in ["a", "b"] {
            slot.add(task(id));
        }

        let mut seen = Vec::new();
        slot.traverse::<_, ()>(|t| {
            seen.push(t.id().to_string());
            if t.id().as_str() == "a" {
                // "b"'s position is freed and immediately reused by "x".
                slot.delete(&"b".into());
                slot.add(task("x"));
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, ["a"]);
        assert_eq!(ids(&slot), ["a", "x"]);
    }

    // ==================== Concurrency ====================

    #[test]
    fn test_concurrent_add_and_drain() {
        let slot = Arc::new(Slot::new());
        let writers = 4;
        let per_writer = 500;

        let drained = std::thread::scope(|s| {
            for w in 0..writers {
                let slot = Arc::clone(&slot);
                s.spawn(move || {
                    for i in 0..per_writer {
                        slot.add(task(&format!("{w}-{i}")));
                    }
                });
            }

            let slot = Arc::clone(&slot);
            s.spawn(move || {
                let mut total = 0;
                for _ in 0..200 {
                    total += slot.drain().len();
                    std::thread::yield_now();
                }
                total
            })
            .join()
            .unwrap()
        });

        let total = drained + slot.drain().len();
        assert_eq!(total, writers * per_writer);
    }
}
