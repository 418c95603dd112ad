//! Resource ledger: which allocations hold which resources on which node.
//!
//! Every node has its own book behind a mutex. A reservation checks the
//! book's remaining capacity and records the allocation under that lock, so
//! two callers reserving on the same node can never together exceed its
//! capacity. Callers on different nodes do not contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WlmError};
use crate::resources::ResourceVector;

/// Resources reserved on one node for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub job_id: Uuid,
    pub node_id: String,
    pub resources: ResourceVector,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time usage of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUsage {
    pub node_id: String,
    pub capacity: ResourceVector,
    pub allocated: ResourceVector,
    pub allocations: usize,
}

impl NodeUsage {
    pub fn free(&self) -> ResourceVector {
        self.capacity.saturating_sub(&self.allocated)
    }
}

#[derive(Debug)]
struct NodeBook {
    capacity: ResourceVector,
    allocated: ResourceVector,
    allocations: HashMap<Uuid, Allocation>,
}

impl NodeBook {
    fn free(&self) -> ResourceVector {
        self.capacity.saturating_sub(&self.allocated)
    }
}

type Book = Arc<Mutex<NodeBook>>;

#[derive(Debug, Default)]
pub struct ResourceLedger {
    books: RwLock<HashMap<String, Book>>,
    /// allocation id -> node id
    index: Mutex<HashMap<Uuid, String>>,
}

// A panic while holding one of these locks cannot leave a book half-updated:
// every mutation is a single insert/remove paired with one vector update.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self, node_id: &str) -> Option<Book> {
        self.books
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(node_id)
            .cloned()
    }

    /// Add a node or change its capacity. Shrinking below what is already
    /// allocated leaves existing allocations in place; the node just has no
    /// free resources until enough of them are released.
    pub fn upsert_node(&self, node_id: &str, capacity: ResourceVector) {
        if let Some(book) = self.book(node_id) {
            lock(&book).capacity = capacity;
            return;
        }
        self.books
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(node_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(NodeBook {
                    capacity,
                    allocated: ResourceVector::ZERO,
                    allocations: HashMap::new(),
                }))
            });
    }

    /// Forget a node, returning the allocations it still held.
    pub fn remove_node(&self, node_id: &str) -> Vec<Allocation> {
        let Some(book) = self
            .books
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(node_id)
        else {
            return Vec::new();
        };
        let drained: Vec<Allocation> = lock(&book).allocations.drain().map(|(_, a)| a).collect();
        let mut index = lock(&self.index);
        for allocation in &drained {
            index.remove(&allocation.id);
        }
        drained
    }

    /// Atomically reserve `request` on `node_id` for `job_id`.
    pub fn try_reserve(
        &self,
        node_id: &str,
        job_id: Uuid,
        request: ResourceVector,
    ) -> Result<Allocation> {
        let book = self
            .book(node_id)
            .ok_or_else(|| WlmError::NodeNotFound(node_id.to_string()))?;

        let allocation = {
            let mut book = lock(&book);
            let total = book
                .allocated
                .checked_add(&request)
                .filter(|total| total.fits_within(&book.capacity))
                .ok_or_else(|| WlmError::InsufficientResources {
                    node_id: node_id.to_string(),
                })?;
            let allocation = Allocation {
                id: Uuid::new_v4(),
                job_id,
                node_id: node_id.to_string(),
                resources: request,
                created_at: Utc::now(),
            };
            book.allocated = total;
            book.allocations.insert(allocation.id, allocation.clone());
            allocation
        };

        lock(&self.index).insert(allocation.id, node_id.to_string());
        tracing::debug!(
            allocation_id = %allocation.id,
            job_id = %job_id,
            node_id,
            resources = %request,
            "Resources reserved"
        );
        Ok(allocation)
    }

    /// Return an allocation's resources to its node's free pool.
    pub fn release(&self, allocation_id: Uuid) -> Result<Allocation> {
        let node_id = lock(&self.index)
            .remove(&allocation_id)
            .ok_or(WlmError::AllocationNotFound(allocation_id))?;
        let book = self
            .book(&node_id)
            .ok_or(WlmError::AllocationNotFound(allocation_id))?;

        let mut book = lock(&book);
        let allocation = book
            .allocations
            .remove(&allocation_id)
            .ok_or(WlmError::AllocationNotFound(allocation_id))?;
        book.allocated = book.allocated.saturating_sub(&allocation.resources);
        tracing::debug!(
            allocation_id = %allocation_id,
            job_id = %allocation.job_id,
            node_id = %node_id,
            "Resources released"
        );
        Ok(allocation)
    }

    pub fn free(&self, node_id: &str) -> Option<ResourceVector> {
        self.book(node_id).map(|book| lock(&book).free())
    }

    pub fn allocated(&self, node_id: &str) -> Option<ResourceVector> {
        self.book(node_id).map(|book| lock(&book).allocated)
    }

    pub fn capacity(&self, node_id: &str) -> Option<ResourceVector> {
        self.book(node_id).map(|book| lock(&book).capacity)
    }

    pub fn allocations_on(&self, node_id: &str) -> Vec<Allocation> {
        self.book(node_id)
            .map(|book| lock(&book).allocations.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, allocation_id: Uuid) -> Option<Allocation> {
        let node_id = lock(&self.index).get(&allocation_id).cloned()?;
        let book = self.book(&node_id)?;
        let book = lock(&book);
        book.allocations.get(&allocation_id).cloned()
    }

    /// Usage of every node, ordered by node id.
    pub fn usage(&self) -> Vec<NodeUsage> {
        let books: Vec<(String, Book)> = self
            .books
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, book)| (id.clone(), book.clone()))
            .collect();
        let mut usage: Vec<NodeUsage> = books
            .into_iter()
            .map(|(node_id, book)| {
                let book = lock(&book);
                NodeUsage {
                    node_id,
                    capacity: book.capacity,
                    allocated: book.allocated,
                    allocations: book.allocations.len(),
                }
            })
            .collect();
        usage.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        usage
    }

    pub fn allocation_count(&self) -> usize {
        lock(&self.index).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn reserve_and_release_round_trip_capacity() {
        let ledger = ResourceLedger::new();
        ledger.upsert_node("n1", ResourceVector::new(4, 4096, 1));

        let a = ledger
            .try_reserve("n1", Uuid::new_v4(), ResourceVector::new(3, 1024, 1))
            .unwrap();
        assert_eq!(ledger.free("n1"), Some(ResourceVector::new(1, 3072, 0)));

        let err = ledger
            .try_reserve("n1", Uuid::new_v4(), ResourceVector::new(2, 0, 0))
            .unwrap_err();
        assert!(matches!(err, WlmError::InsufficientResources { .. }));

        ledger.release(a.id).unwrap();
        assert_eq!(ledger.free("n1"), Some(ResourceVector::new(4, 4096, 1)));
        assert!(matches!(
            ledger.release(a.id),
            Err(WlmError::AllocationNotFound(_))
        ));
    }

    #[test]
    fn reserve_on_unknown_node_fails() {
        let ledger = ResourceLedger::new();
        let err = ledger
            .try_reserve("ghost", Uuid::new_v4(), ResourceVector::new(1, 0, 0))
            .unwrap_err();
        assert!(matches!(err, WlmError::NodeNotFound(_)));
    }

    #[test]
    fn any_dimension_short_rejects() {
        let ledger = ResourceLedger::new();
        ledger.upsert_node("n1", ResourceVector::new(8, 1024, 0));
        assert!(ledger
            .try_reserve("n1", Uuid::new_v4(), ResourceVector::new(1, 512, 1))
            .is_err());
        assert_eq!(ledger.allocation_count(), 0);
    }

    #[test]
    fn concurrent_reservations_never_oversubscribe() {
        let ledger = Arc::new(ResourceLedger::new());
        ledger.upsert_node("n1", ResourceVector::new(16, 16 * 1024, 2));

        let granted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let ledger = ledger.clone();
                let granted = granted.clone();
                thread::spawn(move || {
                    for round in 0..50 {
                        let gpus = u32::from((i + round) % 7 == 0);
                        let request = ResourceVector::new(3, 2048, gpus);
                        if let Ok(a) = ledger.try_reserve("n1", Uuid::new_v4(), request) {
                            granted.fetch_add(1, Ordering::SeqCst);
                            let allocated = ledger.allocated("n1").unwrap();
                            assert!(allocated.fits_within(&ResourceVector::new(16, 16 * 1024, 2)));
                            if round % 2 == 0 {
                                ledger.release(a.id).unwrap();
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let capacity = ledger.capacity("n1").unwrap();
        let sum = ledger
            .allocations_on("n1")
            .iter()
            .fold(ResourceVector::ZERO, |acc, a| {
                acc.checked_add(&a.resources).unwrap()
            });
        assert!(sum.fits_within(&capacity));
        assert_eq!(sum, ledger.allocated("n1").unwrap());
        assert!(granted.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn shrinking_capacity_keeps_allocations() {
        let ledger = ResourceLedger::new();
        ledger.upsert_node("n1", ResourceVector::new(4, 0, 0));
        let a = ledger
            .try_reserve("n1", Uuid::new_v4(), ResourceVector::new(3, 0, 0))
            .unwrap();
        ledger.upsert_node("n1", ResourceVector::new(2, 0, 0));
        assert_eq!(ledger.free("n1"), Some(ResourceVector::ZERO));
        assert_eq!(ledger.get(a.id), Some(a.clone()));
        ledger.release(a.id).unwrap();
        assert_eq!(ledger.free("n1"), Some(ResourceVector::new(2, 0, 0)));
    }

    #[test]
    fn remove_node_returns_live_allocations() {
        let ledger = ResourceLedger::new();
        ledger.upsert_node("n1", ResourceVector::new(4, 0, 0));
        let a = ledger
            .try_reserve("n1", Uuid::new_v4(), ResourceVector::new(1, 0, 0))
            .unwrap();
        let removed = ledger.remove_node("n1");
        assert_eq!(removed, vec![a.clone()]);
        assert_eq!(ledger.allocation_count(), 0);
        assert!(ledger.free("n1").is_none());
        assert!(ledger.release(a.id).is_err());
    }

    #[test]
    fn usage_is_sorted() {
        let ledger = ResourceLedger::new();
        ledger.upsert_node("b", ResourceVector::new(2, 0, 0));
        ledger.upsert_node("a", ResourceVector::new(4, 0, 0));
        ledger
            .try_reserve("a", Uuid::new_v4(), ResourceVector::new(1, 0, 0))
            .unwrap();
        let usage = ledger.usage();
        assert_eq!(usage[0].node_id, "a");
        assert_eq!(usage[0].free(), ResourceVector::new(3, 0, 0));
        assert_eq!(usage[0].allocations, 1);
        assert_eq!(usage[1].node_id, "b");
    }
}
