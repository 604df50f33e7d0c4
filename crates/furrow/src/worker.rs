//! Worker slots and their construction from a node list.
//!
//! A worker is a reusable scheduling slot bound to one node and a contiguous
//! range of that node's cores. The pool partitions every node into the same
//! number of slots and hands out free worker ids in FIFO order.

use std::collections::VecDeque;
use std::fmt;

use error_stack::Report;
use serde::{Deserialize, Serialize};

use crate::settings::ConfigError;

/// A compute node as supplied by the environment: an address and the number
/// of usable cores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeNode {
    pub address: String,
    pub cores: u32,
}

/// The node a worker's cores belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHost {
    pub id: usize,
    pub address: String,
}

/// An inclusive range of core indices reserved for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreRange {
    pub start: u32,
    pub end: u32,
}

impl CoreRange {
    pub fn width(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn overlaps(&self, other: &CoreRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for CoreRange {
    /// Renders the pinning-list syntax consumed by the launch wrapper.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// One scheduling slot. Workers are created once at session start and
/// recycled between tasks; their ids are stable for the whole session.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: usize,
    pub host: WorkerHost,
    pub cores: CoreRange,
}

/// The full set of workers plus the FIFO free queue of worker ids.
///
/// Only the session's dispatch loop touches the queue, so no synchronization
/// is needed around checkout/checkin.
pub struct WorkerPool {
    workers: Vec<Worker>,
    free: VecDeque<usize>,
}

impl WorkerPool {
    /// Partition each node's cores into `processes_per_node` contiguous,
    /// non-overlapping ranges and build one worker per range. Worker ids
    /// increase globally starting at 0, in node order then range order.
    pub fn load(
        nodes: &[ComputeNode],
        processes_per_node: u32,
    ) -> Result<Self, Report<ConfigError>> {
        if nodes.is_empty() {
            return Err(Report::new(ConfigError::EmptyNodeList));
        }
        if processes_per_node == 0 {
            return Err(Report::new(ConfigError::ZeroProcessesPerNode));
        }

        let mut workers = Vec::with_capacity(nodes.len() * processes_per_node as usize);
        for (host_id, node) in nodes.iter().enumerate() {
            if node.cores < processes_per_node {
                return Err(Report::new(ConfigError::TooFewCores {
                    address: node.address.clone(),
                    cores: node.cores,
                    slots: processes_per_node,
                }));
            }

            let base = node.cores / processes_per_node;
            let remainder = node.cores % processes_per_node;
            let mut start = 0;
            for slot in 0..processes_per_node {
                let width = base + u32::from(slot < remainder);
                workers.push(Worker {
                    id: workers.len(),
                    host: WorkerHost {
                        id: host_id,
                        address: node.address.clone(),
                    },
                    cores: CoreRange {
                        start,
                        end: start + width - 1,
                    },
                });
                start += width;
            }
        }

        let free = (0..workers.len()).collect();
        Ok(Self { workers, free })
    }

    pub fn total(&self) -> usize {
        self.workers.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn get(&self, id: usize) -> &Worker {
        &self.workers[id]
    }

    /// Take the next free worker id, if any.
    pub fn checkout(&mut self) -> Option<usize> {
        self.free.pop_front()
    }

    /// Return a worker id to the back of the free queue.
    pub fn checkin(&mut self, id: usize) {
        debug_assert!(id < self.workers.len());
        debug_assert!(!self.free.contains(&id));
        self.free.push_back(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(cores: &[u32]) -> Vec<ComputeNode> {
        cores
            .iter()
            .enumerate()
            .map(|(i, cores)| ComputeNode {
                address: format!("node{i}"),
                cores: *cores,
            })
            .collect()
    }

    #[test]
    fn even_partition() {
        let pool = WorkerPool::load(&nodes(&[4]), 2).expect("loading pool");

        assert_eq!(pool.total(), 2);
        assert_eq!(pool.get(0).cores, CoreRange { start: 0, end: 1 });
        assert_eq!(pool.get(1).cores, CoreRange { start: 2, end: 3 });
    }

    #[test]
    fn uneven_partition_is_balanced() {
        let pool = WorkerPool::load(&nodes(&[7]), 3).expect("loading pool");

        let ranges: Vec<_> = pool.workers().iter().map(|w| w.cores).collect();
        assert_eq!(
            ranges,
            [
                CoreRange { start: 0, end: 2 },
                CoreRange { start: 3, end: 4 },
                CoreRange { start: 5, end: 6 },
            ]
        );

        let covered: u32 = ranges.iter().map(CoreRange::width).sum();
        assert_eq!(covered, 7);
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(!a.overlaps(b), "ranges {a} and {b} overlap");
            }
        }
    }

    #[test]
    fn worker_ids_increase_across_nodes() {
        let pool = WorkerPool::load(&nodes(&[4, 4]), 2).expect("loading pool");

        assert_eq!(pool.total(), 4);
        let ids: Vec<_> = pool.workers().iter().map(|w| w.id).collect();
        assert_eq!(ids, [0, 1, 2, 3]);
        assert_eq!(pool.get(2).host.address, "node1");
        assert_eq!(pool.get(2).cores, CoreRange { start: 0, end: 1 });
    }

    #[test]
    fn checkout_is_fifo_and_checkin_recycles() {
        let mut pool = WorkerPool::load(&nodes(&[4]), 2).expect("loading pool");

        assert_eq!(pool.checkout(), Some(0));
        assert_eq!(pool.checkout(), Some(1));
        assert_eq!(pool.checkout(), None);

        pool.checkin(1);
        pool.checkin(0);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.checkout(), Some(1));
        assert_eq!(pool.checkout(), Some(0));
    }

    #[test]
    fn rejects_bad_configurations() {
        assert!(WorkerPool::load(&[], 2).is_err());
        assert!(WorkerPool::load(&nodes(&[4]), 0).is_err());
        assert!(WorkerPool::load(&nodes(&[2]), 4).is_err());
    }
}
