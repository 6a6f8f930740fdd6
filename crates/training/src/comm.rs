//! Process-group collectives used by the training loop.
//!
//! Collectives block until every member of the group arrives.

use std::sync::{Arc, Barrier, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {rank} contributed {actual} values, expected {expected}")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        actual: usize,
    },
    #[error("destination rank {dst} outside group of {world_size}")]
    InvalidRank { dst: usize, world_size: usize },
    #[error("process group state poisoned by a panicked member")]
    Poisoned,
}

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_main(&self) -> bool {
        self.rank() == 0
    }

    /// Element-wise sum of `values` across ranks, delivered to `dst`. Other ranks keep
    /// their own values.
    fn reduce_sum(&self, dst: usize, values: &mut [f32]) -> Result<(), CommError>;

    fn barrier(&self) -> Result<(), CommError>;
}

/// Group of one; every collective is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn reduce_sum(&self, dst: usize, _values: &mut [f32]) -> Result<(), CommError> {
        if dst != 0 {
            return Err(CommError::InvalidRank { dst, world_size: 1 });
        }
        Ok(())
    }

    fn barrier(&self) -> Result<(), CommError> {
        Ok(())
    }
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
}

/// In-process group whose members run on separate threads.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl LocalGroup {
    /// One handle per rank; hand each to its own thread.
    pub fn create(world_size: usize) -> Vec<LocalGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn reduce_sum(&self, dst: usize, values: &mut [f32]) -> Result<(), CommError> {
        if dst >= self.world_size {
            return Err(CommError::InvalidRank {
                dst,
                world_size: self.world_size,
            });
        }
        let mut result = match self.shared.slots.lock() {
            Ok(mut slots) => {
                slots[self.rank].clear();
                slots[self.rank].extend_from_slice(values);
                Ok(())
            }
            Err(_) => Err(CommError::Poisoned),
        };
        self.shared.barrier.wait();

        if self.rank == dst && result.is_ok() {
            result = match self.shared.slots.lock() {
                Ok(slots) => accumulate(values, &slots, dst),
                Err(_) => Err(CommError::Poisoned),
            };
        }
        // Slots stay untouched until dst has read them.
        self.shared.barrier.wait();
        result
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.shared.barrier.wait();
        Ok(())
    }
}

fn accumulate(values: &mut [f32], slots: &[Vec<f32>], dst: usize) -> Result<(), CommError> {
    for (rank, slot) in slots.iter().enumerate() {
        if rank == dst {
            continue;
        }
        if slot.len() != values.len() {
            return Err(CommError::LengthMismatch {
                rank,
                expected: values.len(),
                actual: slot.len(),
            });
        }
        for (acc, v) in values.iter_mut().zip(slot) {
            *acc += v;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn single_process_reduce_is_identity() {
        let group = SingleProcess;
        let mut values = vec![1.0, 2.0];
        group.reduce_sum(0, &mut values).unwrap();
        assert_eq!(values, vec![1.0, 2.0]);
        assert!(group.reduce_sum(1, &mut values).is_err());
    }

    #[test]
    fn local_group_sums_on_destination_only() {
        let results: Vec<(usize, Vec<f32>)> = thread::scope(|s| {
            let handles: Vec<_> = LocalGroup::create(3)
                .into_iter()
                .map(|group| {
                    s.spawn(move || {
                        let mut values = vec![group.rank() as f32, 1.0];
                        group.reduce_sum(0, &mut values).unwrap();
                        // A second round must not see stale slots.
                        let mut again = vec![10.0];
                        group.reduce_sum(0, &mut again).unwrap();
                        (group.rank(), vec![values[0], values[1], again[0]])
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (rank, values) in results {
            if rank == 0 {
                assert_eq!(values, vec![3.0, 3.0, 30.0]);
            } else {
                assert_eq!(values, vec![rank as f32, 1.0, 10.0]);
            }
        }
    }

    #[test]
    fn mismatched_lengths_are_reported_on_destination() {
        let results: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = LocalGroup::create(2)
                .into_iter()
                .map(|group| {
                    s.spawn(move || {
                        let mut values = vec![0.0; group.rank() + 1];
                        group.reduce_sum(0, &mut values).is_err()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![true, false]);
    }
}
