//! Iteration-based batch loader: a fixed number of batches across as many epochs as needed.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::dataset::{collate, CollateConfig, DatasetError, DatasetResult, DetectionDataset, LoadedBatch};

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub max_iter: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub drop_last: bool,
    pub rank: usize,
    pub num_replicas: usize,
    pub collate: CollateConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_iter: 1,
            shuffle: true,
            seed: 0,
            drop_last: false,
            rank: 0,
            num_replicas: 1,
            collate: CollateConfig::default(),
        }
    }
}

/// Every rank draws `per_replica` samples per epoch. Shards shorter than that wrap around
/// the epoch order, so all ranks share one epoch length and stay aligned.
pub struct IterationLoader<D> {
    dataset: D,
    cfg: LoaderConfig,
    per_replica: usize,
    batches_per_epoch: usize,
}

impl<D: DetectionDataset> IterationLoader<D> {
    pub fn new(dataset: D, mut cfg: LoaderConfig) -> DatasetResult<Self> {
        cfg.batch_size = cfg.batch_size.max(1);
        cfg.num_replicas = cfg.num_replicas.max(1);
        if cfg.rank >= cfg.num_replicas {
            return Err(DatasetError::InvalidShard {
                rank: cfg.rank,
                num_replicas: cfg.num_replicas,
            });
        }
        let per_replica = dataset.len().div_ceil(cfg.num_replicas);
        let batches_per_epoch = if cfg.drop_last {
            per_replica / cfg.batch_size
        } else {
            per_replica.div_ceil(cfg.batch_size)
        };
        if batches_per_epoch == 0 {
            return Err(DatasetError::Empty);
        }
        tracing::debug!(
            rank = cfg.rank,
            num_replicas = cfg.num_replicas,
            per_replica,
            batches_per_epoch,
            "sharded loader"
        );
        Ok(Self {
            dataset,
            cfg,
            per_replica,
            batches_per_epoch,
        })
    }

    /// Total iterations, not epochs.
    pub fn len(&self) -> usize {
        self.cfg.max_iter
    }

    pub fn is_empty(&self) -> bool {
        self.cfg.max_iter == 0
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.batches_per_epoch
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    pub fn collate_config(&self) -> &CollateConfig {
        &self.cfg.collate
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Dataset indices this rank visits in `epoch`, in order.
    pub fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.cfg.shuffle {
            let mut rng = StdRng::seed_from_u64(self.cfg.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
            .iter()
            .copied()
            .cycle()
            .take(self.per_replica * self.cfg.num_replicas)
            .skip(self.cfg.rank)
            .step_by(self.cfg.num_replicas)
            .collect()
    }

    /// Yields `(iteration_index, batch)` for `start_iter..max_iter`.
    pub fn iter_from(&self, start_iter: usize) -> LoaderIter<'_, D> {
        LoaderIter {
            loader: self,
            next: start_iter,
            epoch: usize::MAX,
            order: Vec::new(),
        }
    }

    fn load(&self, indices: Vec<usize>) -> DatasetResult<LoadedBatch> {
        let samples = indices
            .par_iter()
            .map(|&i| self.dataset.get(i))
            .collect::<DatasetResult<Vec<_>>>()?;
        collate(samples, indices, &self.cfg.collate)
    }
}

pub struct LoaderIter<'a, D> {
    loader: &'a IterationLoader<D>,
    next: usize,
    epoch: usize,
    order: Vec<usize>,
}

impl<D: DetectionDataset> Iterator for LoaderIter<'_, D> {
    type Item = DatasetResult<(usize, LoadedBatch)>;

    fn next(&mut self) -> Option<Self::Item> {
        let loader = self.loader;
        if self.next >= loader.cfg.max_iter {
            return None;
        }
        let iteration = self.next;
        self.next += 1;

        let epoch = iteration / loader.batches_per_epoch;
        let slot = iteration % loader.batches_per_epoch;
        if self.epoch != epoch {
            self.order = loader.epoch_indices(epoch);
            self.epoch = epoch;
        }
        let start = slot * loader.cfg.batch_size;
        let end = (start + loader.cfg.batch_size).min(self.order.len());
        let indices = self.order[start..end].to_vec();
        Some(loader.load(indices).map(|batch| (iteration, batch)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.loader.cfg.max_iter.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SyntheticDataset;
    use std::collections::BTreeSet;

    fn loader(len: usize, cfg: LoaderConfig) -> IterationLoader<SyntheticDataset> {
        IterationLoader::new(SyntheticDataset::new(len, 8, 8, 3), cfg).unwrap()
    }

    fn indices(loader: &IterationLoader<SyntheticDataset>, start: usize) -> Vec<(usize, Vec<usize>)> {
        loader
            .iter_from(start)
            .map(|item| {
                let (it, batch) = item.unwrap();
                (it, batch.indices)
            })
            .collect()
    }

    #[test]
    fn length_is_max_iter_across_epochs() {
        let l = loader(
            5,
            LoaderConfig {
                batch_size: 2,
                max_iter: 7,
                ..Default::default()
            },
        );
        assert_eq!(l.len(), 7);
        assert_eq!(l.batches_per_epoch(), 3);
        let all = indices(&l, 0);
        assert_eq!(all.len(), 7);
        assert_eq!(all.iter().map(|(i, _)| *i).collect::<Vec<_>>(), (0..7).collect::<Vec<_>>());
        // The last batch of each epoch is partial without drop_last.
        assert_eq!(all[2].1.len(), 1);
        let epoch0: BTreeSet<usize> = all[..3].iter().flat_map(|(_, b)| b.clone()).collect();
        assert_eq!(epoch0, (0..5).collect());
    }

    #[test]
    fn resume_matches_tail_of_full_run() {
        let cfg = LoaderConfig {
            batch_size: 3,
            max_iter: 10,
            seed: 11,
            ..Default::default()
        };
        let l = loader(7, cfg);
        let full = indices(&l, 0);
        let resumed = indices(&l, 4);
        assert_eq!(resumed, full[4..].to_vec());
        assert!(indices(&l, 10).is_empty());
    }

    fn shard(rank: usize, max_iter: usize) -> IterationLoader<SyntheticDataset> {
        loader(
            9,
            LoaderConfig {
                batch_size: 2,
                max_iter,
                rank,
                num_replicas: 2,
                seed: 5,
                ..Default::default()
            },
        )
    }

    #[test]
    fn uneven_shards_are_padded_and_cover_epoch() {
        let a = shard(0, 2).epoch_indices(0);
        let b = shard(1, 2).epoch_indices(0);
        assert_eq!(a.len(), 5);
        assert_eq!(b.len(), 5);
        let union: BTreeSet<usize> = a.iter().chain(b.iter()).copied().collect();
        assert_eq!(union, (0..9).collect());
        // Only the single wrapped sample may appear on both ranks.
        let a: BTreeSet<usize> = a.into_iter().collect();
        let b: BTreeSet<usize> = b.into_iter().collect();
        assert!(a.intersection(&b).count() <= 1);
    }

    #[test]
    fn uneven_shards_share_epoch_boundaries() {
        let (r0, r1) = (shard(0, 12), shard(1, 12));
        assert_eq!(r0.batches_per_epoch(), 3);
        assert_eq!(r1.batches_per_epoch(), 3);
        let (a, b) = (indices(&r0, 0), indices(&r1, 0));
        assert_eq!(a.len(), 12);
        assert_eq!(b.len(), 12);
        for ((it, x), (_, y)) in a.iter().zip(b.iter()) {
            let x: BTreeSet<_> = x.iter().collect();
            let y: BTreeSet<_> = y.iter().collect();
            assert!(x.is_disjoint(&y), "iteration {it}: {x:?} vs {y:?}");
        }
    }

    #[test]
    fn rank_outside_group_is_rejected() {
        let err = IterationLoader::new(
            SyntheticDataset::new(4, 4, 4, 0),
            LoaderConfig {
                rank: 2,
                num_replicas: 2,
                ..Default::default()
            },
        );
        assert!(matches!(
            err,
            Err(DatasetError::InvalidShard {
                rank: 2,
                num_replicas: 2
            })
        ));
    }

    #[test]
    fn drop_last_skips_partial_batches() {
        let l = loader(
            5,
            LoaderConfig {
                batch_size: 2,
                max_iter: 4,
                drop_last: true,
                shuffle: false,
                ..Default::default()
            },
        );
        assert_eq!(l.batches_per_epoch(), 2);
        let all = indices(&l, 0);
        assert_eq!(all[0].1, vec![0, 1]);
        assert_eq!(all[1].1, vec![2, 3]);
        assert_eq!(all[2].1, vec![0, 1]);
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let err = IterationLoader::new(SyntheticDataset::new(0, 4, 4, 0), LoaderConfig::default());
        assert!(matches!(err, Err(DatasetError::Empty)));
    }
}
