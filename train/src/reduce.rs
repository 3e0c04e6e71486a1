//! Cross-process averaging of epoch statistics.
//!
//! Every worker must call [`DistributedReducer::reduce`] the same number of times,
//! in the same order, with dictionaries holding the same keys and value lengths.
//! A worker that skips a call deadlocks the group.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Barrier, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("Rank {rank} sent {found} values, expected {expected}")]
    LengthMismatch {
        rank: usize,
        found: usize,
        expected: usize,
    },

    #[error("Rank {rank} sent statistics under different keys")]
    LayoutMismatch { rank: usize },

    #[error("A group member panicked during a collective call")]
    Poisoned,
}

/// Blocking collective operations over a fixed group of workers.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Gathers every rank's values, indexed by rank. Blocks until all ranks arrive.
    fn all_gather(&self, values: &[f64]) -> Result<Vec<Vec<f64>>, ReduceError>;
}

/// A group of one.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, values: &[f64]) -> Result<Vec<Vec<f64>>, ReduceError> {
        Ok(vec![values.to_vec()])
    }
}

struct GroupState {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f64>>>,
}

/// In-process group: one member per worker thread.
pub struct LocalGroup;

impl LocalGroup {
    /// Creates the members of a group of `world_size` workers, in rank order.
    pub fn new(world_size: usize) -> Vec<LocalMember> {
        let world_size = world_size.max(1);
        let state = Arc::new(GroupState {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        (0..world_size)
            .map(|rank| LocalMember {
                rank,
                world_size,
                state: state.clone(),
            })
            .collect()
    }
}

pub struct LocalMember {
    rank: usize,
    world_size: usize,
    state: Arc<GroupState>,
}

impl Collective for LocalMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, values: &[f64]) -> Result<Vec<Vec<f64>>, ReduceError> {
        {
            let mut slots = self.state.slots.lock().map_err(|_| ReduceError::Poisoned)?;
            slots[self.rank] = values.to_vec();
        }
        self.state.barrier.wait();
        let gathered = self
            .state
            .slots
            .lock()
            .map_err(|_| ReduceError::Poisoned)?
            .clone();
        // Nobody may write the next round before everyone has read this one.
        self.state.barrier.wait();

        for (rank, slot) in gathered.iter().enumerate() {
            if slot.len() != values.len() {
                return Err(ReduceError::LengthMismatch {
                    rank,
                    found: slot.len(),
                    expected: values.len(),
                });
            }
        }
        Ok(gathered)
    }
}

pub type StatsDict = BTreeMap<String, Vec<f64>>;

/// Averages statistics over all workers of a run.
#[derive(Clone, Default)]
pub struct DistributedReducer {
    collective: Option<Arc<dyn Collective>>,
}

impl DistributedReducer {
    pub fn new(collective: Arc<dyn Collective>) -> Self {
        Self {
            collective: Some(collective),
        }
    }

    pub fn disabled() -> Self {
        Self { collective: None }
    }

    /// Replaces every value with its mean across workers. The identity without
    /// a group, or with a group of one.
    ///
    /// Means are accumulated in rank order as `x0 + sum((xr - x0) / n)`, so every
    /// worker computes the same bits and equal inputs come back unchanged.
    pub fn reduce(&self, stats: StatsDict) -> Result<StatsDict, ReduceError> {
        let Some(collective) = self.collective.as_ref() else {
            return Ok(stats);
        };
        if collective.world_size() <= 1 {
            return Ok(stats);
        }

        let layout = layout_of(&stats);
        let mut flat = layout.to_vec();
        flat.extend(stats.values().flatten());
        let gathered = collective.all_gather(&flat)?;
        for (rank, values) in gathered.iter().enumerate() {
            if values[..LAYOUT_LEN] != layout {
                return Err(ReduceError::LayoutMismatch { rank });
            }
        }
        let n = gathered.len() as f64;

        let mean: Vec<f64> = (LAYOUT_LEN..flat.len())
            .map(|i| {
                let x0 = gathered[0][i];
                x0 + gathered.iter().map(|rank| (rank[i] - x0) / n).sum::<f64>()
            })
            .collect();

        let mut offset = 0;
        Ok(stats
            .into_iter()
            .map(|(key, values)| {
                let len = values.len();
                let reduced = mean[offset..offset + len].to_vec();
                offset += len;
                (key, reduced)
            })
            .collect())
    }

    /// True on every worker when `ok` holds on all of them. Lets the workers of a
    /// group leave a phase together when one of them failed.
    pub fn all_succeeded(&self, ok: bool) -> Result<bool, ReduceError> {
        let Some(collective) = self.collective.as_ref() else {
            return Ok(ok);
        };
        if collective.world_size() <= 1 {
            return Ok(ok);
        }
        let gathered = collective.all_gather(&[if ok { 1.0 } else { 0.0 }])?;
        Ok(gathered.iter().all(|values| values[0] == 1.0))
    }
}

const LAYOUT_LEN: usize = 2;

/// Fingerprint of the keys and value lengths of `stats`, as two exactly
/// representable floats.
fn layout_of(stats: &StatsDict) -> [f64; LAYOUT_LEN] {
    let mut hasher = DefaultHasher::new();
    for (key, values) in stats {
        key.hash(&mut hasher);
        values.len().hash(&mut hasher);
    }
    let hash = hasher.finish();
    [(hash >> 32) as f64, (hash & u32::MAX as u64) as f64]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn stats(psnr: Vec<f64>, loss: f64) -> StatsDict {
        BTreeMap::from([("psnr".to_owned(), psnr), ("loss".to_owned(), vec![loss])])
    }

    fn run_group(inputs: Vec<StatsDict>) -> Vec<StatsDict> {
        let members = LocalGroup::new(inputs.len());
        let handles: Vec<_> = members
            .into_iter()
            .zip(inputs)
            .map(|(member, input)| {
                thread::spawn(move || {
                    let reducer = DistributedReducer::new(Arc::new(member));
                    reducer.reduce(input).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn identity_without_group() {
        let input = stats(vec![31.5, 28.25], 0.125);
        assert_eq!(DistributedReducer::disabled().reduce(input.clone()).unwrap(), input);

        let single = DistributedReducer::new(Arc::new(SingleProcess));
        assert_eq!(single.reduce(input.clone()).unwrap(), input);

        let alone = LocalGroup::new(1).remove(0);
        assert_eq!(DistributedReducer::new(Arc::new(alone)).reduce(input.clone()).unwrap(), input);
    }

    #[test]
    fn constant_inputs_are_exact() {
        let input = stats(vec![0.1, 0.1], 0.1);
        for output in run_group(vec![input.clone(), input.clone(), input.clone()]) {
            assert_eq!(output, input);
        }
    }

    #[test]
    fn every_rank_gets_the_mean() {
        let outputs = run_group(vec![
            stats(vec![10.0, 20.0], 1.0),
            stats(vec![20.0, 40.0], 2.0),
            stats(vec![30.0, 60.0], 6.0),
            stats(vec![40.0, 80.0], 7.0),
        ]);

        for output in &outputs {
            assert_eq!(output["psnr"], vec![25.0, 50.0]);
            assert_eq!(output["loss"], vec![4.0]);
        }
    }

    #[test]
    fn repeated_rounds_stay_in_lockstep() {
        let members = LocalGroup::new(2);
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let rank = member.rank() as f64;
                    let reducer = DistributedReducer::new(Arc::new(member));
                    (0..5)
                        .map(|round| {
                            let input = stats(vec![round as f64 + rank], rank);
                            reducer.reduce(input).unwrap()["psnr"][0]
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![0.5, 1.5, 2.5, 3.5, 4.5]);
        }
    }

    #[test]
    fn mismatched_lengths_fail() {
        let members = LocalGroup::new(2);
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let values = vec![1.0; member.rank() + 1];
                    member.all_gather(&values)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.iter().all(|r| matches!(r, Err(ReduceError::LengthMismatch { .. }))));
    }

    #[test]
    fn mismatched_keys_fail() {
        let members = LocalGroup::new(2);
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    // Same number of values, different auxiliary loss names.
                    let name = if member.rank() == 0 { "aux/smooth" } else { "aux/tv" };
                    let input = BTreeMap::from([("loss".to_owned(), vec![1.0]), (name.to_owned(), vec![2.0])]);
                    DistributedReducer::new(Arc::new(member)).reduce(input)
                })
            })
            .collect();

        for handle in handles {
            assert!(matches!(handle.join().unwrap(), Err(ReduceError::LayoutMismatch { .. })));
        }
    }

    #[test]
    fn one_failure_is_seen_by_all() {
        assert!(DistributedReducer::disabled().all_succeeded(true).unwrap());
        assert!(!DistributedReducer::disabled().all_succeeded(false).unwrap());

        let members = LocalGroup::new(3);
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let ok = member.rank() != 2;
                    let reducer = DistributedReducer::new(Arc::new(member));
                    (reducer.all_succeeded(ok).unwrap(), reducer.all_succeeded(true).unwrap())
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), (false, true));
        }
    }
}
