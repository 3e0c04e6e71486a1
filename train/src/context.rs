use std::sync::Arc;
use std::time::{Duration, Instant};

use burn::prelude::Backend;

use crate::error::TrainError;
use crate::reduce::{Collective, DistributedReducer};

/// State shared by every epoch of a run.
pub struct RunContext<B: Backend> {
    pub device: B::Device,
    collective: Option<Arc<dyn Collective>>,
    start: Instant,
    /// Current epoch, zero based.
    pub epoch: usize,
    /// Optimizer steps taken since the start of the run.
    pub global_step: usize,
}

impl<B: Backend> RunContext<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            collective: None,
            start: Instant::now(),
            epoch: 0,
            global_step: 0,
        }
    }

    pub fn distributed(device: B::Device, collective: Arc<dyn Collective>) -> Self {
        Self {
            collective: Some(collective),
            ..Self::new(device)
        }
    }

    pub fn rank(&self) -> Option<usize> {
        self.collective.as_ref().map(|c| c.rank())
    }

    pub fn world_size(&self) -> usize {
        self.collective.as_ref().map_or(1, |c| c.world_size())
    }

    /// Only the leader publishes telemetry and writes exported images.
    pub fn is_leader(&self) -> bool {
        matches!(self.rank(), None | Some(0))
    }

    pub fn reducer(&self) -> DistributedReducer {
        match &self.collective {
            Some(collective) => DistributedReducer::new(collective.clone()),
            None => DistributedReducer::disabled(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Prefix of every log line, `Rank:{r}, ` in distributed runs.
    pub fn log_prefix(&self) -> String {
        match self.rank() {
            Some(rank) => format!("Rank:{rank}, "),
            None => String::new(),
        }
    }

    pub fn begin_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    /// Ends a phase on every worker at once. When any worker failed, all of them
    /// return an error: their own, or [`TrainError::PeerFailed`].
    ///
    /// Every worker must call this at the same point, whatever its rank.
    pub fn settle<T, E: From<TrainError>>(&self, result: Result<T, E>) -> Result<T, E> {
        let all_ok = match self.reducer().all_succeeded(result.is_ok()) {
            Ok(all_ok) => all_ok,
            Err(e) => return result.and(Err(TrainError::from(e).into())),
        };
        match result {
            Ok(_) if !all_ok => Err(TrainError::PeerFailed.into()),
            result => result,
        }
    }
}
