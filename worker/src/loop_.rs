use std::{
    path::PathBuf,
    time::Instant,
};

use collective::ProcessGroup;
use log::{debug, error, info};
use ndarray::{Array3, Array4, Axis};
use seg_core::{Loader, OhemCrossEntropy, Optimizer, SegModel};

use crate::{
    checkpoint,
    context::WorkerContext,
    error::{Result, WorkerErr},
    stats::{self, LossWindow},
};

/// Reporting and checkpoint cadence for the loop.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub max_epoch: usize,
    pub msg_iter: usize,
    pub checkpoint_interval: usize,
    pub result_path: PathBuf,
}

/// Outcome of a completed training run.
#[derive(Debug, Clone, Copy)]
pub struct TrainSummary {
    pub steps: usize,
    pub last_lr: f32,
}

/// Drives the per-rank step loop.
///
/// Every rank executes the identical sequence: pull a batch, place it on the
/// bound device, forward, OHEM loss, backward, synchronize gradients across
/// the cohort, update. The gradient all-reduce is the only cross-process
/// point in steady state; it blocks until every rank arrives, which is what
/// keeps parameter replicas bit-identical step after step. Loss statistics,
/// reporting and checkpointing are coordinator-local and never block peers.
pub struct TrainLoop<M, L> {
    ctx: WorkerContext,
    group: ProcessGroup,
    model: M,
    loader: L,
    optimizer: Optimizer,
    criterion: OhemCrossEntropy,
    opts: LoopOptions,
    window: LossWindow,
}

impl<M: SegModel, L: Loader> TrainLoop<M, L> {
    pub fn new(
        ctx: WorkerContext,
        group: ProcessGroup,
        model: M,
        loader: L,
        optimizer: Optimizer,
        criterion: OhemCrossEntropy,
        opts: LoopOptions,
    ) -> Self {
        Self {
            ctx,
            group,
            model,
            loader,
            optimizer,
            criterion,
            opts,
            window: LossWindow::default(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Runs to the precomputed iteration budget.
    ///
    /// # Returns
    /// A summary once `max_epoch * batches_per_epoch` steps have completed.
    ///
    /// # Errors
    /// Data, training-math, and collective failures are all fatal; there is
    /// no skip-and-retry for a malformed batch or a failed synchronization.
    pub fn run(&mut self) -> Result<TrainSummary> {
        let batches_per_epoch = self.loader.batches_per_epoch();
        if batches_per_epoch == 0 {
            return Err(WorkerErr::Config("loader yields no batches".to_string()));
        }
        let max_iteration = self.opts.max_epoch * batches_per_epoch;

        // Start from rank 0's parameters so every replica is identical.
        let mut flat = self.model.params_flat();
        self.group.broadcast(&mut flat)?;
        self.model.load_flat(&flat)?;

        if self.ctx.is_coordinator() {
            info!("optimizer launched successfully, max_iteration {max_iteration}");
        }

        let glob_start = Instant::now();
        let mut start = Instant::now();
        let mut it = 0usize;

        for _epoch in 0..self.opts.max_epoch {
            for _ in 0..batches_per_epoch {
                let batch = self.loader.next_batch()?;
                let images = self.ctx.device().place(batch.images);
                let labels = squeeze_labels(self.ctx.device().place(batch.labels))?;

                self.optimizer.zero_grad();
                let scores = self.model.forward(images.view())?;
                let loss = self.criterion.loss(scores.view(), labels.view())?;
                let grad_scores = self.criterion.loss_prime(scores.view(), labels.view())?;
                self.model
                    .backward(images.view(), grad_scores.view(), self.optimizer.grads_mut())?;

                // Gradient synchronization: blocking; every rank must reach
                // this point each step or the cohort deadlocks.
                self.group.all_reduce_mean(self.optimizer.grads_mut())?;

                let mut params = self.model.params_mut();
                self.optimizer.step(&mut params)?;
                drop(params);

                self.window.push(loss);

                if it % self.opts.checkpoint_interval == 0 && self.ctx.is_coordinator() {
                    match checkpoint::save_model(&self.opts.result_path, it, &self.model) {
                        Ok(path) => debug!(step = it; "wrote checkpoint {}", path.display()),
                        Err(e) => error!(step = it; "checkpoint write failed: {e}"),
                    }
                }

                if it % self.opts.msg_iter == 0 && it != 0 && self.ctx.is_coordinator() {
                    self.report(it, max_iteration, glob_start, &mut start);
                }

                it += 1;
            }
        }

        Ok(TrainSummary {
            steps: it,
            last_lr: self.optimizer.lr(),
        })
    }

    /// Coordinator-local progress line; clears the loss window.
    fn report(&mut self, it: usize, max_iteration: usize, glob_start: Instant, start: &mut Instant) {
        let Some(loss_avg) = self.window.mean() else {
            return;
        };

        let now = Instant::now();
        let t_intv = now - *start;
        let glob_t_intv = now - glob_start;
        let eta = match stats::eta(max_iteration, it, glob_t_intv) {
            Some(eta) => stats::format_duration(eta),
            None => return,
        };

        info!(
            "iter: {it}/{max_iteration}, lr: {lr:.6}, loss: {loss_avg:.4}, eta: {eta}, time: {time:.4}",
            lr = self.optimizer.lr(),
            time = t_intv.as_secs_f64(),
        );

        self.window.clear();
        *start = now;
    }
}

/// Removes the singleton channel dimension from `(n, 1, h, w)` labels.
fn squeeze_labels(labels: Array4<u32>) -> Result<Array3<u32>> {
    let channel = labels.len_of(Axis(1));
    if channel != 1 {
        return Err(WorkerErr::LabelShape { got: channel });
    }
    Ok(labels.index_axis_move(Axis(1), 0))
}
