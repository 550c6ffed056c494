use std::{env, io, path::PathBuf};

use collective::{GroupConfig, ProcessGroup};
use log::info;
use seg_core::{
    GroupSettings, Loader, LrSchedule, OhemCrossEntropy, Optimizer, PixelClassifier, SegModel,
    SyntheticLoader,
};

use worker::{LoopOptions, Result, TrainConfig, TrainLoop, WorkerContext};

fn main() -> io::Result<()> {
    env_logger::init();

    let config_path: PathBuf = env::args()
        .nth(1)
        .unwrap_or_else(|| "train.json".to_string())
        .into();
    let rank: usize = env::var("RANK")
        .map_err(|_| io::Error::other("RANK must be set"))?
        .parse()
        .map_err(io::Error::other)?;

    run(rank, config_path)?;
    Ok(())
}

fn run(rank: usize, config_path: PathBuf) -> Result<()> {
    let cfg = TrainConfig::from_file(&config_path)?;

    // Bind the device before any tensor work; a bad ordinal must never get
    // as far as allocating on the wrong slot.
    let ctx = WorkerContext::bind(rank, cfg.world_size)?;

    let group = ProcessGroup::bootstrap(&GroupConfig {
        rank,
        world_size: cfg.world_size,
        rendezvous: cfg.rendezvous()?,
        timeout: cfg.rendezvous_timeout(),
    })?;

    if ctx.is_coordinator() {
        info!("arguments: {cfg:?}");
    }

    let loader = SyntheticLoader::new(
        cfg.samples_per_rank,
        cfg.batch_size_per_device,
        cfg.in_channels,
        cfg.num_classes,
        (cfg.crop_size[0], cfg.crop_size[1]),
        cfg.seed.wrapping_add(rank as u64),
    )?;
    let model = PixelClassifier::new(cfg.in_channels, cfg.num_classes, cfg.seed)?;

    let max_iteration = cfg.max_epoch * loader.batches_per_epoch();
    let schedule = LrSchedule::new(
        cfg.base_lr,
        cfg.warmup_steps.min(max_iteration),
        cfg.warmup_start_lr,
        max_iteration,
        cfg.power,
    )?;

    let groups: Vec<_> = model
        .param_groups()
        .iter()
        .map(|spec| {
            (
                spec.len,
                GroupSettings {
                    lr_multiplier: spec.lr_multiplier,
                    weight_decay: if spec.decay { cfg.weight_decay } else { 0.0 },
                    momentum: cfg.momentum,
                },
            )
        })
        .collect();
    let optimizer = Optimizer::new(schedule, &groups)?;
    let criterion = OhemCrossEntropy::new(cfg.ohem_loss_thresh(), cfg.ohem_min_kept());

    let opts = LoopOptions {
        max_epoch: cfg.max_epoch,
        msg_iter: cfg.msg_iter,
        checkpoint_interval: cfg.checkpoint_interval,
        result_path: cfg.result_path.clone(),
    };

    let summary = TrainLoop::new(ctx, group, model, loader, optimizer, criterion, opts).run()?;
    info!(rank = rank; "training finished after {} steps", summary.steps);
    Ok(())
}
