use std::{
    fs,
    net::{SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::{Result, WorkerErr};

/// Full training configuration, read once at process start.
///
/// Defaults mirror the Cityscapes retraining recipe; any field can be
/// overridden from the JSON file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TrainConfig {
    pub world_size: usize,

    #[serde(default = "default_addr")]
    pub rendezvous_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_rendezvous_timeout_secs")]
    pub rendezvous_timeout_secs: u64,

    #[serde(default = "default_base_lr")]
    pub base_lr: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    #[serde(default)]
    pub warmup_start_lr: f32,
    #[serde(default = "default_power")]
    pub power: f32,

    pub max_epoch: usize,

    /// Probability cutoff; converted to the loss-space threshold `-ln(p)`.
    #[serde(default = "default_ohem_threshold")]
    pub ohem_threshold: f32,
    /// Fraction of a batch's pixels that must always contribute.
    #[serde(default = "default_ohem_min_kept_fraction")]
    pub ohem_min_kept_fraction: f32,

    #[serde(default = "default_msg_iter")]
    pub msg_iter: usize,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    pub crop_size: [usize; 2],
    pub batch_size_per_device: usize,
    pub result_path: PathBuf,

    // concrete collaborator knobs
    pub in_channels: usize,
    pub num_classes: usize,
    pub samples_per_rank: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    29500
}

fn default_rendezvous_timeout_secs() -> u64 {
    60
}

fn default_base_lr() -> f32 {
    0.01
}

fn default_momentum() -> f32 {
    0.9
}

fn default_weight_decay() -> f32 {
    5e-4
}

fn default_warmup_steps() -> usize {
    1000
}

fn default_power() -> f32 {
    0.9
}

fn default_ohem_threshold() -> f32 {
    0.7
}

fn default_ohem_min_kept_fraction() -> f32 {
    1.0 / 16.0
}

fn default_msg_iter() -> usize {
    50
}

fn default_checkpoint_interval() -> usize {
    10_000
}

fn default_seed() -> u64 {
    1
}

impl TrainConfig {
    /// Loads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)
            .map_err(|e| WorkerErr::Config(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(WorkerErr::Config(msg.to_string()));

        if self.world_size == 0 {
            return fail("world_size must be at least 1");
        }
        if self.max_epoch == 0 {
            return fail("max_epoch must be positive");
        }
        if self.msg_iter == 0 {
            return fail("msg_iter must be positive");
        }
        if self.checkpoint_interval == 0 {
            return fail("checkpoint_interval must be positive");
        }
        if self.batch_size_per_device == 0 {
            return fail("batch_size_per_device must be positive");
        }
        if !(self.ohem_threshold > 0.0 && self.ohem_threshold < 1.0) {
            return fail("ohem_threshold must be a probability in (0, 1)");
        }
        if !(self.ohem_min_kept_fraction > 0.0 && self.ohem_min_kept_fraction <= 1.0) {
            return fail("ohem_min_kept_fraction must be in (0, 1]");
        }
        Ok(())
    }

    pub fn rendezvous(&self) -> Result<SocketAddr> {
        let ip = self
            .rendezvous_addr
            .parse()
            .map_err(|e| WorkerErr::Config(format!("rendezvous_addr: {e}")))?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.port)))
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(self.rendezvous_timeout_secs)
    }

    /// The OHEM pixel floor: a fixed fraction of each batch's pixel count.
    pub fn ohem_min_kept(&self) -> usize {
        let pixels = self.batch_size_per_device * self.crop_size[0] * self.crop_size[1];
        ((pixels as f32 * self.ohem_min_kept_fraction) as usize).max(1)
    }

    /// The loss-space hard-pixel cutoff.
    pub fn ohem_loss_thresh(&self) -> f32 {
        -self.ohem_threshold.ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "world_size": 2,
            "max_epoch": 3,
            "crop_size": [16, 16],
            "batch_size_per_device": 4,
            "result_path": "/tmp/out",
            "in_channels": 3,
            "num_classes": 2,
            "samples_per_rank": 8,
        })
    }

    fn parse(value: serde_json::Value) -> TrainConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn defaults_fill_the_recipe() {
        let cfg = parse(minimal());
        cfg.validate().unwrap();
        assert_eq!(cfg.base_lr, 0.01);
        assert_eq!(cfg.warmup_steps, 1000);
        assert_eq!(cfg.checkpoint_interval, 10_000);
        assert_eq!(cfg.rendezvous().unwrap().port(), 29500);
    }

    #[test]
    fn min_kept_is_a_fraction_of_batch_pixels() {
        let cfg = parse(minimal());
        // 4 * 16 * 16 / 16
        assert_eq!(cfg.ohem_min_kept(), 64);
    }

    #[test]
    fn loss_thresh_is_negative_log_probability() {
        let cfg = parse(minimal());
        assert!((cfg.ohem_loss_thresh() - 0.35667497).abs() < 1e-5);
    }

    #[test]
    fn rejects_bad_bounds() {
        let mut v = minimal();
        v["msg_iter"] = 0.into();
        assert!(parse(v).validate().is_err());

        let mut v = minimal();
        v["ohem_threshold"] = serde_json::json!(1.5);
        assert!(parse(v).validate().is_err());

        let mut v = minimal();
        v["world_size"] = 0.into();
        assert!(parse(v).validate().is_err());
    }
}
