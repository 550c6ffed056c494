use ndarray::{Array4, ArrayView4};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use crate::error::{Result, SegErr};

/// One entry of a model's parameter partition.
///
/// The model declares structure (which parameters exist, whether they take
/// weight decay, their relative rate); the caller supplies the actual
/// hyperparameters when building the optimizer.
#[derive(Debug, Clone, Copy)]
pub struct GroupSpec {
    pub name: &'static str,
    pub len: usize,
    /// Whether weight decay applies to this group (biases usually opt out).
    pub decay: bool,
    pub lr_multiplier: f32,
}

/// A named view of one parameter tensor, for checkpoint serialization.
#[derive(Debug)]
pub struct NamedTensor<'a> {
    pub name: &'static str,
    pub shape: Vec<usize>,
    pub data: &'a [f32],
}

/// The segmentation-model seam consumed by the training loop.
///
/// The loop treats the architecture as opaque: it only needs per-pixel class
/// scores out of `forward`, score gradients folded into the flat parameter
/// gradient by `backward`, and flat access to the parameters for the
/// optimizer, the collective broadcast, and checkpointing.
pub trait SegModel {
    fn num_classes(&self) -> usize;

    /// The parameter partition, in flat order.
    fn param_groups(&self) -> Vec<GroupSpec>;

    /// Mutable parameter slices, one per group, in partition order.
    fn params_mut(&mut self) -> Vec<&mut [f32]>;

    /// A flat snapshot of all parameters, groups concatenated.
    fn params_flat(&self) -> Vec<f32>;

    /// Overwrites all parameters from a flat snapshot.
    ///
    /// # Errors
    /// `SegErr::ShapeMismatch` when `flat` does not match the parameter count.
    fn load_flat(&mut self, flat: &[f32]) -> Result<()>;

    /// Named tensors for checkpoint serialization.
    fn state_dict(&self) -> Vec<NamedTensor<'_>>;

    /// Per-pixel class scores, `(batch, classes, height, width)`.
    fn forward(&self, images: ArrayView4<f32>) -> Result<Array4<f32>>;

    /// Accumulates parameter gradients into `grads` (flat, group order)
    /// given the loss gradient with respect to the scores.
    fn backward(
        &self,
        images: ArrayView4<f32>,
        grad_scores: ArrayView4<f32>,
        grads: &mut [f32],
    ) -> Result<()>;
}

/// A per-pixel linear classifier (a 1x1 convolution).
///
/// Small enough to verify the training core end to end while the real
/// architecture stays behind the [`SegModel`] seam. Weight and bias form two
/// parameter groups; the bias skips weight decay and trains at twice the
/// rate, the usual head setup.
#[derive(Debug, Clone)]
pub struct PixelClassifier {
    in_channels: usize,
    classes: usize,
    /// Row-major `(classes, in_channels)`.
    weight: Vec<f32>,
    bias: Vec<f32>,
}

const BIAS_LR_MULTIPLIER: f32 = 2.0;

impl PixelClassifier {
    /// Creates a classifier with seeded normal-initialized weights.
    ///
    /// The seed makes parameter state reproducible per process; replicas
    /// still synchronize through the cohort broadcast at loop start.
    ///
    /// # Errors
    /// `SegErr::InvalidModel` on a degenerate channel/class count.
    pub fn new(in_channels: usize, classes: usize, seed: u64) -> Result<Self> {
        if in_channels == 0 {
            return Err(SegErr::InvalidModel("in_channels must be positive"));
        }
        if classes < 2 {
            return Err(SegErr::InvalidModel("at least two classes are required"));
        }

        let std = 1.0 / (in_channels as f32).sqrt();
        // SAFETY: std is finite and positive for any valid in_channels.
        let normal = Normal::new(0.0, std).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);

        Ok(Self {
            in_channels,
            classes,
            weight: (0..classes * in_channels)
                .map(|_| normal.sample(&mut rng))
                .collect(),
            bias: vec![0.0; classes],
        })
    }

    fn check_images(&self, images: &ArrayView4<f32>) -> Result<()> {
        let (_, channels, _, _) = images.dim();
        if channels != self.in_channels {
            return Err(SegErr::ShapeMismatch {
                what: "image channels",
                got: channels,
                expected: self.in_channels,
            });
        }
        Ok(())
    }

    fn num_params(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

impl SegModel for PixelClassifier {
    fn num_classes(&self) -> usize {
        self.classes
    }

    fn param_groups(&self) -> Vec<GroupSpec> {
        vec![
            GroupSpec {
                name: "weight",
                len: self.weight.len(),
                decay: true,
                lr_multiplier: 1.0,
            },
            GroupSpec {
                name: "bias",
                len: self.bias.len(),
                decay: false,
                lr_multiplier: BIAS_LR_MULTIPLIER,
            },
        ]
    }

    fn params_mut(&mut self) -> Vec<&mut [f32]> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn params_flat(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.num_params());
        flat.extend_from_slice(&self.weight);
        flat.extend_from_slice(&self.bias);
        flat
    }

    fn load_flat(&mut self, flat: &[f32]) -> Result<()> {
        if flat.len() != self.num_params() {
            return Err(SegErr::ShapeMismatch {
                what: "flat parameters",
                got: flat.len(),
                expected: self.num_params(),
            });
        }

        let (w, b) = flat.split_at(self.weight.len());
        self.weight.copy_from_slice(w);
        self.bias.copy_from_slice(b);
        Ok(())
    }

    fn state_dict(&self) -> Vec<NamedTensor<'_>> {
        vec![
            NamedTensor {
                name: "weight",
                shape: vec![self.classes, self.in_channels],
                data: &self.weight,
            },
            NamedTensor {
                name: "bias",
                shape: vec![self.classes],
                data: &self.bias,
            },
        ]
    }

    fn forward(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.check_images(&images)?;
        let (n, _, height, width) = images.dim();

        let mut scores = Array4::zeros((n, self.classes, height, width));
        for b in 0..n {
            for y in 0..height {
                for x in 0..width {
                    for k in 0..self.classes {
                        let mut acc = self.bias[k];
                        let row = &self.weight[k * self.in_channels..(k + 1) * self.in_channels];
                        for (c, w) in row.iter().enumerate() {
                            acc += w * images[[b, c, y, x]];
                        }
                        scores[[b, k, y, x]] = acc;
                    }
                }
            }
        }

        Ok(scores)
    }

    fn backward(
        &self,
        images: ArrayView4<f32>,
        grad_scores: ArrayView4<f32>,
        grads: &mut [f32],
    ) -> Result<()> {
        self.check_images(&images)?;
        if grads.len() != self.num_params() {
            return Err(SegErr::ShapeMismatch {
                what: "gradient buffer",
                got: grads.len(),
                expected: self.num_params(),
            });
        }

        let (n, classes, height, width) = grad_scores.dim();
        if classes != self.classes {
            return Err(SegErr::ShapeMismatch {
                what: "score gradient classes",
                got: classes,
                expected: self.classes,
            });
        }

        let (gw, gb) = grads.split_at_mut(self.weight.len());
        for b in 0..n {
            for y in 0..height {
                for x in 0..width {
                    for k in 0..self.classes {
                        let g = grad_scores[[b, k, y, x]];
                        if g == 0.0 {
                            continue;
                        }
                        gb[k] += g;
                        let row = &mut gw[k * self.in_channels..(k + 1) * self.in_channels];
                        for (c, slot) in row.iter_mut().enumerate() {
                            *slot += g * images[[b, c, y, x]];
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;
    use crate::{
        loss::OhemCrossEntropy,
        optimizer::{GroupSettings, Optimizer},
        schedule::LrSchedule,
    };

    fn ramp_images(n: usize, channels: usize, side: usize) -> Array4<f32> {
        let mut images = Array4::zeros((n, channels, side, side));
        for b in 0..n {
            for c in 0..channels {
                for y in 0..side {
                    for x in 0..side {
                        images[[b, c, y, x]] = ((b + c + y * x) % 7) as f32 / 7.0;
                    }
                }
            }
        }
        images
    }

    #[test]
    fn forward_produces_class_scores_per_pixel() {
        let model = PixelClassifier::new(3, 4, 1).unwrap();
        let images = ramp_images(2, 3, 5);
        let scores = model.forward(images.view()).unwrap();
        assert_eq!(scores.dim(), (2, 4, 5, 5));
    }

    #[test]
    fn flat_snapshot_roundtrip() {
        let mut a = PixelClassifier::new(3, 4, 1).unwrap();
        let b = PixelClassifier::new(3, 4, 99).unwrap();
        assert_ne!(a.params_flat(), b.params_flat());

        a.load_flat(&b.params_flat()).unwrap();
        assert_eq!(a.params_flat(), b.params_flat());

        assert!(matches!(
            a.load_flat(&[0.0; 3]),
            Err(SegErr::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn backward_matches_finite_differences() {
        let model = PixelClassifier::new(2, 3, 5).unwrap();
        let images = ramp_images(1, 2, 3);
        let criterion = OhemCrossEntropy::new(0.0, 1);
        let labels = Array3::from_elem((1, 3, 3), 1u32);

        let scores = model.forward(images.view()).unwrap();
        let grad_scores = criterion.loss_prime(scores.view(), labels.view()).unwrap();
        let mut grads = vec![0.0f32; 9];
        model
            .backward(images.view(), grad_scores.view(), &mut grads)
            .unwrap();

        let eps = 1e-2f32;
        let base_flat = model.params_flat();
        for i in 0..base_flat.len() {
            let mut bumped = model.clone();
            let mut flat = base_flat.clone();
            flat[i] += eps;
            bumped.load_flat(&flat).unwrap();
            let up = criterion
                .loss(bumped.forward(images.view()).unwrap().view(), labels.view())
                .unwrap();

            flat[i] -= 2.0 * eps;
            bumped.load_flat(&flat).unwrap();
            let down = criterion
                .loss(bumped.forward(images.view()).unwrap().view(), labels.view())
                .unwrap();

            let numeric = (up - down) / (2.0 * eps);
            assert!(
                (grads[i] - numeric).abs() < 1e-2,
                "param {i}: analytic {} vs numeric {numeric}",
                grads[i]
            );
        }
    }

    #[test]
    fn trains_to_separate_channel_argmax() {
        // labels follow the strongest input channel; a linear per-pixel
        // classifier must drive this loss well below the uniform baseline
        let mut model = PixelClassifier::new(3, 3, 11).unwrap();
        let schedule = LrSchedule::new(0.5, 10, 0.0, 400, 0.9).unwrap();
        let groups: Vec<_> = model
            .param_groups()
            .iter()
            .map(|spec| {
                (
                    spec.len,
                    GroupSettings {
                        lr_multiplier: spec.lr_multiplier,
                        weight_decay: if spec.decay { 1e-4 } else { 0.0 },
                        momentum: 0.9,
                    },
                )
            })
            .collect();
        let mut optimizer = Optimizer::new(schedule, &groups).unwrap();
        let criterion = OhemCrossEntropy::new(0.05, 8);

        let mut rng = StdRng::seed_from_u64(3);
        let normal = Normal::new(0.0f32, 1.0).unwrap();
        let mut images = Array4::zeros((2, 3, 4, 4));
        images.mapv_inplace(|_| normal.sample(&mut rng));
        let mut labels = Array3::zeros((2, 4, 4));
        for b in 0..2 {
            for y in 0..4 {
                for x in 0..4 {
                    let mut best = 0;
                    for c in 1..3 {
                        if images[[b, c, y, x]] > images[[b, best, y, x]] {
                            best = c;
                        }
                    }
                    labels[[b, y, x]] = best as u32;
                }
            }
        }

        let first = {
            let scores = model.forward(images.view()).unwrap();
            criterion.loss(scores.view(), labels.view()).unwrap()
        };

        let mut last = first;
        for _ in 0..400 {
            optimizer.zero_grad();
            let scores = model.forward(images.view()).unwrap();
            last = criterion.loss(scores.view(), labels.view()).unwrap();
            let grad_scores = criterion.loss_prime(scores.view(), labels.view()).unwrap();
            model
                .backward(images.view(), grad_scores.view(), optimizer.grads_mut())
                .unwrap();
            let mut params = model.params_mut();
            optimizer.step(&mut params).unwrap();
        }

        assert!(
            last < first * 0.5,
            "loss did not improve: first {first}, last {last}"
        );
    }
}
