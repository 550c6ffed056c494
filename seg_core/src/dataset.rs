use ndarray::{Array2, Array3, Array4};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::{
    error::{Result, SegErr},
    loss::IGNORE_LABEL,
};

/// One training batch.
///
/// Labels keep a singleton channel dimension, `(batch, 1, height, width)`;
/// the training loop squeezes it before the loss.
#[derive(Debug)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Array4<u32>,
}

/// The data-loading seam consumed by the training loop.
///
/// A loader yields batched, shuffled samples and reports its batch count so
/// the loop can derive the total iteration budget.
pub trait Loader {
    fn batches_per_epoch(&self) -> usize;

    /// The next batch, cycling and reshuffling across epochs.
    fn next_batch(&mut self) -> Result<Batch>;
}

/// Seeded in-memory dataset of random images labeled by channel argmax.
///
/// Stands in for the real pipeline behind the [`Loader`] seam: deterministic
/// per seed, shuffled every epoch, a sprinkle of ignore-sentinel pixels, and
/// learnable structure (the label is the strongest input channel).
pub struct SyntheticLoader {
    images: Vec<Array3<f32>>,
    labels: Vec<Array2<u32>>,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

const IGNORE_FRACTION: f64 = 0.05;

impl SyntheticLoader {
    /// Generates the dataset.
    ///
    /// # Args
    /// * `samples` - Total example count; incomplete trailing batches drop.
    /// * `batch_size` - Examples per batch.
    /// * `channels` - Image channels; must be >= `classes` so the argmax
    ///   labeling stays well-defined.
    /// * `classes` - Number of label classes.
    /// * `crop` - `(height, width)` of every sample.
    /// * `seed` - Generator seed; give each rank its own.
    pub fn new(
        samples: usize,
        batch_size: usize,
        channels: usize,
        classes: usize,
        crop: (usize, usize),
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 || samples < batch_size {
            return Err(SegErr::InvalidDataset("need at least one full batch"));
        }
        if classes < 2 || channels < classes {
            return Err(SegErr::InvalidDataset("channels must cover all classes"));
        }
        let (height, width) = crop;
        if height == 0 || width == 0 {
            return Err(SegErr::InvalidDataset("crop must be non-empty"));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut images = Vec::with_capacity(samples);
        let mut labels = Vec::with_capacity(samples);

        for _ in 0..samples {
            let mut image = Array3::zeros((channels, height, width));
            image.mapv_inplace(|_| rng.random::<f32>() * 2.0 - 1.0);

            let mut label = Array2::zeros((height, width));
            for y in 0..height {
                for x in 0..width {
                    if rng.random_bool(IGNORE_FRACTION) {
                        label[[y, x]] = IGNORE_LABEL;
                        continue;
                    }
                    let mut best = 0;
                    for c in 1..classes {
                        if image[[c, y, x]] > image[[best, y, x]] {
                            best = c;
                        }
                    }
                    label[[y, x]] = best as u32;
                }
            }

            images.push(image);
            labels.push(label);
        }

        Ok(Self {
            order: (0..samples).collect(),
            images,
            labels,
            batch_size,
            cursor: 0,
            rng,
        })
    }
}

impl Loader for SyntheticLoader {
    fn batches_per_epoch(&self) -> usize {
        self.images.len() / self.batch_size
    }

    fn next_batch(&mut self) -> Result<Batch> {
        if self.cursor == 0 {
            self.order.shuffle(&mut self.rng);
        }

        let (channels, height, width) = self.images[0].dim();
        let mut images = Array4::zeros((self.batch_size, channels, height, width));
        let mut labels = Array4::zeros((self.batch_size, 1, height, width));

        let base = self.cursor * self.batch_size;
        for slot in 0..self.batch_size {
            let sample = self.order[base + slot];
            images
                .index_axis_mut(ndarray::Axis(0), slot)
                .assign(&self.images[sample]);
            labels
                .index_axis_mut(ndarray::Axis(0), slot)
                .index_axis_mut(ndarray::Axis(0), 0)
                .assign(&self.labels[sample]);
        }

        self.cursor = (self.cursor + 1) % self.batches_per_epoch();
        Ok(Batch { images, labels })
    }
}
