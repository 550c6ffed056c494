use ndarray::{Array4, ArrayView3, ArrayView4};

use crate::error::{Result, SegErr};

/// Label value marking pixels excluded from the loss.
pub const IGNORE_LABEL: u32 = 255;

/// Cross-entropy with online hard example mining.
///
/// Computes the unreduced per-pixel cross entropy, drops easy pixels whose
/// loss falls at or below `thresh`, and averages the remainder. When fewer
/// than `min_kept` pixels clear the threshold, the `min_kept` highest-loss
/// pixels are kept instead, so the gradient-contributing set never collapses
/// even on images the model already gets mostly right.
#[derive(Debug, Clone)]
pub struct OhemCrossEntropy {
    thresh: f32,
    min_kept: usize,
    ignore_index: u32,
}

impl OhemCrossEntropy {
    /// Creates the criterion.
    ///
    /// # Args
    /// * `thresh` - Loss-value cutoff below which a pixel counts as easy.
    /// * `min_kept` - Floor on the number of retained pixels.
    pub fn new(thresh: f32, min_kept: usize) -> Self {
        Self {
            thresh,
            min_kept,
            ignore_index: IGNORE_LABEL,
        }
    }

    pub fn with_ignore_index(mut self, ignore_index: u32) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    /// The mean loss over the mined pixel set.
    ///
    /// # Args
    /// * `scores` - Class scores, `(batch, classes, height, width)`.
    /// * `labels` - Ground truth, `(batch, height, width)`; entries are class
    ///   indices or the ignore sentinel.
    ///
    /// # Returns
    /// Exactly 0.0 when every pixel is ignored; finite otherwise.
    ///
    /// # Errors
    /// `SegErr::ShapeMismatch` on disagreeing dimensions,
    /// `SegErr::LabelOutOfRange` on a label that is neither a class index nor
    /// the sentinel.
    pub fn loss(&self, scores: ArrayView4<f32>, labels: ArrayView3<u32>) -> Result<f32> {
        let kept = self.mine(scores, labels)?;
        if kept.is_empty() {
            return Ok(0.0);
        }

        let total: f32 = kept.iter().map(|&(_, l)| l).sum();
        Ok(total / kept.len() as f32)
    }

    /// Gradient of [`loss`] with respect to the scores.
    ///
    /// Kept pixels receive `(softmax - onehot) / kept_count`; every other
    /// pixel, ignored ones included, contributes nothing.
    ///
    /// [`loss`]: OhemCrossEntropy::loss
    pub fn loss_prime(
        &self,
        scores: ArrayView4<f32>,
        labels: ArrayView3<u32>,
    ) -> Result<Array4<f32>> {
        let kept = self.mine(scores, labels)?;
        let (n, classes, height, width) = scores.dim();
        let mut grad = Array4::zeros((n, classes, height, width));
        if kept.is_empty() {
            return Ok(grad);
        }

        let inv_kept = 1.0 / kept.len() as f32;
        for &(flat, _) in &kept {
            let (b, y, x) = unflatten(flat, height, width);
            let label = labels[[b, y, x]] as usize;

            let mut max = f32::NEG_INFINITY;
            for c in 0..classes {
                max = max.max(scores[[b, c, y, x]]);
            }
            let mut denom = 0.0;
            for c in 0..classes {
                denom += (scores[[b, c, y, x]] - max).exp();
            }

            for c in 0..classes {
                let p = (scores[[b, c, y, x]] - max).exp() / denom;
                let target = if c == label { 1.0 } else { 0.0 };
                grad[[b, c, y, x]] = (p - target) * inv_kept;
            }
        }

        Ok(grad)
    }

    /// Flat `(batch * height * width)` indices of the mined pixels.
    ///
    /// Exposed so callers can observe the size of the contributing set.
    pub fn kept_indices(
        &self,
        scores: ArrayView4<f32>,
        labels: ArrayView3<u32>,
    ) -> Result<Vec<usize>> {
        Ok(self.mine(scores, labels)?.into_iter().map(|(i, _)| i).collect())
    }

    /// Per-pixel losses of the selected set, `(flat_index, loss)` pairs.
    fn mine(&self, scores: ArrayView4<f32>, labels: ArrayView3<u32>) -> Result<Vec<(usize, f32)>> {
        let (n, classes, height, width) = scores.dim();
        let (ln, lh, lw) = labels.dim();
        if ln != n {
            return Err(SegErr::ShapeMismatch { what: "label batch", got: ln, expected: n });
        }
        if lh != height {
            return Err(SegErr::ShapeMismatch { what: "label height", got: lh, expected: height });
        }
        if lw != width {
            return Err(SegErr::ShapeMismatch { what: "label width", got: lw, expected: width });
        }

        let mut pixels = Vec::new();
        for b in 0..n {
            for y in 0..height {
                for x in 0..width {
                    let label = labels[[b, y, x]];
                    if label == self.ignore_index {
                        continue;
                    }
                    let label = label as usize;
                    if label >= classes {
                        return Err(SegErr::LabelOutOfRange {
                            label: label as u32,
                            classes,
                        });
                    }

                    // numerically stable -log softmax[label]
                    let mut max = f32::NEG_INFINITY;
                    for c in 0..classes {
                        max = max.max(scores[[b, c, y, x]]);
                    }
                    let mut denom = 0.0;
                    for c in 0..classes {
                        denom += (scores[[b, c, y, x]] - max).exp();
                    }
                    let loss = denom.ln() - (scores[[b, label, y, x]] - max);

                    pixels.push(((b * height + y) * width + x, loss));
                }
            }
        }

        Ok(self.select(pixels))
    }

    fn select(&self, mut pixels: Vec<(usize, f32)>) -> Vec<(usize, f32)> {
        if pixels.is_empty() {
            return pixels;
        }

        let above = pixels.iter().filter(|&&(_, l)| l > self.thresh).count();
        if above >= self.min_kept {
            pixels.retain(|&(_, l)| l > self.thresh);
            return pixels;
        }

        // Not enough hard pixels: keep the highest-loss ones up to the floor.
        // Descending loss, ties by ascending index, deterministic within a run.
        pixels.sort_unstable_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        pixels.truncate(self.min_kept.min(pixels.len()));
        pixels
    }
}

fn unflatten(flat: usize, height: usize, width: usize) -> (usize, usize, usize) {
    let x = flat % width;
    let rest = flat / width;
    (rest / height, rest % height, x)
}
