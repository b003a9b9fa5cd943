use super::{load, load_blocks, store, store_blocks, Engine};
use crate::{
    array::DType,
    cache::HintId,
    error::{config_error, shape_error, Result},
    layout::{blocks, Layout, MemoryDesc, BLOCK},
};
use rayon::prelude::*;
use wide::f32x8;

/// The smallest epsilon the accelerated backends accept.
pub const MIN_EPS: f64 = 1e-5;

/// Per channel statistics of a batch normalization.
#[derive(Debug)]
pub enum BatchNormStats<'a> {
    /// Compute the batch mean and biased variance into the slices.
    Compute {
        /// Batch mean.
        mean: &'a mut [f32],
        /// Biased batch variance.
        var: &'a mut [f32],
    },
    /// Normalize with the given statistics.
    Global {
        /// Mean.
        mean: &'a [f32],
        /// Variance.
        var: &'a [f32],
    },
}

/// An f32 batch normalization over axes (N, H, W) of a [`Layout::ChannelBlocked8`] array.
///
/// Statistics, scale and shift are plain 1-D arrays of length C.
#[derive(Debug)]
pub struct BatchNormDesc {
    id: HintId,
    eps: f32,
    global_stats: bool,
    src: MemoryDesc,
    stats: MemoryDesc,
}

impl BatchNormDesc {
    /// Creates a new descriptor.
    ///
    /// **Errors**
    ///
    /// `eps` is less than [`MIN_EPS`].
    pub fn new(src: [usize; 4], eps: f64, global_stats: bool) -> Result<Self> {
        if eps < MIN_EPS {
            return Err(config_error!("eps {eps} is less than {MIN_EPS}"));
        }
        Ok(Self {
            id: HintId::next(),
            eps: eps as f32,
            global_stats,
            src: MemoryDesc::new(src, DType::F32, Layout::ChannelBlocked8)?,
            stats: MemoryDesc::plain(&src[1..2], DType::F32),
        })
    }
    /// Identifies the descriptor.
    pub fn id(&self) -> HintId {
        self.id
    }
    /// Whether statistics are provided rather than computed.
    pub fn global_stats(&self) -> bool {
        self.global_stats
    }
    /// The source, also the destination.
    pub fn src(&self) -> &MemoryDesc {
        &self.src
    }
    /// Per channel statistics.
    pub fn stats(&self) -> &MemoryDesc {
        &self.stats
    }
    fn dims(&self) -> (usize, usize, usize) {
        let dims = self.src.dims();
        (dims[0], dims[1], dims[2] * dims[3])
    }
}

impl Engine {
    /// Normalizes `x` into `y`.
    ///
    /// **Errors**
    ///
    /// The buffers do not match `desc`.
    pub fn batch_norm_forward(
        &self,
        desc: &BatchNormDesc,
        x: &[f32],
        gamma: &[f32],
        beta: &[f32],
        stats: BatchNormStats,
        y: &mut [f32],
    ) -> Result<()> {
        let (n, c, hw) = desc.dims();
        let cb = blocks(c);
        let plane = hw * BLOCK;
        if x.len() != n * cb * plane || y.len() != x.len() || gamma.len() != c || beta.len() != c {
            return Err(shape_error!("batch norm forward buffers do not match {desc:?}"));
        }
        self.install(|| {
            let (mean, var) = match stats {
                BatchNormStats::Compute { mean, var } => {
                    let m = f32x8::splat((n * hw) as f32);
                    let batch_mean: Vec<f32x8> = (0..cb)
                        .into_par_iter()
                        .map(|b| channel_sum(x, n, cb, plane, b, |x| x) / m)
                        .collect();
                    let batch_var: Vec<f32x8> = (0..cb)
                        .into_par_iter()
                        .map(|b| {
                            let mu = batch_mean[b];
                            channel_sum(x, n, cb, plane, b, |x| (x - mu) * (x - mu)) / m
                        })
                        .collect();
                    store_blocks(mean, &batch_mean);
                    store_blocks(var, &batch_var);
                    (batch_mean, batch_var)
                }
                BatchNormStats::Global { mean, var } => {
                    (load_blocks(mean, 0.), load_blocks(var, 1.))
                }
            };
            let eps = f32x8::splat(desc.eps);
            let (scale, shift): (Vec<f32x8>, Vec<f32x8>) = load_blocks(gamma, 0.)
                .into_iter()
                .zip(load_blocks(beta, 0.))
                .zip(mean.iter().zip(var.iter()))
                .map(|((gamma, beta), (mean, var))| {
                    let scale = gamma / (*var + eps).sqrt();
                    (scale, beta - *mean * scale)
                })
                .unzip();
            y.par_chunks_mut(plane)
                .zip(x.par_chunks(plane))
                .enumerate()
                .for_each(|(p, (y, x))| {
                    let (scale, shift) = (scale[p % cb], shift[p % cb]);
                    for (y, x) in y.chunks_exact_mut(BLOCK).zip(x.chunks_exact(BLOCK)) {
                        store(y, load(x) * scale + shift);
                    }
                });
        });
        Ok(())
    }
    /// Computes the gradients of a batch normalization that computed its statistics.
    ///
    /// `mean` and `var` are the batch statistics saved by the forward pass.
    ///
    /// **Errors**
    ///
    /// The buffers do not match `desc`.
    #[allow(clippy::too_many_arguments)]
    pub fn batch_norm_backward(
        &self,
        desc: &BatchNormDesc,
        x: &[f32],
        gy: &[f32],
        gamma: &[f32],
        mean: &[f32],
        var: &[f32],
        gx: &mut [f32],
        ggamma: &mut [f32],
        gbeta: &mut [f32],
    ) -> Result<()> {
        let (n, c, hw) = desc.dims();
        let cb = blocks(c);
        let plane = hw * BLOCK;
        if x.len() != n * cb * plane
            || gy.len() != x.len()
            || gx.len() != x.len()
            || [gamma.len(), mean.len(), var.len(), ggamma.len(), gbeta.len()]
                .iter()
                .any(|len| *len != c)
        {
            return Err(shape_error!("batch norm backward buffers do not match {desc:?}"));
        }
        self.install(|| {
            let eps = f32x8::splat(desc.eps);
            let mean = load_blocks(mean, 0.);
            let inv_std: Vec<f32x8> = load_blocks(var, 1.)
                .into_iter()
                .map(|var| f32x8::splat(1.) / (var + eps).sqrt())
                .collect();
            let (sum_gy, sum_gy_xhat): (Vec<f32x8>, Vec<f32x8>) = (0..cb)
                .into_par_iter()
                .map(|b| {
                    let mut sum_gy = f32x8::default();
                    let mut sum_gy_xhat = f32x8::default();
                    for ni in 0..n {
                        let offset = (ni * cb + b) * plane;
                        let x = &x[offset..offset + plane];
                        let gy = &gy[offset..offset + plane];
                        for (x, gy) in x.chunks_exact(BLOCK).zip(gy.chunks_exact(BLOCK)) {
                            let gy = load(gy);
                            let x_hat = (load(x) - mean[b]) * inv_std[b];
                            sum_gy = sum_gy + gy;
                            sum_gy_xhat = sum_gy_xhat + gy * x_hat;
                        }
                    }
                    (sum_gy, sum_gy_xhat)
                })
                .unzip();
            store_blocks(gbeta, &sum_gy);
            store_blocks(ggamma, &sum_gy_xhat);
            let gamma = load_blocks(gamma, 0.);
            let m = f32x8::splat((n * hw) as f32);
            gx.par_chunks_mut(plane)
                .zip(x.par_chunks(plane).zip(gy.par_chunks(plane)))
                .enumerate()
                .for_each(|(p, (gx, (x, gy)))| {
                    let b = p % cb;
                    let scale = gamma[b] * inv_std[b];
                    let (ggamma, gbeta) = (sum_gy_xhat[b] / m, sum_gy[b] / m);
                    for ((gx, x), gy) in gx
                        .chunks_exact_mut(BLOCK)
                        .zip(x.chunks_exact(BLOCK))
                        .zip(gy.chunks_exact(BLOCK))
                    {
                        let x_hat = (load(x) - mean[b]) * inv_std[b];
                        store(gx, scale * (load(gy) - (x_hat * ggamma + gbeta)));
                    }
                });
        });
        Ok(())
    }
}

/// Sums `f(x)` over the batch and spatial positions of channel block `b`.
fn channel_sum(
    x: &[f32],
    n: usize,
    cb: usize,
    plane: usize,
    b: usize,
    f: impl Fn(f32x8) -> f32x8,
) -> f32x8 {
    let mut sum = f32x8::default();
    for ni in 0..n {
        let offset = (ni * cb + b) * plane;
        for x in x[offset..offset + plane].chunks_exact(BLOCK) {
            sum = sum + f(load(x));
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn blocked(plain: &[f32], n: usize, c: usize, hw: usize) -> Vec<f32> {
        let cb = blocks(c);
        let mut output = vec![0f32; n * cb * hw * BLOCK];
        for ni in 0..n {
            for ci in 0..c {
                for i in 0..hw {
                    output[((ni * cb + ci / BLOCK) * hw + i) * BLOCK + ci % BLOCK] =
                        plain[(ni * c + ci) * hw + i];
                }
            }
        }
        output
    }

    #[test]
    fn eps_too_small() {
        assert!(BatchNormDesc::new([1, 1, 1, 1], 1e-6, false)
            .unwrap_err()
            .is_config());
    }

    #[test]
    fn forward_training_statistics() {
        let engine = Engine::get().unwrap();
        let desc = BatchNormDesc::new([2, 2, 1, 2], 1e-5, false).unwrap();
        let x = blocked(&[1., 3., 0., 0., 5., 7., 2., 2.], 2, 2, 2);
        let mut y = vec![0f32; x.len()];
        let (mut mean, mut var) = ([0f32; 2], [0f32; 2]);
        engine
            .batch_norm_forward(
                &desc,
                &x,
                &[1., 1.],
                &[0., 0.],
                BatchNormStats::Compute {
                    mean: &mut mean,
                    var: &mut var,
                },
                &mut y,
            )
            .unwrap();
        assert_eq!(mean, [4., 1.]);
        assert_eq!(var, [5., 1.]);
        let sum: f32 = y.iter().sum();
        assert_relative_eq!(sum, 0., epsilon = 1e-5);
    }

    #[test]
    fn backward_sums() {
        let engine = Engine::get().unwrap();
        let desc = BatchNormDesc::new([2, 1, 1, 1], 1e-5, false).unwrap();
        let x = blocked(&[1., 3.], 2, 1, 1);
        let gy = blocked(&[1., 1.], 2, 1, 1);
        let mut gx = vec![0f32; x.len()];
        let (mut ggamma, mut gbeta) = ([0f32], [0f32]);
        engine
            .batch_norm_backward(
                &desc,
                &x,
                &gy,
                &[1.],
                &[2.],
                &[1.],
                &mut gx,
                &mut ggamma,
                &mut gbeta,
            )
            .unwrap();
        assert_eq!(gbeta, [2.]);
        assert_relative_eq!(ggamma[0], 0., epsilon = 1e-6);
        assert_relative_eq!(gx[0], 0., epsilon = 1e-6);
        assert_relative_eq!(gx[BLOCK], 0., epsilon = 1e-6);
    }
}
