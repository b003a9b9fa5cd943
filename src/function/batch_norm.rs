use super::{check_inputs, cosim, from_f64, grad_output, to_f64, Function};
use crate::{
    array::{Array, DType, Float},
    cache::{CacheSlot, CacheStats, ComputeComplex, HintId, Params, PrimitiveKind, Signature},
    config::Config,
    dispatch::{self, Backend, Guard},
    engine::{
        batch_norm::{BatchNormDesc, BatchNormStats, MIN_EPS},
        Engine,
    },
    error::{config_error, shape_error, state_error, Result},
    layout::{reorder_if_must, MemoryDesc},
    queue::{Op, OpQueue},
};
use dry::{macro_for, macro_wrap};
use half::f16;
use ndarray::{Array1, Array3, ArrayView1, ArrayView3, Axis};
use paste::paste;
use std::sync::Arc;

/// The default epsilon.
pub const DEFAULT_EPS: f64 = 2e-5;
/// The default decay of the running statistics.
pub const DEFAULT_DECAY: f64 = 0.9;

const NAME: &str = "batch_normalization";

/// Returns (batch, channels, spatial) of `x` normalized per element of `gamma`.
///
/// gamma spans the axes after the batch axis, the remaining axes are reduced.
fn reduce_dims(x: &[usize], gamma: &[usize]) -> Result<[usize; 3]> {
    let axes = gamma.len();
    if axes == 0 || x.len() < axes + 1 || x[1..=axes] != *gamma {
        return Err(shape_error!(
            "{NAME}: gamma {gamma:?} does not match the axes after the batch axis of x {x:?}"
        ));
    }
    Ok([
        x[0],
        gamma.iter().product(),
        x[axes + 1..].iter().product(),
    ])
}

/// Moving averages of the batch statistics, updated by training forward passes.
#[derive(Clone, Debug)]
pub struct RunningStatistics {
    mean: Array,
    var: Array,
}

impl RunningStatistics {
    /// Creates running statistics from `mean` and `var`.
    ///
    /// **Errors**
    /// - The shapes or types differ.
    /// - The type is not a float.
    pub fn new(mean: Array, var: Array) -> Result<Self> {
        if mean.shape() != var.shape() || mean.dtype() != var.dtype() || !mean.dtype().is_float() {
            return Err(shape_error!(
                "{NAME}: running mean {:?} {:?} and var {:?} {:?} do not match",
                mean.shape(),
                mean.dtype(),
                var.shape(),
                var.dtype()
            ));
        }
        Ok(Self {
            mean: mean.to_plain()?,
            var: var.to_plain()?,
        })
    }
    /// Zeroed statistics with the shape, type and device of `gamma`.
    ///
    /// **Errors**
    ///
    /// Allocation failed.
    pub fn zeros_like(gamma: &Array) -> Result<Self> {
        let desc = MemoryDesc::plain(gamma.shape(), gamma.dtype());
        Ok(Self {
            mean: Array::zeros(desc.clone(), gamma.device())?,
            var: Array::zeros(desc, gamma.device())?,
        })
    }
    /// The running mean.
    pub fn mean(&self) -> &Array {
        &self.mean
    }
    /// The running variance.
    pub fn var(&self) -> &Array {
        &self.var
    }
    /// Returns (mean, var).
    pub fn into_arrays(self) -> (Array, Array) {
        (self.mean, self.var)
    }
    fn check_like(&self, gamma: &Array) -> Result<()> {
        if self.mean.shape() != gamma.shape() || self.mean.dtype() != gamma.dtype() {
            return Err(shape_error!(
                "{NAME}: running statistics {:?} {:?} do not match gamma {:?} {:?}",
                self.mean.shape(),
                self.mean.dtype(),
                gamma.shape(),
                gamma.dtype()
            ));
        }
        Ok(())
    }
    /// Folds the batch statistics of `m` elements per channel into the running statistics.
    ///
    /// `mean = decay * mean + (1 - decay) * batch_mean`
    ///
    /// `var = decay * var + (1 - decay) * batch_var * m / max(m - 1, 1)`
    ///
    /// `var` is the biased batch variance. Arrays previously returned by [`mean()`](Self::mean)
    /// or [`var()`](Self::var) are not modified.
    ///
    /// **Errors**
    ///
    /// The batch statistics do not match.
    pub fn update(&mut self, mean: &Array, var: &Array, decay: f64, m: usize) -> Result<()> {
        self.mean.make_mut()?;
        self.var.make_mut()?;
        let factor = m as f64 / m.saturating_sub(1).max(1) as f64;
        macro_wrap!(paste! { match self.mean.dtype() {
            macro_for!($T in [f16, f32, f64] {
                DType::[<$T:upper>] => {
                    moving_average::<$T>(&self.mean, mean, decay, 1.)?;
                    moving_average::<$T>(&self.var, var, decay, factor)?;
                }
            })
            DType::I32 => {
                return Err(shape_error!("{NAME}: running statistics must be floats"));
            }
        }});
        Ok(())
    }
}

fn moving_average<T: Float>(running: &Array, batch: &Array, decay: f64, factor: f64) -> Result<()> {
    let batch = batch.to_array::<T>()?;
    let mut running = running.write::<T>()?;
    if running.len() != batch.len() {
        return Err(shape_error!(
            "{NAME}: batch statistics {:?} do not match running statistics of length {}",
            batch.shape(),
            running.len()
        ));
    }
    for (r, b) in running.iter_mut().zip(batch.iter()) {
        let value = r.to_f64_lossy() * decay + b.to_f64_lossy() * (1. - decay) * factor;
        *r = T::from_f64_lossy(value);
    }
    Ok(())
}

/// Broadcasts a per channel vector over (batch, channel, spatial).
fn channel(a: ArrayView1<f64>) -> ArrayView3<f64> {
    a.insert_axis(Axis(0)).insert_axis(Axis(2))
}

fn channel_sum(x: ArrayView3<f64>) -> Array1<f64> {
    x.sum_axis(Axis(2)).sum_axis(Axis(0))
}

fn normalize_dense(
    x: ArrayView3<f64>,
    gamma: ArrayView1<f64>,
    beta: ArrayView1<f64>,
    stats: Option<(ArrayView1<f64>, ArrayView1<f64>)>,
    eps: f64,
) -> (Array3<f64>, Array1<f64>, Array1<f64>) {
    let (n, _, s) = x.dim();
    let (mean, var) = match stats {
        Some((mean, var)) => (mean.to_owned(), var.to_owned()),
        None => {
            let m = (n * s).max(1) as f64;
            let mean = channel_sum(x) / m;
            let centered = &x - &channel(mean.view());
            let var = channel_sum(centered.mapv(|x| x * x).view()) / m;
            (mean, var)
        }
    };
    let std = var.mapv(|v| (v + eps).sqrt());
    let x_hat = (&x - &channel(mean.view())) / &channel(std.view());
    let y = x_hat * &channel(gamma) + &channel(beta);
    (y, mean, var)
}

struct DenseGrads {
    gx: Array3<f64>,
    ggamma: Array1<f64>,
    gbeta: Array1<f64>,
    stats: Option<(Array1<f64>, Array1<f64>)>,
}

fn normalize_backward_dense(
    x: ArrayView3<f64>,
    gamma: ArrayView1<f64>,
    gy: ArrayView3<f64>,
    mean: ArrayView1<f64>,
    var: ArrayView1<f64>,
    eps: f64,
    fixed: bool,
) -> DenseGrads {
    let (n, _, s) = x.dim();
    let m = (n * s).max(1) as f64;
    let var_eps = var.mapv(|v| v + eps);
    let std = var_eps.mapv(f64::sqrt);
    let x_hat = (&x - &channel(mean)) / &channel(std.view());
    let gbeta = channel_sum(gy);
    let ggamma = channel_sum((&gy * &x_hat).view());
    let scale = &gamma / &std;
    if fixed {
        let gx = &gy * &channel(scale.view());
        let gmean = (&scale * &gbeta).mapv(|g| -g);
        let gvar = (&gamma / &var_eps) * &ggamma * -0.5;
        DenseGrads {
            gx,
            ggamma,
            gbeta,
            stats: Some((gmean, gvar)),
        }
    } else {
        let correction = (&x_hat * &channel(ggamma.view()) + &channel(gbeta.view())) / m;
        let gx = (&gy - &correction) * &channel(scale.view());
        DenseGrads {
            gx,
            ggamma,
            gbeta,
            stats: None,
        }
    }
}

fn as_f64_3(x: &Array, dims: [usize; 3]) -> Result<Array3<f64>> {
    to_f64(x)?
        .into_shape(dims)
        .map_err(|e| shape_error!("{e}"))
}

fn as_f64_1(x: &Array) -> Result<Array1<f64>> {
    let len = x.len();
    to_f64(x)?.into_shape(len).map_err(|e| shape_error!("{e}"))
}

/// Returns (y, mean, var) computed on the dense fallback.
///
/// Inputs are `[x, gamma, beta]`, normalized with batch statistics, or `[x, gamma, beta, mean,
/// var]`.
fn forward_dense(inputs: &[Array], dims: [usize; 3], eps: f64) -> Result<(Array, Array, Array)> {
    let (x, gamma, beta) = (&inputs[0], &inputs[1], &inputs[2]);
    let stats = match inputs {
        [_, _, _, mean, var] => Some((as_f64_1(mean)?, as_f64_1(var)?)),
        _ => None,
    };
    let (y, mean, var) = normalize_dense(
        as_f64_3(x, dims)?.view(),
        as_f64_1(gamma)?.view(),
        as_f64_1(beta)?.view(),
        stats.as_ref().map(|(mean, var)| (mean.view(), var.view())),
        eps,
    );
    let (dtype, device) = (x.dtype(), x.device());
    Ok((
        from_f64(y, dtype, device)?.reshape(x.shape())?,
        from_f64(mean, dtype, device)?.reshape(gamma.shape())?,
        from_f64(var, dtype, device)?.reshape(gamma.shape())?,
    ))
}

/// Returns `[gx, ggamma, gbeta]`, followed by `[gmean, gvar]` if `fixed`.
#[allow(clippy::too_many_arguments)]
fn backward_dense(
    x: &Array,
    gamma: &Array,
    gy: &Array,
    mean: &Array,
    var: &Array,
    dims: [usize; 3],
    eps: f64,
    fixed: bool,
) -> Result<Vec<Array>> {
    let grads = normalize_backward_dense(
        as_f64_3(x, dims)?.view(),
        as_f64_1(gamma)?.view(),
        as_f64_3(gy, dims)?.view(),
        as_f64_1(mean)?.view(),
        as_f64_1(var)?.view(),
        eps,
        fixed,
    );
    let (dtype, device) = (x.dtype(), x.device());
    let mut output = vec![
        from_f64(grads.gx, dtype, device)?.reshape(x.shape())?,
        from_f64(grads.ggamma, dtype, device)?.reshape(gamma.shape())?,
        from_f64(grads.gbeta, dtype, device)?.reshape(gamma.shape())?,
    ];
    if let Some((gmean, gvar)) = grads.stats {
        output.push(from_f64(gmean, dtype, device)?.reshape(gamma.shape())?);
        output.push(from_f64(gvar, dtype, device)?.reshape(gamma.shape())?);
    }
    Ok(output)
}

/// Dims of `x` for the kernel library, rank 2 inputs are viewed as (N, C, 1, 1).
fn src_dims(x: &Array) -> Result<[usize; 4]> {
    match *x.shape() {
        [n, c] => Ok([n, c, 1, 1]),
        [n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(shape_error!(
            "{NAME}: expected 2 or 4 dimensions, found {:?}",
            x.shape()
        )),
    }
}

fn to_blocked(x: &Array, desc: &BatchNormDesc, queue: &mut OpQueue) -> Result<Array> {
    if x.ndim() == 2 {
        reorder_if_must(&x.reshape(desc.src().dims())?, desc.src(), queue)
    } else {
        reorder_if_must(x, desc.src(), queue)
    }
}

/// Rank 2 outputs are reordered to plain and returned with `shape`.
fn from_blocked(y: &Array, shape: &[usize], queue: &mut OpQueue) -> Result<Array> {
    if shape.len() == 2 {
        reorder_if_must(y, &MemoryDesc::plain(y.shape(), DType::F32), queue)?.reshape(shape)
    } else {
        Ok(y.clone())
    }
}

/// Plan of the accelerated forward pass.
///
/// Inputs are `[x, gamma, beta]`, computing batch statistics, or `[x, gamma, beta, mean, var]`.
#[derive(Debug)]
pub struct BatchNormForward {
    signature: Signature,
    desc: Arc<BatchNormDesc>,
    inputs: Vec<Array>,
    y: Array,
    stats: Option<(Array, Array)>,
}

impl ComputeComplex for BatchNormForward {
    fn signature(&self) -> &Signature {
        &self.signature
    }
    fn rebind(&mut self, inputs: &[Array]) {
        self.inputs.clear();
        self.inputs.extend_from_slice(inputs);
    }
}

impl BatchNormForward {
    fn build(signature: &Signature, inputs: &[Array], eps: f64) -> Result<Self> {
        let x = &inputs[0];
        let desc = Arc::new(BatchNormDesc::new(src_dims(x)?, eps, inputs.len() == 5)?);
        let y = Array::zeros(desc.src().clone(), x.device())?;
        let stats = if desc.global_stats() {
            None
        } else {
            Some((
                Array::zeros(desc.stats().clone(), x.device())?,
                Array::zeros(desc.stats().clone(), x.device())?,
            ))
        };
        Ok(Self {
            signature: signature.clone(),
            desc,
            inputs: inputs.to_vec(),
            y,
            stats,
        })
    }
    /// The descriptor, used as a hint by the backward plan.
    pub fn desc(&self) -> &Arc<BatchNormDesc> {
        &self.desc
    }
    /// Returns y and the batch (mean, var) when they are computed.
    fn execute(&mut self) -> Result<(Array, Option<(Array, Array)>)> {
        let engine = Engine::get()?;
        self.y.reuse_or_alloc()?;
        if let Some((mean, var)) = self.stats.as_mut() {
            mean.reuse_or_alloc()?;
            var.reuse_or_alloc()?;
        }
        let mut queue = OpQueue::new();
        let desc = self.desc.clone();
        let x = to_blocked(&self.inputs[0], &desc, &mut queue)?;
        let gamma = self.inputs[1].clone();
        let beta = self.inputs[2].clone();
        let (mean, var) = match self.stats.as_ref() {
            Some((mean, var)) => (mean.clone(), var.clone()),
            None => (self.inputs[3].clone(), self.inputs[4].clone()),
        };
        let y = self.y.clone();
        queue.push(Op::primitive("batch_norm_forward", move || {
            let x = x.read::<f32>()?;
            let gamma = gamma.read::<f32>()?;
            let beta = beta.read::<f32>()?;
            let mut y = y.write::<f32>()?;
            if desc.global_stats() {
                let (mean, var) = (mean.read::<f32>()?, var.read::<f32>()?);
                let stats = BatchNormStats::Global {
                    mean: mean.as_slice(),
                    var: var.as_slice(),
                };
                engine.batch_norm_forward(&desc, &x, &gamma, &beta, stats, &mut y)
            } else {
                let (mut mean, mut var) = (mean.write::<f32>()?, var.write::<f32>()?);
                let stats = BatchNormStats::Compute {
                    mean: mean.as_mut_slice(),
                    var: var.as_mut_slice(),
                };
                engine.batch_norm_forward(&desc, &x, &gamma, &beta, stats, &mut y)
            }
        }));
        let y = from_blocked(&self.y, self.inputs[0].shape(), &mut queue)?;
        queue.execute()?;
        Ok((y, self.stats.clone()))
    }
}

/// Plan of the accelerated backward pass of a training forward.
///
/// Inputs are `[x, gamma, gy, mean, var]`, where mean and var are the batch statistics.
#[derive(Debug)]
pub struct BatchNormBackward {
    signature: Signature,
    hint: Arc<BatchNormDesc>,
    inputs: Vec<Array>,
    gx: Array,
    ggamma: Array,
    gbeta: Array,
}

impl ComputeComplex for BatchNormBackward {
    fn signature(&self) -> &Signature {
        &self.signature
    }
    fn rebind(&mut self, inputs: &[Array]) {
        self.inputs.clear();
        self.inputs.extend_from_slice(inputs);
    }
}

impl BatchNormBackward {
    fn build(signature: &Signature, inputs: &[Array], hint: &Arc<BatchNormDesc>) -> Result<Self> {
        let x = &inputs[0];
        if src_dims(x)?.as_slice() != hint.src().dims() || hint.global_stats() {
            return Err(state_error!(
                "{NAME}: backward with x {:?} does not match the forward pass",
                x.shape()
            ));
        }
        Ok(Self {
            signature: signature.clone(),
            hint: hint.clone(),
            inputs: inputs.to_vec(),
            gx: Array::zeros(hint.src().clone(), x.device())?,
            ggamma: Array::zeros(hint.stats().clone(), x.device())?,
            gbeta: Array::zeros(hint.stats().clone(), x.device())?,
        })
    }
    fn execute(&mut self) -> Result<Vec<Array>> {
        let engine = Engine::get()?;
        self.gx.reuse_or_alloc()?;
        self.ggamma.reuse_or_alloc()?;
        self.gbeta.reuse_or_alloc()?;
        let mut queue = OpQueue::new();
        let desc = self.hint.clone();
        let x = to_blocked(&self.inputs[0], &desc, &mut queue)?;
        let gy = to_blocked(&self.inputs[2], &desc, &mut queue)?;
        let gamma = self.inputs[1].clone();
        let mean = self.inputs[3].clone();
        let var = self.inputs[4].clone();
        let (gx, ggamma, gbeta) = (self.gx.clone(), self.ggamma.clone(), self.gbeta.clone());
        queue.push(Op::primitive("batch_norm_backward", move || {
            let x = x.read::<f32>()?;
            let gy = gy.read::<f32>()?;
            let gamma = gamma.read::<f32>()?;
            let mean = mean.read::<f32>()?;
            let var = var.read::<f32>()?;
            let mut gx = gx.write::<f32>()?;
            let mut ggamma = ggamma.write::<f32>()?;
            let mut gbeta = gbeta.write::<f32>()?;
            engine.batch_norm_backward(
                &desc,
                &x,
                &gy,
                &gamma,
                &mean,
                &var,
                &mut gx,
                &mut ggamma,
                &mut gbeta,
            )
        }));
        let gx = from_blocked(&self.gx, self.inputs[0].shape(), &mut queue)?;
        queue.execute()?;
        Ok(vec![gx, self.ggamma.clone(), self.gbeta.clone()])
    }
}

#[derive(Debug)]
struct Saved {
    backend: Backend,
    fixed: bool,
    inputs: usize,
    x_shape: Vec<usize>,
    mean: Array,
    var: Array,
    hint: Option<Arc<BatchNormDesc>>,
}

/// Batch normalization.
///
/// Inputs are `[x, gamma, beta]` or `[x, gamma, beta, mean, var]`. gamma spans the axes after the
/// batch axis, `x.shape()[1..1 + gamma.ndim()] == gamma.shape()`, and beta, mean and var have the
/// shape of gamma. Statistics are reduced over the batch axis and the axes after gamma.
///
/// With 3 inputs and [`Config::train`], x is normalized with the batch statistics and the running
/// statistics are updated. The backward pass returns `[gx, ggamma, gbeta]`.
///
/// With 5 inputs, or 3 inputs when not training, x is normalized with the given statistics or the
/// running statistics. The backward pass is computed on the dense fallback and returns a gradient
/// for each input.
///
/// The accelerated backend returns rank 4 outputs in
/// [`Layout::ChannelBlocked8`](crate::layout::Layout::ChannelBlocked8).
#[derive(Debug)]
pub struct BatchNormalization {
    eps: f64,
    decay: f64,
    running: Option<RunningStatistics>,
    forward_cc: CacheSlot<BatchNormForward>,
    backward_cc: CacheSlot<BatchNormBackward>,
    saved: Option<Saved>,
}

impl Default for BatchNormalization {
    fn default() -> Self {
        Self {
            eps: DEFAULT_EPS,
            decay: DEFAULT_DECAY,
            running: None,
            forward_cc: CacheSlot::new(),
            backward_cc: CacheSlot::new(),
            saved: None,
        }
    }
}

impl BatchNormalization {
    /// Creates a new batch normalization.
    ///
    /// **Errors**
    /// - `eps` is not positive, or less than [`MIN_EPS`] when `config` may select an accelerated
    /// backend.
    /// - `decay` is not in \[0, 1\].
    pub fn new(eps: f64, decay: f64, config: &Config) -> Result<Self> {
        if eps.is_nan() || eps <= 0. {
            return Err(config_error!("{NAME}: eps {eps} must be positive"));
        }
        if eps < MIN_EPS && config.accelerated_selectable() {
            return Err(config_error!(
                "{NAME}: eps {eps} is less than {MIN_EPS}, required by the accelerated backends"
            ));
        }
        if !(0. ..=1.).contains(&decay) {
            return Err(config_error!("{NAME}: decay {decay} is not in [0, 1]"));
        }
        Ok(Self {
            eps,
            decay,
            ..Self::default()
        })
    }
    /// Sets the running statistics.
    pub fn with_running_statistics(mut self, running: RunningStatistics) -> Self {
        self.running.replace(running);
        self
    }
    /// The epsilon.
    pub fn eps(&self) -> f64 {
        self.eps
    }
    /// The decay of the running statistics.
    pub fn decay(&self) -> f64 {
        self.decay
    }
    /// The running mean, created by the first training forward pass.
    pub fn running_mean(&self) -> Option<&Array> {
        self.running.as_ref().map(RunningStatistics::mean)
    }
    /// The running variance, created by the first training forward pass.
    pub fn running_var(&self) -> Option<&Array> {
        self.running.as_ref().map(RunningStatistics::var)
    }
    /// The running statistics.
    pub fn running_statistics(&self) -> Option<&RunningStatistics> {
        self.running.as_ref()
    }
    /// Replaces the running statistics, for example when loading a checkpoint.
    pub fn set_running_statistics(&mut self, running: RunningStatistics) {
        self.running.replace(running);
    }
    /// Build and hit counters of the forward and backward plans.
    pub fn cache_stats(&self) -> [CacheStats; 2] {
        [
            CacheStats::from(&self.forward_cc),
            CacheStats::from(&self.backward_cc),
        ]
    }
    /// The backend of the last forward pass.
    pub fn backend(&self) -> Option<Backend> {
        self.saved.as_ref().map(|saved| saved.backend)
    }
    fn signature(
        &self,
        kind: PrimitiveKind,
        inputs: &[Array],
        fixed: bool,
        config: &Config,
        hint: Option<HintId>,
    ) -> Signature {
        Signature {
            kind,
            dtype: inputs[0].dtype(),
            shapes: inputs.iter().map(|x| x.shape().to_vec()).collect(),
            params: Params::batch_norm(self.eps, self.decay, fixed),
            mode: config.train.into(),
            hint,
        }
    }
    fn select(&self, inputs: &[Array], config: &Config) -> Result<Backend> {
        let guard = Guard::new(NAME, inputs, &[2, 4])
            .reject_if(inputs[0].dtype() == DType::F16, "F16 input")
            .reject_if(inputs[1].ndim() != 1, "gamma is not 1-D");
        let backend = dispatch::select(config, &guard)?;
        if backend != Backend::Dense && self.eps < MIN_EPS {
            return Err(config_error!(
                "{NAME}: eps {} is less than {MIN_EPS}, required by the {backend} backend",
                self.eps
            ));
        }
        Ok(backend)
    }
    fn forward_training(
        &mut self,
        inputs: &[Array],
        dims: [usize; 3],
        config: &Config,
    ) -> Result<Vec<Array>> {
        let (x, gamma, beta) = (&inputs[0], &inputs[1], &inputs[2]);
        if let Some(running) = self.running.as_ref() {
            running.check_like(gamma)?;
        }
        let backend = self.select(inputs, config)?;
        if self.running.is_none() {
            log::debug!("{NAME}: running statistics {:?} start at zero", gamma.shape());
            self.running.replace(RunningStatistics::zeros_like(gamma)?);
        }
        let (eps, decay) = (self.eps, self.decay);
        let mut hint = None;
        let (y, mean, var) = match backend {
            Backend::Gpu => {
                let gpu = config
                    .gpu()
                    .ok_or_else(|| state_error!("{NAME}: no gpu kernels"))?;
                let running = self
                    .running
                    .as_mut()
                    .ok_or_else(|| state_error!("{NAME}: missing running statistics"))?;
                let output = gpu.batch_norm_forward_training(x, gamma, beta, eps, decay, running)?;
                (output.y, output.mean, output.var)
            }
            Backend::Accelerated => {
                let signature =
                    self.signature(PrimitiveKind::BatchNormForward, inputs, false, config, None);
                let cc = self
                    .forward_cc
                    .match_or_build(&signature, inputs, |s, i| BatchNormForward::build(s, i, eps))?;
                hint.replace(cc.desc().clone());
                let (y, stats) = cc.execute()?;
                let (mean, var) =
                    stats.ok_or_else(|| state_error!("{NAME}: missing batch statistics"))?;
                (y, mean, var)
            }
            Backend::Dense => forward_dense(inputs, dims, eps)?,
        };
        if config.cosim && backend != Backend::Dense {
            cosim(NAME, backend, &[y.clone()], || {
                Ok(vec![forward_dense(inputs, dims, eps)?.0])
            })?;
        }
        if backend != Backend::Gpu {
            if let Some(running) = self.running.as_mut() {
                running.update(&mean, &var, decay, dims[0] * dims[2])?;
            }
        }
        self.saved.replace(Saved {
            backend,
            fixed: false,
            inputs: inputs.len(),
            x_shape: x.shape().to_vec(),
            mean,
            var,
            hint,
        });
        Ok(vec![y])
    }
    /// `inputs` are `[x, gamma, beta, mean, var]`, `count` is the number of inputs of the call.
    fn forward_fixed(
        &mut self,
        inputs: &[Array],
        count: usize,
        dims: [usize; 3],
        config: &Config,
    ) -> Result<Vec<Array>> {
        let (x, gamma, beta, mean, var) = (
            &inputs[0], &inputs[1], &inputs[2], &inputs[3], &inputs[4],
        );
        let backend = self.select(inputs, config)?;
        let eps = self.eps;
        let y = match backend {
            Backend::Gpu => {
                let gpu = config
                    .gpu()
                    .ok_or_else(|| state_error!("{NAME}: no gpu kernels"))?;
                gpu.batch_norm_forward_inference(x, gamma, beta, mean, var, eps)?
            }
            Backend::Accelerated => {
                let signature =
                    self.signature(PrimitiveKind::BatchNormForward, inputs, true, config, None);
                self.forward_cc
                    .match_or_build(&signature, inputs, |s, i| BatchNormForward::build(s, i, eps))?
                    .execute()?
                    .0
            }
            Backend::Dense => forward_dense(inputs, dims, eps)?.0,
        };
        if config.cosim && backend != Backend::Dense {
            cosim(NAME, backend, &[y.clone()], || {
                Ok(vec![forward_dense(inputs, dims, eps)?.0])
            })?;
        }
        self.saved.replace(Saved {
            backend,
            fixed: true,
            inputs: count,
            x_shape: x.shape().to_vec(),
            mean: mean.clone(),
            var: var.clone(),
            hint: None,
        });
        Ok(vec![y])
    }
}

fn check_like_gamma(inputs: &[Array]) -> Result<()> {
    let gamma = &inputs[1];
    if let Some(a) = inputs[2..].iter().find(|a| a.shape() != gamma.shape()) {
        return Err(shape_error!(
            "{NAME}: expected {:?} like gamma, found {:?}",
            gamma.shape(),
            a.shape()
        ));
    }
    Ok(())
}

impl Function for BatchNormalization {
    /// **Errors**
    /// - gamma does not match x, or beta, mean or var do not match gamma.
    /// - Inference with 3 inputs before the running statistics exist.
    /// - eps is less than [`MIN_EPS`] on an accelerated backend.
    fn forward(&mut self, inputs: &[Array], config: &Config) -> Result<Vec<Array>> {
        check_inputs(NAME, inputs, &[3, 5])?;
        let (x, gamma, beta) = (&inputs[0], &inputs[1], &inputs[2]);
        let dims = reduce_dims(x.shape(), gamma.shape())?;
        check_like_gamma(inputs)?;
        if inputs.len() == 3 && config.train {
            return self.forward_training(inputs, dims, config);
        }
        let fixed = if inputs.len() == 5 {
            inputs.to_vec()
        } else {
            let running = self.running.as_ref().ok_or_else(|| {
                state_error!("{NAME}: inference before the running statistics exist")
            })?;
            running.check_like(gamma)?;
            vec![
                x.clone(),
                gamma.clone(),
                beta.clone(),
                running.mean.clone(),
                running.var.clone(),
            ]
        };
        self.forward_fixed(&fixed, inputs.len(), dims, config)
    }
    /// **Errors**
    /// - No forward pass was run, or the inputs differ from the forward pass.
    /// - `grad_outputs[0]` does not match x.
    fn backward(
        &mut self,
        inputs: &[Array],
        grad_outputs: &[Array],
        config: &Config,
    ) -> Result<Vec<Array>> {
        let saved = self
            .saved
            .as_ref()
            .ok_or_else(|| state_error!("{NAME}: backward called before forward"))?;
        check_inputs(NAME, inputs, &[3, 5])?;
        if inputs.len() != saved.inputs {
            return Err(state_error!(
                "{NAME}: backward with {} inputs after a forward pass with {}",
                inputs.len(),
                saved.inputs
            ));
        }
        let (x, gamma) = (&inputs[0], &inputs[1]);
        if x.shape() != saved.x_shape {
            return Err(state_error!(
                "{NAME}: backward x {:?} does not match the forward pass",
                x.shape()
            ));
        }
        let dims = reduce_dims(x.shape(), gamma.shape())?;
        let gy = grad_output(NAME, grad_outputs, x, x.shape())?;
        let (mean, var) = (saved.mean.clone(), saved.var.clone());
        let eps = self.eps;
        if saved.fixed {
            let mut grads = backward_dense(x, gamma, gy, &mean, &var, dims, eps, true)?;
            grads.truncate(inputs.len());
            return Ok(grads);
        }
        let backend = saved.backend;
        let grads = match backend {
            Backend::Gpu => {
                let gpu = config
                    .gpu()
                    .ok_or_else(|| state_error!("{NAME}: no gpu kernels"))?;
                let grads = gpu.batch_norm_backward(x, gamma, gy, &mean, &var, eps)?;
                vec![grads.gx, grads.ggamma, grads.gbeta]
            }
            Backend::Accelerated => {
                let hint = saved
                    .hint
                    .clone()
                    .ok_or_else(|| state_error!("{NAME}: missing forward plan"))?;
                let backward_inputs = [
                    x.clone(),
                    gamma.clone(),
                    gy.clone(),
                    mean.clone(),
                    var.clone(),
                ];
                let signature = self.signature(
                    PrimitiveKind::BatchNormBackward,
                    &backward_inputs,
                    false,
                    config,
                    Some(hint.id()),
                );
                self.backward_cc
                    .match_or_build(&signature, &backward_inputs, |s, i| {
                        BatchNormBackward::build(s, i, &hint)
                    })?
                    .execute()?
            }
            Backend::Dense => backward_dense(x, gamma, gy, &mean, &var, dims, eps, false)?,
        };
        if config.cosim && backend != Backend::Dense {
            cosim(NAME, backend, &grads, || {
                backward_dense(x, gamma, gy, &mean, &var, dims, eps, false)
            })?;
        }
        Ok(grads)
    }
}

/// Normalizes `x` with the given statistics with a new [`BatchNormalization`].
///
/// **Errors**
///
/// See [`BatchNormalization`].
pub fn fixed_batch_normalization(
    x: &Array,
    gamma: &Array,
    beta: &Array,
    mean: &Array,
    var: &Array,
    eps: f64,
    config: &Config,
) -> Result<Array> {
    let inputs = [
        x.clone(),
        gamma.clone(),
        beta.clone(),
        mean.clone(),
        var.clone(),
    ];
    BatchNormalization::new(eps, DEFAULT_DECAY, config)?
        .forward(&inputs, config)?
        .pop()
        .ok_or_else(|| state_error!("{NAME}: missing output"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EligibilityFlags, UseAccelerated};
    use approx::assert_relative_eq;
    use ndarray::{array, Array as NdArray, Dimension};

    fn accelerated() -> Config {
        Config::default()
            .with_flags(EligibilityFlags {
                accelerated: true,
                gpu: false,
            })
            .with_use_accelerated(UseAccelerated::Always)
    }

    fn dense() -> Config {
        Config::default().with_use_accelerated(UseAccelerated::Never)
    }

    fn affine(c: usize) -> [Array; 2] {
        [
            Array::from_array(NdArray::from_shape_fn(c, |i| 1. + i as f32 / 4.)),
            Array::from_array(NdArray::from_shape_fn(c, |i| i as f32 / 2. - 1.)),
        ]
    }

    #[test]
    fn reduce_dims_multi_axis_gamma() {
        assert_eq!(reduce_dims(&[2, 3, 4, 5], &[3]).unwrap(), [2, 3, 20]);
        assert_eq!(reduce_dims(&[2, 3, 4, 5], &[3, 4]).unwrap(), [2, 12, 5]);
        assert_eq!(reduce_dims(&[2, 3], &[3]).unwrap(), [2, 3, 1]);
        assert!(reduce_dims(&[2, 3], &[4]).unwrap_err().is_shape());
        assert!(reduce_dims(&[3], &[3]).unwrap_err().is_shape());
    }

    #[test]
    fn training_dense_statistics() {
        let x = Array::from_array(array![[1f64, 2.], [3., 6.]]);
        let gamma = Array::from_array(array![1f64, 1.]);
        let beta = Array::from_array(array![0f64, 0.]);
        let mut bn = BatchNormalization::new(1e-5, 0.9, &dense()).unwrap();
        let y = bn.forward(&[x, gamma, beta], &dense()).unwrap().remove(0);
        assert_eq!(bn.backend(), Some(Backend::Dense));
        assert_relative_eq!(
            y.to_array::<f64>().unwrap(),
            array![[-1f64, -1.], [1., 1.]].into_dyn(),
            epsilon = 1e-4
        );
        assert_relative_eq!(
            bn.running_mean().unwrap().to_array::<f64>().unwrap(),
            array![0.2f64, 0.4].into_dyn(),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            bn.running_var().unwrap().to_array::<f64>().unwrap(),
            array![0.2f64, 0.8].into_dyn(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn decay_one_keeps_running_statistics() {
        let running = RunningStatistics::new(
            Array::from_array(array![0.5f32, -0.5]),
            Array::from_array(array![2f32, 3.]),
        )
        .unwrap();
        let before = running.mean().clone();
        let mut bn = BatchNormalization::new(DEFAULT_EPS, 1.0, &dense())
            .unwrap()
            .with_running_statistics(running);
        let x = Array::from_array(NdArray::from_shape_fn([4, 2], |(i, j)| (i * j) as f32));
        let [gamma, beta] = affine(2);
        bn.forward(&[x, gamma, beta], &dense()).unwrap();
        assert_eq!(
            bn.running_mean().unwrap().to_array::<f32>().unwrap(),
            array![0.5f32, -0.5].into_dyn()
        );
        assert_eq!(
            bn.running_var().unwrap().to_array::<f32>().unwrap(),
            array![2f32, 3.].into_dyn()
        );
        assert!(!bn.running_mean().unwrap().same_buffer(&before));
    }

    #[test]
    fn eps_below_library_minimum() {
        assert!(BatchNormalization::new(1e-6, 0.9, &accelerated())
            .unwrap_err()
            .is_config());
        BatchNormalization::new(1e-6, 0.9, &dense()).unwrap();
        assert!(BatchNormalization::new(1e-3, 1.5, &dense())
            .unwrap_err()
            .is_config());
    }

    #[test]
    fn fixed_backward_gradient_counts() {
        let config = dense().with_train(false);
        let x = Array::from_array(NdArray::from_shape_fn([3, 2], |(i, j)| (i + 2 * j) as f64));
        let gamma = Array::from_array(array![1f64, 2.]);
        let beta = Array::from_array(array![0f64, 1.]);
        let mean = Array::from_array(array![1f64, 3.]);
        let var = Array::from_array(array![1f64, 0.5]);
        let inputs = [x.clone(), gamma.clone(), beta.clone(), mean.clone(), var.clone()];
        let gy = Array::from_array(NdArray::from_elem([3, 2], 1f64));
        let mut bn = BatchNormalization::new(1e-5, 0.9, &config).unwrap();
        bn.forward(&inputs, &config).unwrap();
        let grads = bn.backward(&inputs, &[gy.clone()], &config).unwrap();
        assert_eq!(grads.len(), 5);
        let gbeta = grads[2].to_array::<f64>().unwrap();
        assert_eq!(gbeta, array![3f64, 3.].into_dyn());
        let gmean = grads[3].to_array::<f64>().unwrap();
        assert_relative_eq!(gmean[0], -3. / (1f64 + 1e-5).sqrt(), epsilon = 1e-12);
        assert!(bn
            .backward(&inputs[..3], &[gy], &config)
            .unwrap_err()
            .is_state());
    }

    #[test]
    fn inference_uses_running_statistics() {
        let x = Array::from_array(NdArray::from_shape_fn([4, 3], |(i, j)| (i * 3 + j) as f32));
        let [gamma, beta] = affine(3);
        let inputs = [x, gamma, beta];
        let mut bn = BatchNormalization::default();
        let inference = dense().with_train(false);
        assert!(bn.forward(&inputs, &inference).unwrap_err().is_state());
        bn.forward(&inputs, &dense()).unwrap();
        let gy = Array::from_array(NdArray::from_elem([4, 3], 1f32));
        bn.forward(&inputs, &inference).unwrap();
        let grads = bn.backward(&inputs, &[gy], &inference).unwrap();
        assert_eq!(grads.len(), 3);
    }

    #[test]
    fn accelerated_matches_dense() {
        for dims in [vec![3, 10, 4, 5], vec![6, 3]] {
            let c = dims[1];
            let x = Array::from_array(NdArray::from_shape_fn(dims.as_slice(), |i| {
                ((i[0] * 7 + i[1] * 3 + i.slice().iter().sum::<usize>()) % 11) as f32 / 3.
            }));
            let [gamma, beta] = affine(c);
            let inputs = [x.clone(), gamma, beta];
            let mut a = BatchNormalization::default();
            let mut d = BatchNormalization::default();
            let ya = a.forward(&inputs, &accelerated()).unwrap().remove(0);
            let yd = d.forward(&inputs, &dense()).unwrap().remove(0);
            assert_eq!(a.backend(), Some(Backend::Accelerated));
            assert_eq!(ya.shape(), x.shape());
            assert_relative_eq!(
                ya.to_array::<f32>().unwrap(),
                yd.to_array::<f32>().unwrap(),
                epsilon = 1e-3
            );
            assert_relative_eq!(
                a.running_var().unwrap().to_array::<f32>().unwrap(),
                d.running_var().unwrap().to_array::<f32>().unwrap(),
                epsilon = 1e-3
            );
            let gy = Array::from_array(NdArray::from_shape_fn(dims.as_slice(), |i| {
                (i.slice().iter().sum::<usize>() % 5) as f32 - 2.
            }));
            let ga = a.backward(&inputs, &[gy.clone()], &accelerated()).unwrap();
            let gd = d.backward(&inputs, &[gy], &dense()).unwrap();
            assert_eq!(ga.len(), 3);
            for (ga, gd) in ga.iter().zip(gd.iter()) {
                assert_eq!(ga.shape(), gd.shape());
                assert_relative_eq!(
                    ga.to_array::<f32>().unwrap(),
                    gd.to_array::<f32>().unwrap(),
                    epsilon = 1e-3,
                    max_relative = 1e-3
                );
            }
        }
    }

    #[test]
    fn cache_hits_on_same_shape() {
        let x = Array::from_array(NdArray::from_shape_fn([2, 4, 3, 3], |(n, c, h, w)| {
            (n + c * h + w) as f32
        }));
        let [gamma, beta] = affine(4);
        let mut bn = BatchNormalization::default();
        for _ in 0..2 {
            bn.forward(&[x.clone(), gamma.clone(), beta.clone()], &accelerated())
                .unwrap();
        }
        assert_eq!(bn.cache_stats()[0], CacheStats { builds: 1, hits: 1 });
    }
}
