use super::{check_inputs, cosim, grad_output, Function};
use crate::{
    array::{Array, DType, Float},
    cache::{CacheSlot, CacheStats, ComputeComplex, Params, PrimitiveKind, Signature},
    config::Config,
    dispatch::{self, Backend, Guard},
    engine::{
        pooling::{PoolingAlg, PoolingDesc},
        Engine,
    },
    error::{config_error, shape_error, state_error, Result},
    layout::reorder_if_must,
    queue::{Op, OpQueue},
};
use dry::{macro_for, macro_wrap};
use half::f16;
use ndarray::{Array4, ArrayView4, Ix4};
use paste::paste;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

mod sealed {
    pub trait PoolKindBase {}
}
use sealed::PoolKindBase;

/// Options of a 2d pooling over the last two axes of an NCHW array.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pool2Options {
    /// Window size, (kh, kw).
    pub kernel: [usize; 2],
    /// Stride, (sy, sx).
    pub stride: [usize; 2],
    /// Symmetric padding, (ph, pw).
    pub pad: [usize; 2],
    /// Add extra outputs so that every input position is covered by a window.
    pub cover_all: bool,
}

impl Pool2Options {
    /// Options with `kernel`.
    ///
    /// Defaults:
    /// - stride: `kernel`
    /// - pad: 0
    /// - cover_all: true
    pub fn new(kernel: [usize; 2]) -> Self {
        Self {
            kernel,
            stride: kernel,
            pad: [0, 0],
            cover_all: true,
        }
    }
    /// Sets the stride.
    pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }
    /// Sets the padding.
    pub fn with_pad(mut self, pad: [usize; 2]) -> Self {
        self.pad = pad;
        self
    }
    /// Sets cover_all.
    pub fn with_cover_all(mut self, cover_all: bool) -> Self {
        self.cover_all = cover_all;
        self
    }
    /// **Errors**
    ///
    /// The kernel or stride is zero.
    pub fn validate(&self) -> Result<()> {
        if self.kernel.contains(&0) || self.stride.contains(&0) {
            return Err(config_error!(
                "pooling: kernel {:?} and stride {:?} must be positive",
                self.kernel,
                self.stride
            ));
        }
        Ok(())
    }
    /// The output size along `axis` for an input of `size`.
    ///
    /// `(size + 2p - k) / s + 1`, or `(size + 2p - k + s - 1) / s + 1` with cover_all, rounded
    /// down.
    ///
    /// **Errors**
    /// - The options are invalid.
    /// - The output would be empty.
    pub fn output_size(&self, axis: usize, size: usize) -> Result<usize> {
        self.validate()?;
        let (k, s, p) = (
            self.kernel[axis] as isize,
            self.stride[axis] as isize,
            self.pad[axis] as isize,
        );
        let numerator = size as isize + 2 * p - k + if self.cover_all { s - 1 } else { 0 };
        let output = numerator.div_euclid(s) + 1;
        if output <= 0 {
            return Err(shape_error!(
                "pooling: input size {size} is too small for {self:?}"
            ));
        }
        Ok(output as usize)
    }
    /// The output shape for an input of `[h, w]`.
    ///
    /// **Errors**
    ///
    /// See [`output_size()`](Pool2Options::output_size).
    pub fn output_shape(&self, [h, w]: [usize; 2]) -> Result<[usize; 2]> {
        Ok([self.output_size(0, h)?, self.output_size(1, w)?])
    }
    /// Input coordinate of window position `k` for output `o` along `axis`, if not padding.
    fn input_index(&self, axis: usize, o: usize, k: usize, len: usize) -> Option<usize> {
        (o * self.stride[axis] + k)
            .checked_sub(self.pad[axis])
            .filter(|i| *i < len)
    }
}

fn dims4(x: &Array) -> Result<[usize; 4]> {
    match *x.shape() {
        [n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(shape_error!(
            "pooling: expected 4 dimensions, found {:?}",
            x.shape()
        )),
    }
}

fn pool_dense<T: Float>(
    x: ArrayView4<T>,
    options: &Pool2Options,
    alg: PoolingAlg,
) -> Result<(Array4<T>, Option<Array4<i32>>)> {
    let (n, c, ih, iw) = x.dim();
    let [oh, ow] = options.output_shape([ih, iw])?;
    let [kh, kw] = options.kernel;
    let window = T::from_f64_lossy((kh * kw) as f64);
    let mut y = Array4::zeros([n, c, oh, ow]);
    let mut workspace = (alg == PoolingAlg::Max).then(|| Array4::<i32>::zeros([n, c, oh, ow]));
    for (ni, (x, mut y)) in x.outer_iter().zip(y.outer_iter_mut()).enumerate() {
        for (ci, (x, mut y)) in x.outer_iter().zip(y.outer_iter_mut()).enumerate() {
            for ((hy, wy), y) in y.indexed_iter_mut() {
                let mut max = T::neg_infinity();
                let mut argmax = 0;
                let mut sum = T::zero();
                for i in 0..kh {
                    let Some(hx) = options.input_index(0, hy, i, ih) else {
                        continue;
                    };
                    for j in 0..kw {
                        let Some(wx) = options.input_index(1, wy, j, iw) else {
                            continue;
                        };
                        let v = x[(hx, wx)];
                        if v > max {
                            max = v;
                            argmax = i * kw + j;
                        }
                        sum = sum + v;
                    }
                }
                match alg {
                    PoolingAlg::Max => {
                        *y = max;
                        if let Some(workspace) = workspace.as_mut() {
                            workspace[(ni, ci, hy, wy)] = argmax as i32;
                        }
                    }
                    PoolingAlg::AvgIncludePadding => *y = sum / window,
                }
            }
        }
    }
    Ok((y, workspace))
}

fn pool_backward_dense<T: Float>(
    gy: ArrayView4<T>,
    workspace: Option<ArrayView4<i32>>,
    [n, c, ih, iw]: [usize; 4],
    options: &Pool2Options,
    alg: PoolingAlg,
) -> Result<Array4<T>> {
    let [kh, kw] = options.kernel;
    let window = T::from_f64_lossy((kh * kw) as f64);
    let mut gx = Array4::<T>::zeros([n, c, ih, iw]);
    for ((ni, ci, hy, wy), g) in gy.indexed_iter() {
        match (alg, workspace.as_ref()) {
            (PoolingAlg::Max, Some(workspace)) => {
                let k = workspace[(ni, ci, hy, wy)] as usize;
                if let (Some(hx), Some(wx)) = (
                    options.input_index(0, hy, k / kw, ih),
                    options.input_index(1, wy, k % kw, iw),
                ) {
                    gx[(ni, ci, hx, wx)] = gx[(ni, ci, hx, wx)] + *g;
                }
            }
            (PoolingAlg::Max, None) => {
                return Err(state_error!("max pooling backward requires a workspace"))
            }
            (PoolingAlg::AvgIncludePadding, _) => {
                let g = *g / window;
                for i in 0..kh {
                    let Some(hx) = options.input_index(0, hy, i, ih) else {
                        continue;
                    };
                    for j in 0..kw {
                        if let Some(wx) = options.input_index(1, wy, j, iw) {
                            gx[(ni, ci, hx, wx)] = gx[(ni, ci, hx, wx)] + g;
                        }
                    }
                }
            }
        }
    }
    Ok(gx)
}

fn forward_dense(
    x: &Array,
    options: &Pool2Options,
    alg: PoolingAlg,
) -> Result<(Array, Option<Array>)> {
    macro_wrap!(paste! { match x.dtype() {
        macro_for!($T in [f16, f32, f64] {
            DType::[<$T:upper>] => {
                let input = x
                    .to_array::<$T>()?
                    .into_dimensionality::<Ix4>()
                    .map_err(|e| shape_error!("{e}"))?;
                let (y, workspace) = pool_dense(input.view(), options, alg)?;
                Ok((
                    Array::from_array(y).into_device(x.device()),
                    workspace.map(|w| Array::from_array(w).into_device(x.device())),
                ))
            }
        })
        DType::I32 => Err(shape_error!("pooling: expected a float input, found {:?}", x.dtype())),
    }})
}

fn backward_dense(
    x: &Array,
    gy: &Array,
    workspace: Option<&Array>,
    options: &Pool2Options,
    alg: PoolingAlg,
) -> Result<Array> {
    let dims = dims4(x)?;
    let workspace = workspace
        .map(|w| {
            w.to_array::<i32>()?
                .into_dimensionality::<Ix4>()
                .map_err(|e| shape_error!("{e}"))
        })
        .transpose()?;
    macro_wrap!(paste! { match x.dtype() {
        macro_for!($T in [f16, f32, f64] {
            DType::[<$T:upper>] => {
                let gy = gy
                    .to_array::<$T>()?
                    .into_dimensionality::<Ix4>()
                    .map_err(|e| shape_error!("{e}"))?;
                let gx = pool_backward_dense(
                    gy.view(),
                    workspace.as_ref().map(|w| w.view()),
                    dims,
                    options,
                    alg,
                )?;
                Ok(Array::from_array(gx).into_device(x.device()))
            }
        })
        DType::I32 => Err(shape_error!("pooling: expected a float input, found {:?}", x.dtype())),
    }})
}

/// Plan of the accelerated forward pass.
#[derive(Debug)]
pub struct PoolingForward {
    signature: Signature,
    desc: Arc<PoolingDesc>,
    inputs: Vec<Array>,
    y: Array,
    workspace: Option<Array>,
}

impl ComputeComplex for PoolingForward {
    fn signature(&self) -> &Signature {
        &self.signature
    }
    fn rebind(&mut self, inputs: &[Array]) {
        self.inputs.clear();
        self.inputs.extend_from_slice(inputs);
    }
}

impl PoolingForward {
    fn build(
        signature: &Signature,
        inputs: &[Array],
        options: &Pool2Options,
        alg: PoolingAlg,
    ) -> Result<Self> {
        let x = &inputs[0];
        let dims = dims4(x)?;
        let output = options.output_shape([dims[2], dims[3]])?;
        let desc = Arc::new(PoolingDesc::new(
            alg,
            dims,
            output,
            options.kernel,
            options.stride,
            options.pad,
        )?);
        let y = Array::zeros(desc.dst().clone(), x.device())?;
        let workspace = desc
            .workspace()
            .map(|desc| Array::zeros(desc.clone(), x.device()))
            .transpose()?;
        Ok(Self {
            signature: signature.clone(),
            desc,
            inputs: inputs.to_vec(),
            y,
            workspace,
        })
    }
    /// The descriptor, used as a hint by the backward plan.
    pub fn desc(&self) -> &Arc<PoolingDesc> {
        &self.desc
    }
    fn execute(&mut self) -> Result<(Array, Option<Array>)> {
        let engine = Engine::get()?;
        self.y.reuse_or_alloc()?;
        if let Some(workspace) = self.workspace.as_mut() {
            workspace.reuse_or_alloc()?;
        }
        let mut queue = OpQueue::new();
        let desc = self.desc.clone();
        let x = reorder_if_must(&self.inputs[0], desc.src(), &mut queue)?;
        let y = self.y.clone();
        let workspace = self.workspace.clone();
        queue.push(Op::primitive("pooling_forward", move || {
            let x = x.read::<f32>()?;
            let mut y = y.write::<f32>()?;
            let mut workspace = workspace.as_ref().map(Array::write::<i32>).transpose()?;
            engine.pooling_forward(
                &desc,
                &x,
                &mut y,
                workspace.as_deref_mut().map(Vec::as_mut_slice),
            )
        }));
        queue.execute()?;
        Ok((self.y.clone(), self.workspace.clone()))
    }
}

/// Plan of the accelerated backward pass.
#[derive(Debug)]
pub struct PoolingBackward {
    signature: Signature,
    hint: Arc<PoolingDesc>,
    inputs: Vec<Array>,
    gx: Array,
}

impl ComputeComplex for PoolingBackward {
    fn signature(&self) -> &Signature {
        &self.signature
    }
    fn rebind(&mut self, inputs: &[Array]) {
        self.inputs.clear();
        self.inputs.extend_from_slice(inputs);
    }
}

impl PoolingBackward {
    fn build(signature: &Signature, inputs: &[Array], hint: &Arc<PoolingDesc>) -> Result<Self> {
        let x = &inputs[0];
        if x.shape() != hint.src().dims() {
            return Err(state_error!(
                "pooling: backward with x {:?} does not match the forward pass",
                x.shape()
            ));
        }
        Ok(Self {
            signature: signature.clone(),
            hint: hint.clone(),
            inputs: inputs.to_vec(),
            gx: Array::zeros(hint.src().clone(), x.device())?,
        })
    }
    fn execute(&mut self) -> Result<Array> {
        let engine = Engine::get()?;
        self.gx.reuse_or_alloc()?;
        let mut queue = OpQueue::new();
        let desc = self.hint.clone();
        let gy = reorder_if_must(&self.inputs[1], desc.dst(), &mut queue)?;
        let workspace = self.inputs.get(2).cloned();
        let gx = self.gx.clone();
        queue.push(Op::primitive("pooling_backward", move || {
            let gy = gy.read::<f32>()?;
            let workspace = workspace.as_ref().map(Array::read::<i32>).transpose()?;
            let mut gx = gx.write::<f32>()?;
            engine.pooling_backward(&desc, &gy, workspace.as_deref().map(Vec::as_slice), &mut gx)
        }));
        queue.execute()?;
        Ok(self.gx.clone())
    }
}

/// Marker trait for [`PoolBase`].
pub trait PoolKind: Default + Debug + Send + Sync + 'static + PoolKindBase {
    /// The algorithm.
    const ALG: PoolingAlg;
    /// The name of the function.
    const NAME: &'static str;
}

/// Marker for [`MaxPool2`].
#[derive(Default, Clone, Copy, Debug)]
pub struct PoolMax {}

impl PoolKindBase for PoolMax {}

impl PoolKind for PoolMax {
    const ALG: PoolingAlg = PoolingAlg::Max;
    const NAME: &'static str = "max_pooling_2d";
}

/// Marker for [`AvgPool2`].
#[derive(Default, Clone, Copy, Debug)]
pub struct PoolMean {}

impl PoolKindBase for PoolMean {}

impl PoolKind for PoolMean {
    const ALG: PoolingAlg = PoolingAlg::AvgIncludePadding;
    const NAME: &'static str = "average_pooling_2d";
}

#[derive(Debug)]
struct Saved {
    backend: Backend,
    x_shape: Vec<usize>,
    hint: Option<Arc<PoolingDesc>>,
    workspace: Option<Array>,
}

/// 2d pooling of an NCHW array.
///
/// Inputs are `[x]`. Outputs are `[y]`, where y is (N, C, oh, ow) as computed by
/// [`Pool2Options::output_shape()`]. The backward pass returns `[gx]`.
///
/// The accelerated backend returns y in
/// [`Layout::ChannelBlocked8`](crate::layout::Layout::ChannelBlocked8).
pub struct PoolBase<K: PoolKind> {
    options: Pool2Options,
    forward_cc: CacheSlot<PoolingForward>,
    backward_cc: CacheSlot<PoolingBackward>,
    saved: Option<Saved>,
    kind: K,
}

/// MaxPool2
///
/// See [`PoolBase`].
pub type MaxPool2 = PoolBase<PoolMax>;

/// AvgPool2, padding counts toward the window size.
///
/// See [`PoolBase`].
pub type AvgPool2 = PoolBase<PoolMean>;

impl<K: PoolKind> PoolBase<K> {
    /// Creates a new pool with `options`.
    ///
    /// **Errors**
    ///
    /// See [`Pool2Options::validate()`].
    pub fn new(options: Pool2Options) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            forward_cc: CacheSlot::new(),
            backward_cc: CacheSlot::new(),
            saved: None,
            kind: K::default(),
        })
    }
    /// The options.
    pub fn options(&self) -> &Pool2Options {
        &self.options
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
    fn signature(&self, kind: PrimitiveKind, inputs: &[Array], config: &Config) -> Signature {
        let Pool2Options {
            kernel,
            stride,
            pad,
            cover_all,
        } = self.options;
        Signature {
            kind,
            dtype: inputs[0].dtype(),
            shapes: inputs.iter().map(|x| x.shape().to_vec()).collect(),
            params: Params::Pooling {
                alg: K::ALG,
                kernel,
                stride,
                pad,
                cover_all,
            },
            mode: config.train.into(),
            hint: self
                .saved
                .as_ref()
                .and_then(|saved| saved.hint.as_ref())
                .map(|hint| hint.id()),
        }
    }
}

impl<K: PoolKind> Debug for PoolBase<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(K::NAME)
            .field("options", &self.options)
            .field("kind", &self.kind)
            .field("forward_cc", &self.forward_cc)
            .field("backward_cc", &self.backward_cc)
            .finish()
    }
}

impl<K: PoolKind> Function for PoolBase<K> {
    /// **Errors**
    /// - x is not 4 dimensional, or too small for the window.
    /// - x is not a float array.
    fn forward(&mut self, inputs: &[Array], config: &Config) -> Result<Vec<Array>> {
        check_inputs(K::NAME, inputs, &[1])?;
        let x = &inputs[0];
        let dims = dims4(x)?;
        self.options.output_shape([dims[2], dims[3]])?;
        let guard = Guard::new(K::NAME, inputs, &[4]);
        let backend = dispatch::select(config, &guard)?;
        let mut hint = None;
        let (y, workspace) = match backend {
            Backend::Gpu => {
                let gpu = config
                    .gpu()
                    .ok_or_else(|| state_error!("{}: no gpu kernels", K::NAME))?;
                let output = gpu.pooling_forward(x, K::ALG, &self.options)?;
                (output.y, output.workspace)
            }
            Backend::Accelerated => {
                let mut signature = self.signature(PrimitiveKind::PoolingForward, inputs, config);
                signature.hint = None;
                let options = self.options;
                let cc = self
                    .forward_cc
                    .match_or_build(&signature, inputs, |s, i| {
                        PoolingForward::build(s, i, &options, K::ALG)
                    })?;
                hint.replace(cc.desc().clone());
                cc.execute()?
            }
            Backend::Dense => forward_dense(x, &self.options, K::ALG)?,
        };
        if config.cosim && backend != Backend::Dense {
            cosim(K::NAME, backend, &[y.clone()], || {
                Ok(vec![forward_dense(x, &self.options, K::ALG)?.0])
            })?;
        }
        self.saved.replace(Saved {
            backend,
            x_shape: x.shape().to_vec(),
            hint,
            workspace,
        });
        Ok(vec![y])
    }
    /// **Errors**
    /// - No forward pass was run, or x differs from the forward pass.
    /// - `grad_outputs[0]` does not match y.
    fn backward(
        &mut self,
        inputs: &[Array],
        grad_outputs: &[Array],
        config: &Config,
    ) -> Result<Vec<Array>> {
        let saved = self
            .saved
            .as_ref()
            .ok_or_else(|| state_error!("{}: backward called before forward", K::NAME))?;
        check_inputs(K::NAME, inputs, &[1])?;
        let x = &inputs[0];
        if x.shape() != saved.x_shape {
            return Err(state_error!(
                "{}: backward x {:?} does not match the forward pass",
                K::NAME,
                x.shape()
            ));
        }
        let [n, c, h, w] = dims4(x)?;
        let [oh, ow] = self.options.output_shape([h, w])?;
        let gy = grad_output(K::NAME, grad_outputs, x, &[n, c, oh, ow])?;
        let backend = saved.backend;
        let workspace = saved.workspace.clone();
        let gx = match backend {
            Backend::Gpu => {
                let gpu = config
                    .gpu()
                    .ok_or_else(|| state_error!("{}: no gpu kernels", K::NAME))?;
                gpu.pooling_backward(x, gy, workspace.as_ref(), K::ALG, &self.options)?
            }
            Backend::Accelerated => {
                let hint = saved
                    .hint
                    .clone()
                    .ok_or_else(|| state_error!("{}: missing forward plan", K::NAME))?;
                let backward_inputs: Vec<Array> = [Some(x.clone()), Some(gy.clone()), workspace]
                    .into_iter()
                    .flatten()
                    .collect();
                let signature =
                    self.signature(PrimitiveKind::PoolingBackward, &backward_inputs, config);
                self.backward_cc
                    .match_or_build(&signature, &backward_inputs, |s, i| {
                        PoolingBackward::build(s, i, &hint)
                    })?
                    .execute()?
            }
            Backend::Dense => backward_dense(x, gy, workspace.as_ref(), &self.options, K::ALG)?,
        };
        if config.cosim && backend != Backend::Dense {
            let reference_workspace = if K::ALG == PoolingAlg::Max {
                forward_dense(x, &self.options, K::ALG)?.1
            } else {
                None
            };
            cosim(K::NAME, backend, &[gx.clone()], || {
                Ok(vec![backward_dense(
                    x,
                    gy,
                    reference_workspace.as_ref(),
                    &self.options,
                    K::ALG,
                )?])
            })?;
        }
        Ok(vec![gx])
    }
}

/// Max pooling with a new [`MaxPool2`].
///
/// **Errors**
///
/// See [`PoolBase`].
pub fn max_pooling_2d(x: &Array, options: Pool2Options, config: &Config) -> Result<Array> {
    pool::<PoolMax>(x, options, config)
}

/// Average pooling with a new [`AvgPool2`].
///
/// **Errors**
///
/// See [`PoolBase`].
pub fn average_pooling_2d(x: &Array, options: Pool2Options, config: &Config) -> Result<Array> {
    pool::<PoolMean>(x, options, config)
}

fn pool<K: PoolKind>(x: &Array, options: Pool2Options, config: &Config) -> Result<Array> {
    PoolBase::<K>::new(options)?
        .forward(&[x.clone()], config)?
        .pop()
        .ok_or_else(|| state_error!("{}: missing output", K::NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{EligibilityFlags, UseAccelerated},
        layout::Layout,
    };
    use approx::assert_relative_eq;
    use ndarray::{Array as NdArray, ArrayD};

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

    fn input(dims: [usize; 4]) -> NdArray<f32, Ix4> {
        NdArray::from_shape_fn(dims, |(n, c, h, w)| {
            ((n * 7 + c * 5 + h * 3 + w * 11) % 13) as f32 - 6.
        })
    }

    #[test]
    fn output_size() {
        let options = Pool2Options::new([2, 2]).with_cover_all(false);
        assert_eq!(options.output_shape([8, 8]).unwrap(), [4, 4]);
        assert_eq!(options.output_shape([9, 9]).unwrap(), [4, 4]);
        let options = options.with_cover_all(true);
        assert_eq!(options.output_shape([9, 9]).unwrap(), [5, 5]);
        let options = Pool2Options::new([3, 3]).with_stride([2, 2]).with_pad([1, 1]);
        assert_eq!(options.output_shape([4, 4]).unwrap(), [3, 3]);
        assert!(Pool2Options::new([3, 3])
            .with_cover_all(false)
            .output_shape([1, 1])
            .unwrap_err()
            .is_shape());
        assert!(Pool2Options::new([0, 2])
            .validate()
            .unwrap_err()
            .is_config());
    }

    #[test]
    fn max_pooling_shape() {
        let x = Array::from_array(input([1, 3, 8, 8]));
        let options = Pool2Options::new([2, 2]).with_cover_all(false);
        for config in [dense(), accelerated()] {
            let y = max_pooling_2d(&x, options, &config).unwrap();
            assert_eq!(y.shape(), &[1, 3, 4, 4]);
        }
    }

    #[test]
    fn padding_only_windows_pass_cosim() {
        let x = Array::from_array(NdArray::from_elem([1, 1, 1, 1], 3f32));
        let options = Pool2Options::new([1, 1])
            .with_stride([2, 2])
            .with_pad([1, 1])
            .with_cover_all(false);
        let config = accelerated().with_cosim(true);
        let mut pool = MaxPool2::new(options).unwrap();
        let y = pool.forward(&[x.clone()], &config).unwrap().remove(0);
        assert_eq!(pool.backend(), Some(Backend::Accelerated));
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        let y = y.to_array::<f32>().unwrap();
        assert!(y.iter().all(|y| *y == f32::NEG_INFINITY));
        let gy = Array::from_array(NdArray::from_elem([1, 1, 2, 2], 1f32));
        let gx = pool.backward(&[x], &[gy], &config).unwrap().remove(0);
        assert_eq!(gx.to_array::<f32>().unwrap()[[0, 0, 0, 0]], 0.);
    }

    #[test]
    fn accelerated_matches_dense() {
        let x = Array::from_array(input([2, 10, 7, 6]));
        let options = Pool2Options::new([3, 3]).with_stride([2, 2]).with_pad([1, 1]);
        for alg in [PoolingAlg::Max, PoolingAlg::AvgIncludePadding] {
            let (ya, ga, yd, gd) = match alg {
                PoolingAlg::Max => run::<PoolMax>(&x, options),
                PoolingAlg::AvgIncludePadding => run::<PoolMean>(&x, options),
            };
            assert_relative_eq!(ya, yd, epsilon = 1e-5);
            assert_relative_eq!(ga, gd, epsilon = 1e-5);
        }
    }

    fn run<K: PoolKind>(
        x: &Array,
        options: Pool2Options,
    ) -> (ArrayD<f32>, ArrayD<f32>, ArrayD<f32>, ArrayD<f32>) {
        let mut a = PoolBase::<K>::new(options).unwrap();
        let mut d = PoolBase::<K>::new(options).unwrap();
        let ya = a.forward(&[x.clone()], &accelerated()).unwrap().remove(0);
        let yd = d.forward(&[x.clone()], &dense()).unwrap().remove(0);
        assert_eq!(ya.layout(), Layout::ChannelBlocked8);
        assert_eq!(yd.layout(), Layout::Plain);
        let gy = Array::from_array(NdArray::from_shape_fn(yd.shape(), |i| {
            (i[1] + i[2] * 2 + i[3]) as f32
        }));
        let ga = a
            .backward(&[x.clone()], &[gy.clone()], &accelerated())
            .unwrap()
            .remove(0);
        let gd = d.backward(&[x.clone()], &[gy], &dense()).unwrap().remove(0);
        (
            ya.to_array().unwrap(),
            ga.to_array().unwrap(),
            yd.to_array().unwrap(),
            gd.to_array().unwrap(),
        )
    }

    #[test]
    fn max_backward_routes_to_argmax() {
        let x = Array::from_array(
            NdArray::from_shape_vec([1, 1, 2, 2], vec![1f64, 3., 2., 3.]).unwrap(),
        );
        let mut pool = MaxPool2::new(Pool2Options::new([2, 2])).unwrap();
        let y = pool.forward(&[x.clone()], &dense()).unwrap();
        assert_eq!(y[0].to_array::<f64>().unwrap().as_slice().unwrap(), &[3.]);
        let gy = Array::from_array(NdArray::from_elem([1, 1, 1, 1], 1f64));
        let gx = pool.backward(&[x], &[gy], &dense()).unwrap();
        assert_eq!(
            gx[0].to_array::<f64>().unwrap().as_slice().unwrap(),
            &[0., 1., 0., 0.]
        );
    }

    #[test]
    fn cache_hits() {
        let x = Array::from_array(input([1, 3, 8, 8]));
        let mut pool = AvgPool2::new(Pool2Options::new([2, 2])).unwrap();
        for _ in 0..3 {
            pool.forward(&[x.clone()], &accelerated()).unwrap();
        }
        assert_eq!(
            pool.cache_stats()[0],
            CacheStats { builds: 1, hits: 2 }
        );
    }

    #[test]
    fn rank_error() {
        let x = Array::from_array(NdArray::<f32, _>::zeros([2, 3]));
        assert!(max_pooling_2d(&x, Pool2Options::new([2, 2]), &dense())
            .unwrap_err()
            .is_shape());
    }
}
