use super::{check_inputs, cosim, grad_output, Function};
use crate::{
    array::{Array, DType, Float},
    cache::{CacheSlot, CacheStats, ComputeComplex, HintId, Mode, Params, PrimitiveKind, Signature},
    config::Config,
    dispatch::{self, Backend, Guard},
    engine::{inner_product::InnerProductDesc, Engine},
    error::{shape_error, state_error, Result},
    layout::{reorder_if_must, MemoryDesc},
    queue::{Op, OpQueue},
};
use dry::{macro_for, macro_wrap};
use half::f16;
use ndarray::{ArrayD, ArrayViewD, Axis, Ix1, Ix2};
use paste::paste;
use std::sync::Arc;

/// Returns (batch, inputs, outputs) of y = x W^T + b.
///
/// x is flattened to (batch, inputs) and W to (outputs, inputs).
fn linear_dims(x: &Array, w: &Array, b: Option<&Array>) -> Result<(usize, usize, usize)> {
    let (batch, inputs) = match x.shape() {
        [batch, rest @ ..] if !rest.is_empty() => (*batch, rest.iter().product::<usize>()),
        shape => {
            return Err(shape_error!(
                "linear: x must have at least 2 dimensions, found {shape:?}"
            ))
        }
    };
    let (outputs, w_inputs) = match w.shape() {
        [outputs, rest @ ..] if !rest.is_empty() => (*outputs, rest.iter().product::<usize>()),
        shape => {
            return Err(shape_error!(
                "linear: W must have at least 2 dimensions, found {shape:?}"
            ))
        }
    };
    if inputs != w_inputs {
        return Err(shape_error!(
            "linear: x {:?} is incompatible with W {:?}",
            x.shape(),
            w.shape()
        ));
    }
    if let Some(b) = b {
        if b.shape() != [outputs] {
            return Err(shape_error!(
                "linear: expected b [{outputs}], found {:?}",
                b.shape()
            ));
        }
    }
    Ok((batch, inputs, outputs))
}

/// Plain f32 view of `array` with `dims`.
fn as_matrix(array: &Array, dims: &[usize], queue: &mut OpQueue) -> Result<Array> {
    reorder_if_must(array, &MemoryDesc::plain(array.shape(), DType::F32), queue)?.reshape(dims)
}

/// Plan of the accelerated forward pass.
#[derive(Debug)]
pub struct LinearForward {
    signature: Signature,
    desc: Arc<InnerProductDesc>,
    inputs: Vec<Array>,
    y: Array,
}

impl ComputeComplex for LinearForward {
    fn signature(&self) -> &Signature {
        &self.signature
    }
    fn rebind(&mut self, inputs: &[Array]) {
        self.inputs.clear();
        self.inputs.extend_from_slice(inputs);
    }
}

impl LinearForward {
    fn build(signature: &Signature, inputs: &[Array]) -> Result<Self> {
        let (batch, in_size, out_size) = linear_dims(&inputs[0], &inputs[1], inputs.get(2))?;
        let desc = Arc::new(InnerProductDesc::new(
            batch,
            in_size,
            out_size,
            inputs.len() == 3,
        ));
        let y = Array::zeros(desc.dst().clone(), inputs[0].device())?;
        Ok(Self {
            signature: signature.clone(),
            desc,
            inputs: inputs.to_vec(),
            y,
        })
    }
    /// The descriptor, used as a hint by the backward plans.
    pub fn desc(&self) -> &Arc<InnerProductDesc> {
        &self.desc
    }
    fn execute(&mut self) -> Result<Array> {
        let engine = Engine::get()?;
        self.y.reuse_or_alloc()?;
        let mut queue = OpQueue::new();
        let desc = self.desc.clone();
        let x = as_matrix(&self.inputs[0], desc.src().dims(), &mut queue)?;
        let w = as_matrix(&self.inputs[1], desc.weights().dims(), &mut queue)?;
        let b = self.inputs.get(2).cloned();
        let y = self.y.clone();
        queue.push(Op::primitive("inner_product_forward", move || {
            let x = x.read::<f32>()?;
            let w = w.read::<f32>()?;
            let b = b.as_ref().map(Array::read::<f32>).transpose()?;
            let mut y = y.write::<f32>()?;
            engine.inner_product_forward(&desc, &x, &w, b.as_deref().map(Vec::as_slice), &mut y)
        }));
        queue.execute()?;
        Ok(self.y.clone())
    }
}

/// Plan of the accelerated input gradient, gx = gy W.
#[derive(Debug)]
pub struct LinearBackwardData {
    signature: Signature,
    hint: Arc<InnerProductDesc>,
    inputs: Vec<Array>,
    gx: Array,
}

impl ComputeComplex for LinearBackwardData {
    fn signature(&self) -> &Signature {
        &self.signature
    }
    fn rebind(&mut self, inputs: &[Array]) {
        self.inputs.clear();
        self.inputs.extend_from_slice(inputs);
    }
}

impl LinearBackwardData {
    fn build(
        signature: &Signature,
        inputs: &[Array],
        hint: &Arc<InnerProductDesc>,
    ) -> Result<Self> {
        let x = &inputs[0];
        check_hint(hint, x, &inputs[1])?;
        Ok(Self {
            signature: signature.clone(),
            hint: hint.clone(),
            inputs: inputs.to_vec(),
            gx: Array::zeros(MemoryDesc::plain(x.shape(), DType::F32), x.device())?,
        })
    }
    fn execute(&mut self) -> Result<Array> {
        let engine = Engine::get()?;
        self.gx.reuse_or_alloc()?;
        let mut queue = OpQueue::new();
        let desc = self.hint.clone();
        let w = as_matrix(&self.inputs[1], desc.weights().dims(), &mut queue)?;
        let gy = as_matrix(&self.inputs[2], desc.dst().dims(), &mut queue)?;
        let gx = self.gx.clone();
        queue.push(Op::primitive("inner_product_backward_data", move || {
            let gy = gy.read::<f32>()?;
            let w = w.read::<f32>()?;
            let mut gx = gx.write::<f32>()?;
            engine.inner_product_backward_data(&desc, &gy, &w, &mut gx)
        }));
        queue.execute()?;
        Ok(self.gx.clone())
    }
}

/// Plan of the accelerated weight and bias gradients.
#[derive(Debug)]
pub struct LinearBackwardWeights {
    signature: Signature,
    hint: Arc<InnerProductDesc>,
    inputs: Vec<Array>,
    gw: Array,
    gb: Option<Array>,
}

impl ComputeComplex for LinearBackwardWeights {
    fn signature(&self) -> &Signature {
        &self.signature
    }
    fn rebind(&mut self, inputs: &[Array]) {
        self.inputs.clear();
        self.inputs.extend_from_slice(inputs);
    }
}

impl LinearBackwardWeights {
    fn build(
        signature: &Signature,
        inputs: &[Array],
        hint: &Arc<InnerProductDesc>,
    ) -> Result<Self> {
        let w = &inputs[1];
        check_hint(hint, &inputs[0], w)?;
        let gb = if hint.bias() {
            Some(Array::zeros(hint.bias_desc(), w.device())?)
        } else {
            None
        };
        Ok(Self {
            signature: signature.clone(),
            hint: hint.clone(),
            inputs: inputs.to_vec(),
            gw: Array::zeros(MemoryDesc::plain(w.shape(), DType::F32), w.device())?,
            gb,
        })
    }
    fn execute(&mut self) -> Result<(Array, Option<Array>)> {
        let engine = Engine::get()?;
        self.gw.reuse_or_alloc()?;
        if let Some(gb) = self.gb.as_mut() {
            gb.reuse_or_alloc()?;
        }
        let mut queue = OpQueue::new();
        let desc = self.hint.clone();
        let x = as_matrix(&self.inputs[0], desc.src().dims(), &mut queue)?;
        let gy = as_matrix(&self.inputs[2], desc.dst().dims(), &mut queue)?;
        let gw = self.gw.clone();
        let gb = self.gb.clone();
        queue.push(Op::primitive("inner_product_backward_weights", move || {
            let x = x.read::<f32>()?;
            let gy = gy.read::<f32>()?;
            let mut gw = gw.write::<f32>()?;
            let mut gb = gb.as_ref().map(Array::write::<f32>).transpose()?;
            engine.inner_product_backward_weights(
                &desc,
                &x,
                &gy,
                &mut gw,
                gb.as_deref_mut().map(Vec::as_mut_slice),
            )
        }));
        queue.execute()?;
        Ok((self.gw.clone(), self.gb.clone()))
    }
}

fn check_hint(hint: &InnerProductDesc, x: &Array, w: &Array) -> Result<()> {
    let (batch, inputs, outputs) = linear_dims(x, w, None)?;
    if hint.src().dims() != [batch, inputs] || hint.weights().dims() != [outputs, inputs] {
        return Err(state_error!(
            "linear: backward with x {:?} and W {:?} does not match the forward pass",
            x.shape(),
            w.shape()
        ));
    }
    Ok(())
}

fn linear_dense<T: Float + std::ops::AddAssign>(
    x: ArrayViewD<T>,
    w: ArrayViewD<T>,
    b: Option<ArrayViewD<T>>,
) -> Result<ArrayD<T>> {
    let batch = x.shape()[0];
    let outputs = w.shape()[0];
    let x = x
        .into_shape([batch, w.len() / outputs.max(1)])
        .map_err(|e| shape_error!("{e}"))?;
    let w = w
        .into_shape([outputs, x.shape()[1]])
        .map_err(|e| shape_error!("{e}"))?;
    let mut y = x.dot(&w.t());
    if let Some(b) = b {
        let b = b
            .into_dimensionality::<Ix1>()
            .map_err(|e| shape_error!("{e}"))?;
        y += &b;
    }
    Ok(y.into_dyn())
}

fn linear_backward_dense<T: Float>(
    x: ArrayViewD<T>,
    w: ArrayViewD<T>,
    gy: ArrayViewD<T>,
    bias: bool,
) -> Result<(ArrayD<T>, ArrayD<T>, Option<ArrayD<T>>)> {
    let (x_dim, w_dim) = (x.raw_dim(), w.raw_dim());
    let batch = x.shape()[0];
    let outputs = w.shape()[0];
    let x = x
        .into_shape([batch, w.len() / outputs.max(1)])
        .map_err(|e| shape_error!("{e}"))?;
    let w = w
        .into_shape([outputs, x.shape()[1]])
        .map_err(|e| shape_error!("{e}"))?;
    let gy = gy
        .into_dimensionality::<Ix2>()
        .map_err(|e| shape_error!("{e}"))?;
    let gx = gy.dot(&w).into_shape(x_dim).map_err(|e| shape_error!("{e}"))?;
    let gw = gy.t().dot(&x).into_shape(w_dim).map_err(|e| shape_error!("{e}"))?;
    let gb = bias.then(|| gy.sum_axis(Axis(0)).into_dyn());
    Ok((gx, gw, gb))
}

fn forward_dense(inputs: &[Array]) -> Result<Array> {
    let x = &inputs[0];
    macro_wrap!(paste! { match x.dtype() {
        macro_for!($T in [f16, f32, f64] {
            DType::[<$T:upper>] => {
                let b = inputs.get(2).map(Array::to_array::<$T>).transpose()?;
                let y = linear_dense(
                    x.to_array::<$T>()?.view(),
                    inputs[1].to_array::<$T>()?.view(),
                    b.as_ref().map(|b| b.view()),
                )?;
                Ok(Array::from_array(y).into_device(x.device()))
            }
        })
        DType::I32 => Err(shape_error!("linear: expected a float input, found {:?}", x.dtype())),
    }})
}

fn backward_dense(x: &Array, w: &Array, gy: &Array, bias: bool) -> Result<Vec<Array>> {
    macro_wrap!(paste! { match x.dtype() {
        macro_for!($T in [f16, f32, f64] {
            DType::[<$T:upper>] => {
                let (gx, gw, gb) = linear_backward_dense(
                    x.to_array::<$T>()?.view(),
                    w.to_array::<$T>()?.view(),
                    gy.to_array::<$T>()?.view(),
                    bias,
                )?;
                Ok([Some(gx), Some(gw), gb]
                    .into_iter()
                    .flatten()
                    .map(|g| Array::from_array(g).into_device(x.device()))
                    .collect())
            }
        })
        DType::I32 => Err(shape_error!("linear: expected a float input, found {:?}", x.dtype())),
    }})
}

#[derive(Debug)]
struct Saved {
    backend: Backend,
    x_shape: Vec<usize>,
    w_shape: Vec<usize>,
    bias: bool,
    hint: Option<Arc<InnerProductDesc>>,
}

/// y = x W^T + b.
///
/// Inputs are `[x, W]` or `[x, W, b]`. x is flattened to (batch, inputs) where batch is the first
/// dimension, W is flattened to (outputs, inputs), and b is (outputs). The output is
/// (batch, outputs). The backward pass returns `[gx, gW]` or `[gx, gW, gb]`.
#[derive(Debug, Default)]
pub struct Linear {
    forward_cc: CacheSlot<LinearForward>,
    backward_data_cc: CacheSlot<LinearBackwardData>,
    backward_weights_cc: CacheSlot<LinearBackwardWeights>,
    saved: Option<Saved>,
}

impl Linear {
    /// Creates a new [`Linear`].
    pub fn new() -> Self {
        Self::default()
    }
    /// Build and hit counters of the forward, backward data and backward weights plans.
    pub fn cache_stats(&self) -> [CacheStats; 3] {
        [
            CacheStats::from(&self.forward_cc),
            CacheStats::from(&self.backward_data_cc),
            CacheStats::from(&self.backward_weights_cc),
        ]
    }
    /// The backend of the last forward pass.
    pub fn backend(&self) -> Option<Backend> {
        self.saved.as_ref().map(|saved| saved.backend)
    }
}

fn signature(
    kind: PrimitiveKind,
    inputs: &[Array],
    bias: bool,
    mode: Mode,
    hint: Option<HintId>,
) -> Signature {
    Signature {
        kind,
        dtype: inputs[0].dtype(),
        shapes: inputs.iter().map(|x| x.shape().to_vec()).collect(),
        params: Params::Linear { bias },
        mode,
        hint,
    }
}

impl Function for Linear {
    /// **Errors**
    /// - The shapes are incompatible.
    /// - The inputs are on different devices.
    fn forward(&mut self, inputs: &[Array], config: &Config) -> Result<Vec<Array>> {
        check_inputs("linear", inputs, &[2, 3])?;
        let (x, w, b) = (&inputs[0], &inputs[1], inputs.get(2));
        linear_dims(x, w, b)?;
        let guard = Guard::new("linear", inputs, &[2, 4]);
        let backend = dispatch::select(config, &guard)?;
        let mut hint = None;
        let y = match backend {
            Backend::Gpu => {
                let gpu = config
                    .gpu()
                    .ok_or_else(|| state_error!("linear: no gpu kernels"))?;
                gpu.linear_forward(x, w, b)?
            }
            Backend::Accelerated => {
                let signature = signature(
                    PrimitiveKind::LinearForward,
                    inputs,
                    b.is_some(),
                    config.train.into(),
                    None,
                );
                let cc = self
                    .forward_cc
                    .match_or_build(&signature, inputs, LinearForward::build)?;
                hint.replace(cc.desc().clone());
                cc.execute()?
            }
            Backend::Dense => forward_dense(inputs)?,
        };
        if config.cosim && backend != Backend::Dense {
            cosim("linear", backend, &[y.clone()], || Ok(vec![forward_dense(inputs)?]))?;
        }
        self.saved.replace(Saved {
            backend,
            x_shape: x.shape().to_vec(),
            w_shape: w.shape().to_vec(),
            bias: b.is_some(),
            hint,
        });
        Ok(vec![y])
    }
    /// **Errors**
    /// - No forward pass was run, or the shapes differ from the forward pass.
    /// - `grad_outputs[0]` is not (batch, outputs).
    fn backward(
        &mut self,
        inputs: &[Array],
        grad_outputs: &[Array],
        config: &Config,
    ) -> Result<Vec<Array>> {
        let saved = self
            .saved
            .as_ref()
            .ok_or_else(|| state_error!("linear: backward called before forward"))?;
        check_inputs("linear", inputs, &[2, 3])?;
        let (x, w) = (&inputs[0], &inputs[1]);
        if x.shape() != saved.x_shape
            || w.shape() != saved.w_shape
            || (inputs.len() == 3) != saved.bias
        {
            return Err(state_error!(
                "linear: backward inputs do not match the forward pass"
            ));
        }
        let gy = grad_output("linear", grad_outputs, x, &[x.shape()[0], w.shape()[0]])?;
        let bias = saved.bias;
        let grads: Vec<Array> = match saved.backend {
            Backend::Gpu => {
                let gpu = config
                    .gpu()
                    .ok_or_else(|| state_error!("linear: no gpu kernels"))?;
                let grads = gpu.linear_backward(x, w, gy, bias)?;
                [Some(grads.gx), Some(grads.gw), grads.gb]
                    .into_iter()
                    .flatten()
                    .collect()
            }
            Backend::Accelerated => {
                let hint = saved
                    .hint
                    .clone()
                    .ok_or_else(|| state_error!("linear: missing forward plan"))?;
                let backward_inputs = [x.clone(), w.clone(), gy.clone()];
                let mode = config.train.into();
                let signature_data = signature(
                    PrimitiveKind::LinearBackwardData,
                    &backward_inputs,
                    bias,
                    mode,
                    Some(hint.id()),
                );
                let gx = self
                    .backward_data_cc
                    .match_or_build(&signature_data, &backward_inputs, |s, i| {
                        LinearBackwardData::build(s, i, &hint)
                    })?
                    .execute()?;
                let signature_weights = Signature {
                    kind: PrimitiveKind::LinearBackwardWeights,
                    ..signature_data
                };
                let (gw, gb) = self
                    .backward_weights_cc
                    .match_or_build(&signature_weights, &backward_inputs, |s, i| {
                        LinearBackwardWeights::build(s, i, &hint)
                    })?
                    .execute()?;
                [Some(gx), Some(gw), gb].into_iter().flatten().collect()
            }
            Backend::Dense => backward_dense(x, w, gy, bias)?,
        };
        if config.cosim && saved.backend != Backend::Dense {
            cosim("linear backward", saved.backend, &grads, || {
                backward_dense(x, w, gy, bias)
            })?;
        }
        Ok(grads)
    }
}

/// Computes y = x W^T + b with a new [`Linear`].
///
/// **Errors**
///
/// See [`Linear`].
pub fn linear(x: &Array, w: &Array, b: Option<&Array>, config: &Config) -> Result<Array> {
    let inputs: Vec<Array> = [Some(x), Some(w), b].into_iter().flatten().cloned().collect();
    let mut outputs = Linear::new().forward(&inputs, config)?;
    outputs
        .pop()
        .ok_or_else(|| state_error!("linear: missing output"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EligibilityFlags, UseAccelerated};
    use approx::assert_relative_eq;
    use ndarray::{array, Array as NdArray};

    fn accelerated() -> Config {
        Config::default()
            .with_flags(EligibilityFlags {
                accelerated: true,
                gpu: false,
            })
            .with_use_accelerated(UseAccelerated::Always)
    }

    #[test]
    fn dense_f64_exact() {
        let x = array![[1f64, 2.], [3., 4.]];
        let w = array![[1f64, 1.], [0., 2.], [1., 0.]];
        let b = array![0.5f64, 0., -1.];
        let y = linear(
            &Array::from_array(x.clone()),
            &Array::from_array(w.clone()),
            Some(&Array::from_array(b.clone())),
            &Config::default().with_use_accelerated(UseAccelerated::Never),
        )
        .unwrap();
        let expected = x.dot(&w.t()) + &b;
        assert_eq!(y.to_array::<f64>().unwrap(), expected.into_dyn());
    }

    #[test]
    fn flattens_higher_rank() {
        let x = Array::from_array(NdArray::from_shape_fn([2, 2, 1, 3], |(n, c, _, w)| {
            (n + c * w) as f32
        }));
        let w = Array::from_array(NdArray::from_elem([4, 6], 0.5f32));
        let y = linear(&x, &w, None, &accelerated()).unwrap();
        assert_eq!(y.shape(), &[2, 4]);
    }

    #[test]
    fn accelerated_matches_dense() {
        let x = NdArray::from_shape_fn([3, 5], |(i, j)| (i * 5 + j) as f32 / 10.);
        let w = NdArray::from_shape_fn([4, 5], |(i, j)| (i as f32 - j as f32) / 7.);
        let b = array![1f32, -1., 0.5, 0.];
        let gy = NdArray::from_shape_fn([3, 4], |(i, j)| (i + j) as f32);
        let inputs = [
            Array::from_array(x),
            Array::from_array(w),
            Array::from_array(b),
        ];
        let dense = Config::default().with_use_accelerated(UseAccelerated::Never);
        let mut a = Linear::new();
        let mut d = Linear::new();
        let ya = a.forward(&inputs, &accelerated()).unwrap();
        let yd = d.forward(&inputs, &dense).unwrap();
        assert_eq!(a.backend(), Some(Backend::Accelerated));
        assert_eq!(d.backend(), Some(Backend::Dense));
        assert_relative_eq!(
            ya[0].to_array::<f32>().unwrap(),
            yd[0].to_array::<f32>().unwrap(),
            epsilon = 1e-4
        );
        let gy = [Array::from_array(gy)];
        let ga = a.backward(&inputs, &gy, &accelerated()).unwrap();
        let gd = d.backward(&inputs, &gy, &dense).unwrap();
        assert_eq!(ga.len(), 3);
        for (ga, gd) in ga.iter().zip(gd.iter()) {
            assert_eq!(ga.shape(), gd.shape());
            assert_relative_eq!(
                ga.to_array::<f32>().unwrap(),
                gd.to_array::<f32>().unwrap(),
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn cache_reuse() {
        let mut linear = Linear::new();
        let config = accelerated();
        let w = Array::from_array(NdArray::<f32, _>::ones([2, 3]));
        for batch in [4, 4, 4, 5] {
            let x = Array::from_array(NdArray::<f32, _>::ones([batch, 3]));
            linear.forward(&[x, w.clone()], &config).unwrap();
        }
        assert_eq!(
            linear.cache_stats()[0],
            CacheStats {
                builds: 2,
                hits: 2
            }
        );
    }

    #[test]
    fn errors() {
        let mut linear = Linear::new();
        let config = Config::default();
        let x = Array::from_array(NdArray::<f32, _>::ones([2, 3]));
        let w = Array::from_array(NdArray::<f32, _>::ones([2, 4]));
        assert!(linear
            .forward(&[x.clone(), w], &config)
            .unwrap_err()
            .is_shape());
        let gy = Array::from_array(NdArray::<f32, _>::ones([2, 2]));
        let w = Array::from_array(NdArray::<f32, _>::ones([2, 3]));
        assert!(linear
            .backward(&[x, w], &[gy], &config)
            .unwrap_err()
            .is_state());
    }
}
