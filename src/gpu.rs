use crate::{
    array::{Array, DType},
    engine::pooling::PoolingAlg,
    function::{batch_norm::RunningStatistics, pooling::Pool2Options},
};
use anyhow::Result;

/// Gradients of a linear function.
#[derive(Debug)]
pub struct LinearGrads {
    /// Input gradient.
    pub gx: Array,
    /// Weight gradient.
    pub gw: Array,
    /// Bias gradient.
    pub gb: Option<Array>,
}

/// Output of a pooling.
#[derive(Debug)]
pub struct PoolingOutput {
    /// The pooled array.
    pub y: Array,
    /// Argmax indices for max pooling, in any layout the provider chooses.
    pub workspace: Option<Array>,
}

/// Output of a training batch normalization.
#[derive(Debug)]
pub struct BatchNormOutput {
    /// The normalized array.
    pub y: Array,
    /// Batch mean.
    pub mean: Array,
    /// Biased batch variance.
    pub var: Array,
}

/// Gradients of a batch normalization.
#[derive(Debug)]
pub struct BatchNormGrads {
    /// Input gradient.
    pub gx: Array,
    /// Scale gradient.
    pub ggamma: Array,
    /// Shift gradient.
    pub gbeta: Array,
}

/// A GPU kernel provider.
///
/// Calls whose inputs are all on a [`Device::Gpu`](crate::array::Device::Gpu) are routed here when
/// a provider is attached with [`Config::with_gpu()`](crate::config::Config::with_gpu). Outputs
/// should be tagged with the device of the inputs.
pub trait GpuKernels: Send + Sync {
    /// The name of the provider.
    fn name(&self) -> &str {
        "gpu"
    }
    /// Whether the provider supports `dtype`.
    fn supports(&self, dtype: DType) -> bool {
        dtype.is_float()
    }
    /// Computes `y = x W^T + b`.
    fn linear_forward(&self, x: &Array, w: &Array, b: Option<&Array>) -> Result<Array>;
    /// Computes the gradients of a linear function.
    fn linear_backward(&self, x: &Array, w: &Array, gy: &Array, bias: bool)
        -> Result<LinearGrads>;
    /// Pools `x`.
    fn pooling_forward(
        &self,
        x: &Array,
        alg: PoolingAlg,
        options: &Pool2Options,
    ) -> Result<PoolingOutput>;
    /// Computes the input gradient of a pooling.
    fn pooling_backward(
        &self,
        x: &Array,
        gy: &Array,
        workspace: Option<&Array>,
        alg: PoolingAlg,
        options: &Pool2Options,
    ) -> Result<Array>;
    /// Normalizes `x` with batch statistics.
    ///
    /// The provider updates `running` itself, with the unbiased variance.
    #[allow(clippy::too_many_arguments)]
    fn batch_norm_forward_training(
        &self,
        x: &Array,
        gamma: &Array,
        beta: &Array,
        eps: f64,
        decay: f64,
        running: &mut RunningStatistics,
    ) -> Result<BatchNormOutput>;
    /// Normalizes `x` with the given statistics.
    fn batch_norm_forward_inference(
        &self,
        x: &Array,
        gamma: &Array,
        beta: &Array,
        mean: &Array,
        var: &Array,
        eps: f64,
    ) -> Result<Array>;
    /// Computes the gradients of a training batch normalization.
    #[allow(clippy::too_many_arguments)]
    fn batch_norm_backward(
        &self,
        x: &Array,
        gamma: &Array,
        gy: &Array,
        mean: &Array,
        var: &Array,
        eps: f64,
    ) -> Result<BatchNormGrads>;
}
