use crate::{
    array::{Array, DType},
    config::{Config, UseAccelerated},
    error::{config_error, Result},
};

/// Backends a call can run on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
pub enum Backend {
    /// The attached [`GpuKernels`](crate::gpu::GpuKernels) provider.
    #[display(fmt = "gpu")]
    Gpu,
    /// The optimized kernel library.
    #[display(fmt = "accelerated")]
    Accelerated,
    /// The dense fallback.
    #[display(fmt = "dense")]
    Dense,
}

/// Eligibility of a call for the accelerated backends.
///
/// The first input is the primary input, its rank and type decide eligibility. All inputs must be
/// on the same device.
#[derive(Debug)]
pub struct Guard<'a> {
    op: &'static str,
    inputs: &'a [Array],
    ranks: &'static [usize],
    rejected: Option<&'static str>,
}

impl<'a> Guard<'a> {
    /// A guard for `op` accepting a primary input with one of `ranks`.
    pub fn new(op: &'static str, inputs: &'a [Array], ranks: &'static [usize]) -> Self {
        Self {
            op,
            inputs,
            ranks,
            rejected: None,
        }
    }
    /// Rejects the accelerated backends with `reason` if `reject`.
    pub fn reject_if(mut self, reject: bool, reason: &'static str) -> Self {
        if reject && self.rejected.is_none() {
            self.rejected.replace(reason);
        }
        self
    }
    /// Why the accelerated backends can't run the call, if anything.
    fn ineligible(&self, dtype: DType, ndim: usize) -> Option<String> {
        if let Some(reason) = self.rejected {
            Some(reason.to_string())
        } else if !self.ranks.contains(&ndim) {
            Some(format!("rank {ndim} not in {:?}", self.ranks))
        } else if !dtype.is_float() {
            Some(format!("{dtype:?} input"))
        } else {
            None
        }
    }
}

/// Selects the backend of a call.
///
/// The GPU is chosen when the inputs are on a GPU and a provider is attached that supports the
/// call. Otherwise the kernel library is chosen for eligible f32 host inputs, and the dense
/// fallback for everything else. [`UseAccelerated::Never`] always selects the dense fallback, and
/// [`UseAccelerated::Always`] logs a warning when falling back.
///
/// **Errors**
///
/// The inputs are on different devices.
pub fn select(config: &Config, guard: &Guard) -> Result<Backend> {
    let Some(primary) = guard.inputs.first() else {
        return Ok(Backend::Dense);
    };
    let device = primary.device();
    if let Some(other) = guard.inputs.iter().find(|x| x.device() != device) {
        return Err(config_error!(
            "{}: inputs on {device:?} and {:?}",
            guard.op,
            other.device()
        ));
    }
    let dtype = primary.dtype();
    let reason = if config.use_accelerated == UseAccelerated::Never {
        Some("use_accelerated is never".to_string())
    } else if let Some(reason) = guard.ineligible(dtype, primary.ndim()) {
        Some(reason)
    } else if device.is_gpu() {
        match config.gpu() {
            Some(gpu) if config.flags.gpu && gpu.supports(dtype) => {
                log::trace!("{}: {}", guard.op, Backend::Gpu);
                return Ok(Backend::Gpu);
            }
            Some(gpu) if config.flags.gpu => {
                Some(format!("{} does not support {dtype:?}", gpu.name()))
            }
            _ => Some("no gpu kernels".to_string()),
        }
    } else if !config.flags.accelerated {
        Some("kernel library unavailable".to_string())
    } else if dtype != DType::F32 {
        Some(format!("kernel library requires F32, found {dtype:?}"))
    } else {
        log::trace!("{}: {}", guard.op, Backend::Accelerated);
        return Ok(Backend::Accelerated);
    };
    if let Some(reason) = reason {
        if config.use_accelerated == UseAccelerated::Always {
            log::warn!("{}: falling back to dense, {reason}", guard.op);
        } else {
            log::trace!("{}: dense, {reason}", guard.op);
        }
    }
    Ok(Backend::Dense)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{array::Device, config::EligibilityFlags};

    fn config() -> Config {
        Config::default().with_flags(EligibilityFlags {
            accelerated: true,
            gpu: false,
        })
    }

    fn array(dims: &[usize]) -> Array {
        let len = dims.iter().product();
        Array::from_shape_vec(dims, vec![0f32; len]).unwrap()
    }

    #[test]
    fn accelerated_if_eligible() {
        let inputs = [array(&[2, 3]), array(&[4, 3])];
        let guard = Guard::new("linear", &inputs, &[2, 4]);
        assert_eq!(select(&config(), &guard).unwrap(), Backend::Accelerated);
        let guard = Guard::new("linear", &inputs, &[2, 4]).reject_if(true, "test");
        assert_eq!(select(&config(), &guard).unwrap(), Backend::Dense);
        let guard = Guard::new("pooling", &inputs, &[4]);
        assert_eq!(select(&config(), &guard).unwrap(), Backend::Dense);
    }

    #[test]
    fn never_is_dense() {
        let inputs = [array(&[2, 3])];
        let guard = Guard::new("linear", &inputs, &[2]);
        let config = config().with_use_accelerated(UseAccelerated::Never);
        assert_eq!(select(&config, &guard).unwrap(), Backend::Dense);
    }

    #[test]
    fn f64_is_dense() {
        let inputs = [Array::from_shape_vec(&[1, 1], vec![0f64]).unwrap()];
        let guard = Guard::new("linear", &inputs, &[2]);
        assert_eq!(select(&config(), &guard).unwrap(), Backend::Dense);
    }

    #[test]
    fn mixed_devices() {
        let inputs = [array(&[2, 3]), array(&[4, 3]).into_device(Device::Gpu(0))];
        let guard = Guard::new("linear", &inputs, &[2]);
        assert!(select(&config(), &guard).unwrap_err().is_config());
    }

    #[test]
    fn gpu_without_kernels_is_dense() {
        let inputs = [array(&[2, 3]).into_device(Device::Gpu(0))];
        let guard = Guard::new("linear", &inputs, &[2]);
        assert_eq!(select(&config(), &guard).unwrap(), Backend::Dense);
    }
}
