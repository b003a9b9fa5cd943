use crate::{
    array::{Array, DType, Device, Float},
    config::Config,
    dispatch::Backend,
    error::{shape_error, state_error, Error, Result},
};
use dry::{macro_for, macro_wrap};
use half::f16;
use ndarray::{ArrayD, Dimension};
use paste::paste;

/// Batch normalization.
pub mod batch_norm;
/// Linear.
pub mod linear;
/// Pooling.
pub mod pooling;

/// A differentiable operator.
///
/// A function owns its cached compute complexes and the state saved by the last forward pass.
/// [`backward()`](Function::backward) must follow [`forward()`](Function::forward) with the same
/// inputs, and runs on the backend the forward pass selected.
pub trait Function {
    /// Computes the outputs.
    ///
    /// **Errors**
    ///
    /// See the implementation.
    fn forward(&mut self, inputs: &[Array], config: &Config) -> Result<Vec<Array>>;
    /// Computes the gradients of the inputs, one per input, given the gradients of the outputs.
    ///
    /// **Errors**
    /// - No forward pass was run.
    /// - The inputs differ from those of the forward pass.
    fn backward(
        &mut self,
        inputs: &[Array],
        grad_outputs: &[Array],
        config: &Config,
    ) -> Result<Vec<Array>>;
}

/// Checks that there are `counts` inputs sharing one float type.
fn check_inputs(op: &str, inputs: &[Array], counts: &[usize]) -> Result<DType> {
    if !counts.contains(&inputs.len()) {
        return Err(shape_error!(
            "{op}: expected {counts:?} inputs, found {}",
            inputs.len()
        ));
    }
    let dtype = inputs[0].dtype();
    if !dtype.is_float() {
        return Err(shape_error!("{op}: expected a float input, found {dtype:?}"));
    }
    if let Some(x) = inputs.iter().find(|x| x.dtype() != dtype) {
        return Err(shape_error!(
            "{op}: expected {dtype:?} inputs, found {:?}",
            x.dtype()
        ));
    }
    Ok(dtype)
}

fn grad_output<'a>(
    op: &str,
    grad_outputs: &'a [Array],
    x: &Array,
    shape: &[usize],
) -> Result<&'a Array> {
    let gy = grad_outputs
        .first()
        .ok_or_else(|| shape_error!("{op}: missing output gradient"))?;
    if gy.shape() != shape || gy.dtype() != x.dtype() {
        return Err(shape_error!(
            "{op}: expected output gradient {shape:?} {:?}, found {:?} {:?}",
            x.dtype(),
            gy.shape(),
            gy.dtype(),
        ));
    }
    Ok(gy)
}

fn to_f64(x: &Array) -> Result<ArrayD<f64>> {
    macro_wrap!(paste! { match x.dtype() {
        macro_for!($T in [f16, f32, f64] {
            DType::[<$T:upper>] => Ok(x.to_array::<$T>()?.mapv(Float::to_f64_lossy)),
        })
        DType::I32 => Ok(x.to_array::<i32>()?.mapv(f64::from)),
    }})
}

fn from_f64<D: Dimension>(
    x: ndarray::Array<f64, D>,
    dtype: DType,
    device: Device,
) -> Result<Array> {
    macro_wrap!(paste! { match dtype {
        macro_for!($T in [f16, f32, f64] {
            DType::[<$T:upper>] => {
                Ok(Array::from_array(x.mapv(<$T as Float>::from_f64_lossy)).into_device(device))
            }
        })
        DType::I32 => Err(shape_error!("expected a float type, found {dtype:?}")),
    }})
}

/// The largest difference tolerated by co-simulation.
pub fn cosim_tolerance(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => 1e-2,
        DType::F32 => 1e-3,
        DType::F64 => 1e-9,
        DType::I32 => 0.,
    }
}

/// Recomputes outputs of `backend` on the dense fallback and compares them.
///
/// **Errors**
///
/// [`Error::Cosim`] if an element differs by more than [`cosim_tolerance()`].
fn cosim(
    op: &'static str,
    backend: Backend,
    outputs: &[Array],
    reference: impl FnOnce() -> Result<Vec<Array>>,
) -> Result<()> {
    let reference = reference()?;
    if outputs.len() != reference.len() {
        return Err(state_error!(
            "{op}: {backend} returned {} outputs, dense returned {}",
            outputs.len(),
            reference.len()
        ));
    }
    for (output, reference) in outputs.iter().zip(reference.iter()) {
        let (a, b) = (to_f64(output)?, to_f64(reference)?);
        if a.shape() != b.shape() {
            return Err(shape_error!(
                "{op}: {backend} returned {:?}, dense returned {:?}",
                a.shape(),
                b.shape()
            ));
        }
        let mut max_abs_diff = 0f64;
        for (a, b) in a.iter().zip(b.iter()) {
            let diff = if a == b || (a.is_nan() && b.is_nan()) {
                0.
            } else {
                (a - b).abs()
            };
            if diff.is_nan() || diff > max_abs_diff {
                max_abs_diff = diff;
            }
        }
        let tolerance = cosim_tolerance(output.dtype());
        if max_abs_diff.is_nan() || max_abs_diff > tolerance {
            log::warn!("{op}: {backend} differs from dense by {max_abs_diff}");
            return Err(Error::Cosim {
                op,
                max_abs_diff,
                tolerance,
            });
        }
        log::trace!("{op}: {backend} within {max_abs_diff} of dense");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn cosim_detects_difference() {
        let a = Array::from_array(array![1f32, 2.]);
        let b = Array::from_array(array![1f32, 2.1]);
        let err = cosim("test", Backend::Accelerated, &[a.clone()], || Ok(vec![b])).unwrap_err();
        assert!(matches!(err, Error::Cosim { op: "test", .. }));
        let c = Array::from_array(array![1f32, 2.0001]);
        cosim("test", Backend::Accelerated, &[a], || Ok(vec![c])).unwrap();
    }

    #[test]
    fn cosim_equal_infinities() {
        let a = Array::from_array(array![f32::NEG_INFINITY, f32::INFINITY, 1.]);
        cosim("test", Backend::Accelerated, &[a.clone()], || Ok(vec![a.clone()])).unwrap();
        let b = Array::from_array(array![f32::INFINITY, f32::INFINITY, 1.]);
        let err = cosim("test", Backend::Accelerated, &[a], || Ok(vec![b])).unwrap_err();
        assert!(matches!(err, Error::Cosim { op: "test", .. }));
    }

    #[test]
    fn check_inputs_dtypes() {
        let x = Array::from_array(array![1f32]);
        let y = Array::from_array(array![1f64]);
        assert!(check_inputs("test", &[x.clone(), y], &[2]).unwrap_err().is_shape());
        assert!(check_inputs("test", &[x.clone()], &[2, 3]).unwrap_err().is_shape());
        assert_eq!(check_inputs("test", &[x], &[1]).unwrap(), DType::F32);
    }
}
