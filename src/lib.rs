/*!
# **dnnfuse**
Compute-complex caching and execution-graph fusion for neural network primitives.

**dnnfuse** is the native acceleration layer underneath an autodiff framework. It runs the forward
and backward passes of linear, pooling and batch normalization layers on one of three backends:
- A GPU kernel provider (see [`gpu::GpuKernels`]).
- The optimized kernel library in [`engine`], which works on its own physical layouts.
- A dense fallback written with [`ndarray`], which is always eligible.

Calls on the kernel library are described by compute complexes: execution plans keyed on a
[`Signature`](cache::Signature) of shapes and parameters. Each layer caches one plan per
primitive, so repeated calls with stable shapes only rebind their inputs. A plan converts inputs
into the layout the library prefers by queueing reorders ahead of the primitive in an
[`OpQueue`](queue::OpQueue), which is executed once per call.

# Example
```no_run
# use dnnfuse::{array::Array, config::Config, function::{Function, linear::Linear}};
# fn main() -> dnnfuse::Result<()> {
let config = Config::default();
let x = Array::from_array(ndarray::Array::<f32, _>::ones([3, 4]));
let w = Array::from_array(ndarray::Array::<f32, _>::ones([5, 4]));
let mut linear = Linear::default();
let y = linear.forward(&[x, w], &config)?;
assert_eq!(y[0].shape(), &[3, 5]);
# Ok(())
# }
```
*/

#![cfg_attr(doc_cfg, feature(doc_auto_cfg))]
#![warn(missing_docs)]

/// Errors.
pub mod error;
pub use error::{Error, Result};

/// Arrays.
pub mod array;
/// Physical layouts and reorders.
pub mod layout;
/// Op queues.
pub mod queue;
/// Compute-complex cache.
pub mod cache;
/// Configuration.
pub mod config;
/// Backend selection.
pub mod dispatch;
/// GPU kernel providers.
pub mod gpu;
/// The optimized kernel library.
pub mod engine;
/// Functions with forward and backward passes.
pub mod function;
