use crate::error::{Error, Result};
use once_cell::sync::OnceCell;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt::{self, Debug};
use wide::f32x8;

/// Batch normalization primitives.
pub mod batch_norm;
/// Inner product primitives.
pub mod inner_product;
/// Pooling primitives.
pub mod pooling;

/// Execution context of the kernel library.
///
/// Primitives run on a dedicated thread pool. There is one engine per process, acquired lazily
/// with [`Engine::get()`].
pub struct Engine {
    pool: ThreadPool,
}

impl Engine {
    /// The process wide engine.
    ///
    /// **Errors**
    ///
    /// The thread pool could not be created.
    pub fn get() -> Result<&'static Self> {
        static ENGINE: OnceCell<Engine> = OnceCell::new();
        ENGINE.get_or_try_init(|| {
            let pool = ThreadPoolBuilder::new()
                .thread_name(|i| format!("dnnfuse-engine-{i}"))
                .build()
                .map_err(|e| Error::Backend(e.into()))?;
            log::debug!("engine: {} threads", pool.current_num_threads());
            Ok(Self { pool })
        })
    }
    /// The number of threads.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
    fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        self.pool.install(f)
    }
}

impl Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Engine")
            .field("threads", &self.threads())
            .finish()
    }
}

fn load(x: &[f32]) -> f32x8 {
    let mut a = [0f32; 8];
    a.copy_from_slice(&x[..8]);
    f32x8::from(a)
}

fn store(y: &mut [f32], v: f32x8) {
    y[..8].copy_from_slice(&v.to_array());
}

/// Pads a per channel slice to a multiple of the block size with `fill`.
fn load_blocks(x: &[f32], fill: f32) -> Vec<f32x8> {
    x.chunks(8)
        .map(|chunk| {
            let mut a = [fill; 8];
            a[..chunk.len()].copy_from_slice(chunk);
            f32x8::from(a)
        })
        .collect()
}

fn store_blocks(y: &mut [f32], blocks: &[f32x8]) {
    for (y, v) in y.chunks_mut(8).zip(blocks) {
        let len = y.len();
        y.copy_from_slice(&v.to_array()[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_pad() {
        let blocks = load_blocks(&[1., 2., 3.], 7.);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].to_array(), [1., 2., 3., 7., 7., 7., 7., 7.]);
        let mut y = [0f32; 3];
        store_blocks(&mut y, &blocks);
        assert_eq!(y, [1., 2., 3.]);
    }

    #[test]
    fn engine_singleton() {
        let a = Engine::get().unwrap();
        let b = Engine::get().unwrap();
        assert!(std::ptr::eq(a, b));
        assert!(a.threads() > 0);
    }
}
