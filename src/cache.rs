use crate::{
    array::{Array, DType},
    engine::pooling::PoolingAlg,
    error::Result,
};
use std::{
    fmt::{self, Debug},
    sync::atomic::{AtomicU64, Ordering},
};

/// Identifies a forward plan, used as a hint by the matching backward plan.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HintId(u64);

impl HintId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Kernel library primitives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
#[allow(missing_docs)]
pub enum PrimitiveKind {
    LinearForward,
    LinearBackwardData,
    LinearBackwardWeights,
    PoolingForward,
    PoolingBackward,
    BatchNormForward,
    BatchNormBackward,
}

/// Train or inference.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[allow(missing_docs)]
pub enum Mode {
    Train,
    Inference,
}

impl From<bool> for Mode {
    fn from(train: bool) -> Self {
        if train {
            Self::Train
        } else {
            Self::Inference
        }
    }
}

/// Operator parameters of a [`Signature`].
///
/// Floats are stored as their bit patterns.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[allow(missing_docs)]
pub enum Params {
    Linear {
        bias: bool,
    },
    Pooling {
        alg: PoolingAlg,
        kernel: [usize; 2],
        stride: [usize; 2],
        pad: [usize; 2],
        cover_all: bool,
    },
    BatchNorm {
        eps_bits: u64,
        decay_bits: u64,
        fixed: bool,
    },
}

impl Params {
    /// Batch normalization parameters.
    pub fn batch_norm(eps: f64, decay: f64, fixed: bool) -> Self {
        Self::BatchNorm {
            eps_bits: eps.to_bits(),
            decay_bits: decay.to_bits(),
            fixed,
        }
    }
}

/// The key of a compute complex.
///
/// Two calls may share a plan only if their signatures are equal.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Signature {
    /// The primitive.
    pub kind: PrimitiveKind,
    /// The element type.
    pub dtype: DType,
    /// Shapes of the inputs, in order.
    pub shapes: Vec<Vec<usize>>,
    /// Operator parameters.
    pub params: Params,
    /// Train or inference.
    pub mode: Mode,
    /// The forward plan a backward plan was derived from.
    pub hint: Option<HintId>,
}

/// A reusable execution plan.
pub trait ComputeComplex {
    /// The signature the plan was built for.
    fn signature(&self) -> &Signature;
    /// Rebinds the plan to new `inputs` with the same signature.
    fn rebind(&mut self, inputs: &[Array]);
}

/// A single slot cache of a [`ComputeComplex`].
///
/// A miss replaces the previous plan, so alternating between shapes rebuilds on every call.
pub struct CacheSlot<C> {
    entry: Option<C>,
    builds: usize,
    hits: usize,
}

impl<C> Default for CacheSlot<C> {
    fn default() -> Self {
        Self {
            entry: None,
            builds: 0,
            hits: 0,
        }
    }
}

impl<C: ComputeComplex> CacheSlot<C> {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }
    /// Returns the cached plan rebound to `inputs` if its signature equals `signature`, otherwise
    /// builds a new plan with `build` and caches it.
    ///
    /// **Errors**
    ///
    /// Errors from `build` are returned and the slot is left empty.
    pub fn match_or_build<F>(
        &mut self,
        signature: &Signature,
        inputs: &[Array],
        build: F,
    ) -> Result<&mut C>
    where
        F: FnOnce(&Signature, &[Array]) -> Result<C>,
    {
        match self.entry.take() {
            Some(mut entry) if entry.signature() == signature => {
                entry.rebind(inputs);
                self.hits += 1;
                Ok(self.entry.insert(entry))
            }
            previous => {
                if previous.is_some() {
                    log::debug!("{}: signature changed, rebuilding", signature.kind);
                } else {
                    log::debug!("{}: building", signature.kind);
                }
                let entry = build(signature, inputs)?;
                self.builds += 1;
                Ok(self.entry.insert(entry))
            }
        }
    }
    /// The cached plan.
    pub fn get(&self) -> Option<&C> {
        self.entry.as_ref()
    }
    /// Drops the cached plan. Counters are kept.
    pub fn clear(&mut self) {
        self.entry = None;
    }
    /// The number of plans built.
    pub fn builds(&self) -> usize {
        self.builds
    }
    /// The number of calls that reused the cached plan.
    pub fn hits(&self) -> usize {
        self.hits
    }
}

impl<C> Debug for CacheSlot<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CacheSlot")
            .field("cached", &self.entry.is_some())
            .field("builds", &self.builds)
            .field("hits", &self.hits)
            .finish()
    }
}

/// Build and hit counters of a cache slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    /// The number of plans built.
    pub builds: usize,
    /// The number of calls that reused the cached plan.
    pub hits: usize,
}

impl<C: ComputeComplex> From<&CacheSlot<C>> for CacheStats {
    fn from(slot: &CacheSlot<C>) -> Self {
        Self {
            builds: slot.builds(),
            hits: slot.hits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::shape_error;

    struct Plan {
        signature: Signature,
        inputs: Vec<Array>,
    }

    impl ComputeComplex for Plan {
        fn signature(&self) -> &Signature {
            &self.signature
        }
        fn rebind(&mut self, inputs: &[Array]) {
            self.inputs = inputs.to_vec();
        }
    }

    fn signature(dims: &[usize]) -> Signature {
        Signature {
            kind: PrimitiveKind::LinearForward,
            dtype: DType::F32,
            shapes: vec![dims.to_vec()],
            params: Params::Linear { bias: false },
            mode: Mode::Train,
            hint: None,
        }
    }

    fn build(signature: &Signature, inputs: &[Array]) -> Result<Plan> {
        Ok(Plan {
            signature: signature.clone(),
            inputs: inputs.to_vec(),
        })
    }

    #[test]
    fn hit_rebinds() {
        let mut slot = CacheSlot::new();
        let a = Array::from_shape_vec(&[2], vec![1f32, 2.]).unwrap();
        let b = Array::from_shape_vec(&[2], vec![3f32, 4.]).unwrap();
        slot.match_or_build(&signature(&[2]), &[a], build).unwrap();
        let plan = slot
            .match_or_build(&signature(&[2]), &[b.clone()], build)
            .unwrap();
        assert!(plan.inputs[0].same_buffer(&b));
        assert_eq!(slot.builds(), 1);
        assert_eq!(slot.hits(), 1);
    }

    #[test]
    fn last_shape_wins() {
        let mut slot = CacheSlot::new();
        let a = Array::from_shape_vec(&[2], vec![1f32, 2.]).unwrap();
        let b = Array::from_shape_vec(&[3], vec![1f32, 2., 3.]).unwrap();
        for x in [&a, &b, &a] {
            slot.match_or_build(&signature(x.shape()), &[x.clone()], build)
                .unwrap();
        }
        assert_eq!(CacheStats::from(&slot), CacheStats { builds: 3, hits: 0 });
    }

    #[test]
    fn failed_build_empties_slot() {
        let mut slot = CacheSlot::<Plan>::new();
        slot.match_or_build(&signature(&[2]), &[], build).unwrap();
        let result = slot.match_or_build(&signature(&[3]), &[], |_, _| Err(shape_error!("x")));
        assert!(result.is_err());
        assert!(slot.get().is_none());
    }
}
