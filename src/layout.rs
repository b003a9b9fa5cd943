use crate::{
    array::{Array, DType, Element},
    error::{layout_error, state_error, Result},
    queue::{Op, OpQueue},
};
use half::f16;
use ndarray::Dimension;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Channel block size of [`Layout::ChannelBlocked8`].
pub const BLOCK: usize = 8;

/// Physical layouts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Layout {
    /// Let the kernel library pick. Only valid as a reorder target.
    Any,
    /// Row major.
    Plain,
    /// NHWC.
    ChannelsLast,
    /// NCHW with channels grouped by 8 and the block innermost, padded with zeros (nChw8c).
    ChannelBlocked8,
}

impl Layout {
    /// The rank the layout requires, if any.
    pub fn rank(self) -> Option<usize> {
        match self {
            Self::Any | Self::Plain => None,
            Self::ChannelsLast | Self::ChannelBlocked8 => Some(4),
        }
    }
}

/// Describes the logical dimensions, element type and physical layout of an [`Array`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MemoryDesc {
    dims: Vec<usize>,
    dtype: DType,
    layout: Layout,
}

impl MemoryDesc {
    /// Creates a new descriptor.
    ///
    /// **Errors**
    ///
    /// The layout requires a rank other than `dims.len()`.
    pub fn new(dims: impl Into<Vec<usize>>, dtype: DType, layout: Layout) -> Result<Self> {
        let dims = dims.into();
        if let Some(rank) = layout.rank() {
            if dims.len() != rank {
                return Err(layout_error!(
                    "{layout:?} requires {rank} dimensions, found {dims:?}"
                ));
            }
        }
        Ok(Self {
            dims,
            dtype,
            layout,
        })
    }
    /// A [`Layout::Plain`] descriptor.
    pub fn plain(dims: &[usize], dtype: DType) -> Self {
        Self {
            dims: dims.to_vec(),
            dtype,
            layout: Layout::Plain,
        }
    }
    /// The logical dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }
    /// The element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }
    /// The layout.
    pub fn layout(&self) -> Layout {
        self.layout
    }
    /// The number of logical elements.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }
    /// Whether there are no logical elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The number of stored elements, including block padding.
    pub fn physical_len(&self) -> usize {
        match (self.layout, self.dims.as_slice()) {
            (Layout::ChannelBlocked8, [n, c, h, w]) => n * blocks(*c) * BLOCK * h * w,
            _ => self.len(),
        }
    }
    /// The same dimensions and type with `layout`.
    ///
    /// **Errors**
    ///
    /// See [`MemoryDesc::new()`].
    pub fn with_layout(&self, layout: Layout) -> Result<Self> {
        Self::new(self.dims.clone(), self.dtype, layout)
    }
    /// The physical offset of the logical `index`.
    pub(crate) fn offset(&self, index: &[usize]) -> usize {
        match (self.layout, self.dims.as_slice(), index) {
            (Layout::ChannelsLast, [_, c, h, w], [ni, ci, hi, wi]) => {
                ((ni * h + hi) * w + wi) * c + ci
            }
            (Layout::ChannelBlocked8, [_, c, h, w], [ni, ci, hi, wi]) => {
                (((ni * blocks(*c) + ci / BLOCK) * h + hi) * w + wi) * BLOCK + ci % BLOCK
            }
            _ => index
                .iter()
                .zip(self.dims.iter())
                .fold(0, |offset, (i, d)| offset * d + i),
        }
    }
}

/// The number of channel blocks for `channels`.
pub(crate) fn blocks(channels: usize) -> usize {
    (channels + BLOCK - 1) / BLOCK
}

/// Converts `array` into the `target` layout.
///
/// Returns `array` unchanged when the target is [`Layout::Any`] or the layouts already agree.
/// Otherwise allocates the output and pushes a reorder onto `queue`, the output is only valid after
/// the queue is executed.
///
/// **Errors**
/// - The dimensions or types of `array` and `target` differ.
/// - Allocation failed.
pub fn reorder_if_must(array: &Array, target: &MemoryDesc, queue: &mut OpQueue) -> Result<Array> {
    if array.shape() != target.dims() || array.dtype() != target.dtype() {
        return Err(layout_error!(
            "cannot reorder {:?} {:?} into {:?} {:?}",
            array.shape(),
            array.dtype(),
            target.dims(),
            target.dtype(),
        ));
    }
    if target.layout() == Layout::Any || target.layout() == array.layout() {
        return Ok(array.clone());
    }
    let output = Array::zeros(target.clone(), array.device())?;
    queue.push(Op::reorder(array.clone(), output.clone()));
    Ok(output)
}

pub(crate) fn reorder(src: &Array, dst: &Array) -> Result<()> {
    if src.same_buffer(dst) {
        return Err(state_error!("reorder source and destination alias"));
    }
    match src.dtype() {
        DType::F16 => reorder_impl::<f16>(src, dst),
        DType::F32 => reorder_impl::<f32>(src, dst),
        DType::F64 => reorder_impl::<f64>(src, dst),
        DType::I32 => reorder_impl::<i32>(src, dst),
    }
}

fn reorder_impl<T: Element>(src: &Array, dst: &Array) -> Result<()> {
    let x = src.read::<T>()?;
    let mut y = dst.write::<T>()?;
    let (src_desc, dst_desc) = (src.desc(), dst.desc());
    for index in ndarray::indices(src_desc.dims()) {
        let index = index.slice();
        y[dst_desc.offset(index)] = x[src_desc.offset(index)];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_rank() {
        assert!(MemoryDesc::new([2, 3], DType::F32, Layout::ChannelBlocked8)
            .unwrap_err()
            .is_layout());
        assert!(MemoryDesc::new([2, 3], DType::F32, Layout::Any).is_ok());
    }

    #[test]
    fn blocked_pads_channels() {
        let desc = MemoryDesc::new([2, 3, 4, 5], DType::F32, Layout::ChannelBlocked8).unwrap();
        assert_eq!(desc.len(), 2 * 3 * 4 * 5);
        assert_eq!(desc.physical_len(), 2 * 8 * 4 * 5);
        assert_eq!(desc.offset(&[0, 0, 0, 1]), 8);
        assert_eq!(desc.offset(&[0, 2, 0, 0]), 2);
        assert_eq!(desc.offset(&[1, 0, 0, 0]), 8 * 4 * 5);
    }

    #[test]
    fn reorder_any_is_noop() {
        let x = Array::from_shape_vec(&[1, 2, 1, 1], vec![1f32, 2.]).unwrap();
        let mut queue = OpQueue::new();
        let target = MemoryDesc::new([1, 2, 1, 1], DType::F32, Layout::Any).unwrap();
        let y = reorder_if_must(&x, &target, &mut queue).unwrap();
        assert!(queue.is_empty());
        assert!(x.same_buffer(&y));
    }

    #[test]
    fn reorder_roundtrip() {
        let data: Vec<f32> = (0..2 * 10 * 3 * 2).map(|x| x as f32).collect();
        let x = Array::from_shape_vec(&[2, 10, 3, 2], data.clone()).unwrap();
        let mut queue = OpQueue::new();
        for layout in [Layout::ChannelBlocked8, Layout::ChannelsLast] {
            let target = x.desc().with_layout(layout).unwrap();
            let y = reorder_if_must(&x, &target, &mut queue).unwrap();
            assert_eq!(queue.len(), 1);
            queue.execute().unwrap();
            assert_eq!(y.layout(), layout);
            let z = y.to_array::<f32>().unwrap();
            assert_eq!(z.as_slice().unwrap(), data.as_slice());
        }
    }

    #[test]
    fn reorder_dims_mismatch() {
        let x = Array::from_shape_vec(&[1, 2, 1, 1], vec![1f32, 2.]).unwrap();
        let target = MemoryDesc::new([1, 3, 1, 1], DType::F32, Layout::ChannelBlocked8).unwrap();
        let mut queue = OpQueue::new();
        assert!(reorder_if_must(&x, &target, &mut queue)
            .unwrap_err()
            .is_layout());
    }
}
