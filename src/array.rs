use crate::{
    error::{layout_error, shape_error, Result},
    layout::{reorder_if_must, Layout, MemoryDesc},
    queue::OpQueue,
};
use half::f16;
use ndarray::{ArrayD, Dimension, IxDyn, LinalgScalar};
use num_traits::FromPrimitive;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/// Element types.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DType {
    /// float16
    F16,
    /// float32
    F32,
    /// float64
    F64,
    /// int32, only used for pooling workspaces.
    I32,
}

impl DType {
    /// Whether the type is a floating point type.
    pub fn is_float(self) -> bool {
        !matches!(self, Self::I32)
    }
    /// The size in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::F16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Where an array lives.
///
/// Storage is host visible for every device. A [`GpuKernels`](crate::gpu::GpuKernels) provider
/// is responsible for moving data for arrays tagged [`Device::Gpu`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Device {
    /// The host.
    #[default]
    Host,
    /// A GPU with the given ordinal.
    Gpu(usize),
}

impl Device {
    /// Whether the device is the host.
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }
    /// Whether the device is a GPU.
    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Gpu(_))
    }
}

#[doc(hidden)]
#[derive(Clone)]
pub enum Buffer {
    F16(Arc<RwLock<Vec<f16>>>),
    F32(Arc<RwLock<Vec<f32>>>),
    F64(Arc<RwLock<Vec<f64>>>),
    I32(Arc<RwLock<Vec<i32>>>),
}

impl Buffer {
    fn zeros(dtype: DType, len: usize) -> Result<Self> {
        fn zeros<T: Element>(len: usize) -> Result<Buffer> {
            let mut data = Vec::new();
            data.try_reserve_exact(len)?;
            data.resize(len, T::default());
            Ok(T::into_buffer(data))
        }
        match dtype {
            DType::F16 => zeros::<f16>(len),
            DType::F32 => zeros::<f32>(len),
            DType::F64 => zeros::<f64>(len),
            DType::I32 => zeros::<i32>(len),
        }
    }
    fn deep_clone(&self) -> Result<Self> {
        fn deep_clone<T: Element>(data: &RwLock<Vec<T>>) -> Result<Buffer> {
            let data = data.read();
            let mut output = Vec::new();
            output.try_reserve_exact(data.len())?;
            output.extend_from_slice(&data);
            Ok(T::into_buffer(output))
        }
        match self {
            Self::F16(data) => deep_clone(data),
            Self::F32(data) => deep_clone(data),
            Self::F64(data) => deep_clone(data),
            Self::I32(data) => deep_clone(data),
        }
    }
    fn strong_count(&self) -> usize {
        match self {
            Self::F16(data) => Arc::strong_count(data),
            Self::F32(data) => Arc::strong_count(data),
            Self::F64(data) => Arc::strong_count(data),
            Self::I32(data) => Arc::strong_count(data),
        }
    }
    fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::F16(a), Self::F16(b)) => Arc::ptr_eq(a, b),
            (Self::F32(a), Self::F32(b)) => Arc::ptr_eq(a, b),
            (Self::F64(a), Self::F64(b)) => Arc::ptr_eq(a, b),
            (Self::I32(a), Self::I32(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Types that can be stored in an [`Array`].
pub trait Element: Copy + Default + PartialEq + Debug + Send + Sync + 'static + sealed::Sealed {
    /// The [`DType`].
    const DTYPE: DType;
    #[doc(hidden)]
    fn into_buffer(data: Vec<Self>) -> Buffer;
    #[doc(hidden)]
    fn as_buffer(buffer: &Buffer) -> Option<&Arc<RwLock<Vec<Self>>>>;
}

macro_rules! impl_element {
    ($($t:ty => $v:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $t {}

            impl Element for $t {
                const DTYPE: DType = DType::$v;
                fn into_buffer(data: Vec<Self>) -> Buffer {
                    Buffer::$v(Arc::new(RwLock::new(data)))
                }
                fn as_buffer(buffer: &Buffer) -> Option<&Arc<RwLock<Vec<Self>>>> {
                    if let Buffer::$v(data) = buffer {
                        Some(data)
                    } else {
                        None
                    }
                }
            }
        )*
    };
}

impl_element!(f16 => F16, f32 => F32, f64 => F64, i32 => I32);

/// Floating point [`Element`]s, used by the dense fallback.
pub trait Float: Element + num_traits::Float + FromPrimitive + LinalgScalar {
    /// Converts to f64, NaN if not representable.
    fn to_f64_lossy(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }
    /// Converts from f64, NaN if not representable.
    fn from_f64_lossy(x: f64) -> Self {
        Self::from_f64(x).unwrap_or_else(Self::nan)
    }
}

impl Float for f16 {}
impl Float for f32 {}
impl Float for f64 {}

/// A dense array.
///
/// An [`Array`] pairs a shared buffer with a [`MemoryDesc`] describing its logical shape and
/// physical layout. Cloning is cheap, clones alias the same buffer.
#[derive(Clone)]
pub struct Array {
    desc: MemoryDesc,
    device: Device,
    buffer: Buffer,
}

impl Array {
    /// Creates a host array in plain layout from `array`.
    pub fn from_array<T: Element, D: Dimension>(array: ndarray::Array<T, D>) -> Self {
        let desc = MemoryDesc::plain(array.shape(), T::DTYPE);
        let data: Vec<T> = array.iter().copied().collect();
        Self {
            desc,
            device: Device::Host,
            buffer: T::into_buffer(data),
        }
    }
    /// Creates a host array in plain layout from `dims` and `data`.
    ///
    /// **Errors**
    ///
    /// The product of `dims` is not the length of `data`.
    pub fn from_shape_vec<T: Element>(dims: &[usize], data: Vec<T>) -> Result<Self> {
        let desc = MemoryDesc::plain(dims, T::DTYPE);
        if desc.physical_len() != data.len() {
            return Err(shape_error!(
                "shape {dims:?} does not match data of length {}",
                data.len()
            ));
        }
        Ok(Self {
            desc,
            device: Device::Host,
            buffer: T::into_buffer(data),
        })
    }
    /// Allocates a zeroed array.
    ///
    /// **Errors**
    /// - The layout of `desc` is [`Layout::Any`].
    /// - Allocation failed.
    pub fn zeros(desc: MemoryDesc, device: Device) -> Result<Self> {
        if desc.layout() == Layout::Any {
            return Err(layout_error!(
                "cannot materialize an array with layout {:?}",
                Layout::Any
            ));
        }
        let buffer = Buffer::zeros(desc.dtype(), desc.physical_len())?;
        Ok(Self {
            desc,
            device,
            buffer,
        })
    }
    /// The descriptor.
    pub fn desc(&self) -> &MemoryDesc {
        &self.desc
    }
    /// The logical shape.
    pub fn shape(&self) -> &[usize] {
        self.desc.dims()
    }
    /// The number of dimensions.
    pub fn ndim(&self) -> usize {
        self.desc.dims().len()
    }
    /// The number of logical elements.
    pub fn len(&self) -> usize {
        self.desc.len()
    }
    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The element type.
    pub fn dtype(&self) -> DType {
        self.desc.dtype()
    }
    /// The physical layout.
    pub fn layout(&self) -> Layout {
        self.desc.layout()
    }
    /// Whether the layout is [`Layout::Plain`].
    pub fn is_plain(&self) -> bool {
        self.layout() == Layout::Plain
    }
    /// The device.
    pub fn device(&self) -> Device {
        self.device
    }
    /// Tags the array with `device`.
    pub fn into_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
    /// Whether `self` and `other` alias the same buffer.
    pub fn same_buffer(&self, other: &Self) -> bool {
        self.buffer.ptr_eq(&other.buffer)
    }
    /// Whether another [`Array`] aliases the buffer.
    pub fn is_shared(&self) -> bool {
        self.buffer.strong_count() > 1
    }
    /// Converts to plain layout.
    ///
    /// Returns a clone if already plain, otherwise reorders into a new array.
    pub fn to_plain(&self) -> Result<Self> {
        if self.is_plain() {
            return Ok(self.clone());
        }
        let mut queue = OpQueue::new();
        let output = reorder_if_must(
            self,
            &MemoryDesc::plain(self.shape(), self.dtype()),
            &mut queue,
        )?;
        queue.execute()?;
        Ok(output)
    }
    /// Copies into an [`ndarray::ArrayD`], reordering into plain layout if necessary.
    ///
    /// **Errors**
    ///
    /// `T` is not the element type.
    pub fn to_array<T: Element>(&self) -> Result<ArrayD<T>> {
        let plain = self.to_plain()?;
        let data = plain.read::<T>()?.clone();
        ArrayD::from_shape_vec(IxDyn(plain.shape()), data).map_err(|e| shape_error!("{e}"))
    }
    /// Reshapes to `dims`, aliasing the buffer.
    ///
    /// **Errors**
    /// - The layout is not plain.
    /// - The number of elements differs.
    pub fn reshape(&self, dims: &[usize]) -> Result<Self> {
        if !self.is_plain() {
            return Err(layout_error!(
                "reshape requires a plain layout, found {:?}",
                self.layout()
            ));
        }
        let len: usize = dims.iter().product();
        if len != self.len() {
            return Err(shape_error!(
                "cannot reshape {:?} into {dims:?}",
                self.shape()
            ));
        }
        Ok(Self {
            desc: MemoryDesc::plain(dims, self.dtype()),
            device: self.device,
            buffer: self.buffer.clone(),
        })
    }
    pub(crate) fn read<T: Element>(&self) -> Result<RwLockReadGuard<'_, Vec<T>>> {
        T::as_buffer(&self.buffer)
            .map(|data| data.read())
            .ok_or_else(|| shape_error!("expected {:?}, found {:?}", T::DTYPE, self.dtype()))
    }
    pub(crate) fn write<T: Element>(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>> {
        T::as_buffer(&self.buffer)
            .map(|data| data.write())
            .ok_or_else(|| shape_error!("expected {:?}, found {:?}", T::DTYPE, self.dtype()))
    }
    /// Copies the buffer if it is shared, so that writes are not observed by other arrays.
    pub(crate) fn make_mut(&mut self) -> Result<()> {
        if self.is_shared() {
            self.buffer = self.buffer.deep_clone()?;
        }
        Ok(())
    }
    /// Allocates a new zeroed buffer if the buffer is shared.
    ///
    /// Used to reuse plan outputs, which are fully overwritten.
    pub(crate) fn reuse_or_alloc(&mut self) -> Result<()> {
        if self.is_shared() {
            self.buffer = Buffer::zeros(self.dtype(), self.desc.physical_len())?;
        }
        Ok(())
    }
}

impl Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Array")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .field("layout", &self.layout())
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn from_array_roundtrip() {
        let x = array![[1f32, 2., 3.], [4., 5., 6.]];
        let a = Array::from_array(x.clone());
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.dtype(), DType::F32);
        assert!(a.is_plain());
        assert_eq!(a.to_array::<f32>().unwrap(), x.into_dyn());
    }

    #[test]
    fn to_array_wrong_dtype() {
        let a = Array::from_array(array![1f64, 2.]);
        assert!(a.to_array::<f32>().unwrap_err().is_shape());
    }

    #[test]
    fn reshape_aliases() {
        let a = Array::from_shape_vec(&[2, 3], vec![0f32; 6]).unwrap();
        let b = a.reshape(&[6]).unwrap();
        assert!(a.same_buffer(&b));
        assert!(a.reshape(&[4]).unwrap_err().is_shape());
    }

    #[test]
    fn reuse_or_alloc_detaches_shared() {
        let mut a = Array::from_shape_vec(&[2], vec![1f32, 2.]).unwrap();
        let b = a.clone();
        a.reuse_or_alloc().unwrap();
        assert!(!a.same_buffer(&b));
        assert_eq!(b.to_array::<f32>().unwrap().as_slice().unwrap(), &[1., 2.]);
        let mut c = Array::from_shape_vec(&[2], vec![1f32, 2.]).unwrap();
        let d = c.clone();
        c.make_mut().unwrap();
        assert_eq!(c.to_array::<f32>().unwrap().as_slice().unwrap(), &[1., 2.]);
        assert!(!c.same_buffer(&d));
    }
}
