use std::collections::TryReserveError;

/// Errors.
///
/// Each variant is fatal to the call that produced it. No variant is recovered by retrying on a
/// different backend, the backend is selected once per call before any backend work is done.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input rank or dimensions are incompatible with the operator.
    #[error("ShapeError: {0}")]
    Shape(String),
    /// A parameter is incompatible with the selected backend.
    #[error("ConfigError: {0}")]
    Config(String),
    /// The requested physical layout is impossible for the shape.
    #[error("LayoutError: {0}")]
    Layout(String),
    /// The caller violated the forward / backward protocol.
    #[error("StateError: {0}")]
    State(String),
    /// A buffer could not be allocated.
    #[error("allocation failed: {0}")]
    Alloc(#[from] TryReserveError),
    /// Error returned by a [`GpuKernels`](crate::gpu::GpuKernels) provider.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
    /// Co-simulation found a backend disagreeing with the dense fallback.
    #[error("{op}: max_abs_diff {max_abs_diff} exceeds tolerance {tolerance}")]
    Cosim {
        /// The operation.
        op: &'static str,
        /// Largest elementwise difference.
        max_abs_diff: f64,
        /// Allowed difference.
        tolerance: f64,
    },
}

/// Result.
pub type Result<T, E = Error> = std::result::Result<T, E>;

macro_rules! shape_error {
    ($($arg:tt)*) => {
        $crate::error::Error::Shape(format!($($arg)*))
    };
}

macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::Error::Config(format!($($arg)*))
    };
}

macro_rules! layout_error {
    ($($arg:tt)*) => {
        $crate::error::Error::Layout(format!($($arg)*))
    };
}

macro_rules! state_error {
    ($($arg:tt)*) => {
        $crate::error::Error::State(format!($($arg)*))
    };
}

pub(crate) use {config_error, layout_error, shape_error, state_error};

impl Error {
    /// Whether the error is a [`Error::Shape`].
    pub fn is_shape(&self) -> bool {
        matches!(self, Self::Shape(_))
    }
    /// Whether the error is a [`Error::Config`].
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
    /// Whether the error is a [`Error::Layout`].
    pub fn is_layout(&self) -> bool {
        matches!(self, Self::Layout(_))
    }
    /// Whether the error is a [`Error::State`].
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State(_))
    }
}
