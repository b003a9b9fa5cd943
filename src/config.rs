use crate::{
    error::{config_error, Error, Result},
    gpu::GpuKernels,
};
use once_cell::sync::OnceCell;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    str::FromStr,
    sync::Arc,
};

/// Whether the accelerated backends may be used.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum UseAccelerated {
    /// Use an accelerated backend when eligible.
    #[default]
    #[display(fmt = "auto")]
    Auto,
    /// Like [`Auto`](UseAccelerated::Auto), but warn when falling back.
    #[display(fmt = "always")]
    Always,
    /// Always use the dense fallback.
    #[display(fmt = "never")]
    Never,
}

impl FromStr for UseAccelerated {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            _ => Err(config_error!(
                "expected one of auto, always, never, found {s:?}"
            )),
        }
    }
}

/// Backends available in the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EligibilityFlags {
    /// The optimized kernel library.
    pub accelerated: bool,
    /// A GPU kernel provider.
    pub gpu: bool,
}

impl EligibilityFlags {
    /// Detects available backends once per process.
    ///
    /// The kernel library is available unless `DNNFUSE_ACCELERATED` disables it. GPU availability
    /// is set by [`Config::with_gpu()`].
    pub fn detect() -> Self {
        static FLAGS: OnceCell<EligibilityFlags> = OnceCell::new();
        *FLAGS.get_or_init(|| {
            let accelerated = match std::env::var("DNNFUSE_ACCELERATED") {
                Ok(value) => parse_bool(&value).unwrap_or_else(|e| {
                    log::warn!("DNNFUSE_ACCELERATED: {e}");
                    true
                }),
                Err(_) => true,
            };
            let flags = Self {
                accelerated,
                gpu: false,
            };
            log::debug!("detected {flags:?}");
            flags
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(config_error!("expected a boolean, found {value:?}")),
    }
}

fn env_var<T>(key: &str, parse: impl FnOnce(&str) -> Result<T>) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => parse(&value)
            .map(Some)
            .map_err(|e| config_error!("{key}: {e}")),
        Err(_) => Ok(None),
    }
}

/// Process configuration, passed to every call.
#[derive(Clone)]
pub struct Config {
    /// Training mode. Batch normalization computes batch statistics and updates its running
    /// statistics when true.
    pub train: bool,
    /// Whether the accelerated backends may be used.
    pub use_accelerated: UseAccelerated,
    /// Recompute every accelerated result on the dense fallback and compare.
    pub cosim: bool,
    /// Available backends.
    pub flags: EligibilityFlags,
    gpu: Option<Arc<dyn GpuKernels>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            train: true,
            use_accelerated: UseAccelerated::Auto,
            cosim: false,
            flags: EligibilityFlags::detect(),
            gpu: None,
        }
    }
}

impl Config {
    /// Creates the default config.
    pub fn new() -> Self {
        Self::default()
    }
    /// Reads `DNNFUSE_TRAIN`, `DNNFUSE_USE_ACCELERATED`, `DNNFUSE_COSIM` and
    /// `DNNFUSE_ACCELERATED`.
    ///
    /// Unset variables keep their defaults.
    ///
    /// **Errors**
    ///
    /// A variable could not be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(train) = env_var("DNNFUSE_TRAIN", parse_bool)? {
            config.train = train;
        }
        if let Some(use_accelerated) =
            env_var("DNNFUSE_USE_ACCELERATED", str::parse::<UseAccelerated>)?
        {
            config.use_accelerated = use_accelerated;
        }
        if let Some(cosim) = env_var("DNNFUSE_COSIM", parse_bool)? {
            config.cosim = cosim;
        }
        if let Some(accelerated) = env_var("DNNFUSE_ACCELERATED", parse_bool)? {
            config.flags.accelerated = accelerated;
        }
        Ok(config)
    }
    /// Sets [`train`](Config::train).
    pub fn with_train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }
    /// Sets [`use_accelerated`](Config::use_accelerated).
    pub fn with_use_accelerated(mut self, use_accelerated: UseAccelerated) -> Self {
        self.use_accelerated = use_accelerated;
        self
    }
    /// Sets [`cosim`](Config::cosim).
    pub fn with_cosim(mut self, cosim: bool) -> Self {
        self.cosim = cosim;
        self
    }
    /// Sets [`flags`](Config::flags).
    pub fn with_flags(mut self, flags: EligibilityFlags) -> Self {
        self.flags = flags;
        self
    }
    /// Attaches a GPU kernel provider and marks the GPU available.
    pub fn with_gpu(mut self, gpu: Arc<dyn GpuKernels>) -> Self {
        self.flags.gpu = true;
        self.gpu.replace(gpu);
        self
    }
    /// The GPU kernel provider.
    pub fn gpu(&self) -> Option<&Arc<dyn GpuKernels>> {
        self.gpu.as_ref()
    }
    /// Whether a call could select an accelerated backend.
    pub(crate) fn accelerated_selectable(&self) -> bool {
        self.use_accelerated != UseAccelerated::Never
            && (self.flags.accelerated || (self.flags.gpu && self.gpu.is_some()))
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("train", &self.train)
            .field("use_accelerated", &self.use_accelerated)
            .field("cosim", &self.cosim)
            .field("flags", &self.flags)
            .field("gpu", &self.gpu.as_ref().map(|gpu| gpu.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn use_accelerated_from_str() {
        assert_eq!(
            "Always".parse::<UseAccelerated>().unwrap(),
            UseAccelerated::Always
        );
        assert_eq!(
            " never ".parse::<UseAccelerated>().unwrap(),
            UseAccelerated::Never
        );
        assert!("sometimes"
            .parse::<UseAccelerated>()
            .unwrap_err()
            .is_config());
        assert_eq!(UseAccelerated::Auto.to_string(), "auto");
    }

    #[test]
    fn parse_bools() {
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn never_is_not_selectable() {
        let config = Config::default()
            .with_flags(EligibilityFlags {
                accelerated: true,
                gpu: false,
            })
            .with_use_accelerated(UseAccelerated::Never);
        assert!(!config.accelerated_selectable());
        assert!(config
            .with_use_accelerated(UseAccelerated::Auto)
            .accelerated_selectable());
    }
}
