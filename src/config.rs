//! Configuration for the in-process host engine
//!
//! [`HostEngineConfig`] controls how much memory the host engine may hand out,
//! how allocations are aligned for accounting, and how many worker threads
//! run kernels.

use crate::error::{ForgeError, ForgeResult};

/// Environment variable capping host engine memory (bytes)
pub const HOST_MEMORY_LIMIT_ENV: &str = "MATMULFORGE_HOST_MEMORY_LIMIT";

/// Environment variable for allocation alignment (bytes)
pub const HOST_ALIGNMENT_ENV: &str = "MATMULFORGE_HOST_ALIGNMENT";

/// Environment variable for the kernel worker thread count
pub const HOST_THREADS_ENV: &str = "MATMULFORGE_HOST_THREADS";

/// Configuration for [`crate::backend::host::HostEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEngineConfig {
    /// Maximum live allocated bytes; `None` is unlimited
    pub memory_limit: Option<usize>,

    /// Allocation sizes are rounded up to this many bytes when accounted
    pub alignment: usize,

    /// Kernel worker threads; 0 lets rayon pick
    pub threads: usize,
}

impl Default for HostEngineConfig {
    fn default() -> Self {
        HostEngineConfig {
            memory_limit: None,
            alignment: 8,
            threads: 0,
        }
    }
}

impl HostEngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the `MATMULFORGE_HOST_*` environment variables
    pub fn from_env() -> ForgeResult<Self> {
        let mut config = Self::default();
        if let Some(limit) = parse_env(HOST_MEMORY_LIMIT_ENV)? {
            config.memory_limit = Some(limit);
        }
        if let Some(alignment) = parse_env(HOST_ALIGNMENT_ENV)? {
            config.alignment = alignment;
        }
        if let Some(threads) = parse_env(HOST_THREADS_ENV)? {
            config.threads = threads;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set the memory limit in bytes
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Set allocation alignment in bytes
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the number of kernel worker threads
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(ForgeError::InvalidConfiguration(format!(
                "alignment must be a non-zero power of two, got {}",
                self.alignment
            )));
        }
        Ok(())
    }

    /// Bytes accounted for an allocation of `size`
    pub fn aligned_size(&self, size: usize) -> usize {
        size.div_ceil(self.alignment) * self.alignment
    }
}

fn parse_env(key: &str) -> ForgeResult<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed.parse::<usize>().map(Some).map_err(|e| {
                ForgeError::InvalidConfiguration(format!("{}={:?}: {}", key, trimmed, e))
            })
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_host_config_default() {
        let config = HostEngineConfig::default();
        assert_eq!(config.memory_limit, None);
        assert_eq!(config.alignment, 8);
        assert_eq!(config.threads, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_host_config_builder() {
        let config = HostEngineConfig::new()
            .with_memory_limit(1024)
            .with_alignment(64)
            .with_threads(2);
        assert_eq!(config.memory_limit, Some(1024));
        assert_eq!(config.alignment, 64);
        assert_eq!(config.threads, 2);
        assert_eq!(config.aligned_size(1), 64);
        assert_eq!(config.aligned_size(65), 128);
        assert_eq!(config.aligned_size(0), 0);
    }

    #[test]
    fn test_invalid_alignment() {
        assert!(HostEngineConfig::new().with_alignment(0).validate().is_err());
        assert!(HostEngineConfig::new().with_alignment(12).validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var(HOST_MEMORY_LIMIT_ENV, "4096");
        std::env::set_var(HOST_THREADS_ENV, " 3 ");
        let config = HostEngineConfig::from_env().unwrap();
        assert_eq!(config.memory_limit, Some(4096));
        assert_eq!(config.threads, 3);

        std::env::set_var(HOST_ALIGNMENT_ENV, "lots");
        let err = HostEngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ForgeError::InvalidConfiguration(_)));

        std::env::remove_var(HOST_MEMORY_LIMIT_ENV);
        std::env::remove_var(HOST_THREADS_ENV);
        std::env::remove_var(HOST_ALIGNMENT_ENV);
    }
}
