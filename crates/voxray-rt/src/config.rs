//! Ray tracing layer configuration.

use serde::{Deserialize, Serialize};
use voxray_gpu::HeapKind;

/// Settings for an [`RtDevice`](crate::RtDevice).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtConfig {
    /// Enable checks that cost extra work on every call: shader record
    /// bounds, ray-gen index range, scratch base address alignment.
    pub strict_validation: bool,
    /// Heap used by [`RtDevice::create_default_shader_table`](crate::RtDevice::create_default_shader_table).
    pub shader_table_heap: HeapKind,
    /// Lower bound for the scratch alignment reported by the device.
    pub scratch_alignment_floor: u64,
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            strict_validation: cfg!(debug_assertions),
            shader_table_heap: HeapKind::Upload,
            scratch_alignment_floor: 256,
        }
    }
}

impl RtConfig {
    /// Create a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set strict validation.
    pub const fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict_validation = strict;
        self
    }

    /// Set the default shader table heap.
    pub const fn with_shader_table_heap(mut self, heap: HeapKind) -> Self {
        self.shader_table_heap = heap;
        self
    }

    /// Set the scratch alignment floor. Must be a power of two.
    pub const fn with_scratch_alignment_floor(mut self, floor: u64) -> Self {
        self.scratch_alignment_floor = floor;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RtConfig::default();
        assert_eq!(config.strict_validation, cfg!(debug_assertions));
        assert_eq!(config.shader_table_heap, HeapKind::Upload);
        assert_eq!(config.scratch_alignment_floor, 256);
    }

    #[test]
    fn builder_methods() {
        let config = RtConfig::new()
            .with_strict_validation(true)
            .with_shader_table_heap(HeapKind::GpuUpload)
            .with_scratch_alignment_floor(512);
        assert!(config.strict_validation);
        assert_eq!(config.shader_table_heap, HeapKind::GpuUpload);
        assert_eq!(config.scratch_alignment_floor, 512);
    }
}
