//! Instance records for top-level acceleration structures.

use crate::acceleration::AccelerationStructure;
use crate::backend::RayTracingBackend;
use crate::device::RtDevice;
use ash::vk;
use glam::Mat4;
use voxray_gpu::{GpuError, HeapKind, Result, SharedBuffer};

const MAX_24_BIT: u32 = 0x00FF_FFFF;

/// One instance of a bottom-level structure in a top-level build.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InstanceRecord {
    pub transform: Mat4,
    /// Value of `gl_InstanceCustomIndexEXT`. 24 bits.
    pub custom_index: u32,
    pub mask: u8,
    /// Offset added to the hit group index. 24 bits.
    pub sbt_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    pub blas_address: vk::DeviceAddress,
}

impl InstanceRecord {
    /// Identity-transformed instance of `blas`, visible to every ray mask.
    pub fn new(blas: &AccelerationStructure) -> Self {
        Self::from_address(blas.device_address())
    }

    pub fn from_address(blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform: Mat4::IDENTITY,
            custom_index: 0,
            mask: 0xFF,
            sbt_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
            blas_address,
        }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    #[must_use]
    pub fn with_custom_index(mut self, index: u32) -> Self {
        self.custom_index = index;
        self
    }

    #[must_use]
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    #[must_use]
    pub fn with_sbt_offset(mut self, offset: u32) -> Self {
        self.sbt_offset = offset;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.flags = flags;
        self
    }

    /// Encode as the packed record the driver reads.
    pub fn to_vk(&self) -> Result<vk::AccelerationStructureInstanceKHR> {
        if self.custom_index > MAX_24_BIT {
            return Err(GpuError::InvalidArgument(format!(
                "custom index {} does not fit in 24 bits",
                self.custom_index
            )));
        }
        if self.sbt_offset > MAX_24_BIT {
            return Err(GpuError::InvalidArgument(format!(
                "shader binding table offset {} does not fit in 24 bits",
                self.sbt_offset
            )));
        }
        let flags = u8::try_from(self.flags.as_raw()).map_err(|_| {
            GpuError::InvalidArgument(format!("instance flags {:?} do not fit in 8 bits", self.flags))
        })?;

        // Row-major 3x4; glam stores columns.
        let mut matrix = [0.0; 12];
        for row in 0..3 {
            matrix[row * 4..row * 4 + 4].copy_from_slice(&self.transform.row(row).to_array());
        }

        Ok(vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR { matrix },
            instance_custom_index_and_mask: vk::Packed24_8::new(self.custom_index, self.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                self.sbt_offset,
                flags,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        })
    }
}

/// Encode `records` and write them to the start of `buffer`.
pub fn write_instances(buffer: &SharedBuffer, records: &[InstanceRecord]) -> Result<()> {
    let instances = records
        .iter()
        .map(InstanceRecord::to_vk)
        .collect::<Result<Vec<_>>>()?;

    // SAFETY: the instance struct is plain data without padding.
    let bytes = unsafe {
        std::slice::from_raw_parts(
            instances.as_ptr().cast::<u8>(),
            std::mem::size_of_val(instances.as_slice()),
        )
    };
    buffer.write_bytes(0, bytes)
}

impl<B: RayTracingBackend> RtDevice<B> {
    /// Allocate a CPU-visible instance buffer holding `records`.
    pub fn upload_instances(
        &self,
        records: &[InstanceRecord],
        heap: HeapKind,
    ) -> Result<SharedBuffer> {
        if records.is_empty() {
            return Err(GpuError::InvalidArgument(
                "no instances to upload".to_string(),
            ));
        }
        let buffer = self.allocate_instance_buffer(records.len() as u64, heap)?;
        let written = self
            .map_for_write(&buffer)
            .and_then(|_| write_instances(&buffer, records));
        if let Err(e) = written {
            self.release(buffer)?;
            return Err(e);
        }
        tracing::debug!(count = records.len(), "uploaded instance records");
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtConfig;
    use crate::testing::FakeBackend;
    use glam::Vec3;

    #[test]
    fn instance_size() {
        assert_eq!(std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(), 64);
    }

    #[test]
    fn identity_transform_is_row_major() {
        let raw = InstanceRecord::from_address(0x1000).to_vk().unwrap();
        assert_eq!(
            raw.transform.matrix,
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
        assert_eq!(unsafe { raw.acceleration_structure_reference.device_handle }, 0x1000);
    }

    #[test]
    fn translation_lands_in_last_column() {
        let raw = InstanceRecord::from_address(0)
            .with_transform(Mat4::from_translation(Vec3::new(3.0, -2.0, 5.0)))
            .to_vk()
            .unwrap();
        let m = raw.transform.matrix;
        assert_eq!((m[3], m[7], m[11]), (3.0, -2.0, 5.0));
    }

    #[test]
    fn fields_are_packed() {
        let raw = InstanceRecord::from_address(0)
            .with_custom_index(0x00AB_CDEF)
            .with_mask(0x0F)
            .with_sbt_offset(7)
            .with_flags(vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE)
            .to_vk()
            .unwrap();

        assert_eq!(raw.instance_custom_index_and_mask.low_24(), 0x00AB_CDEF);
        assert_eq!(raw.instance_custom_index_and_mask.high_8(), 0x0F);
        assert_eq!(
            raw.instance_shader_binding_table_record_offset_and_flags.low_24(),
            7
        );
        assert_eq!(
            u32::from(raw.instance_shader_binding_table_record_offset_and_flags.high_8()),
            vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE.as_raw()
        );
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let record = InstanceRecord::from_address(0).with_custom_index(1 << 24);
        assert!(matches!(record.to_vk(), Err(GpuError::InvalidArgument(_))));

        let record = InstanceRecord::from_address(0).with_sbt_offset(1 << 24);
        assert!(matches!(record.to_vk(), Err(GpuError::InvalidArgument(_))));
    }

    #[test]
    fn upload_writes_every_record() {
        let device = RtDevice::new(FakeBackend::new(), RtConfig::default());
        let records = [
            InstanceRecord::from_address(0xAA00),
            InstanceRecord::from_address(0xBB00).with_custom_index(1),
        ];
        let buffer = device.upload_instances(&records, HeapKind::Upload).unwrap();
        assert_eq!(buffer.size, 128);

        let second = buffer.read_bytes(64 + 56, 8).unwrap();
        assert_eq!(second, 0xBB00u64.to_ne_bytes());
    }

    #[test]
    fn upload_needs_cpu_visible_heap() {
        let device = RtDevice::new(FakeBackend::new(), RtConfig::default());
        let records = [InstanceRecord::from_address(0xAA00)];
        assert!(matches!(
            device.upload_instances(&records, HeapKind::DeviceLocal),
            Err(GpuError::InvalidState(_))
        ));
        assert_eq!(device.backend().live_buffers(), 0);
        assert!(matches!(
            device.upload_instances(&[], HeapKind::Upload),
            Err(GpuError::InvalidArgument(_))
        ));
    }
}
