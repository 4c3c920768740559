//! Capability summary derived from the selected adapter.
use ash::{vk, Instance};

/// Formats probed for support when building a [`CapabilitySummary`].
pub const CANDIDATE_FORMATS: &[vk::Format] = &[
    vk::Format::R8_UNORM,
    vk::Format::R8G8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::B10G11R11_UFLOAT_PACK32,
    vk::Format::R16_SFLOAT,
    vk::Format::R16G16_SFLOAT,
    vk::Format::R16G16B16A16_SFLOAT,
    vk::Format::R32_UINT,
    vk::Format::R32_SFLOAT,
    vk::Format::R32G32_SFLOAT,
    vk::Format::R32G32B32A32_SFLOAT,
    vk::Format::BC1_RGBA_UNORM_BLOCK,
    vk::Format::BC3_UNORM_BLOCK,
    vk::Format::BC5_UNORM_BLOCK,
    vk::Format::BC7_UNORM_BLOCK,
    vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK,
    vk::Format::ASTC_4X4_UNORM_BLOCK,
    vk::Format::D16_UNORM,
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
];

/// Formats supported for each image usage, in [`CANDIDATE_FORMATS`] order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatSupport {
    /// Sampled images.
    pub sampled: Vec<vk::Format>,
    /// Colour attachments.
    pub color_attachment: Vec<vk::Format>,
    /// Depth/stencil attachments.
    pub depth_stencil_attachment: Vec<vk::Format>,
    /// Storage images.
    pub storage: Vec<vk::Format>,
}

impl FormatSupport {
    fn insert(&mut self, format: vk::Format, features: vk::FormatFeatureFlags) {
        let usages = [
            (&mut self.sampled, vk::FormatFeatureFlags::SAMPLED_IMAGE),
            (
                &mut self.color_attachment,
                vk::FormatFeatureFlags::COLOR_ATTACHMENT,
            ),
            (
                &mut self.depth_stencil_attachment,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            ),
            (&mut self.storage, vk::FormatFeatureFlags::STORAGE_IMAGE),
        ];
        for (formats, required) in usages {
            if features.contains(required) {
                formats.push(format);
            }
        }
    }
}

/// Coarse classification of a memory type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Device local, not host visible.
    DeviceLocal,
    /// Host visible, uncached.
    HostVisible,
    /// Host visible and cached, for readback.
    HostCached,
    /// Device local and host visible (integrated GPUs, resizable BAR).
    Unified,
    /// Lazily allocated, for transient attachments.
    Lazily,
    /// Anything else, including protected memory.
    Other,
}

impl MemoryClass {
    const COUNT: usize = 6;

    /// Classifies a memory type by its property flags.
    pub fn classify(flags: vk::MemoryPropertyFlags) -> MemoryClass {
        use vk::MemoryPropertyFlags as F;

        if flags.contains(F::LAZILY_ALLOCATED) {
            MemoryClass::Lazily
        } else if flags.contains(F::PROTECTED) {
            MemoryClass::Other
        } else if flags.contains(F::DEVICE_LOCAL | F::HOST_VISIBLE) {
            MemoryClass::Unified
        } else if flags.contains(F::DEVICE_LOCAL) {
            MemoryClass::DeviceLocal
        } else if flags.contains(F::HOST_VISIBLE | F::HOST_CACHED) {
            MemoryClass::HostCached
        } else if flags.contains(F::HOST_VISIBLE) {
            MemoryClass::HostVisible
        } else {
            MemoryClass::Other
        }
    }

    #[inline]
    fn slot(self) -> usize {
        self as usize
    }
}

/// Alignment limits downstream allocators and uploads have to honour.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Alignments {
    /// `minUniformBufferOffsetAlignment`
    pub uniform_buffer_offset: vk::DeviceSize,
    /// `minStorageBufferOffsetAlignment`
    pub storage_buffer_offset: vk::DeviceSize,
    /// `optimalBufferCopyOffsetAlignment`
    pub buffer_copy_offset: vk::DeviceSize,
    /// `optimalBufferCopyRowPitchAlignment`
    pub buffer_copy_row_pitch: vk::DeviceSize,
    /// `nonCoherentAtomSize`
    pub non_coherent_atom_size: vk::DeviceSize,
    /// `bufferImageGranularity`
    pub buffer_image_granularity: vk::DeviceSize,
}

impl Alignments {
    fn from_limits(limits: &vk::PhysicalDeviceLimits) -> Alignments {
        Alignments {
            uniform_buffer_offset: limits.min_uniform_buffer_offset_alignment,
            storage_buffer_offset: limits.min_storage_buffer_offset_alignment,
            buffer_copy_offset: limits.optimal_buffer_copy_offset_alignment,
            buffer_copy_row_pitch: limits.optimal_buffer_copy_row_pitch_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            buffer_image_granularity: limits.buffer_image_granularity,
        }
    }
}

/// What downstream object creation needs to know about the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySummary {
    /// Supported formats per usage.
    pub formats: FormatSupport,
    /// Class of each memory type, indexed by memory type index.
    pub memory_types: Vec<MemoryClass>,
    /// Alignment limits.
    pub alignments: Alignments,
    /// Sample counts usable for both colour and depth attachments.
    pub sample_counts: vk::SampleCountFlags,
    memory_masks: [u32; MemoryClass::COUNT],
}

impl CapabilitySummary {
    /// Builds a summary from already queried properties. `format_properties`
    /// is called once per entry of [`CANDIDATE_FORMATS`].
    pub fn from_parts(
        properties: &vk::PhysicalDeviceProperties,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        mut format_properties: impl FnMut(vk::Format) -> vk::FormatProperties,
    ) -> CapabilitySummary {
        let mut formats = FormatSupport::default();
        for &format in CANDIDATE_FORMATS {
            formats.insert(format, format_properties(format).optimal_tiling_features);
        }

        let mut memory_masks = [0; MemoryClass::COUNT];
        let memory_types: Vec<MemoryClass> = memory_properties
            .memory_types_as_slice()
            .iter()
            .enumerate()
            .map(|(index, memory_type)| {
                let class = MemoryClass::classify(memory_type.property_flags);
                memory_masks[class.slot()] |= 1 << index;
                class
            })
            .collect();

        let limits = &properties.limits;
        CapabilitySummary {
            formats,
            memory_types,
            alignments: Alignments::from_limits(limits),
            sample_counts: limits.framebuffer_color_sample_counts
                & limits.framebuffer_depth_sample_counts,
            memory_masks,
        }
    }

    /// Queries and builds the summary for `physical_device`.
    ///
    /// # Safety
    /// `physical_device` must belong to `instance`.
    pub unsafe fn query(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        properties: &vk::PhysicalDeviceProperties,
    ) -> CapabilitySummary {
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        CapabilitySummary::from_parts(properties, &memory_properties, |format| {
            instance.get_physical_device_format_properties(physical_device, format)
        })
    }

    /// Bit mask of the memory types of `class`.
    #[inline]
    pub fn memory_type_mask(&self, class: MemoryClass) -> u32 {
        self.memory_masks[class.slot()]
    }

    /// Lowest memory type index of `class` allowed by `type_bits`, as found
    /// in `VkMemoryRequirements::memoryTypeBits`.
    #[inline]
    pub fn find_memory_type(&self, type_bits: u32, class: MemoryClass) -> Option<u32> {
        let candidates = type_bits & self.memory_type_mask(class);
        (candidates != 0).then(|| candidates.trailing_zeros())
    }

    /// Returns true if `count` samples work for colour and depth attachments.
    #[inline]
    pub fn supports_sample_count(&self, count: vk::SampleCountFlags) -> bool {
        self.sample_counts.contains(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::MemoryPropertyFlags as F;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &property_flags) in properties.memory_types.iter_mut().zip(types) {
            *slot = vk::MemoryType {
                property_flags,
                heap_index: 0,
            };
        }

        properties
    }

    fn summary(types: &[vk::MemoryPropertyFlags]) -> CapabilitySummary {
        let mut properties = vk::PhysicalDeviceProperties::default();
        properties.limits.framebuffer_color_sample_counts =
            vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4 | vk::SampleCountFlags::TYPE_8;
        properties.limits.framebuffer_depth_sample_counts =
            vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4;
        properties.limits.non_coherent_atom_size = 64;
        properties.limits.min_uniform_buffer_offset_alignment = 256;

        CapabilitySummary::from_parts(&properties, &memory_properties(types), |format| {
            let optimal_tiling_features = match format {
                vk::Format::D32_SFLOAT => vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                    | vk::FormatFeatureFlags::SAMPLED_IMAGE,
                vk::Format::R8G8B8A8_UNORM => vk::FormatFeatureFlags::SAMPLED_IMAGE
                    | vk::FormatFeatureFlags::COLOR_ATTACHMENT
                    | vk::FormatFeatureFlags::STORAGE_IMAGE,
                vk::Format::BC7_UNORM_BLOCK => vk::FormatFeatureFlags::SAMPLED_IMAGE,
                _ => vk::FormatFeatureFlags::empty(),
            };
            vk::FormatProperties {
                optimal_tiling_features,
                ..Default::default()
            }
        })
    }

    #[test]
    fn classification() {
        assert_eq!(MemoryClass::classify(F::DEVICE_LOCAL), MemoryClass::DeviceLocal);
        assert_eq!(
            MemoryClass::classify(F::HOST_VISIBLE | F::HOST_COHERENT),
            MemoryClass::HostVisible
        );
        assert_eq!(
            MemoryClass::classify(F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED),
            MemoryClass::HostCached
        );
        assert_eq!(
            MemoryClass::classify(F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT),
            MemoryClass::Unified
        );
        assert_eq!(
            MemoryClass::classify(F::DEVICE_LOCAL | F::LAZILY_ALLOCATED),
            MemoryClass::Lazily
        );
        assert_eq!(MemoryClass::classify(F::empty()), MemoryClass::Other);
        assert_eq!(
            MemoryClass::classify(F::DEVICE_LOCAL | F::PROTECTED),
            MemoryClass::Other
        );
    }

    #[test]
    fn discrete_memory_layout() {
        let summary = summary(&[
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
            F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
            F::DEVICE_LOCAL,
        ]);
        assert_eq!(summary.memory_types.len(), 5);
        assert_eq!(summary.memory_type_mask(MemoryClass::DeviceLocal), 0b10001);
        assert_eq!(summary.memory_type_mask(MemoryClass::HostVisible), 0b00010);
        assert_eq!(summary.memory_type_mask(MemoryClass::HostCached), 0b00100);
        assert_eq!(summary.memory_type_mask(MemoryClass::Unified), 0b01000);
        assert_eq!(summary.memory_type_mask(MemoryClass::Lazily), 0);

        assert_eq!(summary.find_memory_type(!0, MemoryClass::DeviceLocal), Some(0));
        assert_eq!(summary.find_memory_type(0b10000, MemoryClass::DeviceLocal), Some(4));
        assert_eq!(summary.find_memory_type(0b00001, MemoryClass::HostVisible), None);
    }

    #[test]
    fn formats_by_usage() {
        let summary = summary(&[F::DEVICE_LOCAL]);
        assert_eq!(
            summary.formats.sampled,
            vec![
                vk::Format::R8G8B8A8_UNORM,
                vk::Format::BC7_UNORM_BLOCK,
                vk::Format::D32_SFLOAT
            ]
        );
        assert_eq!(summary.formats.color_attachment, vec![vk::Format::R8G8B8A8_UNORM]);
        assert_eq!(summary.formats.depth_stencil_attachment, vec![vk::Format::D32_SFLOAT]);
        assert_eq!(summary.formats.storage, vec![vk::Format::R8G8B8A8_UNORM]);
    }

    #[test]
    fn sample_mask_is_color_and_depth() {
        let summary = summary(&[]);
        assert!(summary.supports_sample_count(vk::SampleCountFlags::TYPE_4));
        assert!(!summary.supports_sample_count(vk::SampleCountFlags::TYPE_8));
        assert_eq!(summary.alignments.non_coherent_atom_size, 64);
        assert_eq!(summary.alignments.uniform_buffer_offset, 256);
    }
}
