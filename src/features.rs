//! Device feature bit sets and their mapping onto Vulkan feature structures.
use crate::DeviceSmallVec;
use ash::vk;
use std::{ffi::CStr, ptr};

macro_rules! device_features {
    ($($(#[$($doc:tt)*])* $flag:ident = $bit:literal => $chain:ident . $field:ident;)*) => {
        bitflags::bitflags! {
            /// Device features this crate knows how to query, require and enable.
            ///
            /// Each flag maps onto exactly one `VkBool32` in the feature chain.
            #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
            pub struct DeviceFeatures: u64 {
                $($(#[$($doc)*])* const $flag = 1 << $bit;)*
            }
        }

        impl FeatureChain<'_> {
            /// Every feature reported as `VK_TRUE` in the chain.
            pub(crate) fn reported(&self) -> DeviceFeatures {
                let mut features = DeviceFeatures::empty();
                $(
                    if self.$chain.$field == vk::TRUE {
                        features |= DeviceFeatures::$flag;
                    }
                )*
                features
            }

            /// Sets every feature in `features` to `VK_TRUE`. Never clears.
            pub(crate) fn enable(&mut self, features: DeviceFeatures) {
                $(
                    if features.contains(DeviceFeatures::$flag) {
                        self.$chain.$field = vk::TRUE;
                    }
                )*
            }
        }
    };
}

device_features! {
    /// Anisotropic filtering in samplers.
    SAMPLER_ANISOTROPY = 0 => core.sampler_anisotropy;
    /// BC compressed texture formats.
    TEXTURE_COMPRESSION_BC = 1 => core.texture_compression_bc;
    /// ETC2 and EAC compressed texture formats.
    TEXTURE_COMPRESSION_ETC2 = 2 => core.texture_compression_etc2;
    /// ASTC LDR compressed texture formats.
    TEXTURE_COMPRESSION_ASTC_LDR = 3 => core.texture_compression_astc_ldr;
    /// Storage writes and atomics from fragment shaders.
    FRAGMENT_STORES_AND_ATOMICS = 4 => core.fragment_stores_and_atomics;
    /// Extended image gather instructions.
    SHADER_IMAGE_GATHER_EXTENDED = 5 => core.shader_image_gather_extended;
    /// Depth clamping instead of clipping.
    DEPTH_CLAMP = 6 => core.depth_clamp;
    /// Indirect draws with a draw count above one.
    MULTI_DRAW_INDIRECT = 7 => core.multi_draw_indirect;
    /// Non-zero `firstInstance` in indirect draws.
    DRAW_INDIRECT_FIRST_INSTANCE = 8 => core.draw_indirect_first_instance;
    /// Cube array image views.
    IMAGE_CUBE_ARRAY = 9 => core.image_cube_array;
    /// Extended storage image formats.
    SHADER_STORAGE_IMAGE_EXTENDED_FORMATS = 10 => core.shader_storage_image_extended_formats;
    /// Storage image reads without a declared format.
    SHADER_STORAGE_IMAGE_READ_WITHOUT_FORMAT = 11 => core.shader_storage_image_read_without_format;
    /// Storage image writes without a declared format.
    SHADER_STORAGE_IMAGE_WRITE_WITHOUT_FORMAT = 12 => core.shader_storage_image_write_without_format;
    /// 16-bit integers in shaders.
    SHADER_INT16 = 13 => core.shader_int16;
    /// `DrawParameters` shader capability.
    SHADER_DRAW_PARAMETERS = 14 => vulkan11.shader_draw_parameters;
    /// 16-bit members in storage buffers.
    STORAGE_BUFFER_16BIT_ACCESS = 15 => vulkan11.storage_buffer16_bit_access;
    /// Scalar block layout for uniform and storage buffers.
    SCALAR_BLOCK_LAYOUT = 16 => vulkan12.scalar_block_layout;
    /// `vkCmdDrawIndirectCount` and friends.
    DRAW_INDIRECT_COUNT = 17 => vulkan12.draw_indirect_count;
    /// 16-bit floats in shaders.
    SHADER_FLOAT16 = 18 => vulkan12.shader_float16;
    /// Descriptor indexing.
    DESCRIPTOR_INDEXING = 19 => vulkan12.descriptor_indexing;
    /// Non-uniform indexing of sampled image arrays.
    SHADER_SAMPLED_IMAGE_ARRAY_NON_UNIFORM_INDEXING = 20 => vulkan12.shader_sampled_image_array_non_uniform_indexing;
    /// Non-uniform indexing of storage buffer arrays.
    SHADER_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING = 21 => vulkan12.shader_storage_buffer_array_non_uniform_indexing;
    /// Update-after-bind for sampled image descriptors.
    DESCRIPTOR_BINDING_SAMPLED_IMAGE_UPDATE_AFTER_BIND = 22 => vulkan12.descriptor_binding_sampled_image_update_after_bind;
    /// Update-after-bind for storage image descriptors.
    DESCRIPTOR_BINDING_STORAGE_IMAGE_UPDATE_AFTER_BIND = 23 => vulkan12.descriptor_binding_storage_image_update_after_bind;
    /// Update-after-bind for storage buffer descriptors.
    DESCRIPTOR_BINDING_STORAGE_BUFFER_UPDATE_AFTER_BIND = 24 => vulkan12.descriptor_binding_storage_buffer_update_after_bind;
    /// Updating unused descriptors while a command buffer is pending.
    DESCRIPTOR_BINDING_UPDATE_UNUSED_WHILE_PENDING = 25 => vulkan12.descriptor_binding_update_unused_while_pending;
    /// Partially bound descriptor bindings.
    DESCRIPTOR_BINDING_PARTIALLY_BOUND = 26 => vulkan12.descriptor_binding_partially_bound;
    /// Runtime sized descriptor arrays.
    RUNTIME_DESCRIPTOR_ARRAY = 27 => vulkan12.runtime_descriptor_array;
    /// Rendering without render pass objects. Core in 1.3.
    DYNAMIC_RENDERING = 28 => dynamic_rendering.dynamic_rendering;
    /// `OpDemoteToHelperInvocation`. Core in 1.3.
    SHADER_DEMOTE_TO_HELPER_INVOCATION = 29 => demote.shader_demote_to_helper_invocation;
    /// Requires `VK_EXT_memory_priority`.
    MEMORY_PRIORITY = 30 => memory_priority.memory_priority;
    /// Requires `VK_EXT_pageable_device_local_memory`.
    PAGEABLE_DEVICE_LOCAL_MEMORY = 31 => pageable.pageable_device_local_memory;
    /// Requires `VK_KHR_pipeline_executable_properties`.
    PIPELINE_EXECUTABLE_INFO = 32 => pipeline_executable.pipeline_executable_info;
}

impl DeviceFeatures {
    /// Sub-features guaranteed by the Vulkan specification whenever
    /// `descriptorIndexing` is supported.
    pub const DESCRIPTOR_INDEXING_BUNDLE: DeviceFeatures = DeviceFeatures::DESCRIPTOR_INDEXING
        .union(DeviceFeatures::SHADER_SAMPLED_IMAGE_ARRAY_NON_UNIFORM_INDEXING)
        .union(DeviceFeatures::SHADER_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING)
        .union(DeviceFeatures::DESCRIPTOR_BINDING_SAMPLED_IMAGE_UPDATE_AFTER_BIND)
        .union(DeviceFeatures::DESCRIPTOR_BINDING_STORAGE_IMAGE_UPDATE_AFTER_BIND)
        .union(DeviceFeatures::DESCRIPTOR_BINDING_STORAGE_BUFFER_UPDATE_AFTER_BIND)
        .union(DeviceFeatures::DESCRIPTOR_BINDING_UPDATE_UNUSED_WHILE_PENDING)
        .union(DeviceFeatures::DESCRIPTOR_BINDING_PARTIALLY_BOUND)
        .union(DeviceFeatures::RUNTIME_DESCRIPTOR_ARRAY);

    /// 16-bit arithmetic and storage used by the half precision upscaling path.
    pub const HALF_PRECISION: DeviceFeatures = DeviceFeatures::SHADER_FLOAT16
        .union(DeviceFeatures::SHADER_INT16)
        .union(DeviceFeatures::STORAGE_BUFFER_16BIT_ACCESS);
}

bitflags::bitflags! {
    /// Optional device extensions tracked per adapter.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct OptionalExtensions: u32 {
        /// `VK_EXT_memory_priority`
        const MEMORY_PRIORITY = 1 << 0;
        /// `VK_EXT_pageable_device_local_memory`
        const PAGEABLE_DEVICE_LOCAL_MEMORY = 1 << 1;
        /// `VK_KHR_pipeline_executable_properties`
        const PIPELINE_EXECUTABLE_PROPERTIES = 1 << 2;
        /// `VK_NV_device_diagnostic_checkpoints`
        const DIAGNOSTIC_CHECKPOINTS = 1 << 3;
        /// `VK_AMD_buffer_marker`
        const BUFFER_MARKER = 1 << 4;
        /// `VK_EXT_memory_budget`
        const MEMORY_BUDGET = 1 << 5;
    }
}

impl OptionalExtensions {
    const NAMES: [(OptionalExtensions, &'static CStr); 6] = [
        (OptionalExtensions::MEMORY_PRIORITY, ash::ext::memory_priority::NAME),
        (
            OptionalExtensions::PAGEABLE_DEVICE_LOCAL_MEMORY,
            ash::ext::pageable_device_local_memory::NAME,
        ),
        (
            OptionalExtensions::PIPELINE_EXECUTABLE_PROPERTIES,
            ash::khr::pipeline_executable_properties::NAME,
        ),
        (
            OptionalExtensions::DIAGNOSTIC_CHECKPOINTS,
            ash::nv::device_diagnostic_checkpoints::NAME,
        ),
        (OptionalExtensions::BUFFER_MARKER, ash::amd::buffer_marker::NAME),
        (OptionalExtensions::MEMORY_BUDGET, ash::ext::memory_budget::NAME),
    ];

    /// Collects the optional extensions for which `is_present` holds.
    pub fn detect(mut is_present: impl FnMut(&CStr) -> bool) -> OptionalExtensions {
        OptionalExtensions::NAMES
            .iter()
            .filter(|(_, name)| is_present(name))
            .fold(OptionalExtensions::empty(), |set, (flag, _)| set | *flag)
    }

    /// Extension names of every flag in `self`.
    pub fn extension_names(self) -> DeviceSmallVec<&'static CStr> {
        OptionalExtensions::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Which optional structures get linked into a `VkPhysicalDeviceFeatures2` chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) struct ChainLinks {
    pub vulkan12: bool,
    pub dynamic_rendering: bool,
    pub demote: bool,
    pub extensions: OptionalExtensions,
}

/// Unlinked storage for every feature structure this crate reads or writes.
///
/// The structures are only chained together for the duration of
/// [`FeatureChain::with_linked`], so the storage can be moved freely.
#[derive(Default)]
pub(crate) struct FeatureChain<'a> {
    core: vk::PhysicalDeviceFeatures,
    vulkan11: vk::PhysicalDeviceVulkan11Features<'a>,
    vulkan12: vk::PhysicalDeviceVulkan12Features<'a>,
    dynamic_rendering: vk::PhysicalDeviceDynamicRenderingFeatures<'a>,
    demote: vk::PhysicalDeviceShaderDemoteToHelperInvocationFeatures<'a>,
    memory_priority: vk::PhysicalDeviceMemoryPriorityFeaturesEXT<'a>,
    pageable: vk::PhysicalDevicePageableDeviceLocalMemoryFeaturesEXT<'a>,
    pipeline_executable: vk::PhysicalDevicePipelineExecutablePropertiesFeaturesKHR<'a>,
}

impl FeatureChain<'_> {
    /// Chains the structures selected by `links` behind a
    /// `VkPhysicalDeviceFeatures2`, hands it to `f` and unlinks again.
    pub(crate) fn with_linked<R>(
        &mut self,
        links: ChainLinks,
        f: impl FnOnce(&mut vk::PhysicalDeviceFeatures2<'_>) -> R,
    ) -> R {
        let mut features2 = vk::PhysicalDeviceFeatures2::default().features(self.core);
        if links.vulkan12 {
            features2 = features2
                .push_next(&mut self.vulkan11)
                .push_next(&mut self.vulkan12);
        }
        if links.dynamic_rendering {
            features2 = features2.push_next(&mut self.dynamic_rendering);
        }
        if links.demote {
            features2 = features2.push_next(&mut self.demote);
        }
        if links.extensions.contains(OptionalExtensions::MEMORY_PRIORITY) {
            features2 = features2.push_next(&mut self.memory_priority);
        }
        if links
            .extensions
            .contains(OptionalExtensions::PAGEABLE_DEVICE_LOCAL_MEMORY)
        {
            features2 = features2.push_next(&mut self.pageable);
        }
        if links
            .extensions
            .contains(OptionalExtensions::PIPELINE_EXECUTABLE_PROPERTIES)
        {
            features2 = features2.push_next(&mut self.pipeline_executable);
        }

        let result = f(&mut features2);
        let core = features2.features;
        self.core = core;
        self.unlink();
        result
    }

    fn unlink(&mut self) {
        self.vulkan11.p_next = ptr::null_mut();
        self.vulkan12.p_next = ptr::null_mut();
        self.dynamic_rendering.p_next = ptr::null_mut();
        self.demote.p_next = ptr::null_mut();
        self.memory_priority.p_next = ptr::null_mut();
        self.pageable.p_next = ptr::null_mut();
        self.pipeline_executable.p_next = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_then_report_is_identity() {
        let wanted = DeviceFeatures::DESCRIPTOR_INDEXING_BUNDLE
            | DeviceFeatures::DEPTH_CLAMP
            | DeviceFeatures::MEMORY_PRIORITY;
        let mut chain = FeatureChain::default();
        chain.enable(wanted);
        assert_eq!(chain.reported(), wanted);
    }

    #[test]
    fn enable_is_additive() {
        let mut chain = FeatureChain::default();
        chain.enable(DeviceFeatures::SAMPLER_ANISOTROPY);
        chain.enable(DeviceFeatures::SCALAR_BLOCK_LAYOUT);
        chain.enable(DeviceFeatures::empty());
        assert_eq!(
            chain.reported(),
            DeviceFeatures::SAMPLER_ANISOTROPY | DeviceFeatures::SCALAR_BLOCK_LAYOUT
        );
    }

    #[test]
    fn linking_leaves_no_dangling_pointers() {
        let mut chain = FeatureChain::default();
        chain.enable(DeviceFeatures::SHADER_DRAW_PARAMETERS | DeviceFeatures::SAMPLER_ANISOTROPY);
        let links = ChainLinks {
            vulkan12: true,
            dynamic_rendering: true,
            demote: true,
            extensions: OptionalExtensions::all(),
        };
        let linked = chain.with_linked(links, |features2| {
            assert_eq!(features2.features.sampler_anisotropy, vk::TRUE);
            !features2.p_next.is_null()
        });
        assert!(linked);
        assert!(chain.vulkan11.p_next.is_null());
        assert!(chain.pipeline_executable.p_next.is_null());
        assert!(chain.reported().contains(DeviceFeatures::SHADER_DRAW_PARAMETERS));
    }

    #[test]
    fn optional_extension_detection() {
        let present = [ash::ext::memory_budget::NAME, ash::amd::buffer_marker::NAME];
        let detected = OptionalExtensions::detect(|name| present.iter().any(|p| *p == name));
        assert_eq!(
            detected,
            OptionalExtensions::MEMORY_BUDGET | OptionalExtensions::BUFFER_MARKER
        );
        assert_eq!(detected.extension_names().len(), 2);
    }
}
