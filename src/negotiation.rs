//! Feature negotiation for the selected adapter.
use crate::{
    catalog::CapabilityRecord,
    features::{ChainLinks, DeviceFeatures, OptionalExtensions},
    selection::{AdapterAssessment, Requirement, MANDATORY_GATES},
};
use ash::vk;
use std::ffi::CStr;

/// Which optional features may be enabled when the adapter supports them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OptionalFeaturePolicy {
    /// `VK_EXT_memory_priority`.
    pub memory_priority: bool,
    /// `VK_EXT_pageable_device_local_memory`. Also needs `memory_priority`.
    pub pageable_device_local_memory: bool,
    /// `VK_NV_device_diagnostic_checkpoints` or `VK_AMD_buffer_marker`.
    pub diagnostic_checkpoints: bool,
    /// `VK_KHR_pipeline_executable_properties`.
    pub pipeline_executable_info: bool,
    /// `VK_EXT_memory_budget`.
    pub memory_budget: bool,
    /// 16-bit shader arithmetic and storage for the half precision upscaler.
    pub half_precision: bool,
}

impl OptionalFeaturePolicy {
    /// Permit no optional feature.
    #[inline]
    pub fn none() -> OptionalFeaturePolicy {
        OptionalFeaturePolicy {
            memory_priority: false,
            pageable_device_local_memory: false,
            diagnostic_checkpoints: false,
            pipeline_executable_info: false,
            memory_budget: false,
            half_precision: false,
        }
    }
}

impl Default for OptionalFeaturePolicy {
    fn default() -> Self {
        OptionalFeaturePolicy {
            memory_priority: true,
            pageable_device_local_memory: true,
            diagnostic_checkpoints: true,
            pipeline_executable_info: true,
            memory_budget: true,
            half_precision: true,
        }
    }
}

/// Everything needed to create the logical device, minus queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    /// Features to enable.
    pub features: DeviceFeatures,
    /// Extensions to enable.
    pub extensions: Vec<&'static CStr>,
    /// Optional extensions among `extensions`.
    pub optional_extensions: OptionalExtensions,
    pub(crate) links: ChainLinks,
}

impl DeviceRequest {
    /// Returns true if `extension` will be enabled.
    #[inline]
    pub fn is_extension_enabled(&self, extension: &CStr) -> bool {
        self.extensions.iter().any(|e| *e == extension)
    }
}

/// Builds the device request for `record`: every feature its passed gates
/// demand, plus each optional feature that is both present and permitted.
pub fn negotiate(
    record: &CapabilityRecord,
    assessment: &AdapterAssessment,
    policy: &OptionalFeaturePolicy,
) -> DeviceRequest {
    let mut features = assessment.required_features;
    let mut extensions = Vec::new();

    for gate in MANDATORY_GATES {
        let name = match gate.requirement {
            Requirement::Extension { name, .. } => name,
            Requirement::PresentationExtension(name) if record.presentation_required => name,
            _ => continue,
        };
        // promoted extensions are implied by the core version
        if record.supports_extension(name) {
            extensions.push(name);
        }
    }

    let present = record.optional_extensions;
    let mut optional = OptionalExtensions::empty();
    let mut offer = |permitted: bool, extension: OptionalExtensions, feature: DeviceFeatures| {
        if permitted && present.contains(extension) && record.features.contains(feature) {
            optional |= extension;
            features |= feature;
            true
        } else {
            false
        }
    };

    let memory_priority = offer(
        policy.memory_priority,
        OptionalExtensions::MEMORY_PRIORITY,
        DeviceFeatures::MEMORY_PRIORITY,
    );
    offer(
        policy.pageable_device_local_memory && memory_priority,
        OptionalExtensions::PAGEABLE_DEVICE_LOCAL_MEMORY,
        DeviceFeatures::PAGEABLE_DEVICE_LOCAL_MEMORY,
    );
    offer(
        policy.pipeline_executable_info,
        OptionalExtensions::PIPELINE_EXECUTABLE_PROPERTIES,
        DeviceFeatures::PIPELINE_EXECUTABLE_INFO,
    );
    offer(
        policy.memory_budget,
        OptionalExtensions::MEMORY_BUDGET,
        DeviceFeatures::empty(),
    );
    if !offer(
        policy.diagnostic_checkpoints,
        OptionalExtensions::DIAGNOSTIC_CHECKPOINTS,
        DeviceFeatures::empty(),
    ) {
        offer(
            policy.diagnostic_checkpoints,
            OptionalExtensions::BUFFER_MARKER,
            DeviceFeatures::empty(),
        );
    }

    let extended = record.usable_api_version() >= vk::API_VERSION_1_2;
    if policy.half_precision
        && extended
        && record.features.contains(DeviceFeatures::HALF_PRECISION)
    {
        features |= DeviceFeatures::HALF_PRECISION;
    }

    extensions.extend(optional.extension_names());
    for extension in &extensions {
        log::debug!("enabling {}", extension.to_string_lossy());
    }

    DeviceRequest {
        features,
        extensions,
        optional_extensions: optional,
        links: ChainLinks {
            vulkan12: extended,
            dynamic_rendering: features.contains(DeviceFeatures::DYNAMIC_RENDERING),
            demote: features.contains(DeviceFeatures::SHADER_DEMOTE_TO_HELPER_INVOCATION),
            extensions: optional,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::capable_record;

    fn negotiate_with(record: &CapabilityRecord, policy: OptionalFeaturePolicy) -> DeviceRequest {
        let assessment = AdapterAssessment::evaluate(record);
        negotiate(record, &assessment, &policy)
    }

    #[test]
    fn mandatory_only() {
        let record = capable_record(vk::PhysicalDeviceType::DISCRETE_GPU);
        let request = negotiate_with(&record, OptionalFeaturePolicy::none());
        assert_eq!(
            request.features,
            AdapterAssessment::evaluate(&record).required_features
        );
        assert!(request.optional_extensions.is_empty());
        assert!(request.is_extension_enabled(ash::khr::swapchain::NAME));
        assert!(request.is_extension_enabled(ash::khr::dynamic_rendering::NAME));
        assert!(!request.is_extension_enabled(ash::ext::memory_budget::NAME));
        assert!(request.links.dynamic_rendering && request.links.demote);
    }

    #[test]
    fn optional_features_need_presence_and_permission() {
        let record = capable_record(vk::PhysicalDeviceType::DISCRETE_GPU);
        let request = negotiate_with(&record, OptionalFeaturePolicy::default());
        assert_eq!(
            request.optional_extensions,
            OptionalExtensions::MEMORY_PRIORITY | OptionalExtensions::MEMORY_BUDGET
        );
        assert!(request.features.contains(DeviceFeatures::MEMORY_PRIORITY));
        assert!(request.features.contains(DeviceFeatures::HALF_PRECISION));
        assert!(!request.features.contains(DeviceFeatures::PIPELINE_EXECUTABLE_INFO));
        assert!(request.is_extension_enabled(ash::ext::memory_priority::NAME));
        assert!(!request.is_extension_enabled(ash::ext::pageable_device_local_memory::NAME));
    }

    #[test]
    fn pageable_memory_depends_on_priority() {
        let mut record = capable_record(vk::PhysicalDeviceType::DISCRETE_GPU);
        record.optional_extensions |= OptionalExtensions::PAGEABLE_DEVICE_LOCAL_MEMORY;
        record.features |= DeviceFeatures::PAGEABLE_DEVICE_LOCAL_MEMORY;

        let request = negotiate_with(&record, OptionalFeaturePolicy::default());
        assert!(request
            .optional_extensions
            .contains(OptionalExtensions::PAGEABLE_DEVICE_LOCAL_MEMORY));

        let policy = OptionalFeaturePolicy {
            memory_priority: false,
            ..OptionalFeaturePolicy::default()
        };
        let request = negotiate_with(&record, policy);
        assert!(!request
            .optional_extensions
            .intersects(OptionalExtensions::MEMORY_PRIORITY | OptionalExtensions::PAGEABLE_DEVICE_LOCAL_MEMORY));
    }

    #[test]
    fn checkpoints_prefer_nvidia_then_amd() {
        let mut record = capable_record(vk::PhysicalDeviceType::DISCRETE_GPU);
        record.optional_extensions |=
            OptionalExtensions::DIAGNOSTIC_CHECKPOINTS | OptionalExtensions::BUFFER_MARKER;
        let request = negotiate_with(&record, OptionalFeaturePolicy::default());
        assert!(request
            .optional_extensions
            .contains(OptionalExtensions::DIAGNOSTIC_CHECKPOINTS));
        assert!(!request
            .optional_extensions
            .contains(OptionalExtensions::BUFFER_MARKER));

        record
            .optional_extensions
            .remove(OptionalExtensions::DIAGNOSTIC_CHECKPOINTS);
        let request = negotiate_with(&record, OptionalFeaturePolicy::default());
        assert!(request
            .optional_extensions
            .contains(OptionalExtensions::BUFFER_MARKER));
    }

    #[test]
    fn half_precision_requires_full_support() {
        let mut record = capable_record(vk::PhysicalDeviceType::DISCRETE_GPU);
        record.features.remove(DeviceFeatures::SHADER_INT16);
        let request = negotiate_with(&record, OptionalFeaturePolicy::default());
        assert!(!request.features.contains(DeviceFeatures::SHADER_FLOAT16));
    }

    #[test]
    fn promoted_extensions_not_requested_when_unadvertised() {
        let mut record = capable_record(vk::PhysicalDeviceType::DISCRETE_GPU);
        record
            .extensions
            .retain(|e| e.as_c_str() != ash::khr::dynamic_rendering::NAME);
        let request = negotiate_with(&record, OptionalFeaturePolicy::none());
        assert!(!request.is_extension_enabled(ash::khr::dynamic_rendering::NAME));
        assert!(request.features.contains(DeviceFeatures::DYNAMIC_RENDERING));
    }

    #[test]
    fn headless_never_requests_swapchain() {
        let mut record = capable_record(vk::PhysicalDeviceType::DISCRETE_GPU);
        record.presentation_required = false;
        let request = negotiate_with(&record, OptionalFeaturePolicy::none());
        assert!(!request.is_extension_enabled(ash::khr::swapchain::NAME));
    }
}
