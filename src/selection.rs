//! Physical device selection.
//!
//! Every adapter is run through [`MANDATORY_GATES`], a declarative table of
//! requirements. A gate either rejects the adapter or contributes the
//! features that must be force-enabled on the outgoing device request.
use crate::{catalog::CapabilityRecord, features::DeviceFeatures, DeviceCreationError, DeviceSmallVec};
use ash::vk;
use std::{ffi::CStr, fmt};

/// Lowest Vulkan version an adapter must support.
pub const MINIMUM_API_VERSION: u32 = vk::API_VERSION_1_2;

const PLATFORM_TEXTURE_COMPRESSION: DeviceFeatures = if cfg!(target_os = "android") {
    DeviceFeatures::TEXTURE_COMPRESSION_ETC2.union(DeviceFeatures::TEXTURE_COMPRESSION_ASTC_LDR)
} else {
    DeviceFeatures::TEXTURE_COMPRESSION_BC
};

const PLATFORM_DEPTH_CLAMP: DeviceFeatures = if cfg!(target_os = "android") {
    DeviceFeatures::empty()
} else {
    DeviceFeatures::DEPTH_CLAMP
};

/// Boolean device properties a gate can require.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PropertyRequirement {
    /// `VkPhysicalDeviceLimits::timestampComputeAndGraphics`
    TimestampComputeAndGraphics,
}

impl PropertyRequirement {
    /// Returns true if `properties` satisfy the requirement.
    #[inline]
    pub fn holds(self, properties: &vk::PhysicalDeviceProperties) -> bool {
        match self {
            PropertyRequirement::TimestampComputeAndGraphics => {
                properties.limits.timestamp_compute_and_graphics == vk::TRUE
            }
        }
    }
}

/// What a [`Gate`] checks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// The usable API version of the adapter is at least this.
    ApiVersion(u32),
    /// A boolean device property holds.
    Property(PropertyRequirement),
    /// The extension is advertised, or was promoted to core in a version the
    /// adapter supports.
    Extension {
        /// Extension name.
        name: &'static CStr,
        /// Core version the extension was promoted in.
        promoted_in: Option<u32>,
    },
    /// The extension is advertised. Only checked when a window system was
    /// supplied.
    PresentationExtension(&'static CStr),
    /// Every feature is reported.
    Features(DeviceFeatures),
}

/// One mandatory device requirement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Gate {
    /// The check.
    pub requirement: Requirement,
    /// Features force-enabled on the device request once the gate passes.
    pub enables: DeviceFeatures,
    /// Diagnostic reported when the gate fails.
    pub failure: &'static str,
}

impl Gate {
    const fn features(features: DeviceFeatures, failure: &'static str) -> Gate {
        Gate {
            requirement: Requirement::Features(features),
            enables: features,
            failure,
        }
    }

    /// Returns true if `record` passes this gate.
    pub fn holds(&self, record: &CapabilityRecord) -> bool {
        match self.requirement {
            Requirement::ApiVersion(version) => record.usable_api_version() >= version,
            Requirement::Property(property) => property.holds(&record.properties),
            Requirement::Extension { name, promoted_in } => {
                record.supports_extension_or_core(name, promoted_in)
            }
            Requirement::PresentationExtension(name) => {
                !record.presentation_required || record.supports_extension(name)
            }
            Requirement::Features(features) => record.features.contains(features),
        }
    }
}

/// Mandatory requirements, in evaluation order.
pub static MANDATORY_GATES: &[Gate] = &[
    Gate {
        requirement: Requirement::ApiVersion(MINIMUM_API_VERSION),
        enables: DeviceFeatures::empty(),
        failure: "Vulkan 1.2 is not supported",
    },
    Gate {
        requirement: Requirement::Property(PropertyRequirement::TimestampComputeAndGraphics),
        enables: DeviceFeatures::empty(),
        failure: "timestamps are not supported on graphics and compute queues",
    },
    Gate {
        requirement: Requirement::PresentationExtension(ash::khr::swapchain::NAME),
        enables: DeviceFeatures::empty(),
        failure: "VK_KHR_swapchain is not supported",
    },
    Gate::features(
        DeviceFeatures::SCALAR_BLOCK_LAYOUT,
        "scalarBlockLayout is not supported",
    ),
    Gate {
        requirement: Requirement::Extension {
            name: ash::ext::shader_demote_to_helper_invocation::NAME,
            promoted_in: Some(vk::API_VERSION_1_3),
        },
        enables: DeviceFeatures::SHADER_DEMOTE_TO_HELPER_INVOCATION,
        failure: "VK_EXT_shader_demote_to_helper_invocation is not supported",
    },
    Gate {
        requirement: Requirement::Extension {
            name: ash::khr::shader_non_semantic_info::NAME,
            promoted_in: Some(vk::API_VERSION_1_3),
        },
        enables: DeviceFeatures::empty(),
        failure: "VK_KHR_shader_non_semantic_info is not supported",
    },
    Gate {
        requirement: Requirement::Extension {
            name: ash::khr::dynamic_rendering::NAME,
            promoted_in: Some(vk::API_VERSION_1_3),
        },
        enables: DeviceFeatures::DYNAMIC_RENDERING,
        failure: "VK_KHR_dynamic_rendering is not supported",
    },
    Gate::features(
        DeviceFeatures::SAMPLER_ANISOTROPY,
        "samplerAnisotropy is not supported",
    ),
    Gate::features(
        PLATFORM_TEXTURE_COMPRESSION,
        "the platform's block texture compression is not supported",
    ),
    Gate::features(
        DeviceFeatures::FRAGMENT_STORES_AND_ATOMICS,
        "fragmentStoresAndAtomics is not supported",
    ),
    Gate::features(
        DeviceFeatures::SHADER_IMAGE_GATHER_EXTENDED,
        "shaderImageGatherExtended is not supported",
    ),
    Gate::features(PLATFORM_DEPTH_CLAMP, "depthClamp is not supported"),
    Gate::features(
        DeviceFeatures::MULTI_DRAW_INDIRECT.union(DeviceFeatures::DRAW_INDIRECT_FIRST_INSTANCE),
        "multiDrawIndirect or drawIndirectFirstInstance is not supported",
    ),
    Gate::features(
        DeviceFeatures::IMAGE_CUBE_ARRAY,
        "imageCubeArray is not supported",
    ),
    Gate::features(
        DeviceFeatures::SHADER_STORAGE_IMAGE_EXTENDED_FORMATS
            .union(DeviceFeatures::SHADER_STORAGE_IMAGE_READ_WITHOUT_FORMAT)
            .union(DeviceFeatures::SHADER_STORAGE_IMAGE_WRITE_WITHOUT_FORMAT),
        "extended or formatless storage image access is not supported",
    ),
    Gate::features(
        DeviceFeatures::SHADER_DRAW_PARAMETERS,
        "shaderDrawParameters is not supported",
    ),
    Gate::features(
        DeviceFeatures::DRAW_INDIRECT_COUNT,
        "drawIndirectCount is not supported",
    ),
    Gate {
        requirement: Requirement::Features(DeviceFeatures::DESCRIPTOR_INDEXING),
        enables: DeviceFeatures::DESCRIPTOR_INDEXING_BUNDLE,
        failure: "descriptorIndexing is not supported",
    },
];

/// Outcome of running one adapter through [`MANDATORY_GATES`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdapterAssessment {
    /// Whether every mandatory gate passed.
    pub is_supported: bool,
    /// Failure messages of every gate that did not pass.
    pub failed_gates: DeviceSmallVec<&'static str>,
    /// Features demanded by the gates that passed.
    pub required_features: DeviceFeatures,
}

impl AdapterAssessment {
    /// Evaluates every mandatory gate against `record`.
    pub fn evaluate(record: &CapabilityRecord) -> AdapterAssessment {
        let mut assessment = AdapterAssessment::default();
        for gate in MANDATORY_GATES {
            if gate.holds(record) {
                assessment.required_features |= gate.enables;
            } else {
                log::debug!("{} rejected: {}", record.device_name(), gate.failure);
                assessment.failed_gates.push(gate.failure);
            }
        }

        assessment.is_supported = assessment.failed_gates.is_empty();
        assessment
    }
}

/// Picks the adapter to create the device on from `candidates`, each record
/// paired with its assessment.
///
/// An explicit `unconditional` index wins as long as it is in range, even if
/// the adapter is unsupported. Otherwise the first supported adapter is
/// chosen, unless a later supported adapter is discrete and it is not.
pub fn select_adapter(
    candidates: &[(CapabilityRecord, AdapterAssessment)],
    unconditional: Option<usize>,
) -> Result<usize, DeviceCreationError> {
    if let Some(n) = unconditional {
        let (record, assessment) = candidates
            .get(n)
            .ok_or(DeviceCreationError::UnconditionalMissing)?;
        if !assessment.is_supported {
            log::warn!(
                "using unsupported adapter {n} ({}) by explicit request: {}",
                record.device_name(),
                assessment.failed_gates.join(", ")
            );
        }

        return Ok(n);
    }

    let is_discrete =
        |record: &CapabilityRecord| record.device_type() == vk::PhysicalDeviceType::DISCRETE_GPU;
    let mut best: Option<usize> = None;
    for (index, (record, assessment)) in candidates.iter().enumerate() {
        if !assessment.is_supported {
            continue;
        }

        match best {
            None => best = Some(index),
            Some(current) if is_discrete(record) && !is_discrete(&candidates[current].0) => {
                best = Some(index)
            }
            Some(_) => (),
        }
    }

    best.ok_or(DeviceCreationError::NoCompatibleDevice)
}

/// Driver version in canonical `major.minor.patch` form.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriverVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version. Always zero for vendors that only encode two parts.
    pub patch: u32,
}

impl DriverVersion {
    /// Create a driver version.
    #[inline]
    pub const fn new(major: u32, minor: u32, patch: u32) -> DriverVersion {
        DriverVersion {
            major,
            minor,
            patch,
        }
    }

    /// Decodes the vendor specific `driverVersion` packing.
    pub fn decode(driver_id: vk::DriverId, raw: u32) -> DriverVersion {
        match driver_id {
            vk::DriverId::NVIDIA_PROPRIETARY => {
                DriverVersion::new((raw >> 22) & 0x3ff, (raw >> 14) & 0xff, (raw >> 6) & 0xff)
            }
            vk::DriverId::INTEL_PROPRIETARY_WINDOWS => {
                DriverVersion::new(raw >> 14, raw & 0x3fff, 0)
            }
            _ => DriverVersion::new(
                vk::api_version_major(raw),
                vk::api_version_minor(raw),
                vk::api_version_patch(raw),
            ),
        }
    }

    /// Oldest known-good version for proprietary drivers this crate tracks.
    pub fn minimum_for(driver_id: vk::DriverId) -> Option<DriverVersion> {
        match driver_id {
            vk::DriverId::NVIDIA_PROPRIETARY => Some(DriverVersion::new(535, 0, 0)),
            vk::DriverId::AMD_PROPRIETARY => Some(DriverVersion::new(2, 0, 279)),
            vk::DriverId::INTEL_PROPRIETARY_WINDOWS => Some(DriverVersion::new(101, 2115, 0)),
            _ => None,
        }
    }
}

impl fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Returns true if `record` runs a tracked proprietary driver older than its
/// known-good minimum. Never rejects the adapter.
pub fn is_driver_outdated(record: &CapabilityRecord) -> bool {
    let Some(minimum) = DriverVersion::minimum_for(record.driver.id) else {
        return false;
    };

    let version = DriverVersion::decode(record.driver.id, record.driver.version);
    let outdated = version < minimum;
    if outdated {
        log::warn!(
            "{} runs driver {version} ({}), older than the recommended {minimum}",
            record.device_name(),
            record.driver.name
        );
    }

    outdated
}
