//! Physical device enumeration and capability records.
use crate::features::{ChainLinks, DeviceFeatures, FeatureChain, OptionalExtensions};
use ash::prelude::VkResult;
use ash::{vk, Instance};
use std::{
    borrow::Cow,
    ffi::{CStr, CString},
    fmt,
};

/// Answers whether a queue family can present to the target window system.
pub trait PresentationSupport {
    /// Returns `true` if `queue_family_index` of `physical_device` can present.
    ///
    /// # Safety
    /// `physical_device` must belong to the instance the implementation was
    /// created from.
    unsafe fn supports_presentation(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> VkResult<bool>;
}

/// [`PresentationSupport`] backed by a `VkSurfaceKHR`.
pub struct SurfacePresentation {
    loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl SurfacePresentation {
    /// Query presentation support against `surface`.
    #[inline]
    pub fn new(loader: ash::khr::surface::Instance, surface: vk::SurfaceKHR) -> Self {
        SurfacePresentation { loader, surface }
    }

    /// The surface presentation is tested against.
    #[inline]
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }
}

impl PresentationSupport for SurfacePresentation {
    unsafe fn supports_presentation(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> VkResult<bool> {
        self.loader.get_physical_device_surface_support(
            physical_device,
            queue_family_index,
            self.surface,
        )
    }
}

/// Capabilities of one queue family.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    /// Index of the family on its physical device.
    pub index: u32,
    /// Operations supported by queues of this family.
    pub flags: vk::QueueFlags,
    /// Number of queues in the family.
    pub queue_count: u32,
    /// Whether the family can present to the target window system. Always
    /// `true` when no window system was supplied.
    pub supports_present: bool,
}

impl QueueFamilyInfo {
    /// Returns true if every flag in `flags` is supported.
    #[inline]
    pub fn supports(&self, flags: vk::QueueFlags) -> bool {
        self.flags.contains(flags)
    }
}

/// Driver identity as reported by `VkPhysicalDeviceVulkan12Properties`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    /// Driver identifier. Zero if the adapter predates Vulkan 1.2.
    pub id: vk::DriverId,
    /// Driver name.
    pub name: String,
    /// Free-form driver info, usually the marketing version.
    pub info: String,
    /// Vendor encoded `driverVersion`.
    pub version: u32,
}

/// Immutable description of one physical adapter.
#[derive(Clone)]
pub struct CapabilityRecord {
    /// The adapter handle.
    pub physical_device: vk::PhysicalDevice,
    /// Core properties and limits.
    pub properties: vk::PhysicalDeviceProperties,
    /// API version of the instance the record was queried through.
    pub instance_api_version: u32,
    /// Driver identity.
    pub driver: DriverInfo,
    /// Every queue family, in family index order.
    pub queue_families: Vec<QueueFamilyInfo>,
    /// Every advertised device extension.
    pub extensions: Vec<CString>,
    /// Reported device features.
    pub features: DeviceFeatures,
    /// Optional extensions present on the adapter.
    pub optional_extensions: OptionalExtensions,
    /// Whether a window system was supplied when this record was built.
    pub presentation_required: bool,
}

impl CapabilityRecord {
    /// Name of the physical device.
    #[inline]
    pub fn device_name(&self) -> Cow<'_, str> {
        self.properties
            .device_name_as_c_str()
            .map(CStr::to_string_lossy)
            .unwrap_or(Cow::Borrowed("<unnamed>"))
    }

    /// Type of the physical device.
    #[inline]
    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.properties.device_type
    }

    /// Highest Vulkan version the adapter supports.
    #[inline]
    pub fn api_version(&self) -> u32 {
        self.properties.api_version
    }

    /// Vulkan version usable on this adapter: the lower of the instance and
    /// adapter versions.
    #[inline]
    pub fn usable_api_version(&self) -> u32 {
        self.instance_api_version.min(self.api_version())
    }

    /// PCI vendor id.
    #[inline]
    pub fn vendor_id(&self) -> u32 {
        self.properties.vendor_id
    }

    /// Vendor specific device id.
    #[inline]
    pub fn device_id(&self) -> u32 {
        self.properties.device_id
    }

    /// Returns true if `extension` is advertised.
    #[inline]
    pub fn supports_extension(&self, extension: &CStr) -> bool {
        self.extensions.iter().any(|e| e.as_c_str() == extension)
    }

    /// Returns true if `extension` is advertised or was promoted to core in
    /// the usable version.
    #[inline]
    pub fn supports_extension_or_core(&self, extension: &CStr, promoted_in: Option<u32>) -> bool {
        promoted_in.is_some_and(|version| self.usable_api_version() >= version)
            || self.supports_extension(extension)
    }
}

impl fmt::Debug for CapabilityRecord {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CapabilityRecord")
            .field("name", &self.device_name())
            .field("type", &self.device_type())
            .field(
                "api_version",
                &format_args!(
                    "{}.{}",
                    vk::api_version_major(self.api_version()),
                    vk::api_version_minor(self.api_version())
                ),
            )
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id()))
            .field("device_id", &format_args!("{:#06x}", self.device_id()))
            .field("driver", &self.driver)
            .field("queue_families", &self.queue_families)
            .field("features", &self.features)
            .field("optional_extensions", &self.optional_extensions)
            .finish()
    }
}

/// Builds one [`CapabilityRecord`] per physical adapter.
pub struct CapabilityCatalog<'a> {
    instance_api_version: u32,
    presentation: Option<&'a dyn PresentationSupport>,
}

impl<'a> CapabilityCatalog<'a> {
    /// Create a catalog builder. `instance_api_version` is the API version
    /// the instance was created with; the extended property and feature
    /// queries are only issued when both it and the adapter reach 1.2.
    #[inline]
    pub fn new(instance_api_version: u32) -> Self {
        CapabilityCatalog {
            instance_api_version,
            presentation: None,
        }
    }

    /// Window system used to test presentation support. Without one every
    /// queue family is treated as able to present.
    #[inline]
    pub fn presentation(mut self, presentation: Option<&'a dyn PresentationSupport>) -> Self {
        self.presentation = presentation;
        self
    }

    /// Enumerates and queries every physical adapter.
    ///
    /// Fails only if enumeration fails or the host runs out of memory. An
    /// adapter whose individual queries fail is skipped.
    ///
    /// # Safety
    /// `instance` must be a valid instance created with at least
    /// `instance_api_version`.
    pub unsafe fn build(&self, instance: &Instance) -> VkResult<Vec<CapabilityRecord>> {
        let physical_devices = instance.enumerate_physical_devices()?;
        collect_records(
            physical_devices
                .into_iter()
                .map(|physical_device| self.query(instance, physical_device)),
        )
    }

    /// Describes the queue families of `physical_device`, asking the window
    /// system about presentation support if one was supplied.
    unsafe fn queue_families(
        &self,
        physical_device: vk::PhysicalDevice,
        families: &[vk::QueueFamilyProperties],
    ) -> VkResult<Vec<QueueFamilyInfo>> {
        let mut queue_families = Vec::with_capacity(families.len());
        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            let supports_present = match self.presentation {
                Some(presentation) => {
                    presentation.supports_presentation(physical_device, index)?
                }
                None => true,
            };

            queue_families.push(QueueFamilyInfo {
                index,
                flags: family.queue_flags,
                queue_count: family.queue_count,
                supports_present,
            });
        }

        Ok(queue_families)
    }

    unsafe fn query(
        &self,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<CapabilityRecord> {
        let properties = instance.get_physical_device_properties(physical_device);
        let extensions: Vec<CString> = instance
            .enumerate_device_extension_properties(physical_device)?
            .iter()
            .filter_map(|properties| properties.extension_name_as_c_str().ok())
            .map(CStr::to_owned)
            .collect();
        let is_present = |name: &CStr| extensions.iter().any(|e| e.as_c_str() == name);

        let usable_api_version = self.instance_api_version.min(properties.api_version);
        let extended = usable_api_version >= vk::API_VERSION_1_2;
        let core_1_3 = usable_api_version >= vk::API_VERSION_1_3;
        let optional_extensions = OptionalExtensions::detect(is_present);
        let mut driver = DriverInfo {
            id: vk::DriverId::from_raw(0),
            name: String::new(),
            info: String::new(),
            version: properties.driver_version,
        };

        let mut chain = FeatureChain::default();
        if extended {
            let mut vulkan12 = vk::PhysicalDeviceVulkan12Properties::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut vulkan12);
            instance.get_physical_device_properties2(physical_device, &mut properties2);
            driver.id = vulkan12.driver_id;
            driver.name = lossy(vulkan12.driver_name_as_c_str());
            driver.info = lossy(vulkan12.driver_info_as_c_str());

            let links = ChainLinks {
                vulkan12: true,
                dynamic_rendering: core_1_3 || is_present(ash::khr::dynamic_rendering::NAME),
                demote: core_1_3
                    || is_present(ash::ext::shader_demote_to_helper_invocation::NAME),
                extensions: optional_extensions,
            };
            chain.with_linked(links, |features2| {
                instance.get_physical_device_features2(physical_device, features2)
            });
        } else {
            chain.with_linked(ChainLinks::default(), |features2| {
                features2.features = instance.get_physical_device_features(physical_device);
            });
        }
        let features = chain.reported();

        let queue_families = self.queue_families(
            physical_device,
            &instance.get_physical_device_queue_family_properties(physical_device),
        )?;

        Ok(CapabilityRecord {
            physical_device,
            properties,
            instance_api_version: self.instance_api_version,
            driver,
            queue_families,
            extensions,
            features,
            optional_extensions,
            presentation_required: self.presentation.is_some(),
        })
    }
}

/// Keeps every successfully queried adapter. Running out of memory aborts
/// the whole catalog, any other per-adapter failure skips that adapter.
fn collect_records(
    queried: impl IntoIterator<Item = VkResult<CapabilityRecord>>,
) -> VkResult<Vec<CapabilityRecord>> {
    let mut records = Vec::new();
    for (index, record) in queried.into_iter().enumerate() {
        match record {
            Ok(record) => {
                log::debug!("adapter {index}: {record:?}");
                records.push(record);
            }
            Err(
                err @ (vk::Result::ERROR_OUT_OF_HOST_MEMORY
                | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            ) => return Err(err),
            Err(err) => {
                log::warn!("skipping adapter {index}, capability query failed: {err}");
            }
        }
    }

    Ok(records)
}

fn lossy(name: Result<&CStr, std::ffi::FromBytesUntilNulError>) -> String {
    name.map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a record for an adapter that passes every mandatory gate.
    pub(crate) fn capable_record(device_type: vk::PhysicalDeviceType) -> CapabilityRecord {
        let mut properties = vk::PhysicalDeviceProperties {
            api_version: vk::API_VERSION_1_3,
            device_type,
            vendor_id: 0x10de,
            device_id: 0x2684,
            ..Default::default()
        };
        properties.limits.timestamp_compute_and_graphics = vk::TRUE;
        for (dst, src) in properties.device_name.iter_mut().zip(b"Test Adapter\0") {
            *dst = *src as std::os::raw::c_char;
        }

        let extensions = [
            ash::khr::swapchain::NAME,
            ash::khr::shader_non_semantic_info::NAME,
            ash::ext::shader_demote_to_helper_invocation::NAME,
            ash::khr::dynamic_rendering::NAME,
            ash::ext::memory_priority::NAME,
            ash::ext::memory_budget::NAME,
        ]
        .into_iter()
        .map(CStr::to_owned)
        .collect();

        CapabilityRecord {
            physical_device: vk::PhysicalDevice::null(),
            properties,
            instance_api_version: vk::API_VERSION_1_3,
            driver: DriverInfo {
                id: vk::DriverId::MESA_RADV,
                name: "radv".to_owned(),
                info: "Mesa 24.0".to_owned(),
                version: vk::make_api_version(0, 24, 0, 0),
            },
            queue_families: vec![
                QueueFamilyInfo {
                    index: 0,
                    flags: vk::QueueFlags::GRAPHICS
                        | vk::QueueFlags::COMPUTE
                        | vk::QueueFlags::TRANSFER,
                    queue_count: 1,
                    supports_present: true,
                },
                QueueFamilyInfo {
                    index: 1,
                    flags: vk::QueueFlags::TRANSFER,
                    queue_count: 2,
                    supports_present: false,
                },
            ],
            extensions,
            features: DeviceFeatures::all()
                .difference(DeviceFeatures::PAGEABLE_DEVICE_LOCAL_MEMORY)
                .difference(DeviceFeatures::PIPELINE_EXECUTABLE_INFO),
            optional_extensions: OptionalExtensions::MEMORY_PRIORITY
                | OptionalExtensions::MEMORY_BUDGET,
            presentation_required: true,
        }
    }

    #[test]
    fn extension_lookup() {
        let record = capable_record(vk::PhysicalDeviceType::DISCRETE_GPU);
        assert!(record.supports_extension(ash::khr::swapchain::NAME));
        assert!(!record.supports_extension(ash::ext::pageable_device_local_memory::NAME));
        assert!(record.supports_extension_or_core(
            ash::ext::pageable_device_local_memory::NAME,
            Some(vk::API_VERSION_1_3)
        ));
        assert!(!record.supports_extension_or_core(
            ash::ext::pageable_device_local_memory::NAME,
            None
        ));
    }

    #[test]
    fn older_instance_caps_promoted_extensions() {
        let mut record = capable_record(vk::PhysicalDeviceType::DISCRETE_GPU);
        record.instance_api_version = vk::API_VERSION_1_2;
        assert_eq!(record.api_version(), vk::API_VERSION_1_3);
        assert_eq!(record.usable_api_version(), vk::API_VERSION_1_2);

        record
            .extensions
            .retain(|e| e.as_c_str() != ash::khr::dynamic_rendering::NAME);
        assert!(!record.supports_extension_or_core(
            ash::khr::dynamic_rendering::NAME,
            Some(vk::API_VERSION_1_3)
        ));

        record.instance_api_version = vk::API_VERSION_1_3;
        assert!(record.supports_extension_or_core(
            ash::khr::dynamic_rendering::NAME,
            Some(vk::API_VERSION_1_3)
        ));
    }

    struct FailingPresentation(vk::Result);

    impl PresentationSupport for FailingPresentation {
        unsafe fn supports_presentation(
            &self,
            _physical_device: vk::PhysicalDevice,
            queue_family_index: u32,
        ) -> VkResult<bool> {
            match queue_family_index {
                0 => Ok(true),
                _ => Err(self.0),
            }
        }
    }

    fn family_properties(count: usize) -> Vec<vk::QueueFamilyProperties> {
        vec![
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                queue_count: 1,
                ..Default::default()
            };
            count
        ]
    }

    #[test]
    fn failed_queries_skip_only_their_adapter() {
        let records = collect_records([
            Ok(capable_record(vk::PhysicalDeviceType::INTEGRATED_GPU)),
            Err(vk::Result::ERROR_INITIALIZATION_FAILED),
            Ok(capable_record(vk::PhysicalDeviceType::DISCRETE_GPU)),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR),
        ])
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].device_type(), vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert_eq!(records[1].device_type(), vk::PhysicalDeviceType::DISCRETE_GPU);

        assert!(collect_records(Vec::<VkResult<CapabilityRecord>>::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn out_of_memory_aborts_the_catalog() {
        for oom in [
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        ] {
            let mut queried = 0;
            let results = [
                Ok(capable_record(vk::PhysicalDeviceType::DISCRETE_GPU)),
                Err(oom),
                Ok(capable_record(vk::PhysicalDeviceType::DISCRETE_GPU)),
            ];
            let outcome = collect_records(results.into_iter().inspect(|_| queried += 1));
            assert_eq!(outcome.unwrap_err(), oom);
            assert_eq!(queried, 2);
        }
    }

    #[test]
    fn presentation_failure_skips_the_adapter() {
        let presentation = FailingPresentation(vk::Result::ERROR_SURFACE_LOST_KHR);
        let catalog =
            CapabilityCatalog::new(vk::API_VERSION_1_3).presentation(Some(&presentation));
        let failed =
            unsafe { catalog.queue_families(vk::PhysicalDevice::null(), &family_properties(2)) };
        assert_eq!(failed, Err(vk::Result::ERROR_SURFACE_LOST_KHR));

        let records = collect_records([
            failed.map(|_| capable_record(vk::PhysicalDeviceType::DISCRETE_GPU)),
            Ok(capable_record(vk::PhysicalDeviceType::INTEGRATED_GPU)),
        ])
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device_type(), vk::PhysicalDeviceType::INTEGRATED_GPU);

        let presentation = FailingPresentation(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let catalog =
            CapabilityCatalog::new(vk::API_VERSION_1_3).presentation(Some(&presentation));
        let failed =
            unsafe { catalog.queue_families(vk::PhysicalDevice::null(), &family_properties(2)) };
        assert!(collect_records([
            failed.map(|_| capable_record(vk::PhysicalDeviceType::DISCRETE_GPU))
        ])
        .is_err());
    }

    #[test]
    fn queue_families_without_window_system_all_present() {
        let catalog = CapabilityCatalog::new(vk::API_VERSION_1_3);
        let families =
            unsafe { catalog.queue_families(vk::PhysicalDevice::null(), &family_properties(3)) }
                .unwrap();
        assert_eq!(families.len(), 3);
        assert!(families.iter().all(|family| family.supports_present));
        assert_eq!(families[2].index, 2);

        let presentation = FailingPresentation(vk::Result::ERROR_SURFACE_LOST_KHR);
        let catalog =
            CapabilityCatalog::new(vk::API_VERSION_1_3).presentation(Some(&presentation));
        let families =
            unsafe { catalog.queue_families(vk::PhysicalDevice::null(), &family_properties(1)) }
                .unwrap();
        assert!(families[0].supports_present);
    }

    #[test]
    fn identity_accessors() {
        let record = capable_record(vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert_eq!(record.device_name(), "Test Adapter");
        assert_eq!(record.device_type(), vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert_eq!(record.vendor_id(), 0x10de);
        assert!(format!("{record:?}").contains("Test Adapter"));
    }
}
