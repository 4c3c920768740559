//! Device creation utils.
use crate::{
    allocation::AllocationTracker,
    capabilities::CapabilitySummary,
    catalog::{CapabilityCatalog, DriverInfo, PresentationSupport, SurfacePresentation},
    features::FeatureChain,
    negotiation::{negotiate, DeviceRequest, OptionalFeaturePolicy},
    queue::{QueueFamilyIndices, QueueLocation, QueuePlan, QueueSetup},
    selection::{is_driver_outdated, select_adapter, AdapterAssessment, MINIMUM_API_VERSION},
    transfer::{vulkan::VulkanTransfer, TransferBatchPool, TransferError},
};
use ash::prelude::VkResult;
use ash::{vk, Device, Instance};
use parking_lot::{Mutex, MutexGuard};
use std::{
    borrow::Cow,
    ffi::{c_char, CStr},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;

/// Default number of transfer batches.
pub const DEFAULT_TRANSFER_BATCH_COUNT: usize = 16;

/// Errors that can occur during device creation.
#[derive(Debug, Error)]
pub enum DeviceCreationError {
    /// Vulkan Error.
    #[error("vulkan error: {0}")]
    Vulkan(vk::Result),
    /// The host or device ran out of memory.
    #[error("out of memory")]
    OutOfMemory,
    /// There is no physical device at the index specified by [`DeviceBuilder::select_nth_unconditionally`].
    #[error("no physical device at specified index")]
    UnconditionalMissing,
    /// No physical device passed every mandatory requirement.
    #[error("no compatible physical device")]
    NoCompatibleDevice,
    /// The selected physical device has no queue family for graphics and
    /// compute work.
    #[error("no usable queue family")]
    NoUsableQueueFamily,
    /// The selected physical device or the instance is too old.
    #[error("{adapter} is unsupported: {reason}")]
    Unsupported {
        /// Name of the physical device.
        adapter: String,
        /// Why it can't be used.
        reason: String,
    },
    /// Creating the transfer batches failed.
    #[error("transfer pool creation failed")]
    TransferPool(#[from] TransferError),
}

impl From<vk::Result> for DeviceCreationError {
    fn from(err: vk::Result) -> Self {
        match err {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                DeviceCreationError::OutOfMemory
            }
            err => DeviceCreationError::Vulkan(err),
        }
    }
}

/// Callback invoked once when the device is lost.
pub type DeviceLostFn = dyn FnOnce() + Send;

/// Records device loss. The first report logs and runs the callback, later
/// reports are no-ops.
pub struct DeviceLossHandler {
    lost: AtomicBool,
    callback: Mutex<Option<Box<DeviceLostFn>>>,
}

impl DeviceLossHandler {
    /// Create a handler with an optional callback.
    pub fn new(callback: Option<Box<DeviceLostFn>>) -> Self {
        DeviceLossHandler {
            lost: AtomicBool::new(false),
            callback: Mutex::new(callback),
        }
    }

    /// Reports that the device was lost.
    pub fn report(&self) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }

        log::error!("device lost");
        if let Some(callback) = self.callback.lock().take() {
            callback();
        }
    }

    /// Returns true once device loss was reported.
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DeviceLossHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLossHandler")
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

/// Queue handles of every role. Compute and transfer may alias graphics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Queues {
    /// Graphics and present queue.
    pub graphics: vk::Queue,
    /// Compute queue.
    pub compute: vk::Queue,
    /// Transfer queue.
    pub transfer: vk::Queue,
}

/// State shared by everything created from a [`LogicalDevice`]. Destroys
/// the device once the last reference is dropped.
pub struct DeviceShared {
    device: Device,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    driver: DriverInfo,
    old_driver: bool,
    queues: Queues,
    plan: QueuePlan,
    request: DeviceRequest,
    summary: CapabilitySummary,
    submit_lock: Mutex<()>,
    loss: DeviceLossHandler,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    allocation: Option<Arc<AllocationTracker>>,
}

impl DeviceShared {
    /// The device loader.
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The physical device this device belongs to.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Properties of the physical device.
    #[inline]
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Name of the physical device.
    #[inline]
    pub fn device_name(&self) -> Cow<'_, str> {
        self.properties
            .device_name_as_c_str()
            .map(CStr::to_string_lossy)
            .unwrap_or(Cow::Borrowed("<unnamed>"))
    }

    /// Driver identity.
    #[inline]
    pub fn driver(&self) -> &DriverInfo {
        &self.driver
    }

    /// Returns true if the driver is older than the recommended minimum.
    #[inline]
    pub fn is_driver_outdated(&self) -> bool {
        self.old_driver
    }

    /// Queue handles.
    #[inline]
    pub fn queues(&self) -> Queues {
        self.queues
    }

    /// Queue family of every role.
    #[inline]
    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.plan.family_indices()
    }

    /// The queue plan the device was created with.
    #[inline]
    pub fn queue_plan(&self) -> &QueuePlan {
        &self.plan
    }

    /// The queue setups which are in use.
    #[inline]
    pub fn queue_setups(&self) -> &[QueueSetup] {
        &self.plan.queue_setups
    }

    /// Enabled features and extensions.
    #[inline]
    pub fn request(&self) -> &DeviceRequest {
        &self.request
    }

    /// Returns true if `extension` is enabled.
    #[inline]
    pub fn is_extension_enabled(&self, extension: &CStr) -> bool {
        self.request.is_extension_enabled(extension)
    }

    /// Derived formats, memory classes and limits.
    #[inline]
    pub fn summary(&self) -> &CapabilitySummary {
        &self.summary
    }

    /// Device loss bookkeeping.
    #[inline]
    pub fn loss_handler(&self) -> &DeviceLossHandler {
        &self.loss
    }

    /// `VK_EXT_debug_utils` device functions, if debug labels are enabled.
    #[inline]
    pub fn debug_utils(&self) -> Option<&ash::ext::debug_utils::Device> {
        self.debug_utils.as_ref()
    }

    /// The allocation tracker, if allocations are tracked.
    #[inline]
    pub fn allocation_tracker(&self) -> Option<&Arc<AllocationTracker>> {
        self.allocation.as_ref()
    }

    /// Allocation callbacks to pass to every object creation and
    /// destruction on this device.
    #[inline]
    pub fn allocation_callbacks(&self) -> Option<vk::AllocationCallbacks<'_>> {
        self.allocation.as_deref().map(AllocationTracker::callbacks)
    }

    /// Locks the device wide queue submission path. Hold it for every
    /// `vkQueueSubmit` and `vkQueuePresentKHR` on this device.
    #[inline]
    pub fn submit_lock(&self) -> MutexGuard<'_, ()> {
        self.submit_lock.lock()
    }

    /// Submits under the submission lock and reports device loss.
    ///
    /// # Safety
    /// `submits` and `fence` must be valid for `queue` of this device.
    pub unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let result = {
            let _guard = self.submit_lock();
            self.device.queue_submit(queue, submits, fence)
        };
        if result == Err(vk::Result::ERROR_DEVICE_LOST) {
            self.loss.report();
        }

        result
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        let callbacks = self.allocation_callbacks();
        unsafe { self.device.destroy_device(callbacks.as_ref()) };
    }
}

impl fmt::Debug for DeviceShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceShared")
            .field("device", &self.device.handle())
            .field("name", &self.device_name())
            .field("queues", &self.queues)
            .field("queue_families", &self.queue_families())
            .field("old_driver", &self.old_driver)
            .field("loss", &self.loss)
            .finish_non_exhaustive()
    }
}

/// A created device together with its transfer batch pool.
pub struct LogicalDevice {
    // the pool is destroyed before the last `DeviceShared` reference
    transfer: TransferBatchPool<VulkanTransfer>,
    shared: Arc<DeviceShared>,
}

impl LogicalDevice {
    /// State shared with everything created from this device.
    #[inline]
    pub fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// The device loader.
    #[inline]
    pub fn device(&self) -> &Device {
        self.shared.device()
    }

    /// The transfer batch pool.
    #[inline]
    pub fn transfer(&self) -> &TransferBatchPool<VulkanTransfer> {
        &self.transfer
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.shared.device().device_wait_idle() {
                log::warn!("waiting for device idle before teardown failed: {err}");
            }
            self.transfer.destroy();
        }
    }
}

impl fmt::Debug for LogicalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalDevice")
            .field("shared", &self.shared)
            .field("transfer", &self.transfer)
            .finish()
    }
}

/// Selects a physical device, negotiates its features and creates the
/// logical device, its queues and transfer batches.
pub struct DeviceBuilder<'a> {
    presentation: Option<Box<dyn PresentationSupport + 'a>>,
    unconditional_nth: Option<usize>,
    policy: OptionalFeaturePolicy,
    transfer_batch_count: usize,
    track_allocations: bool,
    debug_labels: bool,
    on_device_lost: Option<Box<DeviceLostFn>>,
}

impl<'a> DeviceBuilder<'a> {
    /// Create a new device builder.
    #[inline]
    pub fn new() -> Self {
        DeviceBuilder {
            presentation: None,
            unconditional_nth: None,
            policy: OptionalFeaturePolicy::default(),
            transfer_batch_count: DEFAULT_TRANSFER_BATCH_COUNT,
            track_allocations: false,
            debug_labels: false,
            on_device_lost: None,
        }
    }

    /// Surface to use to check for presentation support in queue families.
    /// Also requires `VK_KHR_swapchain`.
    #[inline]
    pub fn for_surface(self, loader: ash::khr::surface::Instance, surface: vk::SurfaceKHR) -> Self {
        self.presentation(SurfacePresentation::new(loader, surface))
    }

    /// Custom window system presentation query. Without one, every queue
    /// family counts as able to present and `VK_KHR_swapchain` is not
    /// required.
    #[inline]
    pub fn presentation(mut self, presentation: impl PresentationSupport + 'a) -> Self {
        self.presentation = Some(Box::new(presentation));
        self
    }

    /// Skip the selection logic and always select the physical device at the
    /// specified index.
    #[inline]
    pub fn select_nth_unconditionally(mut self, n: usize) -> Self {
        self.unconditional_nth = Some(n);
        self
    }

    /// Which optional features may be enabled.
    #[inline]
    pub fn optional_features(mut self, policy: OptionalFeaturePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Number of transfer batches. Clamped to at least one.
    #[inline]
    pub fn transfer_batch_count(mut self, count: usize) -> Self {
        self.transfer_batch_count = count.max(1);
        self
    }

    /// Count host allocations of the device through an [`AllocationTracker`].
    #[inline]
    pub fn track_allocations(mut self, track: bool) -> Self {
        self.track_allocations = track;
        self
    }

    /// Name transfer command buffers and wrap them in debug label regions.
    /// The instance must have `VK_EXT_debug_utils` enabled.
    #[inline]
    pub fn debug_labels(mut self, enabled: bool) -> Self {
        self.debug_labels = enabled;
        self
    }

    /// Called once when device loss is first detected.
    #[inline]
    pub fn on_device_lost(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_device_lost = Some(Box::new(callback));
        self
    }

    /// Creates the device. On failure everything created so far is destroyed
    /// again.
    ///
    /// # Safety
    /// `instance` must have been created with `instance_api_version` and must
    /// outlive the returned device.
    pub unsafe fn build(
        self,
        instance: &Instance,
        instance_api_version: u32,
    ) -> Result<LogicalDevice, DeviceCreationError> {
        let mut candidates: Vec<_> = CapabilityCatalog::new(instance_api_version)
            .presentation(self.presentation.as_deref())
            .build(instance)?
            .into_iter()
            .map(|record| {
                let assessment = AdapterAssessment::evaluate(&record);
                (record, assessment)
            })
            .collect();
        let selected = select_adapter(&candidates, self.unconditional_nth)?;
        let (record, assessment) = candidates.swap_remove(selected);

        let version = |version: u32| {
            format!(
                "{}.{}",
                vk::api_version_major(version),
                vk::api_version_minor(version)
            )
        };
        for (api_version, what) in [
            (instance_api_version, "instance"),
            (record.api_version(), "device"),
        ] {
            if api_version < MINIMUM_API_VERSION {
                return Err(DeviceCreationError::Unsupported {
                    adapter: record.device_name().into_owned(),
                    reason: format!(
                        "{what} supports Vulkan {}, {} is required",
                        version(api_version),
                        version(MINIMUM_API_VERSION)
                    ),
                });
            }
        }

        log::info!(
            "selected {} ({:?}), Vulkan {}, driver {} {}",
            record.device_name(),
            record.device_type(),
            version(record.api_version()),
            record.driver.name,
            record.driver.info
        );
        let old_driver = is_driver_outdated(&record);
        let request = negotiate(&record, &assessment, &self.policy);
        let plan = QueuePlan::new(&record.queue_families)?;

        let allocation = self
            .track_allocations
            .then(|| Arc::new(AllocationTracker::new()));

        let device = {
            let callbacks = allocation.as_deref().map(AllocationTracker::callbacks);
            let queue_create_infos = plan.queue_create_infos();
            let extension_names: Vec<*const c_char> =
                request.extensions.iter().map(|name| name.as_ptr()).collect();
            let mut chain = FeatureChain::default();
            chain.enable(request.features);
            chain.with_linked(request.links, |features2| {
                let create_info = vk::DeviceCreateInfo::default()
                    .queue_create_infos(&queue_create_infos)
                    .enabled_extension_names(&extension_names)
                    .push_next(features2);
                instance.create_device(record.physical_device, &create_info, callbacks.as_ref())
            })?
        };

        let queue = |location: QueueLocation| {
            device.get_device_queue(location.family, location.index)
        };
        let queues = Queues {
            graphics: queue(plan.graphics),
            compute: queue(plan.compute),
            transfer: queue(plan.transfer),
        };
        let debug_utils = self
            .debug_labels
            .then(|| ash::ext::debug_utils::Device::new(instance, &device));
        let summary =
            CapabilitySummary::query(instance, record.physical_device, &record.properties);

        let shared = Arc::new(DeviceShared {
            device,
            physical_device: record.physical_device,
            properties: record.properties,
            driver: record.driver,
            old_driver,
            queues,
            plan,
            request,
            summary,
            submit_lock: Mutex::new(()),
            loss: DeviceLossHandler::new(self.on_device_lost),
            debug_utils,
            allocation,
        });

        // dropping `shared` on failure destroys the device
        let transfer =
            TransferBatchPool::new(VulkanTransfer::new(Arc::clone(&shared)), self.transfer_batch_count)?;

        Ok(LogicalDevice { transfer, shared })
    }
}

impl Default for DeviceBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn loss_is_reported_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = DeviceLossHandler::new(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })));
        assert!(!handler.is_lost());

        handler.report();
        handler.report();
        assert!(handler.is_lost());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn loss_without_callback() {
        let handler = DeviceLossHandler::new(None);
        handler.report();
        assert!(handler.is_lost());
    }

    #[test]
    fn out_of_memory_is_its_own_error() {
        assert!(matches!(
            DeviceCreationError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            DeviceCreationError::OutOfMemory
        ));
        assert!(matches!(
            DeviceCreationError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            DeviceCreationError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }

    #[test]
    fn batch_count_is_at_least_one() {
        let builder = DeviceBuilder::new();
        assert_eq!(builder.transfer_batch_count, DEFAULT_TRANSFER_BATCH_COUNT);
        assert_eq!(builder.transfer_batch_count(0).transfer_batch_count, 1);
    }
}
