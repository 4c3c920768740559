//! Vulkan implementation of [`TransferBackend`].
use super::{TransferBackend, TransferError, TransferFragment};
use crate::{device::DeviceShared, queue::QueueFamilyIndices};
use ash::vk;
use std::{ffi::CString, sync::Arc, time::Duration};

/// Transfer batches backed by a transient command pool, one primary command
/// buffer and a fence each, submitted to the transfer queue.
pub struct VulkanTransfer {
    shared: Arc<DeviceShared>,
}

/// Device objects of one transfer batch.
#[derive(Debug)]
pub struct VulkanSlot {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl VulkanSlot {
    /// The command buffer work is recorded into.
    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Fence signaled when the last submission completed.
    #[inline]
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }
}

/// Passed to transfer fragments while a batch is being recorded.
pub struct CommandRecorder {
    shared: Arc<DeviceShared>,
    command_buffer: vk::CommandBuffer,
}

impl CommandRecorder {
    /// The device to record with.
    #[inline]
    pub fn device(&self) -> &ash::Device {
        self.shared.device()
    }

    /// The command buffer in the recording state.
    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Queue families, for ownership transfers out of the transfer queue.
    #[inline]
    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.shared.queue_families()
    }

    /// Shared device state.
    #[inline]
    pub fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }
}

impl VulkanTransfer {
    /// Create a backend submitting to the transfer queue of `shared`.
    #[inline]
    pub fn new(shared: Arc<DeviceShared>) -> Self {
        VulkanTransfer { shared }
    }

    fn error(&self, err: vk::Result) -> TransferError {
        if err == vk::Result::ERROR_DEVICE_LOST {
            self.shared.loss_handler().report();
        }

        err.into()
    }

    unsafe fn record(
        &self,
        slot: &VulkanSlot,
        label: &str,
        fragments: Vec<TransferFragment<CommandRecorder>>,
    ) -> Result<(), vk::Result> {
        let device = self.shared.device();
        device.reset_command_pool(slot.command_pool, vk::CommandPoolResetFlags::empty())?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(slot.command_buffer, &begin_info)?;

        let debug_label = self
            .shared
            .debug_utils()
            .zip(CString::new(label).ok().filter(|label| !label.is_empty()));
        if let Some((debug_utils, name)) = &debug_label {
            let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
                .object_handle(slot.command_buffer)
                .object_name(name);
            debug_utils.set_debug_utils_object_name(&name_info)?;
            let label = vk::DebugUtilsLabelEXT::default().label_name(name);
            debug_utils.cmd_begin_debug_utils_label(slot.command_buffer, &label);
        }

        let mut recorder = CommandRecorder {
            shared: Arc::clone(&self.shared),
            command_buffer: slot.command_buffer,
        };
        for fragment in fragments {
            fragment(&mut recorder);
        }

        if let Some((debug_utils, _)) = &debug_label {
            debug_utils.cmd_end_debug_utils_label(slot.command_buffer);
        }
        device.end_command_buffer(slot.command_buffer)
    }
}

impl TransferBackend for VulkanTransfer {
    type Slot = VulkanSlot;
    type Recorder = CommandRecorder;

    fn create_slot(&self, _index: usize) -> Result<VulkanSlot, TransferError> {
        let device = self.shared.device();
        let callbacks = self.shared.allocation_callbacks();
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.shared.queue_families().transfer);

        unsafe {
            let command_pool = device
                .create_command_pool(&pool_info, callbacks.as_ref())
                .map_err(|err| self.error(err))?;
            let allocate_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = match device.allocate_command_buffers(&allocate_info) {
                Ok(buffers) => buffers.first().copied(),
                Err(err) => {
                    device.destroy_command_pool(command_pool, callbacks.as_ref());
                    return Err(self.error(err));
                }
            };
            let fence = device.create_fence(&vk::FenceCreateInfo::default(), callbacks.as_ref());

            match (command_buffer, fence) {
                (Some(command_buffer), Ok(fence)) => Ok(VulkanSlot {
                    command_pool,
                    command_buffer,
                    fence,
                }),
                (_, fence) => {
                    if let Ok(fence) = fence {
                        device.destroy_fence(fence, callbacks.as_ref());
                    }
                    device.destroy_command_pool(command_pool, callbacks.as_ref());
                    Err(self.error(
                        fence
                            .err()
                            .unwrap_or(vk::Result::ERROR_INITIALIZATION_FAILED),
                    ))
                }
            }
        }
    }

    unsafe fn destroy_slot(&self, slot: VulkanSlot) {
        let device = self.shared.device();
        let callbacks = self.shared.allocation_callbacks();
        device.destroy_fence(slot.fence, callbacks.as_ref());
        // frees the command buffer too
        device.destroy_command_pool(slot.command_pool, callbacks.as_ref());
    }

    fn submit(
        &self,
        slot: &mut VulkanSlot,
        label: &str,
        fragments: Vec<TransferFragment<CommandRecorder>>,
    ) -> Result<(), TransferError> {
        let device = self.shared.device();
        unsafe {
            self.record(slot, label, fragments)
                .map_err(|err| self.error(err))?;
            device
                .reset_fences(&[slot.fence])
                .map_err(|err| self.error(err))?;

            let command_buffers = [slot.command_buffer];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            self.shared
                .queue_submit(self.shared.queues().transfer, &[submit_info], slot.fence)
                .map_err(TransferError::from)
        }
    }

    fn wait(&self, slot: &VulkanSlot, timeout: Duration) -> Result<bool, TransferError> {
        let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe {
            self.shared
                .device()
                .wait_for_fences(&[slot.fence], true, timeout)
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(self.error(err)),
        }
    }

    fn poll(&self, slot: &VulkanSlot) -> Result<bool, TransferError> {
        unsafe { self.shared.device().get_fence_status(slot.fence) }.map_err(|err| self.error(err))
    }
}
