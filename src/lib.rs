#![allow(clippy::missing_safety_doc)]
#![warn(missing_docs)]
/*!
Vulkan device acquisition and transfer batch pooling for Rust, built on [`ash`].

- ✅ Capability catalog of every physical device
- ✅ Physical device selection against a declarative table of mandatory gates
- ✅ Negotiation of optional features and extensions
- ✅ Queue family planning with dedicated compute and transfer families
- ✅ Device creation, queues and a derived capability summary
- ✅ A fixed size pool of transfer batches with fence tracked completion
- ✅ Host allocation tracking through `VkAllocationCallbacks`

## Example

```rust,ignore
let entry = unsafe { ash::Entry::load() }.unwrap();
let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_3);
let instance = unsafe {
    entry.create_instance(&vk::InstanceCreateInfo::default().application_info(&app_info), None)
}
.unwrap();

let device = unsafe {
    DeviceBuilder::new()
        .transfer_batch_count(8)
        .track_allocations(true)
        .build(&instance, vk::API_VERSION_1_3)
}
.unwrap();

let pool = device.transfer();
let mut batch = pool.acquire("staging upload").unwrap();
batch.push(|recorder: &mut CommandRecorder| unsafe {
    recorder.device().cmd_copy_buffer(recorder.command_buffer(), staging, buffer, &regions);
});
pool.submit(&mut batch).unwrap();
pool.wait(batch, Duration::from_secs(1)).unwrap();
```

Selection picks the first physical device passing every gate in
[`MANDATORY_GATES`], preferring a later discrete one over a non-discrete one.
Use [`DeviceBuilder::select_nth_unconditionally`] to override it.

## Licensing

This project is licensed under the [zlib License].

[zlib License]: https://gitlab.com/Friz64/erupt-bootstrap/-/blob/main/LICENSE
*/

pub mod allocation;
pub mod capabilities;
pub mod catalog;
pub mod device;
pub mod features;
pub mod negotiation;
pub mod queue;
pub mod selection;
pub mod transfer;

pub use allocation::{AllocationStats, AllocationTracker};
pub use capabilities::{CapabilitySummary, MemoryClass};
pub use catalog::{CapabilityCatalog, CapabilityRecord, PresentationSupport, SurfacePresentation};
pub use device::*;
pub use features::{DeviceFeatures, OptionalExtensions};
pub use negotiation::{negotiate, DeviceRequest, OptionalFeaturePolicy};
pub use queue::{QueueFamilyCriteria, QueueFamilyIndices, QueuePlan, QueueSetup};
pub use selection::{select_adapter, AdapterAssessment, MANDATORY_GATES};
pub use transfer::{
    vulkan::{CommandRecorder, VulkanTransfer},
    BatchId, TransferBackend, TransferBatch, TransferBatchPool, TransferError, WaitError,
};

type DeviceSmallVec<T> = smallvec::SmallVec<[T; 8]>;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(DeviceShared: Send, Sync);
    assert_impl_all!(AllocationTracker: Send, Sync);
    assert_impl_all!(TransferBatchPool<VulkanTransfer>: Send, Sync);
    assert_impl_all!(TransferBatch<VulkanTransfer>: Send);
    assert_impl_all!(LogicalDevice: Send, Sync);
}
