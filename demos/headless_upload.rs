use ash::{vk, Entry};
use ash_device_kit::{CommandRecorder, DeviceBuilder, MemoryClass, OptionalFeaturePolicy};
use std::time::Duration;

const BUFFER_SIZE: vk::DeviceSize = 1 << 20;

fn main() {
    let entry = unsafe { Entry::load() }.unwrap();
    let api_version = vk::API_VERSION_1_3;
    let app_info = vk::ApplicationInfo::default()
        .application_name(c"headless_upload")
        .api_version(api_version);
    let instance = unsafe {
        entry.create_instance(
            &vk::InstanceCreateInfo::default().application_info(&app_info),
            None,
        )
    }
    .unwrap();

    let device_builder = DeviceBuilder::new()
        .optional_features(OptionalFeaturePolicy::default())
        .transfer_batch_count(4)
        .track_allocations(true)
        .on_device_lost(|| eprintln!("device lost"));
    let logical_device = unsafe { device_builder.build(&instance, api_version) }.unwrap();
    let shared = logical_device.shared();
    println!("{:#?}", shared);
    println!("enabled extensions: {:?}", shared.request().extensions);

    let device = shared.device();
    let buffer = unsafe {
        device.create_buffer(
            &vk::BufferCreateInfo::default()
                .size(BUFFER_SIZE)
                .usage(vk::BufferUsageFlags::TRANSFER_DST),
            None,
        )
    }
    .unwrap();
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let memory_type = shared
        .summary()
        .find_memory_type(requirements.memory_type_bits, MemoryClass::DeviceLocal)
        .or_else(|| {
            shared
                .summary()
                .find_memory_type(requirements.memory_type_bits, MemoryClass::Unified)
        })
        .expect("no device local memory");
    let memory = unsafe {
        device.allocate_memory(
            &vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type),
            None,
        )
    }
    .unwrap();
    unsafe { device.bind_buffer_memory(buffer, memory, 0) }.unwrap();

    let pool = logical_device.transfer();
    for round in 0..8u32 {
        let mut batch = pool.acquire(format!("fill {round}")).unwrap();
        batch.push(move |recorder: &mut CommandRecorder| unsafe {
            recorder.device().cmd_fill_buffer(
                recorder.command_buffer(),
                buffer,
                0,
                vk::WHOLE_SIZE,
                round,
            );
        });
        pool.submit(&mut batch).unwrap();
        println!("submitted {batch}, {} batches free", pool.free_count());
        pool.wait(batch, Duration::from_secs(1)).unwrap();
    }

    if let Some(tracker) = shared.allocation_tracker() {
        println!("{:#?}", tracker.snapshot());
    }

    unsafe {
        device.destroy_buffer(buffer, None);
        device.free_memory(memory, None);
    }
    drop(logical_device);
    unsafe { instance.destroy_instance(None) };
}
