use crate::maths::UVec2;
use crate::window_surface;
use spark::{vk, Builder, Device, DeviceExtensions, Instance, InstanceExtensions, Loader};
use std::ffi::CStr;
use std::os::raw::c_void;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use winit::window::Window;

unsafe extern "system" fn debug_messenger(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    if let Some(data) = p_callback_data.as_ref() {
        let message = CStr::from_ptr(data.p_message);
        println!("{}, {}: {:?}", message_severity, message_types, message);
    }
    vk::FALSE
}

pub fn try_version_from_str(s: &str) -> Result<vk::Version, &'static str> {
    let mut parts = s.split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or("expected major version")?;
    let minor = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or("expected minor version")?;
    if parts.next().is_some() {
        return Err("expected major.minor");
    }
    Ok(vk::Version::from_raw_parts(major, minor, 0))
}

pub trait DeviceExt {
    unsafe fn get_buffer_device_address_helper(&self, buffer: vk::Buffer) -> vk::DeviceAddress;
}

impl DeviceExt for Device {
    unsafe fn get_buffer_device_address_helper(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo {
            buffer: Some(buffer),
            ..Default::default()
        };
        self.get_buffer_device_address(&info)
    }
}

trait PhysicalDeviceMemoryPropertiesExt {
    fn types(&self) -> &[vk::MemoryType];
    fn heaps(&self) -> &[vk::MemoryHeap];
}

impl PhysicalDeviceMemoryPropertiesExt for vk::PhysicalDeviceMemoryProperties {
    fn types(&self) -> &[vk::MemoryType] {
        &self.memory_types[..self.memory_type_count as usize]
    }
    fn heaps(&self) -> &[vk::MemoryHeap] {
        &self.memory_heaps[..self.memory_heap_count as usize]
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Unique<T>(pub T, u64);

impl<T> Unique<T> {
    pub fn new(obj: T, uid: u64) -> Self {
        Self(obj, uid)
    }
}

pub type UniqueImage = Unique<vk::Image>;
pub type UniqueImageView = Unique<vk::ImageView>;

pub struct ContextParams {
    pub version: vk::Version,
    pub is_debug: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            version: vk::Version::from_raw_parts(1, 1, 0),
            is_debug: false,
        }
    }
}

pub struct RayTracingPipelineProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_base_alignment: u32,
    pub shader_group_handle_alignment: u32,
}

/// Buffer with its own dedicated device memory allocation.
pub struct BufferResource {
    pub buffer: vk::Buffer,
    pub mem: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl BufferResource {
    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_buffer(Some(self.buffer), None);
            device.free_memory(Some(self.mem), None);
        }
    }
}

/// Image plus view with a dedicated device memory allocation.
pub struct ImageResource {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub mem: vk::DeviceMemory,
}

impl ImageResource {
    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_image_view(Some(self.view), None);
            device.destroy_image(Some(self.image), None);
            device.free_memory(Some(self.mem), None);
        }
    }
}

pub type SharedContext = Arc<Context>;

pub struct Context {
    pub instance: Instance,
    pub debug_utils_messenger: Option<vk::DebugUtilsMessengerEXT>,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub physical_device_properties: vk::PhysicalDeviceProperties,
    pub physical_device_memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub ray_tracing_pipeline_properties: RayTracingPipelineProperties,
    pub queue_family_index: u32,
    pub queue_family_properties: vk::QueueFamilyProperties,
    pub queue: vk::Queue,
    pub device: Device,
    pub next_handle_uid: AtomicU64,
}

impl Context {
    pub fn new(window: &Window, params: &ContextParams) -> SharedContext {
        let instance = {
            let loader = Loader::new().unwrap();
            let instance_version = unsafe { loader.enumerate_instance_version() }.unwrap();
            println!(
                "loading instance version {} ({} supported)",
                params.version, instance_version
            );
            if instance_version < params.version {
                panic!(
                    "requested instance version {} is greater than the available version {}",
                    params.version, instance_version
                );
            }

            let mut extensions = InstanceExtensions::new(params.version);
            window_surface::enable_extensions(window, &mut extensions);
            if params.is_debug {
                extensions.enable_ext_debug_utils();
            }
            let extension_names = extensions.to_name_vec();
            for &name in extension_names.iter() {
                println!("loading instance extension {:?}", name);
            }

            let app_info = vk::ApplicationInfo::builder()
                .p_application_name(Some(CStr::from_bytes_with_nul(b"rtao\0").unwrap()))
                .api_version(params.version);

            let extension_name_ptrs: Vec<_> = extension_names.iter().map(|s| s.as_ptr()).collect();
            let instance_create_info = vk::InstanceCreateInfo::builder()
                .p_application_info(Some(&app_info))
                .pp_enabled_extension_names(&extension_name_ptrs);
            unsafe { loader.create_instance(&instance_create_info, None) }.unwrap()
        };

        let debug_utils_messenger = if params.is_debug {
            let create_info = vk::DebugUtilsMessengerCreateInfoEXT {
                message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                pfn_user_callback: Some(debug_messenger),
                ..Default::default()
            };
            Some(unsafe { instance.create_debug_utils_messenger_ext(&create_info, None) }.unwrap())
        } else {
            None
        };

        let surface = window_surface::create(&instance, window).unwrap();

        let physical_device = {
            let physical_devices = unsafe { instance.enumerate_physical_devices_to_vec() }.unwrap();
            for physical_device in &physical_devices {
                let props = unsafe { instance.get_physical_device_properties(*physical_device) };
                println!("physical device ({}): {:?}", props.device_type, unsafe {
                    CStr::from_ptr(props.device_name.as_ptr())
                });
            }
            physical_devices[0]
        };
        let physical_device_properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_version = physical_device_properties.api_version;

        let ray_tracing_pipeline_properties = {
            let mut rtpp = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::builder().insert_next(&mut rtpp);
            unsafe { instance.get_physical_device_properties2(physical_device, properties2.as_mut()) };
            RayTracingPipelineProperties {
                shader_group_handle_size: rtpp.shader_group_handle_size,
                shader_group_base_alignment: rtpp.shader_group_base_alignment,
                shader_group_handle_alignment: rtpp.shader_group_handle_alignment,
            }
        };

        let physical_device_memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let (queue_family_index, queue_family_properties) = {
            let queue_flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;

            unsafe { instance.get_physical_device_queue_family_properties_to_vec(physical_device) }
                .iter()
                .enumerate()
                .filter_map(|(index, info)| {
                    if info.queue_flags.contains(queue_flags)
                        && unsafe {
                            instance.get_physical_device_surface_support_khr(physical_device, index as u32, surface)
                        }
                        .unwrap()
                    {
                        Some((index as u32, *info))
                    } else {
                        None
                    }
                })
                .next()
                .expect("no graphics+compute queue family with surface support")
        };

        let device = {
            println!(
                "loading device version {} ({} supported)",
                params.version, device_version
            );
            if device_version < params.version {
                panic!(
                    "requested device version {} is greater than the available version {}",
                    params.version, device_version
                );
            }

            let queue_priorities = [1.0];
            let device_queue_create_info = vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(queue_family_index)
                .p_queue_priorities(&queue_priorities);

            let available_extensions = {
                let extension_properties =
                    unsafe { instance.enumerate_device_extension_properties_to_vec(physical_device, None) }.unwrap();
                DeviceExtensions::from_properties(params.version, &extension_properties)
            };
            if !available_extensions.supports_khr_acceleration_structure()
                || !available_extensions.supports_khr_ray_tracing_pipeline()
            {
                panic!("physical device does not support ray tracing pipelines");
            }

            let mut extensions = DeviceExtensions::new(params.version);
            extensions.enable_khr_swapchain();
            extensions.enable_ext_scalar_block_layout();
            extensions.enable_khr_acceleration_structure();
            extensions.enable_khr_ray_tracing_pipeline();
            let extension_names = extensions.to_name_vec();
            for &name in extension_names.iter() {
                println!("loading device extension {:?}", name);
            }

            let mut scalar_block_layout_features =
                vk::PhysicalDeviceScalarBlockLayoutFeaturesEXT::builder().scalar_block_layout(true);
            let mut buffer_device_address_features =
                vk::PhysicalDeviceBufferDeviceAddressFeaturesKHR::builder().buffer_device_address(true);
            let mut acceleration_structure_features =
                vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
            let mut ray_tracing_pipeline_features =
                vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

            let extension_name_ptrs: Vec<_> = extension_names.iter().map(|s| s.as_ptr()).collect();
            let device_create_info = vk::DeviceCreateInfo::builder()
                .p_queue_create_infos(slice::from_ref(&device_queue_create_info))
                .pp_enabled_extension_names(&extension_name_ptrs)
                .insert_next(&mut scalar_block_layout_features)
                .insert_next(&mut buffer_device_address_features)
                .insert_next(&mut acceleration_structure_features)
                .insert_next(&mut ray_tracing_pipeline_features);

            unsafe { instance.create_device(physical_device, &device_create_info, None, params.version) }.unwrap()
        };

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        Arc::new(Self {
            instance,
            debug_utils_messenger,
            surface,
            physical_device,
            physical_device_properties,
            physical_device_memory_properties,
            ray_tracing_pipeline_properties,
            queue_family_index,
            queue_family_properties,
            queue,
            device,
            next_handle_uid: AtomicU64::new(0),
        })
    }

    pub fn allocate_handle_uid(&self) -> u64 {
        self.next_handle_uid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get_memory_type_index(&self, type_filter: u32, property_flags: vk::MemoryPropertyFlags) -> Option<u32> {
        for (i, mt) in self.physical_device_memory_properties.types().iter().enumerate() {
            let i = i as u32;
            if (type_filter & (1 << i)) != 0 && mt.property_flags.contains(property_flags) {
                return Some(i);
            }
        }
        None
    }

    fn allocate_memory(
        &self,
        mem_req: &vk::MemoryRequirements,
        property_flags: vk::MemoryPropertyFlags,
        needs_device_address: bool,
    ) -> vk::DeviceMemory {
        let memory_type_index = self
            .get_memory_type_index(mem_req.memory_type_bits, property_flags)
            .expect("no suitable memory type");
        let mut memory_allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_req.size)
            .memory_type_index(memory_type_index);
        let mut flags_info = vk::MemoryAllocateFlagsInfo {
            flags: vk::MemoryAllocateFlagsKHR::DEVICE_ADDRESS_KHR,
            ..Default::default()
        };
        if needs_device_address {
            memory_allocate_info = memory_allocate_info.insert_next(&mut flags_info);
        }
        unsafe { self.device.allocate_memory(&memory_allocate_info, None) }.unwrap()
    }

    pub fn create_buffer_resource(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        property_flags: vk::MemoryPropertyFlags,
    ) -> BufferResource {
        let buffer_create_info = vk::BufferCreateInfo {
            size,
            usage,
            ..Default::default()
        };
        let buffer = unsafe { self.device.create_buffer(&buffer_create_info, None) }.unwrap();
        let mem_req = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let mem = self.allocate_memory(
            &mem_req,
            property_flags,
            usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
        );
        unsafe { self.device.bind_buffer_memory(buffer, mem, 0) }.unwrap();
        BufferResource { buffer, mem, size }
    }

    /// Writes into a host visible buffer, flushing in case the memory is not coherent.
    pub fn write_buffer_resource(&self, resource: &BufferResource, offset: vk::DeviceSize, data: &[u8]) {
        let mapping =
            unsafe { self.device.map_memory(resource.mem, 0, vk::WHOLE_SIZE, Default::default()) }.unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), (mapping as *mut u8).add(offset as usize), data.len());
        }
        let mapped_range = vk::MappedMemoryRange {
            memory: Some(resource.mem),
            offset: 0,
            size: vk::WHOLE_SIZE,
            ..Default::default()
        };
        unsafe {
            self.device
                .flush_mapped_memory_ranges(slice::from_ref(&mapped_range))
        }
        .unwrap();
        unsafe { self.device.unmap_memory(resource.mem) };
    }

    pub fn create_image_resource(
        &self,
        image_type: vk::ImageType,
        view_type: vk::ImageViewType,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> ImageResource {
        let image_create_info = vk::ImageCreateInfo {
            image_type,
            format,
            extent,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::N1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { self.device.create_image(&image_create_info, None) }.unwrap();
        let mem_req = unsafe { self.device.get_image_memory_requirements(image) };
        let mem = self.allocate_memory(&mem_req, vk::MemoryPropertyFlags::DEVICE_LOCAL, false);
        unsafe { self.device.bind_image_memory(image, mem, 0) }.unwrap();

        let image_view_create_info = vk::ImageViewCreateInfo {
            image: Some(image),
            view_type,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        let view = unsafe { self.device.create_image_view(&image_view_create_info, None) }.unwrap();

        ImageResource { image, view, mem }
    }

    pub fn create_image_resource_2d(
        &self,
        size: UVec2,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> ImageResource {
        self.create_image_resource(
            vk::ImageType::N2D,
            vk::ImageViewType::N2D,
            vk::Extent3D {
                width: size.x,
                height: size.y,
                depth: 1,
            },
            format,
            usage,
        )
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_surface_khr(Some(self.surface), None);
            if self.debug_utils_messenger.is_some() {
                self.instance
                    .destroy_debug_utils_messenger_ext(self.debug_utils_messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
