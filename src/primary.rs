use crate::barrier::*;
use crate::context::*;
use crate::descriptor::*;
use crate::frames::*;
use crate::maths::*;
use crate::pipeline::*;
use crate::scene::Scene;
use bytemuck::{Pod, Zeroable};
use spark::vk;
use std::mem;
use std::slice;

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct CameraData {
    ray_origin: Vec3,
    ray_vec_from_coord: Mat3,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct HitRecordData {
    index_buffer_address: u64,
    vertex_buffer_address: u64,
}

/// First hit pass. Traces one ray per pixel and writes the scene colour
/// plus the hit depth and normal that the occlusion pass consumes.
pub struct PrimaryPass {
    context: SharedContext,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    binding_layout: ShaderBindingLayout,
    binding_table: BufferResource,
    color: ImageResource,
    color_usage: ImageUsage,
    size: UVec2,
}

impl PrimaryPass {
    pub const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    pub fn new(
        context: &SharedContext,
        descriptor_set_layout_cache: &mut DescriptorSetLayoutCache,
        pipeline_cache: &PipelineCache,
        scene: &Scene,
        size: UVec2,
    ) -> Self {
        let descriptor_set_layout = descriptor_set_layout_cache.create_descriptor_set_layout(&[
            DescriptorSetLayoutBinding::UniformData {
                size: mem::size_of::<CameraData>() as u32,
            },
            DescriptorSetLayoutBinding::AccelerationStructure,
            DescriptorSetLayoutBinding::StorageImage,
            DescriptorSetLayoutBinding::StorageImage,
        ]);
        let pipeline_layout = descriptor_set_layout_cache.create_pipeline_layout(descriptor_set_layout);

        let pipeline = pipeline_cache.get_ray_tracing(
            &[
                RayTracingShaderGroupDesc::Raygen("primary.rgen.spv"),
                RayTracingShaderGroupDesc::Miss("primary.rmiss.spv"),
                RayTracingShaderGroupDesc::TrianglesHit {
                    closest_hit: "primary.rchit.spv",
                },
            ],
            pipeline_layout,
        );

        let rtpp = &context.ray_tracing_pipeline_properties;
        let binding_layout = ShaderBindingLayout::new(
            rtpp.shader_group_handle_size,
            rtpp.shader_group_handle_alignment,
            rtpp.shader_group_base_alignment,
            0,
            1,
            mem::size_of::<HitRecordData>() as u32,
        );

        let binding_table = context.create_buffer_resource(
            binding_layout.total_size as vk::DeviceSize,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        {
            let shader_group_count = 3;
            let handle_size = rtpp.shader_group_handle_size as usize;
            let mut handle_data = vec![0u8; shader_group_count * handle_size];
            unsafe {
                context.device.get_ray_tracing_shader_group_handles_khr(
                    pipeline,
                    0,
                    shader_group_count as u32,
                    &mut handle_data,
                )
            }
            .unwrap();
            let (raygen_group_handle, remain) = handle_data.split_at(handle_size);
            let (miss_group_handle, hit_group_handle) = remain.split_at(handle_size);

            let hit_data = HitRecordData {
                index_buffer_address: scene.index_buffer_address(),
                vertex_buffer_address: scene.vertex_buffer_address(),
            };

            let mut table_data = vec![0u8; binding_layout.total_size as usize];
            let raygen_offset = binding_layout.raygen.offset as usize;
            table_data[raygen_offset..raygen_offset + handle_size].copy_from_slice(raygen_group_handle);
            let miss_offset = binding_layout.miss.offset as usize;
            table_data[miss_offset..miss_offset + handle_size].copy_from_slice(miss_group_handle);
            let hit_offset = binding_layout.hit.offset as usize;
            table_data[hit_offset..hit_offset + handle_size].copy_from_slice(hit_group_handle);
            table_data[hit_offset + handle_size..hit_offset + handle_size + mem::size_of::<HitRecordData>()]
                .copy_from_slice(bytemuck::bytes_of(&hit_data));
            context.write_buffer_resource(&binding_table, 0, &table_data);
        }

        let color = context.create_image_resource_2d(
            size,
            Self::COLOR_FORMAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
        );

        Self {
            context: SharedContext::clone(context),
            descriptor_set_layout,
            pipeline_layout,
            pipeline,
            binding_layout,
            binding_table,
            color,
            color_usage: ImageUsage::Initial,
            size,
        }
    }

    pub fn color_view(&self) -> vk::ImageView {
        self.color.view
    }

    pub fn transition_color_for_filter(&mut self, cmd: vk::CommandBuffer) {
        if self.color_usage != ImageUsage::FragmentSampled {
            emit_image_barrier(
                self.color_usage,
                ImageUsage::FragmentSampled,
                self.color.image,
                &self.context.device,
                cmd,
            );
            self.color_usage = ImageUsage::FragmentSampled;
        }
    }

    pub fn record(
        &mut self,
        cmd: vk::CommandBuffer,
        descriptor_pool: &DescriptorPool,
        frame_resources: &mut FrameResources,
        parity: FrameParity,
        scene: &Scene,
        ray_origin: Vec3,
        ray_vec_from_coord: Mat3,
    ) {
        let device = &self.context.device;

        if self.color_usage != ImageUsage::RayTracingStorageWrite {
            emit_image_barrier(
                self.color_usage,
                ImageUsage::RayTracingStorageWrite,
                self.color.image,
                device,
                cmd,
            );
            self.color_usage = ImageUsage::RayTracingStorageWrite;
        }
        frame_resources.transition_for_primary(cmd, parity);

        let descriptor_set = descriptor_pool.create_descriptor_set(
            self.descriptor_set_layout,
            &[
                DescriptorSetBindingData::UniformData {
                    size: mem::size_of::<CameraData>() as u32,
                    writer: &|buf: &mut [u8]| {
                        buf.copy_from_slice(bytemuck::bytes_of(&CameraData {
                            ray_origin,
                            ray_vec_from_coord,
                        }));
                    },
                },
                DescriptorSetBindingData::AccelerationStructure {
                    accel: scene.top_level_accel(),
                },
                DescriptorSetBindingData::StorageImage {
                    image_view: self.color.view,
                },
                DescriptorSetBindingData::StorageImage {
                    image_view: frame_resources.depth_normals_view(parity),
                },
            ],
        );

        let table_address = unsafe { device.get_buffer_device_address_helper(self.binding_table.buffer) };
        let raygen_region = self.binding_layout.raygen.into_device_address_region(table_address);
        let miss_region = self.binding_layout.miss.into_device_address_region(table_address);
        let hit_region = self.binding_layout.hit.into_device_address_region(table_address);
        let callable_region = vk::StridedDeviceAddressRegionKHR::default();

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline_layout,
                0,
                slice::from_ref(&descriptor_set),
                &[],
            );
            device.cmd_trace_rays_khr(
                cmd,
                &raygen_region,
                &miss_region,
                &hit_region,
                &callable_region,
                self.size.x,
                self.size.y,
                1,
            );
        }
    }
}

impl Drop for PrimaryPass {
    fn drop(&mut self) {
        self.color.destroy(&self.context.device);
        self.binding_table.destroy(&self.context.device);
    }
}
