use crate::barrier::*;
use crate::context::*;
use crate::descriptor::*;
use crate::frames::*;
use crate::maths::*;
use crate::pipeline::*;
use crate::samples;
use crate::scene::Scene;
use bytemuck::{Pod, Zeroable};
use spark::vk;
use std::mem;
use std::slice;

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct AoParameters {
    ray_origin: Vec3,
    ao_radius: f32,
    ray_vec_from_coord: Mat3,
    frame_number: u32,
    samples_count: u32,
    sample_start_index: u32,
}

/// One parameter block per frame parity, addressed from the matching
/// shader binding table record. Fixed stride so the odd block is a
/// constant jump from the even one.
const PARAMETER_BLOCK_STRIDE: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct AoSettings {
    pub radius: f32,
    pub ray_count: u32,
}

impl Default for AoSettings {
    fn default() -> Self {
        Self {
            radius: 1.0,
            ray_count: 4,
        }
    }
}

/// Ambient occlusion pass. Shoots hemisphere rays from the surfaces the
/// primary pass found, accumulating against the previous frame where the
/// surface has not moved. Which parity it writes is selected purely by
/// the raygen record used for the dispatch, the descriptors carry both.
pub struct OcclusionPass {
    context: SharedContext,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    sampler: vk::Sampler,
    binding_layout: ShaderBindingLayout,
    binding_table: BufferResource,
    parameter_buffer: BufferResource,
    sample_image: ImageResource,
    sample_staging: BufferResource,
    size: UVec2,
}

impl OcclusionPass {
    pub fn new(
        context: &SharedContext,
        descriptor_set_layout_cache: &mut DescriptorSetLayoutCache,
        pipeline_cache: &PipelineCache,
        init_cmd: vk::CommandBuffer,
        size: UVec2,
    ) -> Self {
        let sampler = {
            let create_info = vk::SamplerCreateInfo {
                mag_filter: vk::Filter::NEAREST,
                min_filter: vk::Filter::NEAREST,
                address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
                address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
                ..Default::default()
            };
            unsafe { context.device.create_sampler(&create_info, None) }.unwrap()
        };

        let descriptor_set_layout = descriptor_set_layout_cache.create_descriptor_set_layout(&[
            DescriptorSetLayoutBinding::AccelerationStructure,
            DescriptorSetLayoutBinding::StorageImage,
            DescriptorSetLayoutBinding::SampledImage { sampler },
            DescriptorSetLayoutBinding::SampledImage { sampler },
            DescriptorSetLayoutBinding::SampledImage { sampler },
            DescriptorSetLayoutBinding::SampledImage { sampler },
        ]);
        let pipeline_layout = descriptor_set_layout_cache.create_pipeline_layout(descriptor_set_layout);

        let pipeline = pipeline_cache.get_ray_tracing(
            &[
                RayTracingShaderGroupDesc::Raygen("rtao.rgen.spv"),
                RayTracingShaderGroupDesc::Miss("rtao.rmiss.spv"),
                RayTracingShaderGroupDesc::TrianglesHit {
                    closest_hit: "rtao.rchit.spv",
                },
            ],
            pipeline_layout,
        );

        let parameter_buffer = context.create_buffer_resource(
            (PARAMETER_BLOCK_STRIDE * PARITY_COUNT) as vk::DeviceSize,
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        let parameter_buffer_address =
            unsafe { context.device.get_buffer_device_address_helper(parameter_buffer.buffer) };

        let rtpp = &context.ray_tracing_pipeline_properties;
        let binding_layout = ShaderBindingLayout::new(
            rtpp.shader_group_handle_size,
            rtpp.shader_group_handle_alignment,
            rtpp.shader_group_base_alignment,
            mem::size_of::<u64>() as u32,
            PARITY_COUNT as u32,
            0,
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

            let mut table_data = vec![0u8; binding_layout.total_size as usize];
            // one raygen record per parity, the inline argument is the
            // address of that parity's parameter block
            for parity_index in 0..PARITY_COUNT {
                let record_offset = binding_layout.raygen_record_offset(parity_index as u32) as usize;
                table_data[record_offset..record_offset + handle_size].copy_from_slice(raygen_group_handle);
                let block_address =
                    parameter_buffer_address + (parity_index * PARAMETER_BLOCK_STRIDE) as vk::DeviceAddress;
                table_data[record_offset + handle_size..record_offset + handle_size + mem::size_of::<u64>()]
                    .copy_from_slice(bytemuck::bytes_of(&block_address));
            }
            let miss_offset = binding_layout.miss.offset as usize;
            table_data[miss_offset..miss_offset + handle_size].copy_from_slice(miss_group_handle);
            let hit_offset = binding_layout.hit.offset as usize;
            table_data[hit_offset..hit_offset + handle_size].copy_from_slice(hit_group_handle);
            context.write_buffer_resource(&binding_table, 0, &table_data);
        }

        let (sample_image, sample_staging) = Self::upload_sample_table(context, init_cmd);

        Self {
            context: SharedContext::clone(context),
            descriptor_set_layout,
            pipeline_layout,
            pipeline,
            sampler,
            binding_layout,
            binding_table,
            parameter_buffer,
            sample_image,
            sample_staging,
            size,
        }
    }

    fn upload_sample_table(context: &SharedContext, init_cmd: vk::CommandBuffer) -> (ImageResource, BufferResource) {
        let table = samples::generate_sample_table();
        let table_bytes: &[u8] = bytemuck::cast_slice(&table);

        let staging = context.create_buffer_resource(
            table_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        context.write_buffer_resource(&staging, 0, table_bytes);

        let image = context.create_image_resource(
            vk::ImageType::N1D,
            vk::ImageViewType::N1D,
            vk::Extent3D {
                width: samples::SAMPLE_TABLE_SIZE,
                height: 1,
                depth: 1,
            },
            vk::Format::R32G32B32A32_SFLOAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        );

        emit_image_barrier(
            ImageUsage::Initial,
            ImageUsage::TransferWrite,
            image.image,
            &context.device,
            init_cmd,
        );
        let region = vk::BufferImageCopy {
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_extent: vk::Extent3D {
                width: samples::SAMPLE_TABLE_SIZE,
                height: 1,
                depth: 1,
            },
            ..Default::default()
        };
        unsafe {
            context.device.cmd_copy_buffer_to_image(
                init_cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                slice::from_ref(&region),
            )
        };
        emit_image_barrier(
            ImageUsage::TransferWrite,
            ImageUsage::RayTracingSampled,
            image.image,
            &context.device,
            init_cmd,
        );

        (image, staging)
    }

    pub fn update(
        &self,
        parity: FrameParity,
        frame_number: u32,
        settings: &AoSettings,
        ray_origin: Vec3,
        ray_vec_from_coord: Mat3,
    ) {
        let params = AoParameters {
            ray_origin,
            ao_radius: settings.radius,
            ray_vec_from_coord,
            frame_number,
            samples_count: samples::sample_window_size(settings.ray_count),
            sample_start_index: samples::sample_start_offset(settings.ray_count),
        };
        self.context.write_buffer_resource(
            &self.parameter_buffer,
            (parity.index() * PARAMETER_BLOCK_STRIDE) as vk::DeviceSize,
            bytemuck::bytes_of(&params),
        );
    }

    pub fn record(
        &self,
        cmd: vk::CommandBuffer,
        descriptor_pool: &DescriptorPool,
        frame_resources: &mut FrameResources,
        parity: FrameParity,
        scene: &Scene,
    ) {
        let device = &self.context.device;

        frame_resources.transition_for_occlusion(cmd, parity);

        let descriptor_set = descriptor_pool.create_descriptor_set(
            self.descriptor_set_layout,
            &[
                DescriptorSetBindingData::AccelerationStructure {
                    accel: scene.top_level_accel(),
                },
                DescriptorSetBindingData::StorageImage {
                    image_view: frame_resources.ao_output_view(parity),
                },
                DescriptorSetBindingData::SampledImage {
                    image_view: frame_resources.ao_output_view(parity.other()),
                },
                DescriptorSetBindingData::SampledImage {
                    image_view: frame_resources.depth_normals_view(parity),
                },
                DescriptorSetBindingData::SampledImage {
                    image_view: frame_resources.depth_normals_view(parity.other()),
                },
                DescriptorSetBindingData::SampledImage {
                    image_view: self.sample_image.view,
                },
            ],
        );

        let table_address = unsafe { device.get_buffer_device_address_helper(self.binding_table.buffer) };
        // dispatch with only the raygen record that matches this parity
        let raygen_region = self
            .binding_layout
            .raygen_record_region(parity.index() as u32)
            .into_device_address_region(table_address);
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

impl Drop for OcclusionPass {
    fn drop(&mut self) {
        let device = &self.context.device;
        self.sample_image.destroy(device);
        self.sample_staging.destroy(device);
        self.parameter_buffer.destroy(device);
        self.binding_table.destroy(device);
        unsafe { device.destroy_sampler(Some(self.sampler), None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_blocks_do_not_overlap() {
        assert!(mem::size_of::<AoParameters>() <= PARAMETER_BLOCK_STRIDE);
    }

    #[test]
    fn settings_default_to_full_sample_window() {
        let settings = AoSettings::default();
        assert_eq!(settings.ray_count, samples::MAX_RAY_COUNT);
        assert_eq!(samples::sample_start_offset(settings.ray_count), 216);
    }
}
