use crate::barrier::*;
use crate::context::*;
use crate::descriptor::*;
use crate::maths::*;
use crate::pipeline::*;
use bytemuck::{Pod, Zeroable};
use spark::{vk, Builder};
use std::mem;
use std::slice;
use strum::{Display, EnumIter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter)]
pub enum OutputMode {
    #[strum(serialize = "AO Only")]
    AoOnly,
    #[strum(serialize = "AO & Color")]
    AoAndColor,
    #[strum(serialize = "Color Only")]
    ColorOnly,
}

impl OutputMode {
    fn as_u32(self) -> u32 {
        match self {
            OutputMode::AoOnly => 0,
            OutputMode::AoAndColor => 1,
            OutputMode::ColorOnly => 2,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct FilterData {
    normal_matrix: Mat3,
    texel_size: Vec2,
    output_mode: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct QuadVertex {
    position: Vec3,
    uv: Vec2,
}

const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex {
        position: Vec3::new(-1.0, -1.0, 0.0),
        uv: Vec2::new(0.0, 0.0),
    },
    QuadVertex {
        position: Vec3::new(1.0, -1.0, 0.0),
        uv: Vec2::new(1.0, 0.0),
    },
    QuadVertex {
        position: Vec3::new(1.0, 1.0, 0.0),
        uv: Vec2::new(1.0, 1.0),
    },
    QuadVertex {
        position: Vec3::new(-1.0, 1.0, 0.0),
        uv: Vec2::new(0.0, 1.0),
    },
];

const QUAD_INDICES: [u32; 6] = [0, 2, 1, 0, 3, 2];

pub const FILTER_RADIUS: usize = 4;

/// Gaussian weights for the 2*FILTER_RADIUS+1 tap kernel, unnormalised,
/// the shader divides by the accumulated edge-aware weight.
#[cfg(test)]
pub(crate) fn kernel_weights() -> [f32; 2 * FILTER_RADIUS + 1] {
    let sigma = 2.0f32;
    let mut weights = [0.0f32; 2 * FILTER_RADIUS + 1];
    for (i, w) in weights.iter_mut().enumerate() {
        let x = (i as f32) - (FILTER_RADIUS as f32);
        *w = (-0.5 * x * x / (sigma * sigma)).exp();
    }
    weights
}

/// Depth and normal rejection matching the fragment shaders: taps across
/// a depth gap or a normal crease stop contributing.
#[cfg(test)]
pub(crate) fn edge_stopping_weight(
    centre_depth: f32,
    tap_depth: f32,
    centre_normal: Vec3,
    tap_normal: Vec3,
) -> f32 {
    let depth_sigma = 0.1f32;
    let depth_delta = (centre_depth - tap_depth).abs();
    let depth_weight = (-depth_delta / depth_sigma).exp();
    let normal_weight = centre_normal.dot(tap_normal).max(0.0).powi(32);
    depth_weight * normal_weight
}

#[cfg(test)]
pub(crate) fn filter_line(ao: &[f32], depth: &[f32], normal: &[Vec3], centre: usize) -> f32 {
    let weights = kernel_weights();
    let mut sum = 0.0f32;
    let mut total_weight = 0.0f32;
    for (i, &kernel_weight) in weights.iter().enumerate() {
        let tap = (centre + i).wrapping_sub(FILTER_RADIUS);
        if tap >= ao.len() {
            continue;
        }
        let weight =
            kernel_weight * edge_stopping_weight(depth[centre], depth[tap], normal[centre], normal[tap]);
        sum += ao[tap] * weight;
        total_weight += weight;
    }
    sum / total_weight
}

/// Separable edge-aware blur over the raw occlusion buffer. The first
/// pass filters along X into an intermediate target, the second filters
/// along Y straight into the swapchain, compositing with the scene
/// colour according to the output mode.
pub struct FilterPass {
    context: SharedContext,
    vertex_buffer: BufferResource,
    index_buffer: BufferResource,
    sampler: vk::Sampler,
    descriptor_set_layout_x: vk::DescriptorSetLayout,
    descriptor_set_layout_y: vk::DescriptorSetLayout,
    pipeline_layout_x: vk::PipelineLayout,
    pipeline_layout_y: vk::PipelineLayout,
    intermediate: ImageResource,
    intermediate_usage: ImageUsage,
    intermediate_render_pass: vk::RenderPass,
    intermediate_framebuffer: vk::Framebuffer,
    swapchain_render_pass: vk::RenderPass,
    size: UVec2,
}

fn create_color_render_pass(context: &Context, format: vk::Format) -> vk::RenderPass {
    let attachment = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::N1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ..Default::default()
    };
    let color_attachment_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .p_color_attachments(slice::from_ref(&color_attachment_ref), None);
    let create_info = vk::RenderPassCreateInfo::builder()
        .p_attachments(slice::from_ref(&attachment))
        .p_subpasses(slice::from_ref(&subpass));
    unsafe { context.device.create_render_pass(&create_info, None) }.unwrap()
}

impl FilterPass {
    pub const INTERMEDIATE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    pub fn new(context: &SharedContext, descriptor_set_layout_cache: &mut DescriptorSetLayoutCache, size: UVec2, swapchain_format: vk::Format) -> Self {
        let vertex_buffer = context.create_buffer_resource(
            mem::size_of_val(&QUAD_VERTICES) as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        context.write_buffer_resource(&vertex_buffer, 0, bytemuck::cast_slice(&QUAD_VERTICES));
        let index_buffer = context.create_buffer_resource(
            mem::size_of_val(&QUAD_INDICES) as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        context.write_buffer_resource(&index_buffer, 0, bytemuck::cast_slice(&QUAD_INDICES));

        let sampler = {
            let create_info = vk::SamplerCreateInfo {
                mag_filter: vk::Filter::LINEAR,
                min_filter: vk::Filter::LINEAR,
                address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
                address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
                ..Default::default()
            };
            unsafe { context.device.create_sampler(&create_info, None) }.unwrap()
        };

        let descriptor_set_layout_x = descriptor_set_layout_cache.create_descriptor_set_layout(&[
            DescriptorSetLayoutBinding::UniformData {
                size: mem::size_of::<FilterData>() as u32,
            },
            DescriptorSetLayoutBinding::SampledImage { sampler },
            DescriptorSetLayoutBinding::SampledImage { sampler },
        ]);
        let pipeline_layout_x = descriptor_set_layout_cache.create_pipeline_layout(descriptor_set_layout_x);

        let descriptor_set_layout_y = descriptor_set_layout_cache.create_descriptor_set_layout(&[
            DescriptorSetLayoutBinding::UniformData {
                size: mem::size_of::<FilterData>() as u32,
            },
            DescriptorSetLayoutBinding::SampledImage { sampler },
            DescriptorSetLayoutBinding::SampledImage { sampler },
            DescriptorSetLayoutBinding::SampledImage { sampler },
        ]);
        let pipeline_layout_y = descriptor_set_layout_cache.create_pipeline_layout(descriptor_set_layout_y);

        let intermediate = context.create_image_resource_2d(
            size,
            Self::INTERMEDIATE_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        );
        let intermediate_render_pass = create_color_render_pass(context, Self::INTERMEDIATE_FORMAT);
        let intermediate_framebuffer = {
            let create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(intermediate_render_pass)
                .p_attachments(slice::from_ref(&intermediate.view))
                .width(size.x)
                .height(size.y)
                .layers(1);
            unsafe { context.device.create_framebuffer(&create_info, None) }.unwrap()
        };

        let swapchain_render_pass = create_color_render_pass(context, swapchain_format);

        Self {
            context: SharedContext::clone(context),
            vertex_buffer,
            index_buffer,
            sampler,
            descriptor_set_layout_x,
            descriptor_set_layout_y,
            pipeline_layout_x,
            pipeline_layout_y,
            intermediate,
            intermediate_usage: ImageUsage::Initial,
            intermediate_render_pass,
            intermediate_framebuffer,
            swapchain_render_pass,
            size,
        }
    }

    pub fn swapchain_render_pass(&self) -> vk::RenderPass {
        self.swapchain_render_pass
    }

    fn graphics_pipeline_state(render_pass: vk::RenderPass) -> GraphicsPipelineState {
        GraphicsPipelineState::new(render_pass).with_vertex_inputs(
            &[vk::VertexInputBindingDescription {
                binding: 0,
                stride: mem::size_of::<QuadVertex>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            &[
                vk::VertexInputAttributeDescription {
                    location: 0,
                    binding: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 0,
                },
                vk::VertexInputAttributeDescription {
                    location: 1,
                    binding: 0,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: mem::size_of::<Vec3>() as u32,
                },
            ],
        )
    }

    fn begin_render_pass(&self, cmd: vk::CommandBuffer, render_pass: vk::RenderPass, framebuffer: vk::Framebuffer) {
        let device = &self.context.device;
        let clear_value = vk::ClearValue {
            color: vk::ClearColorValue { float32: [0.0; 4] },
        };
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: Default::default(),
                extent: vk::Extent2D {
                    width: self.size.x,
                    height: self.size.y,
                },
            })
            .p_clear_values(slice::from_ref(&clear_value));
        unsafe { device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE) };

        let viewport = vk::Viewport {
            width: self.size.x as f32,
            height: self.size.y as f32,
            max_depth: 1.0,
            ..Default::default()
        };
        let scissor = vk::Rect2D {
            offset: Default::default(),
            extent: vk::Extent2D {
                width: self.size.x,
                height: self.size.y,
            },
        };
        unsafe {
            device.cmd_set_viewport(cmd, 0, slice::from_ref(&viewport));
            device.cmd_set_scissor(cmd, 0, slice::from_ref(&scissor));
        }
    }

    fn draw_quad(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline, pipeline_layout: vk::PipelineLayout, descriptor_set: vk::DescriptorSet) {
        let device = &self.context.device;
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                slice::from_ref(&descriptor_set),
                &[],
            );
            device.cmd_bind_vertex_buffers(cmd, 0, slice::from_ref(&Some(self.vertex_buffer.buffer)), &[0]);
            device.cmd_bind_index_buffer(cmd, Some(self.index_buffer.buffer), 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, QUAD_INDICES.len() as u32, 1, 0, 0, 0);
        }
    }

    fn filter_data(&self, normal_matrix: Mat3, output_mode: OutputMode) -> FilterData {
        FilterData {
            normal_matrix,
            texel_size: Vec2::new(1.0 / (self.size.x as f32), 1.0 / (self.size.y as f32)),
            output_mode: output_mode.as_u32(),
        }
    }

    /// X pass, raw occlusion into the intermediate target.
    pub fn record_horizontal(
        &mut self,
        cmd: vk::CommandBuffer,
        descriptor_pool: &DescriptorPool,
        pipeline_cache: &PipelineCache,
        ao_view: vk::ImageView,
        depth_normals_view: vk::ImageView,
        normal_matrix: Mat3,
        output_mode: OutputMode,
    ) {
        if self.intermediate_usage != ImageUsage::Initial {
            // wait for the previous frame's Y pass reads before the clear
            emit_image_barrier(
                self.intermediate_usage,
                ImageUsage::ColorAttachmentWrite,
                self.intermediate.image,
                &self.context.device,
                cmd,
            );
        }

        let data = self.filter_data(normal_matrix, output_mode);
        let descriptor_set = descriptor_pool.create_descriptor_set(
            self.descriptor_set_layout_x,
            &[
                DescriptorSetBindingData::UniformData {
                    size: mem::size_of::<FilterData>() as u32,
                    writer: &|buf: &mut [u8]| buf.copy_from_slice(bytemuck::bytes_of(&data)),
                },
                DescriptorSetBindingData::SampledImage { image_view: ao_view },
                DescriptorSetBindingData::SampledImage {
                    image_view: depth_normals_view,
                },
            ],
        );
        let pipeline = pipeline_cache.get_graphics(
            "quad.vert.spv",
            "filter_x.frag.spv",
            self.pipeline_layout_x,
            &Self::graphics_pipeline_state(self.intermediate_render_pass),
        );

        self.begin_render_pass(cmd, self.intermediate_render_pass, self.intermediate_framebuffer);
        self.draw_quad(cmd, pipeline, self.pipeline_layout_x, descriptor_set);
        unsafe { self.context.device.cmd_end_render_pass(cmd) };

        emit_image_barrier(
            ImageUsage::ColorAttachmentWrite,
            ImageUsage::FragmentSampled,
            self.intermediate.image,
            &self.context.device,
            cmd,
        );
        self.intermediate_usage = ImageUsage::FragmentSampled;
    }

    /// Y pass into the swapchain. Leaves the render pass open so the
    /// caller can draw the UI on top before ending it.
    pub fn record_vertical(
        &self,
        cmd: vk::CommandBuffer,
        descriptor_pool: &DescriptorPool,
        pipeline_cache: &PipelineCache,
        framebuffer: vk::Framebuffer,
        color_view: vk::ImageView,
        depth_normals_view: vk::ImageView,
        normal_matrix: Mat3,
        output_mode: OutputMode,
    ) {
        let data = self.filter_data(normal_matrix, output_mode);
        let descriptor_set = descriptor_pool.create_descriptor_set(
            self.descriptor_set_layout_y,
            &[
                DescriptorSetBindingData::UniformData {
                    size: mem::size_of::<FilterData>() as u32,
                    writer: &|buf: &mut [u8]| buf.copy_from_slice(bytemuck::bytes_of(&data)),
                },
                DescriptorSetBindingData::SampledImage {
                    image_view: self.intermediate.view,
                },
                DescriptorSetBindingData::SampledImage {
                    image_view: depth_normals_view,
                },
                DescriptorSetBindingData::SampledImage { image_view: color_view },
            ],
        );
        let pipeline = pipeline_cache.get_graphics(
            "quad.vert.spv",
            "filter_y.frag.spv",
            self.pipeline_layout_y,
            &Self::graphics_pipeline_state(self.swapchain_render_pass),
        );

        self.begin_render_pass(cmd, self.swapchain_render_pass, framebuffer);
        self.draw_quad(cmd, pipeline, self.pipeline_layout_y, descriptor_set);
    }
}

impl Drop for FilterPass {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            device.destroy_render_pass(Some(self.swapchain_render_pass), None);
            device.destroy_framebuffer(Some(self.intermediate_framebuffer), None);
            device.destroy_render_pass(Some(self.intermediate_render_pass), None);
            device.destroy_sampler(Some(self.sampler), None);
        }
        self.intermediate.destroy(device);
        self.index_buffer.destroy(device);
        self.vertex_buffer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_uses_four_vertices_and_two_triangles() {
        assert_eq!(QUAD_VERTICES.len(), 4);
        assert_eq!(QUAD_INDICES, [0, 2, 1, 0, 3, 2]);
        assert_eq!(mem::size_of::<QuadVertex>(), 20);
    }

    #[test]
    fn constant_field_passes_through_the_filter() {
        let n = 2 * FILTER_RADIUS + 1;
        let ao = vec![0.25f32; n];
        let depth = vec![3.0f32; n];
        let normal = vec![Vec3::new(0.0, 1.0, 0.0); n];
        let filtered = filter_line(&ao, &depth, &normal, FILTER_RADIUS);
        assert!((filtered - 0.25).abs() < 1e-5);
    }

    #[test]
    fn depth_gaps_stop_the_filter() {
        let same = edge_stopping_weight(1.0, 1.0, Vec3::unit_y(), Vec3::unit_y());
        let gap = edge_stopping_weight(1.0, 2.0, Vec3::unit_y(), Vec3::unit_y());
        assert!(gap < same * 0.01);
    }

    #[test]
    fn normal_creases_stop_the_filter() {
        let same = edge_stopping_weight(1.0, 1.0, Vec3::unit_y(), Vec3::unit_y());
        let crease = edge_stopping_weight(1.0, 1.0, Vec3::unit_y(), Vec3::unit_x());
        assert!(crease < same * 0.01);
    }

    #[test]
    fn output_modes_map_to_shader_constants() {
        assert_eq!(OutputMode::AoOnly.as_u32(), 0);
        assert_eq!(OutputMode::AoAndColor.as_u32(), 1);
        assert_eq!(OutputMode::ColorOnly.as_u32(), 2);
    }
}
