use crate::command_buffer::CommandBufferPool;
use crate::context::*;
use crate::maths::align_up;
use arrayvec::ArrayVec;
use spark::{vk, Builder};
use std::cell::Cell;
use std::slice;

/// Byte offset of one frame's region within the uniform data buffer.
fn uniform_frame_base(frame_index: usize, size_per_frame: u32) -> u32 {
    ((frame_index % UniformDataPool::COUNT) as u32) * size_per_frame
}

/// Bump allocator for per-frame uniform data. One buffer holds a region
/// per frame in flight; a frame bumps through its own region and the
/// region is reused once that frame's fence has been waited on.
struct UniformDataPool {
    context: SharedContext,
    buffer: vk::Buffer,
    mem: vk::DeviceMemory,
    mapping: *mut u8,
    size_per_frame: u32,
    min_alignment: u32,
    atom_size: u32,
    frame_index: usize,
    next_offset: Cell<u32>,
}

impl UniformDataPool {
    const COUNT: usize = CommandBufferPool::COUNT;

    fn new(context: &SharedContext, size_per_frame: u32) -> Self {
        let limits = &context.physical_device_properties.limits;
        let min_alignment = limits.min_uniform_buffer_offset_alignment as u32;
        let atom_size = limits.non_coherent_atom_size as u32;

        let buffer = {
            let create_info = vk::BufferCreateInfo {
                size: vk::DeviceSize::from((Self::COUNT as u32) * size_per_frame),
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                ..Default::default()
            };
            unsafe { context.device.create_buffer(&create_info, None) }.unwrap()
        };
        let mem = {
            let mem_req = unsafe { context.device.get_buffer_memory_requirements(buffer) };
            let memory_type_index = context
                .get_memory_type_index(mem_req.memory_type_bits, vk::MemoryPropertyFlags::HOST_VISIBLE)
                .unwrap();
            let allocate_info = vk::MemoryAllocateInfo {
                allocation_size: mem_req.size,
                memory_type_index,
                ..Default::default()
            };
            unsafe { context.device.allocate_memory(&allocate_info, None) }.unwrap()
        };
        unsafe { context.device.bind_buffer_memory(buffer, mem, 0) }.unwrap();
        let mapping = unsafe { context.device.map_memory(mem, 0, vk::WHOLE_SIZE, Default::default()) }.unwrap();

        Self {
            context: SharedContext::clone(context),
            buffer,
            mem,
            mapping: mapping as *mut _,
            size_per_frame,
            min_alignment,
            atom_size,
            frame_index: 0,
            next_offset: Cell::new(0),
        }
    }

    fn begin_frame(&mut self) {
        self.frame_index += 1;
        self.next_offset.set(0);
    }

    fn end_frame(&mut self) {
        let usage = self.next_offset.get();
        if usage == 0 {
            return;
        }
        let mapped_range = vk::MappedMemoryRange {
            memory: Some(self.mem),
            offset: vk::DeviceSize::from(uniform_frame_base(self.frame_index, self.size_per_frame)),
            size: vk::DeviceSize::from(align_up(usage, self.atom_size)),
            ..Default::default()
        };
        unsafe {
            self.context
                .device
                .flush_mapped_memory_ranges(slice::from_ref(&mapped_range))
        }
        .unwrap();
    }

    fn get_buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Returns a writable slice and its byte offset within the buffer.
    fn alloc(&self, size: u32) -> Option<(&mut [u8], u32)> {
        let base = self.next_offset.get();
        let end = base + align_up(size, self.min_alignment);
        if end > self.size_per_frame {
            return None;
        }
        self.next_offset.set(end);

        let offset = uniform_frame_base(self.frame_index, self.size_per_frame) + base;
        let mapped = unsafe { slice::from_raw_parts_mut(self.mapping.add(offset as usize), size as usize) };
        Some((mapped, offset))
    }
}

impl Drop for UniformDataPool {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_buffer(Some(self.buffer), None);
            self.context.device.unmap_memory(self.mem);
            self.context.device.free_memory(Some(self.mem), None);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DescriptorSetLayoutBinding {
    SampledImage { sampler: vk::Sampler },
    StorageImage,
    UniformData { size: u32 },
    AccelerationStructure,
}

pub enum DescriptorSetBindingData<'a> {
    SampledImage { image_view: vk::ImageView },
    StorageImage { image_view: vk::ImageView },
    UniformData { size: u32, writer: &'a dyn Fn(&mut [u8]) },
    AccelerationStructure { accel: vk::AccelerationStructureKHR },
}

pub struct DescriptorSetLayoutCache {
    context: SharedContext,
    descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    pipeline_layouts: Vec<vk::PipelineLayout>,
}

impl DescriptorSetLayoutCache {
    pub fn new(context: &SharedContext) -> Self {
        Self {
            context: SharedContext::clone(context),
            descriptor_set_layouts: Vec::new(),
            pipeline_layouts: Vec::new(),
        }
    }

    pub fn create_descriptor_set_layout(&mut self, bindings: &[DescriptorSetLayoutBinding]) -> vk::DescriptorSetLayout {
        let mut bindings_vk = Vec::new();
        for (i, binding) in bindings.iter().enumerate() {
            match binding {
                DescriptorSetLayoutBinding::SampledImage { sampler } => {
                    bindings_vk.push(vk::DescriptorSetLayoutBinding {
                        binding: i as u32,
                        descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        descriptor_count: 1,
                        stage_flags: vk::ShaderStageFlags::ALL,
                        p_immutable_samplers: sampler,
                    });
                }
                DescriptorSetLayoutBinding::StorageImage => {
                    bindings_vk.push(vk::DescriptorSetLayoutBinding {
                        binding: i as u32,
                        descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                        descriptor_count: 1,
                        stage_flags: vk::ShaderStageFlags::ALL,
                        ..Default::default()
                    });
                }
                DescriptorSetLayoutBinding::UniformData { .. } => {
                    bindings_vk.push(vk::DescriptorSetLayoutBinding {
                        binding: i as u32,
                        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                        descriptor_count: 1,
                        stage_flags: vk::ShaderStageFlags::ALL,
                        ..Default::default()
                    });
                }
                DescriptorSetLayoutBinding::AccelerationStructure => bindings_vk.push(vk::DescriptorSetLayoutBinding {
                    binding: i as u32,
                    descriptor_type: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    descriptor_count: 1,
                    stage_flags: vk::ShaderStageFlags::ALL,
                    ..Default::default()
                }),
            }
        }
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().p_bindings(&bindings_vk);
        let descriptor_set_layout =
            unsafe { self.context.device.create_descriptor_set_layout(&create_info, None) }.unwrap();
        self.descriptor_set_layouts.push(descriptor_set_layout);
        descriptor_set_layout
    }

    pub fn create_pipeline_layout(&mut self, descriptor_set_layout: vk::DescriptorSetLayout) -> vk::PipelineLayout {
        let create_info =
            vk::PipelineLayoutCreateInfo::builder().p_set_layouts(slice::from_ref(&descriptor_set_layout));
        let pipeline_layout = unsafe { self.context.device.create_pipeline_layout(&create_info, None) }.unwrap();
        self.pipeline_layouts.push(pipeline_layout);
        pipeline_layout
    }
}

impl Drop for DescriptorSetLayoutCache {
    fn drop(&mut self) {
        let device = &self.context.device;
        for pipeline_layout in self.pipeline_layouts.iter() {
            unsafe { device.destroy_pipeline_layout(Some(*pipeline_layout), None) };
        }
        for descriptor_set_layout in self.descriptor_set_layouts.iter() {
            unsafe { device.destroy_descriptor_set_layout(Some(*descriptor_set_layout), None) };
        }
    }
}

/// Transient descriptor sets, written fresh every frame and recycled by a
/// whole-pool reset.
pub struct DescriptorPool {
    context: SharedContext,
    pools: [vk::DescriptorPool; Self::COUNT],
    pool_index: usize,
    uniform_data_pool: UniformDataPool,
}

impl DescriptorPool {
    const COUNT: usize = CommandBufferPool::COUNT;

    const MAX_DESCRIPTORS_PER_FRAME: u32 = 256;
    const MAX_SETS_PER_FRAME: u32 = 64;
    const MAX_UNIFORM_DATA_PER_FRAME: u32 = 64 * 1024;

    const MAX_DESCRIPTORS_PER_SET: usize = 16;

    pub fn new(context: &SharedContext) -> Self {
        let pools = {
            let descriptor_pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: Self::MAX_DESCRIPTORS_PER_FRAME,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    descriptor_count: Self::MAX_DESCRIPTORS_PER_FRAME,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: Self::MAX_DESCRIPTORS_PER_FRAME,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    descriptor_count: Self::MAX_DESCRIPTORS_PER_FRAME,
                },
            ];

            let descriptor_pool_create_info = vk::DescriptorPoolCreateInfo::builder()
                .max_sets(Self::MAX_SETS_PER_FRAME)
                .p_pool_sizes(&descriptor_pool_sizes);

            let mut pools = ArrayVec::new();
            for _i in 0..Self::COUNT {
                pools.push(
                    unsafe {
                        context
                            .device
                            .create_descriptor_pool(&descriptor_pool_create_info, None)
                    }
                    .unwrap(),
                );
            }
            pools.into_inner().unwrap()
        };
        Self {
            context: SharedContext::clone(context),
            pools,
            pool_index: 0,
            uniform_data_pool: UniformDataPool::new(context, Self::MAX_UNIFORM_DATA_PER_FRAME),
        }
    }

    pub fn begin_frame(&mut self) {
        self.pool_index = (self.pool_index + 1) % Self::COUNT;
        unsafe {
            self.context
                .device
                .reset_descriptor_pool(self.pools[self.pool_index], vk::DescriptorPoolResetFlags::empty())
        }
        .unwrap();
        self.uniform_data_pool.begin_frame();
    }

    pub fn end_frame(&mut self) {
        self.uniform_data_pool.end_frame();
    }

    pub fn create_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        data: &[DescriptorSetBindingData],
    ) -> vk::DescriptorSet {
        let descriptor_set_allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pools[self.pool_index])
            .p_set_layouts(slice::from_ref(&layout));
        let descriptor_set = unsafe {
            self.context
                .device
                .allocate_descriptor_sets_single(&descriptor_set_allocate_info)
        }
        .unwrap();

        let mut buffer_info = ArrayVec::<_, { Self::MAX_DESCRIPTORS_PER_SET }>::new();
        let mut image_info = ArrayVec::<_, { Self::MAX_DESCRIPTORS_PER_SET }>::new();
        let mut writes = ArrayVec::<_, { Self::MAX_DESCRIPTORS_PER_SET }>::new();
        let mut acceleration_structure_writes = ArrayVec::<_, { Self::MAX_DESCRIPTORS_PER_SET }>::new();

        for (i, data) in data.iter().enumerate() {
            match data {
                DescriptorSetBindingData::SampledImage { image_view } => {
                    image_info.push(vk::DescriptorImageInfo {
                        sampler: None,
                        image_view: Some(*image_view),
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });

                    writes.push(vk::WriteDescriptorSet {
                        dst_set: Some(descriptor_set),
                        dst_binding: i as u32,
                        descriptor_count: 1,
                        descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        p_image_info: image_info.last().unwrap(),
                        ..Default::default()
                    });
                }
                DescriptorSetBindingData::StorageImage { image_view } => {
                    image_info.push(vk::DescriptorImageInfo {
                        sampler: None,
                        image_view: Some(*image_view),
                        image_layout: vk::ImageLayout::GENERAL,
                    });

                    writes.push(vk::WriteDescriptorSet {
                        dst_set: Some(descriptor_set),
                        dst_binding: i as u32,
                        descriptor_count: 1,
                        descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                        p_image_info: image_info.last().unwrap(),
                        ..Default::default()
                    });
                }
                DescriptorSetBindingData::UniformData { size, writer } => {
                    let size = *size;
                    let (addr, offset) = self
                        .uniform_data_pool
                        .alloc(size)
                        .expect("out of per-frame uniform data");
                    writer(addr);

                    buffer_info.push(vk::DescriptorBufferInfo {
                        buffer: Some(self.uniform_data_pool.get_buffer()),
                        offset: vk::DeviceSize::from(offset),
                        range: vk::DeviceSize::from(size),
                    });

                    writes.push(vk::WriteDescriptorSet {
                        dst_set: Some(descriptor_set),
                        dst_binding: i as u32,
                        descriptor_count: 1,
                        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                        p_buffer_info: buffer_info.last().unwrap(),
                        ..Default::default()
                    });
                }
                DescriptorSetBindingData::AccelerationStructure { accel } => {
                    acceleration_structure_writes.push(vk::WriteDescriptorSetAccelerationStructureKHR {
                        acceleration_structure_count: 1,
                        p_acceleration_structures: accel,
                        ..Default::default()
                    });

                    writes.push(vk::WriteDescriptorSet {
                        dst_set: Some(descriptor_set),
                        dst_binding: i as u32,
                        descriptor_count: 1,
                        descriptor_type: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                        p_next: acceleration_structure_writes.last().unwrap() as *const _ as *const _,
                        ..Default::default()
                    });
                }
            }
        }

        unsafe { self.context.device.update_descriptor_sets(&writes, &[]) };

        descriptor_set
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        let device = &self.context.device;
        for pool in self.pools.iter() {
            unsafe {
                device.destroy_descriptor_pool(Some(*pool), None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_frame_regions_alternate_without_overlap() {
        let size = 64 * 1024;
        assert_eq!(uniform_frame_base(0, size), 0);
        assert_eq!(uniform_frame_base(1, size), size);
        // after a full latency period the first region is reused
        assert_eq!(uniform_frame_base(UniformDataPool::COUNT, size), 0);
    }
}
