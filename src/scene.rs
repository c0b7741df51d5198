use crate::context::*;
use crate::maths::*;
use bytemuck::{Pod, Zeroable};
use spark::vk;
use std::mem;
use std::slice;

// vk::AccelerationStructureInstanceKHR with Pod trait
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct AccelerationStructureInstance {
    transform: [f32; 12],
    instance_custom_index_and_mask: u32,
    instance_shader_binding_table_record_offset_and_flags: u32,
    acceleration_structure_reference: u64,
}

const IDENTITY_TRANSFORM: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
];

fn append_box(vertices: &mut Vec<Vec3>, indices: &mut Vec<u32>, centre: Vec3, half_extent: Vec3) {
    let base = vertices.len() as u32;
    for i in 0..8 {
        let sign = Vec3::new(
            if i & 1 != 0 { 1.0 } else { -1.0 },
            if i & 2 != 0 { 1.0 } else { -1.0 },
            if i & 4 != 0 { 1.0 } else { -1.0 },
        );
        vertices.push(centre + sign * half_extent);
    }
    const BOX_INDICES: [u32; 36] = [
        0, 2, 3, 0, 3, 1, // -z
        4, 5, 7, 4, 7, 6, // +z
        0, 4, 6, 0, 6, 2, // -x
        1, 3, 7, 1, 7, 5, // +x
        0, 1, 5, 0, 5, 4, // -y
        2, 6, 7, 2, 7, 3, // +y
    ];
    indices.extend(BOX_INDICES.iter().map(|&i| base + i));
}

fn append_ground_plane(vertices: &mut Vec<Vec3>, indices: &mut Vec<u32>, half_extent: f32) {
    let base = vertices.len() as u32;
    vertices.push(Vec3::new(-half_extent, 0.0, -half_extent));
    vertices.push(Vec3::new(half_extent, 0.0, -half_extent));
    vertices.push(Vec3::new(half_extent, 0.0, half_extent));
    vertices.push(Vec3::new(-half_extent, 0.0, half_extent));
    indices.extend([0, 2, 1, 0, 3, 2].iter().map(|&i| base + i));
}

/// A ground plane with a few boxes on it, enough geometry for occlusion
/// between objects and contact darkening at their bases.
fn build_mesh() -> (Vec<Vec3>, Vec<u32>) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    append_ground_plane(&mut vertices, &mut indices, 12.0);
    append_box(&mut vertices, &mut indices, Vec3::new(0.0, 1.0, 0.0), Vec3::new(1.0, 1.0, 1.0));
    append_box(&mut vertices, &mut indices, Vec3::new(-2.8, 0.6, 1.6), Vec3::new(0.6, 0.6, 0.6));
    append_box(&mut vertices, &mut indices, Vec3::new(2.4, 0.4, -1.8), Vec3::new(0.4, 0.4, 1.4));
    append_box(&mut vertices, &mut indices, Vec3::new(1.8, 2.4, 0.9), Vec3::new(0.3, 0.4, 0.3));
    (vertices, indices)
}

struct AccelLevel {
    accel: vk::AccelerationStructureKHR,
    buffer: BufferResource,
}

impl AccelLevel {
    fn destroy(&self, device: &spark::Device) {
        unsafe { device.destroy_acceleration_structure_khr(Some(self.accel), None) };
        self.buffer.destroy(device);
    }
}

/// Static geometry and its acceleration structures. Both levels are
/// built once into the init command buffer, the caller waits for that
/// submission before tracing.
pub struct Scene {
    context: SharedContext,
    vertex_buffer: BufferResource,
    index_buffer: BufferResource,
    instance_buffer: BufferResource,
    scratch_buffers: [BufferResource; 2],
    bottom_level: AccelLevel,
    top_level: AccelLevel,
    triangle_count: u32,
}

impl Scene {
    pub fn new(context: &SharedContext, cmd: vk::CommandBuffer) -> Self {
        let (vertices, indices) = build_mesh();
        let triangle_count = (indices.len() / 3) as u32;

        let geometry_usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let vertex_buffer = context.create_buffer_resource(
            (vertices.len() * mem::size_of::<Vec3>()) as vk::DeviceSize,
            geometry_usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        context.write_buffer_resource(&vertex_buffer, 0, bytemuck::cast_slice(&vertices));
        let index_buffer = context.create_buffer_resource(
            (indices.len() * mem::size_of::<u32>()) as vk::DeviceSize,
            geometry_usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        context.write_buffer_resource(&index_buffer, 0, bytemuck::cast_slice(&indices));

        let vertex_buffer_address = unsafe { context.device.get_buffer_device_address_helper(vertex_buffer.buffer) };
        let index_buffer_address = unsafe { context.device.get_buffer_device_address_helper(index_buffer.buffer) };

        let geometry_triangles_data = vk::AccelerationStructureGeometryTrianglesDataKHR {
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_data: vk::DeviceOrHostAddressConstKHR {
                device_address: vertex_buffer_address,
            },
            vertex_stride: mem::size_of::<Vec3>() as vk::DeviceSize,
            max_vertex: (vertices.len() - 1) as u32,
            index_type: vk::IndexType::UINT32,
            index_data: vk::DeviceOrHostAddressConstKHR {
                device_address: index_buffer_address,
            },
            ..Default::default()
        };
        let bottom_geometry = vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::TRIANGLES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                triangles: geometry_triangles_data,
            },
            flags: vk::GeometryFlagsKHR::OPAQUE,
            ..Default::default()
        };

        let (bottom_level, bottom_scratch) = Self::build_level(
            context,
            cmd,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &bottom_geometry,
            triangle_count,
        );

        // the bottom level address is known before the build is submitted
        let bottom_level_device_address = {
            let info = vk::AccelerationStructureDeviceAddressInfoKHR {
                acceleration_structure: Some(bottom_level.accel),
                ..Default::default()
            };
            unsafe { context.device.get_acceleration_structure_device_address_khr(&info) }
        };

        let instance = AccelerationStructureInstance {
            transform: IDENTITY_TRANSFORM,
            instance_custom_index_and_mask: 0xff_00_00_00,
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: bottom_level_device_address,
        };
        let instance_buffer = context.create_buffer_resource(
            mem::size_of::<AccelerationStructureInstance>() as vk::DeviceSize,
            geometry_usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        context.write_buffer_resource(&instance_buffer, 0, bytemuck::bytes_of(&instance));
        let instance_buffer_address =
            unsafe { context.device.get_buffer_device_address_helper(instance_buffer.buffer) };

        // the top level build reads what the bottom level build wrote
        let memory_barrier = vk::MemoryBarrier {
            src_access_mask: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            dst_access_mask: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            ..Default::default()
        };
        unsafe {
            context.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::DependencyFlags::empty(),
                slice::from_ref(&memory_barrier),
                &[],
                &[],
            )
        };

        let geometry_instance_data = vk::AccelerationStructureGeometryInstancesDataKHR {
            data: vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer_address,
            },
            ..Default::default()
        };
        let top_geometry = vk::AccelerationStructureGeometryKHR {
            geometry_type: vk::GeometryTypeKHR::INSTANCES,
            geometry: vk::AccelerationStructureGeometryDataKHR {
                instances: geometry_instance_data,
            },
            ..Default::default()
        };

        let (top_level, top_scratch) = Self::build_level(
            context,
            cmd,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &top_geometry,
            1,
        );

        Self {
            context: SharedContext::clone(context),
            vertex_buffer,
            index_buffer,
            instance_buffer,
            scratch_buffers: [bottom_scratch, top_scratch],
            bottom_level,
            top_level,
            triangle_count,
        }
    }

    fn build_level(
        context: &Context,
        cmd: vk::CommandBuffer,
        ty: vk::AccelerationStructureTypeKHR,
        geometry: &vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
    ) -> (AccelLevel, BufferResource) {
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            ty,
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            geometry_count: 1,
            p_geometries: geometry,
            ..Default::default()
        };

        let sizes = {
            let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
            unsafe {
                context.device.get_acceleration_structure_build_sizes_khr(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    Some(slice::from_ref(&primitive_count)),
                    &mut sizes,
                )
            };
            sizes
        };

        let buffer = context.create_buffer_resource(
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let accel = {
            let create_info = vk::AccelerationStructureCreateInfoKHR {
                buffer: Some(buffer.buffer),
                size: sizes.acceleration_structure_size,
                ty,
                ..Default::default()
            };
            unsafe { context.device.create_acceleration_structure_khr(&create_info, None) }.unwrap()
        };

        let scratch = context.create_buffer_resource(
            sizes.build_scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        let scratch_address = unsafe { context.device.get_buffer_device_address_helper(scratch.buffer) };

        build_info.dst_acceleration_structure = Some(accel);
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: scratch_address,
        };

        let build_range_info = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };
        unsafe {
            context
                .device
                .cmd_build_acceleration_structures_khr(cmd, slice::from_ref(&build_info), &[&build_range_info])
        };

        (AccelLevel { accel, buffer }, scratch)
    }

    pub fn top_level_accel(&self) -> vk::AccelerationStructureKHR {
        self.top_level.accel
    }

    pub fn vertex_buffer_address(&self) -> vk::DeviceAddress {
        unsafe { self.context.device.get_buffer_device_address_helper(self.vertex_buffer.buffer) }
    }

    pub fn index_buffer_address(&self) -> vk::DeviceAddress {
        unsafe { self.context.device.get_buffer_device_address_helper(self.index_buffer.buffer) }
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        let device = &self.context.device;
        self.top_level.destroy(device);
        self.bottom_level.destroy(device);
        for scratch in self.scratch_buffers.iter() {
            scratch.destroy(device);
        }
        self.instance_buffer.destroy(device);
        self.index_buffer.destroy(device);
        self.vertex_buffer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_indices_stay_in_bounds() {
        let (vertices, indices) = build_mesh();
        assert_eq!(indices.len() % 3, 0);
        for &i in indices.iter() {
            assert!((i as usize) < vertices.len());
        }
    }

    #[test]
    fn mesh_is_plane_plus_boxes() {
        let (vertices, indices) = build_mesh();
        // 4 plane vertices plus 8 per box
        assert_eq!((vertices.len() - 4) % 8, 0);
        let box_count = (vertices.len() - 4) / 8;
        assert_eq!(indices.len(), 6 + box_count * 36);
    }

    #[test]
    fn boxes_sit_on_or_above_the_ground() {
        let (vertices, _) = build_mesh();
        for v in &vertices[4..] {
            assert!(v.y >= -1e-3);
        }
    }
}
