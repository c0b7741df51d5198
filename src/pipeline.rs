use crate::context::*;
use crate::maths::align_up;
use arrayvec::ArrayVec;
use notify::{DebouncedEvent, RecommendedWatcher, RecursiveMode, Watcher};
use spark::{vk, Builder};
use std::collections::HashMap;
use std::ffi::CStr;
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

fn read_spirv(path: &Path) -> io::Result<Vec<u32>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 4 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "SPIR-V is not a whole number of words",
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

/// Loads SPIR-V modules from a flat directory, swapping in recompiled
/// ones as file change events arrive. Events are polled once per frame
/// rather than on a watcher thread, so module handles only ever change
/// between frames.
struct ShaderLoader {
    context: SharedContext,
    base_path: PathBuf,
    _watcher: RecommendedWatcher,
    file_events: mpsc::Receiver<DebouncedEvent>,
    modules: Mutex<HashMap<PathBuf, vk::ShaderModule>>,
}

impl ShaderLoader {
    fn new<P: AsRef<Path>>(context: &SharedContext, base_path: P) -> Self {
        let base_path = base_path.as_ref().to_owned();

        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::watcher(tx, Duration::from_millis(500)).unwrap();
        if let Err(err) = watcher.watch(&base_path, RecursiveMode::NonRecursive) {
            println!("shader reload disabled: {:?}", err);
        }

        Self {
            context: SharedContext::clone(context),
            base_path,
            _watcher: watcher,
            file_events: rx,
            modules: Mutex::new(HashMap::new()),
        }
    }

    fn create_module(&self, file_name: &Path) -> Option<vk::ShaderModule> {
        let words = read_spirv(&self.base_path.join(file_name)).ok()?;
        let create_info = vk::ShaderModuleCreateInfo {
            code_size: words.len() * mem::size_of::<u32>(),
            p_code: words.as_ptr(),
            ..Default::default()
        };
        unsafe { self.context.device.create_shader_module(&create_info, None) }.ok()
    }

    fn poll_file_changes(&mut self) {
        while let Ok(event) = self.file_events.try_recv() {
            let changed = match event {
                DebouncedEvent::Create(path)
                | DebouncedEvent::Write(path)
                | DebouncedEvent::Rename(_, path) => path,
                _ => continue,
            };
            let file_name = match changed.file_name() {
                Some(file_name) => PathBuf::from(file_name),
                None => continue,
            };
            if let Some(module) = self.create_module(&file_name) {
                println!("reloaded shader: {:?}", file_name);
                if let Some(old) = self.modules.lock().unwrap().insert(file_name, module) {
                    unsafe { self.context.device.destroy_shader_module(Some(old), None) };
                }
            }
        }
    }

    fn get_shader<P: AsRef<Path>>(&self, relative_path: P) -> Option<vk::ShaderModule> {
        let relative_path = relative_path.as_ref();
        let mut modules = self.modules.lock().unwrap();
        if let Some(&module) = modules.get(relative_path) {
            return Some(module);
        }
        let module = self.create_module(relative_path)?;
        modules.insert(relative_path.to_owned(), module);
        Some(module)
    }
}

impl Drop for ShaderLoader {
    fn drop(&mut self) {
        for (_, module) in self.modules.lock().unwrap().drain() {
            unsafe {
                self.context.device.destroy_shader_module(Some(module), None);
            }
        }
    }
}

#[derive(Clone, Eq, PartialEq, Hash)]
pub struct GraphicsPipelineState {
    vertex_input_bindings: ArrayVec<vk::VertexInputBindingDescription, 4>,
    vertex_input_attributes: ArrayVec<vk::VertexInputAttributeDescription, 8>,
    render_pass: vk::RenderPass,
}

impl GraphicsPipelineState {
    pub fn new(render_pass: vk::RenderPass) -> Self {
        Self {
            vertex_input_bindings: ArrayVec::new(),
            vertex_input_attributes: ArrayVec::new(),
            render_pass,
        }
    }

    pub fn with_vertex_inputs(
        mut self,
        bindings: &[vk::VertexInputBindingDescription],
        attributes: &[vk::VertexInputAttributeDescription],
    ) -> Self {
        self.vertex_input_bindings.clear();
        self.vertex_input_bindings.try_extend_from_slice(bindings).unwrap();
        self.vertex_input_attributes.clear();
        self.vertex_input_attributes.try_extend_from_slice(attributes).unwrap();
        self
    }
}

pub enum RayTracingShaderGroupDesc<'a> {
    Raygen(&'a str),
    Miss(&'a str),
    TrianglesHit { closest_hit: &'a str },
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum RayTracingShaderGroup {
    Raygen(vk::ShaderModule),
    Miss(vk::ShaderModule),
    TrianglesHit { closest_hit: vk::ShaderModule },
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum PipelineCacheKey {
    Graphics {
        pipeline_layout: vk::PipelineLayout,
        vertex_shader: vk::ShaderModule,
        fragment_shader: vk::ShaderModule,
        state: GraphicsPipelineState,
    },
    Ui {
        render_pass: vk::RenderPass,
    },
    RayTracing {
        pipeline_layout: vk::PipelineLayout,
        shader_groups: ArrayVec<RayTracingShaderGroup, { PipelineCache::RAY_TRACING_MAX_SHADER_GROUPS }>,
    },
}

pub struct PipelineCache {
    context: SharedContext,
    shader_loader: ShaderLoader,
    pipeline_cache: vk::PipelineCache,
    current_pipelines: HashMap<PipelineCacheKey, vk::Pipeline>,
    new_pipelines: Mutex<HashMap<PipelineCacheKey, vk::Pipeline>>,
}

impl PipelineCache {
    const RAY_TRACING_MAX_MODULES: usize = 8;
    const RAY_TRACING_MAX_SHADER_GROUPS: usize = 5;

    pub fn new<P: AsRef<Path>>(context: &SharedContext, path: P) -> Self {
        let pipeline_cache = {
            let create_info = vk::PipelineCacheCreateInfo::default();
            unsafe { context.device.create_pipeline_cache(&create_info, None) }.unwrap()
        };
        Self {
            context: SharedContext::clone(context),
            shader_loader: ShaderLoader::new(context, path),
            pipeline_cache,
            current_pipelines: HashMap::new(),
            new_pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin_frame(&mut self) {
        self.shader_loader.poll_file_changes();

        let mut new_pipelines = self.new_pipelines.lock().unwrap();
        for (k, v) in new_pipelines.drain() {
            self.current_pipelines.insert(k, v);
        }
    }

    pub fn get_graphics(
        &self,
        vertex_shader_name: &str,
        fragment_shader_name: &str,
        pipeline_layout: vk::PipelineLayout,
        state: &GraphicsPipelineState,
    ) -> vk::Pipeline {
        let vertex_shader = self.shader_loader.get_shader(vertex_shader_name).unwrap();
        let fragment_shader = self.shader_loader.get_shader(fragment_shader_name).unwrap();
        let key = PipelineCacheKey::Graphics {
            pipeline_layout,
            vertex_shader,
            fragment_shader,
            state: state.clone(),
        };
        self.current_pipelines.get(&key).copied().unwrap_or_else(|| {
            let mut new_pipelines = self.new_pipelines.lock().unwrap();
            *new_pipelines.entry(key).or_insert_with(|| {
                let shader_entry_name = CStr::from_bytes_with_nul(b"main\0").unwrap();
                let shader_stage_create_info = [
                    vk::PipelineShaderStageCreateInfo {
                        stage: vk::ShaderStageFlags::VERTEX,
                        module: Some(vertex_shader),
                        p_name: shader_entry_name.as_ptr(),
                        ..Default::default()
                    },
                    vk::PipelineShaderStageCreateInfo {
                        stage: vk::ShaderStageFlags::FRAGMENT,
                        module: Some(fragment_shader),
                        p_name: shader_entry_name.as_ptr(),
                        ..Default::default()
                    },
                ];

                let vertex_input_state_create_info = vk::PipelineVertexInputStateCreateInfo::builder()
                    .p_vertex_attribute_descriptions(&state.vertex_input_attributes)
                    .p_vertex_binding_descriptions(&state.vertex_input_bindings);
                let input_assembly_state_create_info = vk::PipelineInputAssemblyStateCreateInfo {
                    topology: vk::PrimitiveTopology::TRIANGLE_LIST,
                    ..Default::default()
                };

                let viewport_state_create_info = vk::PipelineViewportStateCreateInfo {
                    viewport_count: 1,
                    scissor_count: 1,
                    ..Default::default()
                };

                let rasterization_state_create_info = vk::PipelineRasterizationStateCreateInfo {
                    polygon_mode: vk::PolygonMode::FILL,
                    cull_mode: vk::CullModeFlags::NONE,
                    front_face: vk::FrontFace::COUNTER_CLOCKWISE,
                    line_width: 1.0,
                    ..Default::default()
                };
                let multisample_state_create_info = vk::PipelineMultisampleStateCreateInfo {
                    rasterization_samples: vk::SampleCountFlags::N1,
                    ..Default::default()
                };

                let color_blend_attachment_state = vk::PipelineColorBlendAttachmentState {
                    color_write_mask: vk::ColorComponentFlags::all(),
                    ..Default::default()
                };
                let color_blend_state_create_info = vk::PipelineColorBlendStateCreateInfo::builder()
                    .p_attachments(slice::from_ref(&color_blend_attachment_state));

                let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
                let pipeline_dynamic_state_create_info =
                    vk::PipelineDynamicStateCreateInfo::builder().p_dynamic_states(&dynamic_states);

                let pipeline_create_info = vk::GraphicsPipelineCreateInfo::builder()
                    .p_stages(&shader_stage_create_info)
                    .p_vertex_input_state(Some(&vertex_input_state_create_info))
                    .p_input_assembly_state(Some(&input_assembly_state_create_info))
                    .p_viewport_state(Some(&viewport_state_create_info))
                    .p_rasterization_state(&rasterization_state_create_info)
                    .p_multisample_state(Some(&multisample_state_create_info))
                    .p_color_blend_state(Some(&color_blend_state_create_info))
                    .p_dynamic_state(Some(&pipeline_dynamic_state_create_info))
                    .layout(pipeline_layout)
                    .render_pass(state.render_pass);

                unsafe {
                    self.context.device.create_graphics_pipelines_single(
                        Some(self.pipeline_cache),
                        &pipeline_create_info,
                        None,
                    )
                }
                .unwrap()
            })
        })
    }

    pub fn get_ui(&self, ui_renderer: &spark_egui::Renderer, render_pass: vk::RenderPass) -> vk::Pipeline {
        let key = PipelineCacheKey::Ui { render_pass };
        self.current_pipelines.get(&key).copied().unwrap_or_else(|| {
            let mut new_pipelines = self.new_pipelines.lock().unwrap();
            *new_pipelines.entry(key).or_insert_with(|| {
                ui_renderer.create_pipeline(&self.context.device, render_pass, vk::SampleCountFlags::N1)
            })
        })
    }

    pub fn get_ray_tracing(
        &self,
        group_desc: &[RayTracingShaderGroupDesc],
        pipeline_layout: vk::PipelineLayout,
    ) -> vk::Pipeline {
        assert!(group_desc.len() <= Self::RAY_TRACING_MAX_SHADER_GROUPS);
        let shader_groups: ArrayVec<_, { Self::RAY_TRACING_MAX_SHADER_GROUPS }> = group_desc
            .iter()
            .map(|desc| match desc {
                RayTracingShaderGroupDesc::Raygen(raygen) => {
                    RayTracingShaderGroup::Raygen(self.shader_loader.get_shader(raygen).unwrap())
                }
                RayTracingShaderGroupDesc::Miss(miss) => {
                    RayTracingShaderGroup::Miss(self.shader_loader.get_shader(miss).unwrap())
                }
                RayTracingShaderGroupDesc::TrianglesHit { closest_hit } => RayTracingShaderGroup::TrianglesHit {
                    closest_hit: self.shader_loader.get_shader(closest_hit).unwrap(),
                },
            })
            .collect();
        let key = PipelineCacheKey::RayTracing {
            pipeline_layout,
            shader_groups: shader_groups.clone(),
        };
        self.current_pipelines.get(&key).copied().unwrap_or_else(|| {
            let mut new_pipelines = self.new_pipelines.lock().unwrap();
            *new_pipelines.entry(key).or_insert_with(|| {
                let shader_entry_name = CStr::from_bytes_with_nul(b"main\0").unwrap();
                let mut shader_stage_create_info = ArrayVec::<_, { Self::RAY_TRACING_MAX_MODULES }>::new();
                let mut get_stage_index = |stage, module| {
                    if let Some(i) = shader_stage_create_info.iter().enumerate().find_map(
                        |(i, info): (usize, &vk::PipelineShaderStageCreateInfo)| {
                            if stage == info.stage && Some(module) == info.module {
                                Some(i as u32)
                            } else {
                                None
                            }
                        },
                    ) {
                        i
                    } else {
                        shader_stage_create_info.push(vk::PipelineShaderStageCreateInfo {
                            stage,
                            module: Some(module),
                            p_name: shader_entry_name.as_ptr(),
                            ..Default::default()
                        });
                        (shader_stage_create_info.len() - 1) as u32
                    }
                };

                let shader_group_create_info: ArrayVec<_, { Self::RAY_TRACING_MAX_SHADER_GROUPS }> = shader_groups
                    .iter()
                    .map(|group| match group {
                        RayTracingShaderGroup::Raygen(raygen) => vk::RayTracingShaderGroupCreateInfoKHR {
                            ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
                            general_shader: get_stage_index(vk::ShaderStageFlags::RAYGEN_KHR, *raygen),
                            closest_hit_shader: vk::SHADER_UNUSED_KHR,
                            any_hit_shader: vk::SHADER_UNUSED_KHR,
                            intersection_shader: vk::SHADER_UNUSED_KHR,
                            ..Default::default()
                        },
                        RayTracingShaderGroup::Miss(miss) => vk::RayTracingShaderGroupCreateInfoKHR {
                            ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
                            general_shader: get_stage_index(vk::ShaderStageFlags::MISS_KHR, *miss),
                            closest_hit_shader: vk::SHADER_UNUSED_KHR,
                            any_hit_shader: vk::SHADER_UNUSED_KHR,
                            intersection_shader: vk::SHADER_UNUSED_KHR,
                            ..Default::default()
                        },
                        RayTracingShaderGroup::TrianglesHit { closest_hit } => {
                            vk::RayTracingShaderGroupCreateInfoKHR {
                                ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                                general_shader: vk::SHADER_UNUSED_KHR,
                                closest_hit_shader: get_stage_index(
                                    vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                                    *closest_hit,
                                ),
                                any_hit_shader: vk::SHADER_UNUSED_KHR,
                                intersection_shader: vk::SHADER_UNUSED_KHR,
                                ..Default::default()
                            }
                        }
                    })
                    .collect();

                let pipeline_create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
                    .p_stages(&shader_stage_create_info)
                    .p_groups(&shader_group_create_info)
                    .layout(pipeline_layout)
                    .max_pipeline_ray_recursion_depth(1);

                unsafe {
                    self.context.device.create_ray_tracing_pipelines_khr_single(
                        None,
                        Some(self.pipeline_cache),
                        &pipeline_create_info,
                        None,
                    )
                }
                .unwrap()
            })
        })
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        for (_, pipeline) in self
            .new_pipelines
            .lock()
            .unwrap()
            .drain()
            .chain(self.current_pipelines.drain())
        {
            unsafe {
                self.context.device.destroy_pipeline(Some(pipeline), None);
            }
        }
        unsafe {
            self.context
                .device
                .destroy_pipeline_cache(Some(self.pipeline_cache), None)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderBindingRegion {
    pub offset: u32,
    pub stride: u32,
    pub size: u32,
}

impl ShaderBindingRegion {
    pub fn into_device_address_region(self, base_device_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: base_device_address + self.offset as vk::DeviceSize,
            stride: self.stride as vk::DeviceSize,
            size: self.size as vk::DeviceSize,
        }
    }
}

/// Offsets of the raygen/miss/hit regions within one shader binding table
/// buffer. The raygen region holds `raygen_record_count` records of identical
/// stride, so selecting between them is a fixed-size jump from the region
/// start.
#[derive(Clone, Copy, Debug)]
pub struct ShaderBindingLayout {
    pub raygen: ShaderBindingRegion,
    pub miss: ShaderBindingRegion,
    pub hit: ShaderBindingRegion,
    pub total_size: u32,
}

impl ShaderBindingLayout {
    pub fn new(
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
        raygen_record_data_size: u32,
        raygen_record_count: u32,
        hit_record_data_size: u32,
    ) -> Self {
        let mut next_offset = 0;

        let mut raygen_stride = align_up(handle_size + raygen_record_data_size, handle_alignment);
        if raygen_record_count > 1 {
            // each record can start a dispatch region, so every record
            // must sit at base alignment, not just handle alignment
            raygen_stride = align_up(raygen_stride, base_alignment);
        }
        let raygen = ShaderBindingRegion {
            offset: next_offset,
            stride: raygen_stride,
            size: raygen_stride * raygen_record_count,
        };
        next_offset += align_up(raygen.size, base_alignment);

        let miss_stride = align_up(handle_size, handle_alignment);
        let miss = ShaderBindingRegion {
            offset: next_offset,
            stride: miss_stride,
            size: miss_stride,
        };
        next_offset += align_up(miss.size, base_alignment);

        let hit_stride = align_up(handle_size + hit_record_data_size, handle_alignment);
        let hit = ShaderBindingRegion {
            offset: next_offset,
            stride: hit_stride,
            size: hit_stride,
        };
        next_offset += align_up(hit.size, base_alignment);

        Self {
            raygen,
            miss,
            hit,
            total_size: next_offset,
        }
    }

    /// Byte offset of one raygen record within the table buffer.
    pub fn raygen_record_offset(&self, record_index: u32) -> u32 {
        self.raygen.offset + record_index * self.raygen.stride
    }

    /// Region covering exactly one raygen record, for dispatch.
    pub fn raygen_record_region(&self, record_index: u32) -> ShaderBindingRegion {
        ShaderBindingRegion {
            offset: self.raygen_record_offset(record_index),
            stride: self.raygen.stride,
            size: self.raygen.stride,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HANDLE_SIZE: u32 = 32;
    const HANDLE_ALIGNMENT: u32 = 32;
    const BASE_ALIGNMENT: u32 = 64;

    #[test]
    fn spirv_words_decode_little_endian() {
        let path = std::env::temp_dir().join("rtao_spirv_words.spv");
        fs::write(&path, [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00]).unwrap();
        let words = read_spirv(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(words, [0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn truncated_spirv_is_rejected() {
        let path = std::env::temp_dir().join("rtao_spirv_truncated.spv");
        fs::write(&path, [0x03, 0x02, 0x23]).unwrap();
        let result = read_spirv(&path);
        fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn records_are_handle_plus_inline_data_padded_to_alignment() {
        let layout = ShaderBindingLayout::new(HANDLE_SIZE, HANDLE_ALIGNMENT, BASE_ALIGNMENT, 8, 2, 16);
        // 32 byte handle + inline arguments padded to the next multiple of 32
        assert_eq!(layout.raygen.stride, 64);
        assert_eq!(layout.miss.stride, 32);
        assert_eq!(layout.hit.stride, 64);
    }

    #[test]
    fn regions_start_at_base_alignment() {
        let layout = ShaderBindingLayout::new(HANDLE_SIZE, HANDLE_ALIGNMENT, BASE_ALIGNMENT, 8, 2, 16);
        assert_eq!(layout.raygen.offset % BASE_ALIGNMENT, 0);
        assert_eq!(layout.miss.offset % BASE_ALIGNMENT, 0);
        assert_eq!(layout.hit.offset % BASE_ALIGNMENT, 0);
        assert!(layout.miss.offset >= layout.raygen.offset + layout.raygen.size);
        assert!(layout.hit.offset >= layout.miss.offset + layout.miss.size);
        assert!(layout.total_size >= layout.hit.offset + layout.hit.size);
    }

    #[test]
    fn raygen_record_selection_is_a_fixed_stride_jump() {
        let layout = ShaderBindingLayout::new(HANDLE_SIZE, HANDLE_ALIGNMENT, BASE_ALIGNMENT, 8, 2, 0);
        let even = layout.raygen_record_offset(0);
        let odd = layout.raygen_record_offset(1);
        assert_eq!(odd - even, layout.raygen.stride);

        let region = layout.raygen_record_region(1);
        assert_eq!(region.offset, odd);
        assert_eq!(region.size, layout.raygen.stride);
    }

    #[test]
    fn every_raygen_record_sits_at_base_alignment() {
        // handle alignment smaller than base alignment, as on devices
        // where handles only need 4 byte alignment
        let layout = ShaderBindingLayout::new(HANDLE_SIZE, 4, BASE_ALIGNMENT, 8, 2, 0);
        for record_index in 0..2 {
            assert_eq!(layout.raygen_record_offset(record_index) % BASE_ALIGNMENT, 0);
        }
        assert_eq!(layout.raygen.stride % BASE_ALIGNMENT, 0);

        // a single record region needs no extra stride padding
        let single = ShaderBindingLayout::new(HANDLE_SIZE, 4, BASE_ALIGNMENT, 8, 1, 0);
        assert_eq!(single.raygen.stride, 40);
        assert_eq!(single.raygen.offset % BASE_ALIGNMENT, 0);
    }

    #[test]
    fn device_address_region_applies_offset() {
        let region = ShaderBindingRegion {
            offset: 128,
            stride: 64,
            size: 64,
        };
        let addressed = region.into_device_address_region(0x1000);
        assert_eq!(addressed.device_address, 0x1080);
        assert_eq!(addressed.stride, 64);
        assert_eq!(addressed.size, 64);
    }
}
