use crate::context::*;
use crate::descriptor::*;
use crate::filter::*;
use crate::frames::*;
use crate::maths::*;
use crate::pipeline::*;
use crate::primary::PrimaryPass;
use crate::profiler::{GpuProfiler, ProfileHandle};
use crate::rtao::{AoSettings, OcclusionPass};
use crate::samples;
use crate::scene::Scene;
use spark::vk;
use std::f32::consts::PI;
use std::time::{Duration, Instant};
use strum::IntoEnumIterator;

const PROFILE_PRIMARY: &str = "Primary Rays Time";
const PROFILE_OCCLUSION: &str = "AO Raytracing Time";
const PROFILE_FILTER: &str = "AO Filtering Time";
const PROFILE_TOTAL: &str = "Total Frame Time";

const UI_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

struct Camera {
    angle: f32,
    is_rotating: bool,
}

struct CameraFrame {
    ray_origin: Vec3,
    ray_vec_from_coord: Mat3,
    normal_matrix: Mat3,
}

impl Camera {
    const VERTICAL_FOV: f32 = PI / 7.0;
    const DISTANCE: f32 = 14.0;
    const PITCH: f32 = 0.35;

    fn frame(&self, size: UVec2) -> CameraFrame {
        let rotation = Rotor3::from_rotation_xz(self.angle) * Rotor3::from_rotation_yz(Self::PITCH);
        let eye = rotation * Vec3::new(0.0, 0.0, Self::DISTANCE) + Vec3::new(0.0, 1.0, 0.0);
        let world_from_view = Isometry3::new(eye, rotation);

        let aspect_ratio = (size.x as f32) / (size.y as f32);
        let xy_from_st = Scale2Offset2::new(
            Vec2::new(aspect_ratio, 1.0) * (0.5 * Self::VERTICAL_FOV).tan(),
            Vec2::zero(),
        );
        let st_from_uv = Scale2Offset2::new(Vec2::new(-2.0, 2.0), Vec2::new(1.0, -1.0));
        let coord_from_uv = Scale2Offset2::new(size.as_float(), Vec2::zero());
        let xy_from_coord = xy_from_st * st_from_uv * coord_from_uv.inversed();

        CameraFrame {
            ray_origin: world_from_view.translation,
            ray_vec_from_coord: world_from_view.rotation.into_matrix()
                * Mat3::from_scale(-1.0)
                * xy_from_coord.into_homogeneous_matrix(),
            normal_matrix: world_from_view.rotation.reversed().into_matrix(),
        }
    }
}

/// Runs the three stages in order each frame: primary rays, occlusion
/// rays, then the separable filter into the swapchain.
pub struct Renderer {
    context: SharedContext,
    descriptor_set_layout_cache: DescriptorSetLayoutCache,
    scene: Scene,
    frame_resources: FrameResources,
    primary: PrimaryPass,
    occlusion: OcclusionPass,
    filter: FilterPass,
    profiler: GpuProfiler,
    camera: Camera,
    ao_settings: AoSettings,
    output_mode: OutputMode,
    frame_index: u64,
    camera_frame: Option<CameraFrame>,
    filter_profile: Option<ProfileHandle>,
    total_profile: Option<ProfileHandle>,
    ui_timings: Vec<(&'static str, f32)>,
    ui_refreshed_at: Instant,
}

impl Renderer {
    pub fn new(
        context: &SharedContext,
        pipeline_cache: &PipelineCache,
        init_cmd: vk::CommandBuffer,
        size: UVec2,
        swapchain_format: vk::Format,
    ) -> Self {
        let mut descriptor_set_layout_cache = DescriptorSetLayoutCache::new(context);
        let scene = Scene::new(context, init_cmd);
        let frame_resources = FrameResources::new(context, size);
        let primary = PrimaryPass::new(context, &mut descriptor_set_layout_cache, pipeline_cache, &scene, size);
        let occlusion = OcclusionPass::new(context, &mut descriptor_set_layout_cache, pipeline_cache, init_cmd, size);
        let filter = FilterPass::new(context, &mut descriptor_set_layout_cache, size, swapchain_format);
        let profiler = GpuProfiler::new(context);

        Self {
            context: SharedContext::clone(context),
            descriptor_set_layout_cache,
            scene,
            frame_resources,
            primary,
            occlusion,
            filter,
            profiler,
            camera: Camera {
                angle: 0.4,
                is_rotating: true,
            },
            ao_settings: AoSettings::default(),
            output_mode: OutputMode::AoAndColor,
            frame_index: 0,
            camera_frame: None,
            filter_profile: None,
            total_profile: None,
            ui_timings: Vec::new(),
            ui_refreshed_at: Instant::now(),
        }
    }

    pub fn swapchain_render_pass(&self) -> vk::RenderPass {
        self.filter.swapchain_render_pass()
    }

    fn parity(&self) -> FrameParity {
        FrameParity::from_frame_index(self.frame_index)
    }

    /// Everything that does not touch the swapchain image: both ray
    /// passes and the horizontal half of the filter.
    pub fn render_scene(
        &mut self,
        cmd: vk::CommandBuffer,
        descriptor_pool: &DescriptorPool,
        pipeline_cache: &PipelineCache,
        delta_time: f32,
    ) {
        let parity = self.parity();
        let size = self.frame_resources.size();

        self.profiler.begin_frame(cmd);
        self.total_profile = self.profiler.begin(cmd, PROFILE_TOTAL);

        if self.camera.is_rotating {
            self.camera.angle += 0.2 * delta_time;
        }
        let camera_frame = self.camera.frame(size);

        let primary_profile = self.profiler.begin(cmd, PROFILE_PRIMARY);
        self.primary.record(
            cmd,
            descriptor_pool,
            &mut self.frame_resources,
            parity,
            &self.scene,
            camera_frame.ray_origin,
            camera_frame.ray_vec_from_coord,
        );
        self.profiler.end(cmd, primary_profile);

        self.occlusion.update(
            parity,
            self.frame_index as u32,
            &self.ao_settings,
            camera_frame.ray_origin,
            camera_frame.ray_vec_from_coord,
        );
        let occlusion_profile = self.profiler.begin(cmd, PROFILE_OCCLUSION);
        self.occlusion
            .record(cmd, descriptor_pool, &mut self.frame_resources, parity, &self.scene);
        self.profiler.end(cmd, occlusion_profile);

        self.filter_profile = self.profiler.begin(cmd, PROFILE_FILTER);
        self.frame_resources.transition_for_filter(cmd, parity);
        self.filter.record_horizontal(
            cmd,
            descriptor_pool,
            pipeline_cache,
            self.frame_resources.ao_output_view(parity),
            self.frame_resources.depth_normals_view(parity),
            camera_frame.normal_matrix,
            self.output_mode,
        );

        self.camera_frame = Some(camera_frame);
    }

    /// The vertical filter half, straight into the given swapchain
    /// framebuffer. Leaves the render pass open for the UI.
    pub fn composite(
        &mut self,
        cmd: vk::CommandBuffer,
        descriptor_pool: &DescriptorPool,
        pipeline_cache: &PipelineCache,
        framebuffer: vk::Framebuffer,
    ) {
        let parity = self.parity();
        let camera_frame = self.camera_frame.as_ref().unwrap();

        self.primary.transition_color_for_filter(cmd);
        self.filter.record_vertical(
            cmd,
            descriptor_pool,
            pipeline_cache,
            framebuffer,
            self.primary.color_view(),
            self.frame_resources.depth_normals_view(parity),
            camera_frame.normal_matrix,
            self.output_mode,
        );
    }

    /// Called once the UI has been drawn into the still-open render pass.
    pub fn end_frame(&mut self, cmd: vk::CommandBuffer) {
        unsafe { self.context.device.cmd_end_render_pass(cmd) };
        self.profiler.end(cmd, self.filter_profile.take());
        self.profiler.end(cmd, self.total_profile.take());
        self.profiler.end_frame();
        self.frame_index += 1;
    }

    pub fn draw_ui(&mut self, ctx: &egui::Context) {
        if self.ui_refreshed_at.elapsed() >= UI_REFRESH_INTERVAL {
            self.ui_timings = self.profiler.results().collect();
            self.ui_refreshed_at = Instant::now();
        }

        egui::Window::new("RTAO")
            .default_pos([5.0, 5.0])
            .show(ctx, |ui| {
                ui.add(egui::Slider::new(&mut self.ao_settings.radius, 0.01..=2.0).text("AO Radius"));
                ui.add(
                    egui::Slider::new(
                        &mut self.ao_settings.ray_count,
                        samples::MIN_RAY_COUNT..=samples::MAX_RAY_COUNT,
                    )
                    .text("AO Rays Count"),
                );
                egui::ComboBox::from_label("Output")
                    .selected_text(self.output_mode.to_string())
                    .show_ui(ui, |ui| {
                        for mode in OutputMode::iter() {
                            ui.selectable_value(&mut self.output_mode, mode, mode.to_string());
                        }
                    });
                ui.checkbox(&mut self.camera.is_rotating, "Rotate Camera");
                ui.separator();
                for (name, ms) in &self.ui_timings {
                    ui.label(format!("{}: {:.3} ms", name, ms));
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_rays_span_the_image() {
        let camera = Camera {
            angle: 0.7,
            is_rotating: false,
        };
        let size = UVec2::new(1920, 1080);
        let frame = camera.frame(size);
        // opposite corners produce different ray directions
        let corner_a = frame.ray_vec_from_coord * Vec3::new(0.5, 0.5, 1.0);
        let corner_b = frame.ray_vec_from_coord * Vec3::new(1919.5, 1079.5, 1.0);
        let cos = corner_a.normalized().dot(corner_b.normalized());
        assert!(cos < 0.999);
    }

    #[test]
    fn camera_looks_toward_the_scene() {
        let camera = Camera {
            angle: 1.3,
            is_rotating: false,
        };
        let size = UVec2::new(800, 600);
        let frame = camera.frame(size);
        let centre_ray = (frame.ray_vec_from_coord * Vec3::new(400.0, 300.0, 1.0)).normalized();
        let to_scene = (-frame.ray_origin).normalized();
        assert!(centre_ray.dot(to_scene) > 0.9);
    }
}
