use rtao::prelude::*;
use spark::vk;
use std::collections::HashMap;
use std::slice;
use std::time::Instant;
use structopt::StructOpt;
use winit::{
    dpi::{LogicalSize, Size},
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    window::{Window, WindowBuilder},
};

#[derive(Debug, StructOpt)]
#[structopt(no_version)]
struct AppParams {
    /// Core Vulkan version to load
    #[structopt(short, long, parse(try_from_str=try_version_from_str), default_value="1.2")]
    version: vk::Version,

    /// Enable the Vulkan validation layer
    #[structopt(short, long)]
    debug: bool,
}

enum AppEventResult {
    None,
    Redraw,
    Destroy,
}

struct App {
    window: Window,
    exit_requested: bool,
    context: SharedContext,
    swapchain: Swapchain,
    recreate_swapchain: bool,
    command_buffer_pool: CommandBufferPool,
    descriptor_pool: DescriptorPool,
    pipeline_cache: PipelineCache,
    egui_ctx: egui::Context,
    egui_winit: egui_winit::State,
    egui_renderer: spark_egui::Renderer,
    renderer: Renderer,
    framebuffers: HashMap<UniqueImage, (vk::ImageView, vk::Framebuffer)>,
    last_frame_at: Instant,
}

const SWAPCHAIN_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::COLOR_ATTACHMENT;

impl App {
    fn new(window: Window, params: &ContextParams) -> Self {
        let context = Context::new(&window, params);
        let swapchain = Swapchain::new(&context, SWAPCHAIN_USAGE);

        let command_buffer_pool = CommandBufferPool::new(&context);
        let descriptor_pool = DescriptorPool::new(&context);
        let pipeline_cache = PipelineCache::new(&context, "shaders/bin");

        let egui_max_vertex_count = 64 * 1024;
        let egui_max_texture_side = context
            .physical_device_properties
            .limits
            .max_image_dimension_2d
            .min(2048);

        let egui_ctx = egui::Context::default();
        let mut egui_winit = egui_winit::State::new(&window);
        egui_winit.set_pixels_per_point(window.scale_factor() as f32);
        egui_winit.set_max_texture_side(egui_max_texture_side as usize);
        let egui_renderer = spark_egui::Renderer::new(
            &context.device,
            &context.physical_device_properties,
            &context.physical_device_memory_properties,
            egui_max_vertex_count,
            egui_max_texture_side,
        );

        // one-shot command buffer for acceleration structure builds and
        // lookup table uploads
        let renderer = {
            let init_pool = {
                let create_info = vk::CommandPoolCreateInfo {
                    queue_family_index: context.queue_family_index,
                    flags: vk::CommandPoolCreateFlags::TRANSIENT,
                    ..Default::default()
                };
                unsafe { context.device.create_command_pool(&create_info, None) }.unwrap()
            };
            let init_cmd = {
                let allocate_info = vk::CommandBufferAllocateInfo {
                    command_pool: Some(init_pool),
                    level: vk::CommandBufferLevel::PRIMARY,
                    command_buffer_count: 1,
                    ..Default::default()
                };
                let buffers: [vk::CommandBuffer; 1] =
                    unsafe { context.device.allocate_command_buffers_array(&allocate_info) }.unwrap();
                buffers[0]
            };
            let begin_info = vk::CommandBufferBeginInfo {
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            unsafe { context.device.begin_command_buffer(init_cmd, &begin_info) }.unwrap();

            let renderer = Renderer::new(
                &context,
                &pipeline_cache,
                init_cmd,
                swapchain.get_size(),
                swapchain.get_format(),
            );

            unsafe { context.device.end_command_buffer(init_cmd) }.unwrap();
            let submit_info = vk::SubmitInfo::builder().p_command_buffers(slice::from_ref(&init_cmd));
            unsafe {
                context
                    .device
                    .queue_submit(context.queue, slice::from_ref(&submit_info), None)
            }
            .unwrap();
            unsafe { context.device.queue_wait_idle(context.queue) }.unwrap();
            unsafe { context.device.destroy_command_pool(Some(init_pool), None) };

            renderer
        };

        Self {
            window,
            exit_requested: false,
            context,
            swapchain,
            recreate_swapchain: false,
            command_buffer_pool,
            descriptor_pool,
            pipeline_cache,
            egui_ctx,
            egui_winit,
            egui_renderer,
            renderer,
            framebuffers: HashMap::new(),
            last_frame_at: Instant::now(),
        }
    }

    fn destroy_framebuffers(&mut self) {
        let device = &self.context.device;
        for (_, (view, framebuffer)) in self.framebuffers.drain() {
            unsafe {
                device.destroy_framebuffer(Some(framebuffer), None);
                device.destroy_image_view(Some(view), None);
            }
        }
    }

    fn framebuffer(&mut self, swap_image: UniqueImage) -> vk::Framebuffer {
        let device = &self.context.device;
        let format = self.swapchain.get_format();
        let size = self.swapchain.get_size();
        let render_pass = self.renderer.swapchain_render_pass();
        self.framebuffers
            .entry(swap_image)
            .or_insert_with(|| {
                let view = {
                    let create_info = vk::ImageViewCreateInfo {
                        image: Some(swap_image.0),
                        view_type: vk::ImageViewType::N2D,
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
                    unsafe { device.create_image_view(&create_info, None) }.unwrap()
                };
                let framebuffer = {
                    let create_info = vk::FramebufferCreateInfo::builder()
                        .render_pass(render_pass)
                        .p_attachments(slice::from_ref(&view))
                        .width(size.x)
                        .height(size.y)
                        .layers(1);
                    unsafe { device.create_framebuffer(&create_info, None) }.unwrap()
                };
                (view, framebuffer)
            })
            .1
    }

    fn acquire_swap_image(&mut self, image_available_semaphore: vk::Semaphore) -> UniqueImage {
        loop {
            if self.recreate_swapchain {
                self.destroy_framebuffers();
                self.swapchain.recreate(SWAPCHAIN_USAGE);
                self.recreate_swapchain = false;
            }
            match self.swapchain.acquire(image_available_semaphore) {
                SwapchainAcquireResult::Ok(image) => break image,
                SwapchainAcquireResult::RecreateSoon(image) => {
                    self.recreate_swapchain = true;
                    break image;
                }
                SwapchainAcquireResult::RecreateNow => self.recreate_swapchain = true,
            }
        }
    }

    fn render(&mut self) {
        let delta_time = {
            let now = Instant::now();
            let delta = now.duration_since(self.last_frame_at).as_secs_f32();
            self.last_frame_at = now;
            delta
        };

        let cbar = self.command_buffer_pool.acquire();
        self.pipeline_cache.begin_frame();
        self.descriptor_pool.begin_frame();

        let raw_input = self.egui_winit.take_egui_input(&self.window);
        self.egui_ctx.begin_frame(raw_input);
        self.renderer.draw_ui(&self.egui_ctx);

        self.renderer.render_scene(
            cbar.pre_swapchain_cmd,
            &self.descriptor_pool,
            &self.pipeline_cache,
            delta_time,
        );

        let swap_image = self.acquire_swap_image(cbar.image_available_semaphore);
        let framebuffer = self.framebuffer(swap_image);

        let egui::FullOutput {
            platform_output,
            repaint_after: _repaint_after,
            textures_delta,
            shapes,
        } = self.egui_ctx.end_frame();
        self.egui_winit
            .handle_platform_output(&self.window, &self.egui_ctx, platform_output);
        let clipped_primitives = self.egui_ctx.tessellate(shapes);
        self.egui_renderer.update(
            &self.context.device,
            &self.context.physical_device_memory_properties,
            cbar.post_swapchain_cmd,
            clipped_primitives,
            textures_delta,
        );

        self.renderer.composite(
            cbar.post_swapchain_cmd,
            &self.descriptor_pool,
            &self.pipeline_cache,
            framebuffer,
        );

        let ui_pipeline = self
            .pipeline_cache
            .get_ui(&self.egui_renderer, self.renderer.swapchain_render_pass());
        self.egui_renderer
            .render(&self.context.device, cbar.post_swapchain_cmd, ui_pipeline);

        self.renderer.end_frame(cbar.post_swapchain_cmd);
        emit_image_barrier(
            ImageUsage::ColorAttachmentWrite,
            ImageUsage::Present,
            swap_image.0,
            &self.context.device,
            cbar.post_swapchain_cmd,
        );

        self.descriptor_pool.end_frame();
        let rendering_finished_semaphore = self.command_buffer_pool.submit();
        self.swapchain.present(swap_image, rendering_finished_semaphore);
    }

    fn process_event<T>(
        &mut self,
        event: &Event<'_, T>,
        _target: &EventLoopWindowTarget<T>,
        control_flow: &mut ControlFlow,
    ) -> AppEventResult {
        let mut result = AppEventResult::None;
        match event {
            Event::RedrawEventsCleared => {
                result = AppEventResult::Redraw;
            }
            Event::WindowEvent { event, .. } => {
                if matches!(event, WindowEvent::CloseRequested) {
                    self.exit_requested = true;
                }
                let event_response = self.egui_winit.on_event(&self.egui_ctx, event);
                if event_response.repaint {
                    self.window.request_redraw();
                }
            }
            Event::LoopDestroyed => {
                result = AppEventResult::Destroy;
            }
            _ => {}
        }
        if self.exit_requested {
            control_flow.set_exit();
        } else {
            control_flow.set_poll();
        }
        result
    }
}

impl Drop for App {
    fn drop(&mut self) {
        unsafe { self.context.device.device_wait_idle() }.unwrap();
        self.destroy_framebuffers();
        self.egui_renderer.destroy(&self.context.device);
    }
}

fn main() {
    let app_params = AppParams::from_args();
    let context_params = ContextParams {
        version: app_params.version,
        is_debug: app_params.debug,
    };

    let event_loop = EventLoop::new();

    let window = WindowBuilder::new()
        .with_title("rtao")
        .with_inner_size(Size::Logical(LogicalSize::new(1920.0, 1080.0)))
        .with_resizable(false)
        .build(&event_loop)
        .unwrap();

    let mut apps = Some(App::new(window, &context_params));
    event_loop.run(move |event, target, control_flow| {
        match apps.as_mut().unwrap().process_event(&event, target, control_flow) {
            AppEventResult::None => {}
            AppEventResult::Redraw => {
                apps.as_mut().unwrap().render();
            }
            AppEventResult::Destroy => {
                apps.take();
            }
        }
    });
}
