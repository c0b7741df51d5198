use crate::context::*;
use spark::{vk, Builder, Device};
use std::slice;

/// Command buffers for one frame in flight. The frame is split at the
/// swapchain acquire: work recorded before it must not touch the
/// swapchain image, work after it may.
struct FrameCommandBuffers {
    pool: vk::CommandPool,
    bufs: [vk::CommandBuffer; 2],
    submit_fence: vk::Fence,
    image_available_semaphore: vk::Semaphore,
    rendering_finished_semaphore: vk::Semaphore,
}

const PRE_SWAPCHAIN: usize = 0;
const POST_SWAPCHAIN: usize = 1;

pub struct CommandBufferAcquireResult {
    pub pre_swapchain_cmd: vk::CommandBuffer,
    pub post_swapchain_cmd: vk::CommandBuffer,
    pub image_available_semaphore: vk::Semaphore,
}

impl FrameCommandBuffers {
    fn new(context: &Context) -> Self {
        let device = &context.device;

        let pool = {
            let create_info = vk::CommandPoolCreateInfo {
                queue_family_index: context.queue_family_index,
                ..Default::default()
            };
            unsafe { device.create_command_pool(&create_info, None) }.unwrap()
        };
        let bufs: [vk::CommandBuffer; 2] = {
            let allocate_info = vk::CommandBufferAllocateInfo {
                command_pool: Some(pool),
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 2,
                ..Default::default()
            };
            unsafe { device.allocate_command_buffers_array(&allocate_info) }.unwrap()
        };

        // signalled so the first acquire does not wait
        let submit_fence = {
            let create_info = vk::FenceCreateInfo {
                flags: vk::FenceCreateFlags::SIGNALED,
                ..Default::default()
            };
            unsafe { device.create_fence(&create_info, None) }.unwrap()
        };

        Self {
            pool,
            bufs,
            submit_fence,
            image_available_semaphore: unsafe { device.create_semaphore(&Default::default(), None) }.unwrap(),
            rendering_finished_semaphore: unsafe { device.create_semaphore(&Default::default(), None) }.unwrap(),
        }
    }

    fn wait_and_begin(&self, device: &Device) {
        unsafe {
            device
                .wait_for_fences(slice::from_ref(&self.submit_fence), true, u64::MAX)
                .unwrap();
            device.reset_fences(slice::from_ref(&self.submit_fence)).unwrap();
            device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .unwrap();
        }

        let begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        for cmd in self.bufs.iter() {
            unsafe { device.begin_command_buffer(*cmd, &begin_info) }.unwrap();
        }
    }

    fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_semaphore(Some(self.rendering_finished_semaphore), None);
            device.destroy_semaphore(Some(self.image_available_semaphore), None);
            device.destroy_fence(Some(self.submit_fence), None);
            device.free_command_buffers(self.pool, &self.bufs);
            device.destroy_command_pool(Some(self.pool), None);
        }
    }
}

/// Keeps up to COUNT frames in flight, each protected by its own fence.
pub struct CommandBufferPool {
    context: SharedContext,
    frames: [FrameCommandBuffers; Self::COUNT],
    index: usize,
}

impl CommandBufferPool {
    pub const COUNT: usize = 2;

    pub fn new(context: &SharedContext) -> Self {
        Self {
            context: SharedContext::clone(context),
            frames: [FrameCommandBuffers::new(context), FrameCommandBuffers::new(context)],
            index: 0,
        }
    }

    pub fn acquire(&mut self) -> CommandBufferAcquireResult {
        self.index = (self.index + 1) % Self::COUNT;
        let frame = &self.frames[self.index];
        frame.wait_and_begin(&self.context.device);
        CommandBufferAcquireResult {
            pre_swapchain_cmd: frame.bufs[PRE_SWAPCHAIN],
            post_swapchain_cmd: frame.bufs[POST_SWAPCHAIN],
            image_available_semaphore: frame.image_available_semaphore,
        }
    }

    /// Submits both halves; only the post-swapchain half waits on the
    /// image and signals the present semaphore.
    pub fn submit(&self) -> vk::Semaphore {
        let device = &self.context.device;
        let frame = &self.frames[self.index];

        for cmd in frame.bufs.iter() {
            unsafe { device.end_command_buffer(*cmd) }.unwrap();
        }

        let submit_info = [
            *vk::SubmitInfo::builder().p_command_buffers(slice::from_ref(&frame.bufs[PRE_SWAPCHAIN])),
            *vk::SubmitInfo::builder()
                .p_wait_semaphores(
                    slice::from_ref(&frame.image_available_semaphore),
                    slice::from_ref(&vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
                )
                .p_command_buffers(slice::from_ref(&frame.bufs[POST_SWAPCHAIN]))
                .p_signal_semaphores(slice::from_ref(&frame.rendering_finished_semaphore)),
        ];
        unsafe {
            device
                .queue_submit(self.context.queue, &submit_info, Some(frame.submit_fence))
                .unwrap()
        };

        frame.rendering_finished_semaphore
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        for frame in self.frames.iter() {
            frame.destroy(&self.context.device);
        }
    }
}
