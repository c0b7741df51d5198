use crate::barrier::*;
use crate::context::*;
use crate::maths::*;
use spark::vk;

/// Which of the two resource sets the current frame writes into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameParity {
    Even,
    Odd,
}

pub const PARITY_COUNT: usize = 2;

impl FrameParity {
    pub fn from_frame_index(frame_index: u64) -> Self {
        if frame_index % 2 == 0 {
            FrameParity::Even
        } else {
            FrameParity::Odd
        }
    }

    pub fn other(self) -> Self {
        match self {
            FrameParity::Even => FrameParity::Odd,
            FrameParity::Odd => FrameParity::Even,
        }
    }

    pub fn index(self) -> usize {
        match self {
            FrameParity::Even => 0,
            FrameParity::Odd => 1,
        }
    }
}

struct TrackedImage {
    resource: ImageResource,
    usage: ImageUsage,
}

impl TrackedImage {
    fn transition(&mut self, new_usage: ImageUsage, device: &spark::Device, cmd: vk::CommandBuffer) {
        if self.usage != new_usage {
            emit_image_barrier(self.usage, new_usage, self.resource.image, device, cmd);
            self.usage = new_usage;
        }
    }
}

struct ParityImages {
    ao_output: TrackedImage,
    depth_normals: TrackedImage,
}

/// Ambient occlusion and geometry buffers, one set per frame parity.
/// A frame writes its own parity and samples the other parity, which
/// still holds what the previous frame wrote.
pub struct FrameResources {
    context: SharedContext,
    sets: [ParityImages; PARITY_COUNT],
    size: UVec2,
}

impl FrameResources {
    pub const AO_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
    pub const DEPTH_NORMALS_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

    const FILTER_READ_USAGE: ImageUsage = ImageUsage::FragmentSampled;

    pub fn new(context: &SharedContext, size: UVec2) -> Self {
        let make_set = || ParityImages {
            ao_output: TrackedImage {
                resource: context.create_image_resource_2d(
                    size,
                    Self::AO_FORMAT,
                    vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
                ),
                usage: ImageUsage::Initial,
            },
            depth_normals: TrackedImage {
                resource: context.create_image_resource_2d(
                    size,
                    Self::DEPTH_NORMALS_FORMAT,
                    vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
                ),
                usage: ImageUsage::Initial,
            },
        };
        Self {
            context: SharedContext::clone(context),
            sets: [make_set(), make_set()],
            size,
        }
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn ao_output_view(&self, parity: FrameParity) -> vk::ImageView {
        self.sets[parity.index()].ao_output.resource.view
    }

    pub fn depth_normals_view(&self, parity: FrameParity) -> vk::ImageView {
        self.sets[parity.index()].depth_normals.resource.view
    }

    /// The primary pass writes this frame's depth and normals.
    pub fn transition_for_primary(&mut self, cmd: vk::CommandBuffer, parity: FrameParity) {
        let device = &self.context.device;
        self.sets[parity.index()]
            .depth_normals
            .transition(ImageUsage::RayTracingStorageWrite, device, cmd);
    }

    /// The occlusion pass writes this frame's AO while sampling this
    /// frame's depth and normals plus everything the previous frame wrote.
    pub fn transition_for_occlusion(&mut self, cmd: vk::CommandBuffer, parity: FrameParity) {
        let device = &self.context.device;
        let [even, odd] = &mut self.sets;
        let (current, previous) = match parity {
            FrameParity::Even => (even, odd),
            FrameParity::Odd => (odd, even),
        };
        current
            .depth_normals
            .transition(ImageUsage::RayTracingSampled, device, cmd);
        current
            .ao_output
            .transition(ImageUsage::RayTracingStorageWrite, device, cmd);
        previous
            .depth_normals
            .transition(ImageUsage::RayTracingSampled, device, cmd);
        previous.ao_output.transition(ImageUsage::RayTracingSampled, device, cmd);
    }

    /// The filter samples this frame's AO and depth-normals from the
    /// fragment shader.
    pub fn transition_for_filter(&mut self, cmd: vk::CommandBuffer, parity: FrameParity) {
        let device = &self.context.device;
        let set = &mut self.sets[parity.index()];
        set.ao_output.transition(Self::FILTER_READ_USAGE, device, cmd);
        set.depth_normals.transition(Self::FILTER_READ_USAGE, device, cmd);
    }
}

impl Drop for FrameResources {
    fn drop(&mut self) {
        for set in self.sets.iter() {
            set.ao_output.resource.destroy(&self.context.device);
            set.depth_normals.resource.destroy(&self.context.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_alternates_with_frame_index() {
        assert_eq!(FrameParity::from_frame_index(0), FrameParity::Even);
        assert_eq!(FrameParity::from_frame_index(1), FrameParity::Odd);
        assert_eq!(FrameParity::from_frame_index(2), FrameParity::Even);
    }

    #[test]
    fn previous_frame_owns_the_other_parity() {
        for frame_index in 1..60u64 {
            let current = FrameParity::from_frame_index(frame_index);
            let previous = FrameParity::from_frame_index(frame_index - 1);
            assert_eq!(current.other(), previous);
        }
    }

    #[test]
    fn filter_reads_are_visible_to_the_fragment_stage() {
        // ray tracing visibility does not cover the filter's draws, so
        // both images it samples must be transitioned for fragment reads
        let usage = FrameResources::FILTER_READ_USAGE;
        assert_eq!(usage.as_stage_mask(), vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_ne!(usage.as_stage_mask(), ImageUsage::RayTracingSampled.as_stage_mask());
    }

    #[test]
    fn parity_indices_are_distinct() {
        assert_ne!(FrameParity::Even.index(), FrameParity::Odd.index());
        assert!(FrameParity::Even.index() < PARITY_COUNT);
        assert!(FrameParity::Odd.index() < PARITY_COUNT);
    }
}
