use spark::{vk, Device};
use std::slice;

/// How an image is about to be used (or was last used) by the command stream.
/// Each usage implies the pipeline stage, access mask and layout for a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageUsage {
    /// Freshly created, contents undefined.
    Initial,
    TransferWrite,
    RayTracingStorageWrite,
    RayTracingSampled,
    FragmentSampled,
    ColorAttachmentWrite,
    Present,
}

impl ImageUsage {
    pub fn as_stage_mask(self) -> vk::PipelineStageFlags {
        match self {
            ImageUsage::Initial => vk::PipelineStageFlags::empty(),
            ImageUsage::TransferWrite => vk::PipelineStageFlags::TRANSFER,
            ImageUsage::RayTracingStorageWrite | ImageUsage::RayTracingSampled => {
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
            }
            ImageUsage::FragmentSampled => vk::PipelineStageFlags::FRAGMENT_SHADER,
            ImageUsage::ColorAttachmentWrite => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ImageUsage::Present => vk::PipelineStageFlags::empty(),
        }
    }

    pub fn as_access_mask(self) -> vk::AccessFlags {
        match self {
            ImageUsage::Initial => vk::AccessFlags::empty(),
            ImageUsage::TransferWrite => vk::AccessFlags::TRANSFER_WRITE,
            ImageUsage::RayTracingStorageWrite => vk::AccessFlags::SHADER_WRITE,
            ImageUsage::RayTracingSampled | ImageUsage::FragmentSampled => vk::AccessFlags::SHADER_READ,
            ImageUsage::ColorAttachmentWrite => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ImageUsage::Present => vk::AccessFlags::empty(),
        }
    }

    pub fn as_image_layout(self) -> vk::ImageLayout {
        match self {
            ImageUsage::Initial => vk::ImageLayout::UNDEFINED,
            ImageUsage::TransferWrite => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageUsage::RayTracingStorageWrite => vk::ImageLayout::GENERAL,
            ImageUsage::RayTracingSampled | ImageUsage::FragmentSampled => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageUsage::ColorAttachmentWrite => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageUsage::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

pub fn emit_image_barrier(
    old_usage: ImageUsage,
    new_usage: ImageUsage,
    image: vk::Image,
    device: &Device,
    cmd: vk::CommandBuffer,
) {
    let image_memory_barrier = vk::ImageMemoryBarrier {
        src_access_mask: old_usage.as_access_mask(),
        dst_access_mask: new_usage.as_access_mask(),
        old_layout: old_usage.as_image_layout(),
        new_layout: new_usage.as_image_layout(),
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image: Some(image),
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        },
        ..Default::default()
    };
    let old_stage_mask = old_usage.as_stage_mask();
    let new_stage_mask = new_usage.as_stage_mask();
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            if old_stage_mask.is_empty() {
                vk::PipelineStageFlags::BOTTOM_OF_PIPE
            } else {
                old_stage_mask
            },
            if new_stage_mask.is_empty() {
                vk::PipelineStageFlags::TOP_OF_PIPE
            } else {
                new_stage_mask
            },
            vk::DependencyFlags::empty(),
            &[],
            &[],
            slice::from_ref(&image_memory_barrier),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_usages_have_write_access() {
        assert_eq!(
            ImageUsage::RayTracingStorageWrite.as_access_mask(),
            vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(
            ImageUsage::ColorAttachmentWrite.as_access_mask(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn sampled_usages_share_a_layout() {
        assert_eq!(
            ImageUsage::RayTracingSampled.as_image_layout(),
            ImageUsage::FragmentSampled.as_image_layout()
        );
    }
}
