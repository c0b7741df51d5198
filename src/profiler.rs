use crate::command_buffer::*;
use crate::context::*;
use arrayvec::ArrayVec;
use spark::vk;
use std::mem;
use std::slice;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfileHandle(usize);

#[derive(Debug)]
struct Record {
    name: &'static str,
    started: bool,
    finished: bool,
}

/// Names are assigned to slots on first use and keep that slot for the
/// lifetime of the profiler, so per-frame lookups are stable. Each slot
/// may be started and finished at most once per frame.
#[derive(Debug, Default)]
struct RecordTable {
    records: ArrayVec<Record, { GpuProfiler::MAX_RECORDS }>,
}

impl RecordTable {
    fn begin(&mut self, name: &'static str) -> Option<usize> {
        if let Some(index) = self.records.iter().position(|r| r.name == name) {
            let record = &mut self.records[index];
            if record.started {
                return None;
            }
            record.started = true;
            Some(index)
        } else if self.records.is_full() {
            None
        } else {
            self.records.push(Record {
                name,
                started: true,
                finished: false,
            });
            Some(self.records.len() - 1)
        }
    }

    fn end(&mut self, index: usize) -> bool {
        let record = &mut self.records[index];
        if !record.started || record.finished {
            return false;
        }
        record.finished = true;
        true
    }

    fn reset_frame(&mut self) {
        for record in self.records.iter_mut() {
            record.started = false;
            record.finished = false;
        }
    }
}

fn elapsed_ms(start_ticks: u64, end_ticks: u64, valid_mask: u64, period_ms: f64) -> f32 {
    if end_ticks <= start_ticks {
        return 0.0;
    }
    let delta = (end_ticks - start_ticks) & valid_mask;
    ((delta as f64) * period_ms) as f32
}

/// Timestamps GPU work per named bracket. Each record owns a pair of
/// queries (2i start, 2i+1 end) whose results are copied into a host
/// visible ring so that reading back never stalls: the values shown for
/// a record are from RENDER_LATENCY frames ago.
pub struct GpuProfiler {
    context: SharedContext,
    query_pool: vk::QueryPool,
    readback: BufferResource,
    mapping: *const u64,
    records: RecordTable,
    last_ms: ArrayVec<(&'static str, f32), { Self::MAX_RECORDS }>,
    timestamp_valid_mask: u64,
    timestamp_period_ms: f64,
    frame_index: usize,
    warmed_up: bool,
}

impl GpuProfiler {
    pub const MAX_RECORDS: usize = 64;
    pub const RENDER_LATENCY: usize = CommandBufferPool::COUNT;

    const QUERY_COUNT: u32 = (Self::MAX_RECORDS * 2) as u32;
    const READBACK_SIZE: usize = Self::MAX_RECORDS * Self::RENDER_LATENCY * 2 * mem::size_of::<u64>();

    pub fn new(context: &SharedContext) -> Self {
        let query_pool = {
            let create_info = vk::QueryPoolCreateInfo {
                query_type: vk::QueryType::TIMESTAMP,
                query_count: Self::QUERY_COUNT,
                ..Default::default()
            };
            unsafe { context.device.create_query_pool(&create_info, None) }.unwrap()
        };

        let readback = context.create_buffer_resource(
            Self::READBACK_SIZE as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        let mapping = unsafe {
            context
                .device
                .map_memory(readback.mem, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .unwrap() as *const u64;

        Self {
            context: SharedContext::clone(context),
            query_pool,
            readback,
            mapping,
            records: RecordTable::default(),
            last_ms: ArrayVec::new(),
            timestamp_valid_mask: 1u64
                .checked_shl(context.queue_family_properties.timestamp_valid_bits)
                .unwrap_or(0)
                .wrapping_sub(1),
            timestamp_period_ms: (context.physical_device_properties.limits.timestamp_period as f64) / 1_000_000.0,
            frame_index: 0,
            warmed_up: false,
        }
    }

    fn ring_offset(frame_index: usize, record_index: usize) -> usize {
        ((frame_index % Self::RENDER_LATENCY) * Self::MAX_RECORDS + record_index) * 2
    }

    /// Reads back the results that the frame about to reuse this ring
    /// region wrote, then resets all queries for the new frame.
    pub fn begin_frame(&mut self, cmd: vk::CommandBuffer) {
        self.last_ms.clear();
        if self.warmed_up {
            let mapped_range = vk::MappedMemoryRange {
                memory: Some(self.readback.mem),
                offset: 0,
                size: vk::WHOLE_SIZE,
                ..Default::default()
            };
            unsafe {
                self.context
                    .device
                    .invalidate_mapped_memory_ranges(slice::from_ref(&mapped_range))
            }
            .unwrap();

            for (record_index, record) in self.records.records.iter().enumerate() {
                let base = Self::ring_offset(self.frame_index, record_index);
                let (start_ticks, end_ticks) =
                    unsafe { (*self.mapping.add(base), *self.mapping.add(base + 1)) };
                self.last_ms.push((
                    record.name,
                    elapsed_ms(start_ticks, end_ticks, self.timestamp_valid_mask, self.timestamp_period_ms),
                ));
            }
        }
        self.records.reset_frame();

        unsafe {
            self.context
                .device
                .cmd_reset_query_pool(cmd, self.query_pool, 0, Self::QUERY_COUNT)
        };
    }

    pub fn begin(&mut self, cmd: vk::CommandBuffer, name: &'static str) -> Option<ProfileHandle> {
        let record_index = self.records.begin(name)?;
        unsafe {
            self.context.device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                (record_index * 2) as u32,
            )
        };
        Some(ProfileHandle(record_index))
    }

    pub fn end(&mut self, cmd: vk::CommandBuffer, handle: Option<ProfileHandle>) {
        let record_index = match handle {
            Some(ProfileHandle(index)) => index,
            None => return,
        };
        if !self.records.end(record_index) {
            return;
        }
        let first_query = (record_index * 2) as u32;
        let dst_offset = Self::ring_offset(self.frame_index, record_index) * mem::size_of::<u64>();
        unsafe {
            self.context.device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                first_query + 1,
            );
            self.context.device.cmd_copy_query_pool_results(
                cmd,
                self.query_pool,
                first_query,
                2,
                Some(self.readback.buffer),
                dst_offset as vk::DeviceSize,
                mem::size_of::<u64>() as vk::DeviceSize,
                vk::QueryResultFlags::N64,
            );
        }
    }

    pub fn end_frame(&mut self) {
        self.frame_index += 1;
        if self.frame_index >= Self::RENDER_LATENCY {
            self.warmed_up = true;
        }
    }

    /// Timings from RENDER_LATENCY frames ago, in bracket creation order.
    pub fn results(&self) -> impl Iterator<Item = (&'static str, f32)> + '_ {
        self.last_ms.iter().copied()
    }

    pub fn elapsed_ms(&self, name: &str) -> Option<f32> {
        self.last_ms.iter().find(|(n, _)| *n == name).map(|&(_, ms)| ms)
    }
}

impl Drop for GpuProfiler {
    fn drop(&mut self) {
        unsafe {
            self.context.device.unmap_memory(self.readback.mem);
            self.context.device.destroy_query_pool(Some(self.query_pool), None);
        }
        self.readback.destroy(&self.context.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_slots_are_stable_across_frames() {
        let mut table = RecordTable::default();
        let a = table.begin("alpha");
        let b = table.begin("beta");
        assert_eq!(a, Some(0));
        assert_eq!(b, Some(1));

        table.reset_frame();
        assert_eq!(table.begin("alpha"), a);
        assert_eq!(table.begin("beta"), b);
    }

    #[test]
    fn record_table_refuses_new_names_when_full() {
        let mut table = RecordTable::default();
        let names: Vec<&'static str> = (0..GpuProfiler::MAX_RECORDS)
            .map(|i| &*Box::leak(format!("record{}", i).into_boxed_str()))
            .collect();
        for (i, name) in names.iter().enumerate() {
            assert_eq!(table.begin(name), Some(i));
        }
        assert_eq!(table.begin("one too many"), None);
        // existing names still resolve after the frame rolls over
        table.reset_frame();
        assert_eq!(table.begin(names[3]), Some(3));
    }

    #[test]
    fn double_begin_within_a_frame_is_refused() {
        let mut table = RecordTable::default();
        let handle = table.begin("pass");
        assert_eq!(handle, Some(0));
        assert_eq!(table.begin("pass"), None);

        // ends pair up with the single begin
        assert!(table.end(0));
        assert!(!table.end(0));

        table.reset_frame();
        assert_eq!(table.begin("pass"), Some(0));
    }

    #[test]
    fn end_without_begin_is_refused() {
        let mut table = RecordTable::default();
        table.begin("pass");
        table.reset_frame();
        assert!(!table.end(0));
    }

    #[test]
    fn elapsed_clamps_to_zero_when_end_does_not_follow_start() {
        let mask = u64::MAX;
        assert_eq!(elapsed_ms(100, 100, mask, 1.0), 0.0);
        assert_eq!(elapsed_ms(200, 100, mask, 1.0), 0.0);
    }

    #[test]
    fn elapsed_scales_ticks_by_period() {
        // 1000 ticks at 1us per tick is one millisecond
        let ms = elapsed_ms(0, 1000, u64::MAX, 0.001);
        assert!((ms - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ring_regions_do_not_overlap_across_latency() {
        let frame_a = GpuProfiler::ring_offset(0, GpuProfiler::MAX_RECORDS - 1);
        let frame_b = GpuProfiler::ring_offset(1, 0);
        assert!(frame_a < frame_b);
        // latency wraps back onto the first region
        assert_eq!(
            GpuProfiler::ring_offset(GpuProfiler::RENDER_LATENCY, 0),
            GpuProfiler::ring_offset(0, 0)
        );
    }
}
