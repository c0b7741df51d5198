use crate::maths::*;
use std::f32::consts::PI;

/// Number of hemisphere directions baked into the lookup table.
pub const SAMPLE_TABLE_SIZE: u32 = 360;

pub const MIN_RAY_COUNT: u32 = 1;
pub const MAX_RAY_COUNT: u32 = 4;

/// Window of directions used per ray count. The windows tile the table
/// back to back, so a ray count selects a contiguous run of entries.
const WINDOW_SIZES: [u32; MAX_RAY_COUNT as usize] = [36, 72, 108, 144];

pub fn sample_window_size(ray_count: u32) -> u32 {
    WINDOW_SIZES[(ray_count.clamp(MIN_RAY_COUNT, MAX_RAY_COUNT) - 1) as usize]
}

pub fn sample_start_offset(ray_count: u32) -> u32 {
    WINDOW_SIZES[..(ray_count.clamp(MIN_RAY_COUNT, MAX_RAY_COUNT) - 1) as usize]
        .iter()
        .sum()
}

/// Cosine weighted directions on the +Z hemisphere, spiralled by the
/// golden angle so any prefix of a window is still well distributed.
fn generate_window(count: u32) -> impl Iterator<Item = Vec4> {
    const GOLDEN_RATIO: f32 = 1.618_034;
    (0..count).map(move |i| {
        let s = (i as f32 + 0.5) / (count as f32);
        let phi = 2.0 * PI * ((i as f32) * GOLDEN_RATIO).fract();
        let cos_theta = (1.0 - s).sqrt();
        let sin_theta = s.sqrt();
        Vec4::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta, 0.0)
    })
}

pub fn generate_sample_table() -> Vec<Vec4> {
    let mut table = Vec::with_capacity(SAMPLE_TABLE_SIZE as usize);
    for &window_size in WINDOW_SIZES.iter() {
        table.extend(generate_window(window_size));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_tile_the_whole_table() {
        assert_eq!(WINDOW_SIZES.iter().sum::<u32>(), SAMPLE_TABLE_SIZE);
        assert_eq!(generate_sample_table().len(), SAMPLE_TABLE_SIZE as usize);
    }

    #[test]
    fn start_offsets_follow_window_sizes() {
        assert_eq!(sample_start_offset(1), 0);
        assert_eq!(sample_start_offset(2), 36);
        assert_eq!(sample_start_offset(3), 108);
        assert_eq!(sample_start_offset(4), 216);
    }

    #[test]
    fn windows_stay_in_bounds() {
        for ray_count in MIN_RAY_COUNT..=MAX_RAY_COUNT {
            let offset = sample_start_offset(ray_count);
            let size = sample_window_size(ray_count);
            assert!(offset + size <= SAMPLE_TABLE_SIZE);
        }
    }

    #[test]
    fn out_of_range_ray_counts_clamp() {
        assert_eq!(sample_start_offset(0), sample_start_offset(1));
        assert_eq!(sample_window_size(9), sample_window_size(4));
    }

    #[test]
    fn directions_are_unit_length_on_the_upper_hemisphere() {
        for v in generate_sample_table() {
            let len = (v.x * v.x + v.y * v.y + v.z * v.z).sqrt();
            assert!((len - 1.0).abs() < 1e-4, "length {}", len);
            assert!(v.z >= 0.0);
        }
    }
}
