pub use ultraviolet as uv;

pub type Vec2 = uv::Vec2;
pub type UVec2 = uv::UVec2;

pub type Vec3 = uv::Vec3;
pub type Vec4 = uv::Vec4;

pub type Mat3 = uv::Mat3;
pub type Mat4 = uv::Mat4;

pub type Isometry3 = uv::Isometry3;
pub type Rotor3 = uv::Rotor3;

pub use uv::projection;

pub trait AsFloat {
    type Output;
    fn as_float(&self) -> Self::Output;
}

impl AsFloat for UVec2 {
    type Output = Vec2;
    fn as_float(&self) -> Self::Output {
        Vec2::new(self.x as f32, self.y as f32)
    }
}

pub fn align_up(x: u32, alignment: u32) -> u32 {
    (x + alignment - 1) & !(alignment - 1)
}

pub struct Scale2Offset2 {
    pub scale: Vec2,
    pub offset: Vec2,
}

impl Scale2Offset2 {
    pub fn new(scale: Vec2, offset: Vec2) -> Self {
        Self { scale, offset }
    }

    pub fn into_homogeneous_matrix(&self) -> Mat3 {
        Mat3::new(
            Vec3::new(self.scale.x, 0.0, 0.0),
            Vec3::new(0.0, self.scale.y, 0.0),
            self.offset.into_homogeneous_point(),
        )
    }

    pub fn inversed(&self) -> Self {
        // y = a*x + b => x = (y - b)/a
        let scale_rcp = Vec2::broadcast(1.0) / self.scale;
        Scale2Offset2 {
            scale: scale_rcp,
            offset: -self.offset * scale_rcp,
        }
    }
}

impl std::ops::Mul for Scale2Offset2 {
    type Output = Self;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn mul(self, rhs: Scale2Offset2) -> Self::Output {
        // a(b(v)) = a.s*(b.s*v + b.o) + a.o
        Scale2Offset2 {
            scale: self.scale * rhs.scale,
            offset: self.scale.mul_add(rhs.offset, self.offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_is_identity_on_aligned_values() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(40, 32), 64);
    }
}
