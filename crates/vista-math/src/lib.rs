// SPDX-License-Identifier: CEPL-1.0
//! Uniform transform construction for the quad demo.
//!
//! Matrices are column-major (glam) which is what the std140 `mat4` in the
//! vertex shader expects, so a [`UniformTransform`] can be copied into a
//! uniform buffer byte for byte.
use bytemuck::{Pod, Zeroable};
pub use glam::{Mat4, Vec3};

pub const FOV_Y_DEGREES: f32 = 45.0;
pub const Z_NEAR: f32 = 0.1;
pub const Z_FAR: f32 = 10.0;
/// Spin rate of the model around +Z.
pub const DEGREES_PER_SECOND: f32 = 90.0;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformTransform {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl Default for UniformTransform {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
        }
    }
}

impl UniformTransform {
    /// Transform for `elapsed` seconds after start, for a target of the given aspect ratio.
    pub fn spinning(elapsed: f32, aspect: f32) -> Self {
        Self {
            model: Mat4::from_rotation_z((elapsed * DEGREES_PER_SECOND).to_radians()),
            view: Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z),
            proj: corrected_perspective(aspect),
        }
    }
}

/// Right-handed perspective with a [0, 1] depth range, as produced before any
/// clip-space correction.
pub fn perspective(aspect: f32) -> Mat4 {
    Mat4::perspective_rh(FOV_Y_DEGREES.to_radians(), aspect, Z_NEAR, Z_FAR)
}

/// Perspective with Y scale negated: Vulkan clip space has +Y pointing down.
pub fn corrected_perspective(aspect: f32) -> Mat4 {
    let mut proj = perspective(aspect);
    proj.y_axis.y = -proj.y_axis.y;
    proj
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_y_scale_is_negated() {
        for aspect in [0.25_f32, 0.5, 1.0, 4.0 / 3.0, 16.0 / 9.0, 7.5] {
            let raw = perspective(aspect);
            let fixed = corrected_perspective(aspect);
            // [1][1] in column-major terms is column 1, row 1.
            assert!(raw.y_axis.y > 0.0);
            assert_eq!(fixed.y_axis.y, -raw.y_axis.y);
            assert_eq!(fixed.x_axis, raw.x_axis);
            assert_eq!(fixed.z_axis, raw.z_axis);
            assert_eq!(fixed.w_axis, raw.w_axis);
        }
    }

    #[test]
    fn spinning_uses_corrected_projection() {
        let t = UniformTransform::spinning(1.5, 1.0);
        assert_eq!(t.proj, corrected_perspective(1.0));
        assert!(t.proj.col(1)[1] < 0.0);
    }

    #[test]
    fn model_at_zero_is_identity() {
        let t = UniformTransform::spinning(0.0, 2.0);
        assert!(t.model.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn layout_is_three_mat4() {
        assert_eq!(std::mem::size_of::<UniformTransform>(), 3 * 64);
        let binding = UniformTransform::default();
        let bytes = bytemuck::bytes_of(&binding);
        assert_eq!(bytes.len(), 192);
    }
}
