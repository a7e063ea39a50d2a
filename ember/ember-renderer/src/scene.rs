//! Camera, per-draw push constants and the per-frame scene uniform block.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Push constants of the mesh pipeline: world transform plus the vertex buffer's device address.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuDrawPushConstants {
    pub world_matrix: [f32; 16],
    pub vertex_buffer: u64,
}

impl GpuDrawPushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn new(world: Mat4, vertex_buffer: u64) -> Self {
        Self {
            world_matrix: world.to_cols_array(),
            vertex_buffer,
        }
    }
}

/// Uniform block bound at set 0, binding 0 of the mesh pipeline.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneData {
    pub view: [f32; 16],
    pub proj: [f32; 16],
    pub viewproj: [f32; 16],
    pub ambient_color: [f32; 4],
    /// xyz direction, w intensity.
    pub sunlight_direction: [f32; 4],
    pub sunlight_color: [f32; 4],
}

impl SceneData {
    pub fn new(camera: &Camera, aspect: f32) -> Self {
        let view = camera.view();
        let proj = camera.projection(aspect);
        Self {
            view: view.to_cols_array(),
            proj: proj.to_cols_array(),
            viewproj: (proj * view).to_cols_array(),
            ambient_color: Vec4::splat(0.1).to_array(),
            sunlight_direction: [0.0, 1.0, 0.5, 1.0],
            sunlight_color: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// Vertical field of view in degrees.
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, -5.0),
            fov_y: 70.0,
            near: 0.1,
            far: 10_000.0,
        }
    }
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        Mat4::from_translation(self.position)
    }

    /// Reversed-depth perspective (near maps to 1, far to 0) with Y flipped for Vulkan clip space.
    pub fn projection(&self, aspect: f32) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov_y.to_radians(), aspect, self.far, self.near);
        proj.y_axis.y *= -1.0;
        proj
    }

    /// `projection * view * model`.
    pub fn world(&self, model: Mat4, aspect: f32) -> Mat4 {
        self.projection(aspect) * self.view() * model
    }
}

/// Width over height, 1.0 for a degenerate extent.
pub fn aspect_ratio(extent: (u32, u32)) -> f32 {
    if extent.1 == 0 {
        return 1.0;
    }
    extent.0 as f32 / extent.1 as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_push_constants_layout() {
        assert_eq!(GpuDrawPushConstants::SIZE, 72);
        let pc = GpuDrawPushConstants::new(Mat4::IDENTITY, 0xdead_beef);
        let bytes = bytemuck::bytes_of(&pc);
        assert_eq!(&bytes[64..72], &0xdead_beef_u64.to_ne_bytes());
    }

    #[test]
    fn scene_data_is_std140_sized() {
        assert_eq!(std::mem::size_of::<SceneData>(), 3 * 64 + 3 * 16);
    }

    #[test]
    fn depth_is_reversed() {
        let camera = Camera::default();
        let proj = camera.projection(1.0);
        let near = proj.project_point3(Vec3::new(0.0, 0.0, -camera.near));
        let far = proj.project_point3(Vec3::new(0.0, 0.0, -camera.far));
        assert!((near.z - 1.0).abs() < 1e-4);
        assert!(far.z.abs() < 1e-4);
    }

    #[test]
    fn y_is_flipped() {
        let proj = Camera::default().projection(1.0);
        let up = proj.project_point3(Vec3::new(0.0, 1.0, -5.0));
        assert!(up.y < 0.0);
    }

    #[test]
    fn aspect_of_degenerate_extent_is_one() {
        assert_eq!(aspect_ratio((900, 0)), 1.0);
        assert_eq!(aspect_ratio((200, 100)), 2.0);
    }
}
