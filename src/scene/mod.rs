//! Scene snapshot consumed by the renderer
//!
//! Visibility and the scene graph live outside this crate. Each frame the
//! caller hands over a [`SceneView`]: the camera, the visible renderables in
//! draw order and the active lights.

mod bounds;
mod camera;
mod light;

pub use bounds::*;
pub use camera::*;
pub use light::*;

use glam::{Mat4, Vec3};

use crate::backend::{BufferHandle, TextureHandle};
use crate::resources::MaterialId;

/// GPU geometry of a mesh, owned by the resource system
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mesh {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    /// Bounds in model space
    pub bounds: BoundingSphere,
}

/// A visible object: geometry, material and world transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Renderable {
    pub transform: Mat4,
    pub mesh: Mesh,
    pub material: MaterialId,
}

impl Renderable {
    pub fn new(transform: Mat4, mesh: Mesh, material: MaterialId) -> Self {
        Self {
            transform,
            mesh,
            material,
        }
    }

    pub fn world_bounds(&self) -> BoundingSphere {
        self.mesh.bounds.transformed(&self.transform)
    }

    /// Inverse transpose of the model matrix
    pub fn normal_matrix(&self) -> Mat4 {
        self.transform.inverse().transpose()
    }
}

/// Pre-filtered environment cube map around a point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflectionProbe {
    pub position: Vec3,
    pub radius: f32,
    pub texture: TextureHandle,
    /// Edge length of one cube face
    pub size: u32,
}

impl ReflectionProbe {
    pub fn bounding_sphere(&self) -> BoundingSphere {
        BoundingSphere::new(self.position, self.radius)
    }
}

/// Everything the renderer needs to know about the scene for one frame
#[derive(Debug, Clone, Default)]
pub struct SceneView {
    pub camera: Camera,
    /// Visible renderables in draw order
    pub renderables: Vec<Renderable>,
    pub lights: Vec<Light>,
    pub probes: Vec<ReflectionProbe>,
}

impl SceneView {
    pub fn new(camera: Camera) -> Self {
        Self {
            camera,
            ..Default::default()
        }
    }

    pub fn with_renderable(mut self, renderable: Renderable) -> Self {
        self.renderables.push(renderable);
        self
    }

    pub fn with_light(mut self, light: Light) -> Self {
        self.lights.push(light);
        self
    }

    pub fn with_probe(mut self, probe: ReflectionProbe) -> Self {
        self.probes.push(probe);
        self
    }
}
