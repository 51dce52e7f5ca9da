//! Materials and their compiled shader variants

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::backend::{GraphicsBackend, TextureHandle};
use crate::error::Result;
use crate::resources::{ConstantSet, ShaderVariant, ShaderVariantCache};

/// Source id of the built-in material shader
pub const STANDARD_MATERIAL_SHADER: &str = "standard_material";

/// Index into the [`MaterialLibrary`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub(crate) u32);

impl MaterialId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Which pass a material variant is compiled for.
///
/// The value is injected into the shader as the `RENDER_PASS` constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialPass {
    GBuffer,
    DepthOnly,
    Forward,
}

impl MaterialPass {
    pub fn constant(&self) -> u32 {
        match self {
            MaterialPass::GBuffer => 0,
            MaterialPass::DepthOnly => 1,
            MaterialPass::Forward => 2,
        }
    }

    /// Fragment entry point used by this pass; depth-only draws have none
    pub fn fragment_entry(&self) -> Option<&'static str> {
        match self {
            MaterialPass::GBuffer => Some("fs_gbuffer"),
            MaterialPass::DepthOnly => None,
            MaterialPass::Forward => Some("fs_forward"),
        }
    }
}

/// Everything needed to build a material
#[derive(Debug, Clone)]
pub struct MaterialDescriptor {
    pub name: String,
    /// Shader source registered in the [`ShaderVariantCache`]
    pub shader: String,
    pub constants: ConstantSet,
    pub base_color: Vec4,
    pub emission: Vec3,
    pub roughness: f32,
    pub specular: f32,
    pub albedo_texture: Option<TextureHandle>,
    /// Relative per-pixel shading cost, feeds the depth prepass decision
    pub shading_cost: f32,
    pub transparent: bool,
}

impl Default for MaterialDescriptor {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            shader: STANDARD_MATERIAL_SHADER.to_string(),
            constants: ConstantSet::new(),
            base_color: Vec4::ONE,
            emission: Vec3::ZERO,
            roughness: 0.5,
            specular: 0.5,
            albedo_texture: None,
            shading_cost: 1.0,
            transparent: false,
        }
    }
}

impl MaterialDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_shader(mut self, shader: &str) -> Self {
        self.shader = shader.to_string();
        self
    }

    pub fn with_constants(mut self, constants: ConstantSet) -> Self {
        self.constants = constants;
        self
    }

    pub fn with_base_color(mut self, color: Vec4) -> Self {
        self.base_color = color;
        self
    }

    pub fn with_emission(mut self, emission: Vec3) -> Self {
        self.emission = emission;
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.roughness = roughness;
        self
    }

    pub fn with_specular(mut self, specular: f32) -> Self {
        self.specular = specular;
        self
    }

    pub fn with_albedo_texture(mut self, texture: TextureHandle) -> Self {
        self.albedo_texture = Some(texture);
        self
    }

    pub fn with_shading_cost(mut self, cost: f32) -> Self {
        self.shading_cost = cost;
        self
    }

    pub fn with_transparency(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
    }

    // Presets

    pub fn plastic(color: Vec3) -> Self {
        Self::new("plastic")
            .with_base_color(color.extend(1.0))
            .with_roughness(0.4)
            .with_specular(0.5)
    }

    pub fn metal(color: Vec3, roughness: f32) -> Self {
        Self::new("metal")
            .with_base_color(color.extend(1.0))
            .with_roughness(roughness)
            .with_specular(1.0)
            .with_shading_cost(2.0)
    }

    pub fn glass(alpha: f32) -> Self {
        Self::new("glass")
            .with_base_color(Vec4::new(1.0, 1.0, 1.0, alpha))
            .with_roughness(0.05)
            .with_specular(1.0)
            .with_transparency(true)
    }

    pub fn emissive(color: Vec3) -> Self {
        Self::new("emissive").with_emission(color)
    }

    pub fn uniform_data(&self) -> MaterialUniform {
        MaterialUniform {
            base_color: self.base_color,
            emission_roughness: self.emission.extend(self.roughness),
            params: Vec4::new(
                self.specular,
                if self.albedo_texture.is_some() { 1.0 } else { 0.0 },
                0.0,
                0.0,
            ),
        }
    }
}

/// Material uniform data for GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialUniform {
    pub base_color: Vec4,
    /// xyz = emission, w = roughness
    pub emission_roughness: Vec4,
    /// x = specular, y = albedo texture bound
    pub params: Vec4,
}

/// A registered material with the variants its passes need
#[derive(Debug, Clone)]
pub struct Material {
    descriptor: MaterialDescriptor,
    uniform: MaterialUniform,
    gbuffer: Option<Arc<ShaderVariant>>,
    depth_only: Option<Arc<ShaderVariant>>,
    forward: Option<Arc<ShaderVariant>>,
}

impl Material {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &MaterialDescriptor {
        &self.descriptor
    }

    pub fn uniform(&self) -> &MaterialUniform {
        &self.uniform
    }

    pub fn is_transparent(&self) -> bool {
        self.descriptor.transparent
    }

    pub fn shading_cost(&self) -> f32 {
        self.descriptor.shading_cost
    }

    /// Variant for `pass`, `None` when the material never draws in it
    pub fn variant(&self, pass: MaterialPass) -> Option<&Arc<ShaderVariant>> {
        match pass {
            MaterialPass::GBuffer => self.gbuffer.as_ref(),
            MaterialPass::DepthOnly => self.depth_only.as_ref(),
            MaterialPass::Forward => self.forward.as_ref(),
        }
    }
}

/// All materials known to the renderer.
///
/// Variants are compiled at registration, so a broken material fails at
/// load time instead of in the middle of a frame.
#[derive(Debug, Default)]
pub struct MaterialLibrary {
    materials: Vec<Material>,
}

impl MaterialLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<B: GraphicsBackend>(
        &mut self,
        descriptor: MaterialDescriptor,
        cache: &ShaderVariantCache,
        backend: &mut B,
    ) -> Result<MaterialId> {
        let material = build(descriptor, cache, backend)?;
        log::debug!("Registered material '{}'", material.name());
        let id = MaterialId(self.materials.len() as u32);
        self.materials.push(material);
        Ok(id)
    }

    pub fn get(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MaterialId, &Material)> {
        self.materials
            .iter()
            .enumerate()
            .map(|(i, m)| (MaterialId(i as u32), m))
    }

    /// Recompile every material against a fresh cache, keeping ids stable.
    pub fn rebuild<B: GraphicsBackend>(
        &mut self,
        cache: &ShaderVariantCache,
        backend: &mut B,
    ) -> Result<()> {
        let mut rebuilt = Vec::with_capacity(self.materials.len());
        for material in &self.materials {
            rebuilt.push(build(material.descriptor.clone(), cache, backend)?);
        }
        self.materials = rebuilt;
        Ok(())
    }
}

fn build<B: GraphicsBackend>(
    descriptor: MaterialDescriptor,
    cache: &ShaderVariantCache,
    backend: &mut B,
) -> Result<Material> {
    let mut variant = |pass: MaterialPass| {
        let constants = descriptor
            .constants
            .clone()
            .with_u32("RENDER_PASS", pass.constant());
        cache.get_or_create(backend, &descriptor.shader, &constants)
    };

    let (gbuffer, depth_only, forward) = if descriptor.transparent {
        (None, None, Some(variant(MaterialPass::Forward)?))
    } else {
        (
            Some(variant(MaterialPass::GBuffer)?),
            Some(variant(MaterialPass::DepthOnly)?),
            None,
        )
    };

    Ok(Material {
        uniform: descriptor.uniform_data(),
        descriptor,
        gbuffer,
        depth_only,
        forward,
    })
}
