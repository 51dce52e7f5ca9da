//! Shader variant cache
//!
//! Programs are resolved by `(source identifier, constant set)`. The first
//! request for a key specializes the WGSL source by prepending one `const`
//! declaration per constant, validates the result with naga, and creates a
//! backend program. Later requests share the same [`ShaderVariant`].

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::*;
use crate::error::{RenderError, Result};

/// Value of a specialization constant
#[derive(Debug, Clone, Copy)]
pub enum ConstantValue {
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
}

impl ConstantValue {
    fn bits(&self) -> (u8, u32) {
        match *self {
            ConstantValue::U32(v) => (0, v),
            ConstantValue::I32(v) => (1, v as u32),
            ConstantValue::F32(v) => (2, v.to_bits()),
            ConstantValue::Bool(v) => (3, v as u32),
        }
    }

    /// WGSL type and literal
    fn wgsl(&self) -> Option<(&'static str, String)> {
        match *self {
            ConstantValue::U32(v) => Some(("u32", format!("{v}u"))),
            ConstantValue::I32(v) => Some(("i32", format!("{v}i"))),
            ConstantValue::F32(v) if v.is_finite() => Some(("f32", format!("{v:?}f"))),
            ConstantValue::F32(_) => None,
            ConstantValue::Bool(v) => Some(("bool", v.to_string())),
        }
    }
}

impl PartialEq for ConstantValue {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for ConstantValue {}

impl Hash for ConstantValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

/// Ordered set of named specialization constants
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConstantSet {
    constants: Vec<(String, ConstantValue)>,
}

impl ConstantSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a constant
    pub fn with(mut self, name: &str, value: ConstantValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_u32(self, name: &str, value: u32) -> Self {
        self.with(name, ConstantValue::U32(value))
    }

    pub fn set(&mut self, name: &str, value: ConstantValue) {
        match self
            .constants
            .binary_search_by(|(existing, _)| existing.as_str().cmp(name))
        {
            Ok(index) => self.constants[index].1 = value,
            Err(index) => self.constants.insert(index, (name.to_string(), value)),
        }
    }

    /// Union of two sets; values in `other` win
    pub fn merged(&self, other: &ConstantSet) -> ConstantSet {
        let mut merged = self.clone();
        for (name, value) in &other.constants {
            merged.set(name, *value);
        }
        merged
    }

    pub fn get(&self, name: &str) -> Option<ConstantValue> {
        self.constants
            .binary_search_by(|(existing, _)| existing.as_str().cmp(name))
            .ok()
            .map(|index| self.constants[index].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ConstantValue)> {
        self.constants.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// WGSL declarations for every constant
    fn prelude(&self, source_id: &str) -> Result<String> {
        let mut prelude = String::new();
        for (name, value) in &self.constants {
            let (ty, literal) = value.wgsl().ok_or_else(|| RenderError::ShaderCompilation {
                source_id: source_id.to_string(),
                message: format!("constant {name} is not a finite value"),
            })?;
            prelude.push_str(&format!("const {name}: {ty} = {literal};\n"));
        }
        Ok(prelude)
    }
}

impl fmt::Display for ConstantSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (name, value)) in self.constants.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match value {
                ConstantValue::U32(v) => write!(f, "{name}={v}")?,
                ConstantValue::I32(v) => write!(f, "{name}={v}")?,
                ConstantValue::F32(v) => write!(f, "{name}={v}")?,
                ConstantValue::Bool(v) => write!(f, "{name}={v}")?,
            }
        }
        write!(f, "]")
    }
}

/// Specialized and validated shader module, ready for program creation
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub source_id: String,
    pub constants: ConstantSet,
    /// Specialized WGSL text
    pub source: String,
    pub entry_points: Vec<(String, ShaderStage)>,
}

impl CompiledShader {
    pub fn label(&self) -> String {
        format!("{}{}", self.source_id, self.constants)
    }

    pub fn has_entry_point(&self, name: &str, stage: ShaderStage) -> bool {
        self.entry_points
            .iter()
            .any(|(n, s)| n == name && *s == stage)
    }
}

/// A program specialized by a constant set, shared across frames
#[derive(Debug)]
pub struct ShaderVariant {
    program: ProgramHandle,
    shader: CompiledShader,
}

impl ShaderVariant {
    pub fn program(&self) -> ProgramHandle {
        self.program
    }

    pub fn shader(&self) -> &CompiledShader {
        &self.shader
    }
}

#[derive(Debug, Clone)]
struct ShaderSource {
    text: Arc<str>,
    entry_points: Vec<(String, ShaderStage)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VariantKey {
    source_id: String,
    constants: ConstantSet,
}

/// Cache of shader variants keyed by source and constants
#[derive(Debug, Default)]
pub struct ShaderVariantCache {
    sources: RwLock<HashMap<String, ShaderSource>>,
    variants: RwLock<HashMap<VariantKey, Arc<ShaderVariant>>>,
    failures: RwLock<HashMap<VariantKey, RenderError>>,
}

impl ShaderVariantCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register WGSL text under `source_id` with the entry points every variant must provide.
    pub fn register_source(
        &self,
        source_id: &str,
        text: &str,
        entry_points: &[(&str, ShaderStage)],
    ) {
        let source = ShaderSource {
            text: Arc::from(text),
            entry_points: entry_points
                .iter()
                .map(|(name, stage)| (name.to_string(), *stage))
                .collect(),
        };
        if self
            .sources
            .write()
            .insert(source_id.to_string(), source)
            .is_some()
        {
            log::warn!("Shader source '{}' registered twice, replacing", source_id);
        }
    }

    pub fn has_source(&self, source_id: &str) -> bool {
        self.sources.read().contains_key(source_id)
    }

    /// Look up an existing variant without compiling
    pub fn get(&self, source_id: &str, constants: &ConstantSet) -> Option<Arc<ShaderVariant>> {
        let key = VariantKey {
            source_id: source_id.to_string(),
            constants: constants.clone(),
        };
        self.variants.read().get(&key).cloned()
    }

    /// Return the cached variant or compile it.
    ///
    /// A failed key is remembered and reported again without recompiling.
    pub fn get_or_create<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        source_id: &str,
        constants: &ConstantSet,
    ) -> Result<Arc<ShaderVariant>> {
        let key = VariantKey {
            source_id: source_id.to_string(),
            constants: constants.clone(),
        };
        if let Some(variant) = self.variants.read().get(&key) {
            return Ok(Arc::clone(variant));
        }
        if let Some(error) = self.failures.read().get(&key) {
            return Err(error.clone());
        }

        let source = self
            .sources
            .read()
            .get(source_id)
            .cloned()
            .ok_or_else(|| RenderError::ShaderCompilation {
                source_id: source_id.to_string(),
                message: "unknown shader source".to_string(),
            })?;

        let shader = match compile(source_id, &source, constants) {
            Ok(shader) => shader,
            Err(error) => {
                log::error!("{}", error);
                self.failures.write().insert(key, error.clone());
                return Err(error);
            }
        };

        let program = backend.create_program(&shader)?;
        log::debug!("Compiled shader variant {}", shader.label());
        let variant = Arc::new(ShaderVariant { program, shader });
        self.variants.write().insert(key, Arc::clone(&variant));
        Ok(variant)
    }

    pub fn variant_count(&self) -> usize {
        self.variants.read().len()
    }

    /// Destroy every program; sources stay registered.
    pub fn clear<B: GraphicsBackend>(&self, backend: &mut B) {
        for (_, variant) in self.variants.write().drain() {
            backend.destroy_program(variant.program);
        }
        self.failures.write().clear();
    }

    /// Drop every program handle without touching the backend.
    pub fn forget_all(&self) {
        self.variants.write().clear();
        self.failures.write().clear();
    }
}

fn compile(source_id: &str, source: &ShaderSource, constants: &ConstantSet) -> Result<CompiledShader> {
    let mut specialized = constants.prelude(source_id)?;
    specialized.push_str(&source.text);

    let error = |message: String| RenderError::ShaderCompilation {
        source_id: source_id.to_string(),
        message,
    };

    let module = naga::front::wgsl::parse_str(&specialized)
        .map_err(|e| error(e.emit_to_string(&specialized)))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| error(e.emit_to_string(&specialized)))?;

    let entry_points: Vec<(String, ShaderStage)> = module
        .entry_points
        .iter()
        .map(|ep| {
            let stage = match ep.stage {
                naga::ShaderStage::Vertex => ShaderStage::Vertex,
                naga::ShaderStage::Fragment => ShaderStage::Fragment,
                naga::ShaderStage::Compute => ShaderStage::Compute,
            };
            (ep.name.clone(), stage)
        })
        .collect();

    for (name, stage) in &source.entry_points {
        if !entry_points.iter().any(|(n, s)| n == name && s == stage) {
            return Err(error(format!("missing {stage:?} entry point '{name}'")));
        }
    }

    Ok(CompiledShader {
        source_id: source_id.to_string(),
        constants: constants.clone(),
        source: specialized,
        entry_points,
    })
}
