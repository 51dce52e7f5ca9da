//! Resource management
//!
//! Long-lived GPU resources shared across frames: pooled render targets, the
//! uniform ring buffer, compiled shader variants and materials.

mod material;
mod render_target_pool;
mod ring_buffer;
mod shader;

pub use material::*;
pub use render_target_pool::*;
pub use ring_buffer::*;
pub use shader::*;
