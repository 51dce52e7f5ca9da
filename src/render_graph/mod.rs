//! Render Graph System
//!
//! A per-frame directed acyclic graph of passes and the render targets they
//! read and write. Compilation orders the passes, plans barriers and resource
//! lifetimes; execution binds pooled textures, records the passes and
//! assembles one submission.

pub mod executor;
pub mod graph;
pub mod pass;
pub mod resource;

pub use executor::*;
pub use graph::*;
pub use pass::*;
pub use resource::*;
