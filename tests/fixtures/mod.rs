//! Test fixtures

mod mesh;

pub use mesh::LoopbackMesh;
