use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

use crate::pipeline::{VertexAttribute, VertexFormat, VertexLayout};

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct TexturedVertex {
    pub position: Vec3,
    pub uv: Vec2,
}

impl TexturedVertex {
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: Self::STRIDE,
            attributes: vec![
                attribute("POSITION", VertexFormat::Float32x3, 0),
                attribute("TEXCOORD", VertexFormat::Float32x2, 12),
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ColoredVertex {
    pub position: Vec3,
    pub color: [f32; 4],
}

impl ColoredVertex {
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: Self::STRIDE,
            attributes: vec![
                attribute("POSITION", VertexFormat::Float32x3, 0),
                attribute("COLOR", VertexFormat::Float32x4, 12),
            ],
        }
    }
}

fn attribute(semantic: &str, format: VertexFormat, offset: u32) -> VertexAttribute {
    VertexAttribute {
        semantic: semantic.into(),
        semantic_index: 0,
        format,
        offset,
    }
}

#[derive(Clone, Debug)]
pub struct Mesh {
    pub label: &'static str,
    pub bytes: Vec<u8>,
    pub stride: u32,
    pub vertex_count: u32,
}

impl Mesh {
    pub fn from_vertices<V: Pod>(label: &'static str, vertices: &[V]) -> Self {
        Self {
            label,
            bytes: bytemuck::cast_slice(vertices).to_vec(),
            stride: std::mem::size_of::<V>() as u32,
            vertex_count: vertices.len() as u32,
        }
    }
}

/// The reference triangle, kept upright on non-square surfaces.
pub fn textured_triangle(aspect_ratio: f32) -> [TexturedVertex; 3] {
    [
        TexturedVertex {
            position: Vec3::new(0.0, 0.25 * aspect_ratio, 0.0),
            uv: Vec2::new(0.5, 0.0),
        },
        TexturedVertex {
            position: Vec3::new(0.25, -0.25 * aspect_ratio, 0.0),
            uv: Vec2::new(1.0, 1.0),
        },
        TexturedVertex {
            position: Vec3::new(-0.25, -0.25 * aspect_ratio, 0.0),
            uv: Vec2::new(0.0, 1.0),
        },
    ]
}

pub fn colored_triangle(aspect_ratio: f32) -> [ColoredVertex; 3] {
    [
        ColoredVertex {
            position: Vec3::new(0.0, 0.25 * aspect_ratio, 0.0),
            color: [1.0, 0.0, 0.0, 1.0],
        },
        ColoredVertex {
            position: Vec3::new(0.25, -0.25 * aspect_ratio, 0.0),
            color: [0.0, 1.0, 0.0, 1.0],
        },
        ColoredVertex {
            position: Vec3::new(-0.25, -0.25 * aspect_ratio, 0.0),
            color: [0.0, 0.0, 1.0, 1.0],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_strides_match_layouts() {
        assert_eq!(TexturedVertex::STRIDE, 20);
        assert_eq!(ColoredVertex::STRIDE, 28);

        let mesh = Mesh::from_vertices("triangle", &textured_triangle(960.0 / 720.0));
        assert_eq!(mesh.vertex_count, 3);
        assert_eq!(mesh.bytes.len(), 60);
    }
}
