use std::{collections::HashSet, sync::Arc};

use tracing::debug;

use crate::{
    command_encoder::PrimitiveTopology,
    device::DeviceContext,
    error::{RenderError, RenderResult},
    hal::Gpu,
    id::PipelineId,
    resource::TextureFormat,
    shader::{ShaderModule, ShaderResourceKind, ShaderStage},
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 => 16,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VertexAttribute {
    pub semantic: String,
    pub semantic_index: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShaderVisibility {
    All,
    Vertex,
    Pixel,
}

impl ShaderVisibility {
    fn covers(self, stage: ShaderStage) -> bool {
        matches!(
            (self, stage),
            (Self::All, _)
                | (Self::Vertex, ShaderStage::Vertex)
                | (Self::Pixel, ShaderStage::Pixel)
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescriptorKind {
    ShaderResource,
    ConstantBuffer,
}

/// A root parameter holding a contiguous register range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DescriptorTable {
    pub kind: DescriptorKind,
    pub base_register: u32,
    pub count: u32,
    pub visibility: ShaderVisibility,
}

impl DescriptorTable {
    fn registers(&self) -> std::ops::Range<u32> {
        self.base_register..self.base_register.saturating_add(self.count)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Filter {
    Point,
    Linear,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressMode {
    Wrap,
    Clamp,
    Border,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StaticSampler {
    pub register: u32,
    pub filter: Filter,
    pub address: AddressMode,
    pub visibility: ShaderVisibility,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BindingLayout {
    pub tables: Vec<DescriptorTable>,
    pub static_samplers: Vec<StaticSampler>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FillMode {
    Solid,
    Wireframe,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RasterizerState {
    pub fill: FillMode,
    pub cull: CullMode,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            fill: FillMode::Solid,
            cull: CullMode::Back,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BlendMode {
    #[default]
    Opaque,
    Alpha,
}

#[derive(Clone, Debug)]
pub struct PipelineDesc {
    pub label: String,
    pub vertex_shader: ShaderModule,
    pub pixel_shader: ShaderModule,
    pub vertex_layout: VertexLayout,
    pub binding_layout: BindingLayout,
    pub topology: PrimitiveTopology,
    pub rasterizer: RasterizerState,
    pub blend: BlendMode,
    pub depth_test: bool,
    pub render_target_format: TextureFormat,
}

/// Immutable once built; clones share the same description.
#[derive(Clone, Debug)]
pub struct PipelineState {
    id: PipelineId,
    desc: Arc<PipelineDesc>,
}

impl PipelineState {
    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn desc(&self) -> &PipelineDesc {
        &self.desc
    }

    /// Root parameter index holding the SRV register `register`, if any.
    pub fn texture_table(&self, register: u32) -> Option<u32> {
        self.desc
            .binding_layout
            .tables
            .iter()
            .position(|table| {
                table.kind == DescriptorKind::ShaderResource
                    && table.registers().contains(&register)
            })
            .map(|index| index as u32)
    }
}

#[derive(Default)]
pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build<G: Gpu>(
        &self,
        device: &mut DeviceContext<G>,
        desc: PipelineDesc,
    ) -> RenderResult<PipelineState> {
        validate(&desc)?;
        let id = device.gpu_mut().create_pipeline(&desc)?;
        debug!("built pipeline `{}` as {:?}", desc.label, id);
        Ok(PipelineState {
            id,
            desc: Arc::new(desc),
        })
    }
}

pub fn validate(desc: &PipelineDesc) -> RenderResult<()> {
    desc.vertex_shader.check(ShaderStage::Vertex)?;
    desc.pixel_shader.check(ShaderStage::Pixel)?;
    validate_vertex_layout(&desc.vertex_layout)?;
    validate_binding_layout(&desc.binding_layout)?;

    for input in &desc.vertex_shader.interface.inputs {
        let attribute = desc
            .vertex_layout
            .attributes
            .iter()
            .find(|a| a.semantic == input.semantic && a.semantic_index == input.semantic_index)
            .ok_or_else(|| {
                RenderError::InvalidBindingLayout(format!(
                    "vertex input {}{} is not in the vertex layout",
                    input.semantic, input.semantic_index
                ))
            })?;
        if attribute.format != input.format {
            return Err(RenderError::InvalidBindingLayout(format!(
                "vertex input {}{} expects {:?}, layout provides {:?}",
                input.semantic, input.semantic_index, input.format, attribute.format
            )));
        }
    }

    for module in [&desc.vertex_shader, &desc.pixel_shader] {
        for resource in &module.interface.resources {
            let declared = match resource.kind {
                ShaderResourceKind::Sampler => desc
                    .binding_layout
                    .static_samplers
                    .iter()
                    .any(|s| s.register == resource.register && s.visibility.covers(module.stage)),
                ShaderResourceKind::Texture | ShaderResourceKind::ConstantBuffer => {
                    let kind = if resource.kind == ShaderResourceKind::Texture {
                        DescriptorKind::ShaderResource
                    } else {
                        DescriptorKind::ConstantBuffer
                    };
                    desc.binding_layout.tables.iter().any(|t| {
                        t.kind == kind
                            && t.registers().contains(&resource.register)
                            && t.visibility.covers(module.stage)
                    })
                }
            };
            if !declared {
                return Err(RenderError::InvalidBindingLayout(format!(
                    "{} shader uses {:?} register {} which the binding layout does not expose",
                    module.stage.name(),
                    resource.kind,
                    resource.register
                )));
            }
        }
    }
    Ok(())
}

fn validate_vertex_layout(layout: &VertexLayout) -> RenderResult<()> {
    if layout.stride == 0 {
        return Err(RenderError::InvalidBindingLayout(
            "vertex stride is zero".into(),
        ));
    }

    let mut semantics = HashSet::new();
    let mut spans = Vec::with_capacity(layout.attributes.len());
    for attribute in &layout.attributes {
        let end = attribute
            .offset
            .checked_add(attribute.format.size())
            .filter(|end| *end <= layout.stride)
            .ok_or_else(|| {
                RenderError::InvalidBindingLayout(format!(
                    "attribute {} at offset {} runs past the stride of {}",
                    attribute.semantic, attribute.offset, layout.stride
                ))
            })?;
        if !semantics.insert((attribute.semantic.as_str(), attribute.semantic_index)) {
            return Err(RenderError::InvalidBindingLayout(format!(
                "attribute {}{} is declared twice",
                attribute.semantic, attribute.semantic_index
            )));
        }
        spans.push((attribute.offset, end));
    }

    spans.sort_unstable();
    if spans.windows(2).any(|pair| pair[0].1 > pair[1].0) {
        return Err(RenderError::InvalidBindingLayout(
            "vertex attributes overlap".into(),
        ));
    }
    Ok(())
}

fn validate_binding_layout(layout: &BindingLayout) -> RenderResult<()> {
    for (i, table) in layout.tables.iter().enumerate() {
        if table.count == 0 {
            return Err(RenderError::InvalidBindingLayout(format!(
                "descriptor table {i} is empty"
            )));
        }
        if table.base_register.checked_add(table.count).is_none() {
            return Err(RenderError::InvalidBindingLayout(format!(
                "descriptor table {i} runs past the last register"
            )));
        }
        let clash = layout.tables[..i].iter().any(|other| {
            other.kind == table.kind
                && other.registers().start < table.registers().end
                && table.registers().start < other.registers().end
        });
        if clash {
            return Err(RenderError::InvalidBindingLayout(format!(
                "descriptor table {i} overlaps an earlier {:?} range",
                table.kind
            )));
        }
    }

    let mut registers = HashSet::new();
    for sampler in &layout.static_samplers {
        if !registers.insert(sampler.register) {
            return Err(RenderError::InvalidBindingLayout(format!(
                "sampler register s{} is declared twice",
                sampler.register
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mesh::TexturedVertex, scene::textured_pipeline_desc, shader::ShaderResource};

    fn textured() -> PipelineDesc {
        textured_pipeline_desc(b"vs".to_vec(), b"ps".to_vec())
    }

    #[test]
    fn reference_pipeline_is_valid() {
        validate(&textured()).unwrap();
    }

    #[test]
    fn empty_bytecode_is_a_shader_error() {
        let mut desc = textured();
        desc.pixel_shader.bytecode.clear();
        assert!(matches!(
            validate(&desc),
            Err(RenderError::ShaderCompilationError { stage: "pixel", .. })
        ));
    }

    #[test]
    fn swapped_stages_are_rejected() {
        let mut desc = textured();
        std::mem::swap(&mut desc.vertex_shader, &mut desc.pixel_shader);
        assert!(matches!(
            validate(&desc),
            Err(RenderError::ShaderCompilationError { .. })
        ));
    }

    #[test]
    fn undeclared_texture_is_detected_at_build_time() {
        let mut desc = textured();
        desc.binding_layout.tables.clear();
        assert!(matches!(
            validate(&desc),
            Err(RenderError::InvalidBindingLayout(_))
        ));
    }

    #[test]
    fn texture_hidden_from_pixel_stage_is_rejected() {
        let mut desc = textured();
        desc.binding_layout.tables[0].visibility = ShaderVisibility::Vertex;
        assert!(validate(&desc).is_err());
    }

    #[test]
    fn missing_sampler_is_rejected() {
        let mut desc = textured();
        desc.pixel_shader.interface.resources.push(ShaderResource {
            kind: ShaderResourceKind::Sampler,
            register: 3,
        });
        assert!(matches!(
            validate(&desc),
            Err(RenderError::InvalidBindingLayout(_))
        ));
    }

    #[test]
    fn vertex_input_must_match_layout() {
        let mut desc = textured();
        desc.vertex_layout.attributes.retain(|a| a.semantic != "TEXCOORD");
        assert!(validate(&desc).is_err());

        let mut desc = textured();
        desc.vertex_layout.attributes[1].format = VertexFormat::Float32x4;
        desc.vertex_layout.stride = 28;
        assert!(validate(&desc).is_err());
    }

    #[test]
    fn overlapping_attributes_are_rejected() {
        let mut desc = textured();
        desc.vertex_layout.attributes[1].offset = 8;
        assert!(matches!(
            validate(&desc),
            Err(RenderError::InvalidBindingLayout(_))
        ));
    }

    #[test]
    fn attribute_past_stride_is_rejected() {
        let mut desc = textured();
        desc.vertex_layout.stride = TexturedVertex::STRIDE - 4;
        assert!(validate(&desc).is_err());
    }

    #[test]
    fn offsets_near_the_integer_limit_are_rejected() {
        let mut desc = textured();
        desc.vertex_layout.attributes[1].offset = u32::MAX - 2;
        assert!(matches!(
            validate(&desc),
            Err(RenderError::InvalidBindingLayout(_))
        ));

        let mut desc = textured();
        desc.binding_layout.tables[0].base_register = u32::MAX;
        desc.binding_layout.tables[0].count = 2;
        assert!(matches!(
            validate(&desc),
            Err(RenderError::InvalidBindingLayout(_))
        ));
    }

    #[test]
    fn overlapping_tables_are_rejected() {
        let mut desc = textured();
        let table = desc.binding_layout.tables[0];
        desc.binding_layout.tables.push(table);
        assert!(validate(&desc).is_err());
    }

    #[test]
    fn texture_table_lookup() {
        let desc = textured();
        let state = PipelineState {
            id: PipelineId(0),
            desc: Arc::new(desc),
        };
        assert_eq!(state.texture_table(0), Some(0));
        assert_eq!(state.texture_table(1), None);
    }
}
