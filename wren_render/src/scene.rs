use crate::{
    command_encoder::PrimitiveTopology,
    mesh::{colored_triangle, textured_triangle, ColoredVertex, Mesh, TexturedVertex},
    pipeline::{
        AddressMode, BindingLayout, BlendMode, CullMode, DescriptorKind, DescriptorTable, Filter,
        PipelineDesc, RasterizerState, ShaderVisibility, StaticSampler,
    },
    resource::TextureFormat,
    shader::{
        colored_interface, textured_interface, ShaderModule, ShaderStage, PS_ENTRY_POINT,
        VS_ENTRY_POINT,
    },
    texture::{checkerboard, TextureData, CHECKERBOARD_CELL, CHECKERBOARD_SIZE},
};

/// A texture bound to a shader register for one draw.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TextureBinding {
    pub register: u32,
    pub texture: usize,
}

/// Indices into the lists of a [`SceneSetup`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DrawDesc {
    pub pipeline: usize,
    pub mesh: usize,
    pub textures: Vec<TextureBinding>,
    pub instance_count: u32,
}

/// Everything the renderer builds and uploads during initialization.
#[derive(Clone, Debug, Default)]
pub struct SceneSetup {
    pub pipelines: Vec<PipelineDesc>,
    pub meshes: Vec<Mesh>,
    pub textures: Vec<TextureData>,
    pub draws: Vec<DrawDesc>,
}

impl SceneSetup {
    /// The checkerboard-textured triangle.
    pub fn textured(vs_bytecode: Vec<u8>, ps_bytecode: Vec<u8>, aspect_ratio: f32) -> Self {
        Self {
            pipelines: vec![textured_pipeline_desc(vs_bytecode, ps_bytecode)],
            meshes: vec![Mesh::from_vertices(
                "textured triangle",
                &textured_triangle(aspect_ratio),
            )],
            textures: vec![checkerboard(
                CHECKERBOARD_SIZE,
                CHECKERBOARD_SIZE,
                CHECKERBOARD_CELL,
            )],
            draws: vec![DrawDesc {
                pipeline: 0,
                mesh: 0,
                textures: vec![TextureBinding {
                    register: 0,
                    texture: 0,
                }],
                instance_count: 1,
            }],
        }
    }

    /// Adds a vertex-colored pipeline and triangle next to whatever is
    /// already in the scene.
    pub fn with_colored_triangle(
        mut self,
        vs_bytecode: Vec<u8>,
        ps_bytecode: Vec<u8>,
        aspect_ratio: f32,
    ) -> Self {
        self.pipelines
            .push(colored_pipeline_desc(vs_bytecode, ps_bytecode));
        self.meshes.push(Mesh::from_vertices(
            "colored triangle",
            &colored_triangle(aspect_ratio),
        ));
        self.draws.push(DrawDesc {
            pipeline: self.pipelines.len() - 1,
            mesh: self.meshes.len() - 1,
            textures: Vec::new(),
            instance_count: 1,
        });
        self
    }
}

pub fn textured_pipeline_desc(vs_bytecode: Vec<u8>, ps_bytecode: Vec<u8>) -> PipelineDesc {
    PipelineDesc {
        label: "textured".into(),
        vertex_shader: ShaderModule::new(
            ShaderStage::Vertex,
            VS_ENTRY_POINT,
            vs_bytecode,
            textured_interface(ShaderStage::Vertex),
        ),
        pixel_shader: ShaderModule::new(
            ShaderStage::Pixel,
            PS_ENTRY_POINT,
            ps_bytecode,
            textured_interface(ShaderStage::Pixel),
        ),
        vertex_layout: TexturedVertex::layout(),
        binding_layout: BindingLayout {
            tables: vec![DescriptorTable {
                kind: DescriptorKind::ShaderResource,
                base_register: 0,
                count: 1,
                visibility: ShaderVisibility::Pixel,
            }],
            static_samplers: vec![StaticSampler {
                register: 0,
                filter: Filter::Point,
                address: AddressMode::Border,
                visibility: ShaderVisibility::Pixel,
            }],
        },
        topology: PrimitiveTopology::TriangleList,
        rasterizer: RasterizerState {
            cull: CullMode::None,
            ..Default::default()
        },
        blend: BlendMode::Opaque,
        depth_test: false,
        render_target_format: TextureFormat::Rgba8Unorm,
    }
}

pub fn colored_pipeline_desc(vs_bytecode: Vec<u8>, ps_bytecode: Vec<u8>) -> PipelineDesc {
    PipelineDesc {
        label: "colored".into(),
        vertex_shader: ShaderModule::new(
            ShaderStage::Vertex,
            VS_ENTRY_POINT,
            vs_bytecode,
            colored_interface(ShaderStage::Vertex),
        ),
        pixel_shader: ShaderModule::new(
            ShaderStage::Pixel,
            PS_ENTRY_POINT,
            ps_bytecode,
            colored_interface(ShaderStage::Pixel),
        ),
        vertex_layout: ColoredVertex::layout(),
        binding_layout: BindingLayout::default(),
        topology: PrimitiveTopology::TriangleList,
        rasterizer: RasterizerState {
            cull: CullMode::None,
            ..Default::default()
        },
        blend: BlendMode::Opaque,
        depth_test: false,
        render_target_format: TextureFormat::Rgba8Unorm,
    }
}
