use crate::{
    error::{RenderError, RenderResult},
    pipeline::VertexFormat,
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Pixel => "pixel",
        }
    }

    pub fn profile(self) -> &'static str {
        match self {
            Self::Vertex => "vs_6_0",
            Self::Pixel => "ps_6_0",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ShaderResourceKind {
    Texture,
    Sampler,
    ConstantBuffer,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShaderInput {
    pub semantic: String,
    pub semantic_index: u32,
    pub format: VertexFormat,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShaderResource {
    pub kind: ShaderResourceKind,
    pub register: u32,
}

/// What a compiled stage consumes, as produced by shader reflection in the
/// asset pipeline.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShaderInterface {
    pub inputs: Vec<ShaderInput>,
    pub resources: Vec<ShaderResource>,
}

#[derive(Clone, Debug)]
pub struct ShaderModule {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub bytecode: Vec<u8>,
    pub interface: ShaderInterface,
}

impl ShaderModule {
    pub fn new(
        stage: ShaderStage,
        entry_point: impl Into<String>,
        bytecode: Vec<u8>,
        interface: ShaderInterface,
    ) -> Self {
        Self {
            stage,
            entry_point: entry_point.into(),
            bytecode,
            interface,
        }
    }

    pub(crate) fn check(&self, expected: ShaderStage) -> RenderResult<()> {
        if self.stage != expected {
            return Err(RenderError::shader(
                expected.name(),
                format!("module `{}` is a {} shader", self.entry_point, self.stage.name()),
            ));
        }
        if self.bytecode.is_empty() {
            return Err(RenderError::shader(
                expected.name(),
                format!("module `{}` has no bytecode", self.entry_point),
            ));
        }
        if self.entry_point.is_empty() {
            return Err(RenderError::shader(expected.name(), "missing entry point"));
        }
        Ok(())
    }
}

pub const TEXTURED_HLSL: &str = r#"
struct PSInput
{
    float4 position : SV_POSITION;
    float2 uv : TEXCOORD;
};

Texture2D g_texture : register(t0);
SamplerState g_sampler : register(s0);

PSInput VSMain(float4 position : POSITION, float4 uv : TEXCOORD)
{
    PSInput result;
    result.position = position;
    result.uv = uv.xy;
    return result;
}

float4 PSMain(PSInput input) : SV_TARGET
{
    return g_texture.Sample(g_sampler, input.uv);
}
"#;

pub const VS_ENTRY_POINT: &str = "VSMain";
pub const PS_ENTRY_POINT: &str = "PSMain";

pub fn textured_interface(stage: ShaderStage) -> ShaderInterface {
    match stage {
        ShaderStage::Vertex => ShaderInterface {
            inputs: vec![
                ShaderInput {
                    semantic: "POSITION".into(),
                    semantic_index: 0,
                    format: VertexFormat::Float32x3,
                },
                ShaderInput {
                    semantic: "TEXCOORD".into(),
                    semantic_index: 0,
                    format: VertexFormat::Float32x2,
                },
            ],
            resources: Vec::new(),
        },
        ShaderStage::Pixel => ShaderInterface {
            inputs: Vec::new(),
            resources: vec![
                ShaderResource {
                    kind: ShaderResourceKind::Texture,
                    register: 0,
                },
                ShaderResource {
                    kind: ShaderResourceKind::Sampler,
                    register: 0,
                },
            ],
        },
    }
}

pub const COLORED_HLSL: &str = r#"
struct PSInput
{
    float4 position : SV_POSITION;
    float4 color : COLOR;
};

PSInput VSMain(float4 position : POSITION, float4 color : COLOR)
{
    PSInput result;
    result.position = position;
    result.color = color;
    return result;
}

float4 PSMain(PSInput input) : SV_TARGET
{
    return input.color;
}
"#;

pub fn colored_interface(stage: ShaderStage) -> ShaderInterface {
    match stage {
        ShaderStage::Vertex => ShaderInterface {
            inputs: vec![
                ShaderInput {
                    semantic: "POSITION".into(),
                    semantic_index: 0,
                    format: VertexFormat::Float32x3,
                },
                ShaderInput {
                    semantic: "COLOR".into(),
                    semantic_index: 0,
                    format: VertexFormat::Float32x4,
                },
            ],
            resources: Vec::new(),
        },
        ShaderStage::Pixel => ShaderInterface::default(),
    }
}
