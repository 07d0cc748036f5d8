use hassle_rs::{compile_hlsl, fake_sign_dxil_in_place};

use crate::{
    error::{RenderError, RenderResult},
    shader::ShaderStage,
};

/// Compiles HLSL source to signed DXIL for `stage`.
pub fn compile_shader(
    name: &str,
    source: &str,
    entry_point: &str,
    stage: ShaderStage,
) -> RenderResult<Vec<u8>> {
    let mut bytecode = compile_hlsl(name, source, entry_point, stage.profile(), &[], &[])
        .map_err(|err| RenderError::shader(stage.name(), err.to_string()))?;
    if !fake_sign_dxil_in_place(&mut bytecode) {
        return Err(RenderError::shader(
            stage.name(),
            format!("failed to sign DXIL for `{name}`"),
        ));
    }
    Ok(bytecode)
}
