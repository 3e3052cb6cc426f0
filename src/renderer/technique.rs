//! Technique files: named sets of pipelines bound to render graph nodes.
//!
//! ```json
//! {
//!   "name": "fullscreen",
//!   "pipelines": [
//!     {
//!       "name": "main",
//!       "render_pass": "lighting",
//!       "shaders": [
//!         { "stage": "vertex", "shader": "fullscreen.wgsl", "includes": ["common.wgsl"] },
//!         { "stage": "fragment", "shader": "fullscreen.wgsl" }
//!       ],
//!       "depth": { "write": false, "test": "less_or_equal" },
//!       "blend": [ { "enable": true, "src_colour": "SRC_ALPHA", "dst_colour": "ONE_MINUS_SRC_ALPHA", "op": "ADD" } ],
//!       "cull": "back"
//!     }
//!   ]
//! }
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use super::{
    resource_cache::{CacheError, TechniqueCreation, TechniquePassCreation},
    RendererResourceCache, TechniqueHandle,
};
use crate::{
    gpu::{
        types::{parse_texture_format, ParseEnumError},
        BlendState, CompareOp, CullMode, DepthState, LoadOp, PipelineCreation, PrimitiveTopology,
        RenderPassOutput, ShaderStage, ShaderStageCreation,
    },
    render_graph::{description::flag, RenderGraph},
};

#[derive(Debug, Error)]
pub enum TechniqueError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse technique {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Vocabulary(#[from] ParseEnumError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TechniqueDescription {
    pub name: String,
    #[serde(default)]
    pub pipelines: Vec<PipelineDescription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDescription {
    pub name: Option<String>,
    #[serde(default)]
    pub shaders: Vec<ShaderDescription>,
    pub depth: Option<DepthDescription>,
    #[serde(default)]
    pub blend: Vec<BlendDescription>,
    pub cull: Option<String>,
    pub topology: Option<String>,
    pub render_pass: Option<String>,
    pub render_pass_output: Option<RenderPassOutputDescription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShaderDescription {
    pub stage: String,
    pub shader: String,
    #[serde(default)]
    pub includes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepthDescription {
    #[serde(default, deserialize_with = "flag")]
    pub write: bool,
    pub test: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlendDescription {
    #[serde(default = "enabled", deserialize_with = "flag")]
    pub enable: bool,
    pub src_colour: String,
    pub dst_colour: String,
    #[serde(default = "add")]
    pub op: String,
}

fn enabled() -> bool {
    true
}

fn add() -> String {
    "ADD".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderPassOutputDescription {
    /// Node whose attachment layout the pipeline renders into.
    pub reference: Option<String>,
    #[serde(default)]
    pub custom: Vec<AttachmentDescription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentDescription {
    pub format: String,
    pub op: Option<String>,
}

/// A technique ready for the cache, plus the render passes that could not
/// be found and fell back to the swapchain layout.
#[derive(Debug, Clone)]
pub struct LoadedTechnique {
    pub creation: TechniqueCreation,
    pub fallbacks: Vec<String>,
}

impl TechniqueDescription {
    pub fn from_json(text: &str, path: &Path) -> Result<Self, TechniqueError> {
        serde_json::from_str(text).map_err(|source| TechniqueError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, TechniqueError> {
        let text = read(path)?;
        Self::from_json(&text, path)
    }
}

fn read(path: &Path) -> Result<String, TechniqueError> {
    fs::read_to_string(path).map_err(|source| TechniqueError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Includes first, in order, then the stage's own file.
fn shader_source(shaders_dir: &Path, shader: &ShaderDescription) -> Result<String, TechniqueError> {
    let mut source = String::new();
    for include in shader.includes.iter().chain(std::iter::once(&shader.shader)) {
        source.push_str(&read(&shaders_dir.join(include))?);
        if !source.ends_with('\n') {
            source.push('\n');
        }
    }
    Ok(source)
}

fn custom_output(attachments: &[AttachmentDescription]) -> Result<RenderPassOutput, TechniqueError> {
    let mut output = RenderPassOutput::default();
    for attachment in attachments {
        let format = parse_texture_format(&attachment.format)?;
        let op = match &attachment.op {
            Some(op) => op.parse::<LoadOp>()?,
            None => LoadOp::Clear,
        };
        if format.is_depth_stencil_format() {
            output.depth = Some((format, op));
        } else {
            output.color.push((format, op));
        }
    }
    Ok(output)
}

/// Resolves the layout a pipeline renders into. Unknown nodes fall back to
/// the swapchain layout and are reported through `fallbacks`.
fn resolve_render_pass(
    desc: &PipelineDescription,
    graph: &RenderGraph,
    swapchain_format: wgpu::TextureFormat,
    fallbacks: &mut Vec<String>,
) -> Result<(String, RenderPassOutput), TechniqueError> {
    let reference = match &desc.render_pass_output {
        Some(output) if output.reference.is_none() && !output.custom.is_empty() => {
            let node = desc.render_pass.clone().unwrap_or_default();
            return Ok((node, custom_output(&output.custom)?));
        }
        Some(output) => output.reference.clone().or_else(|| desc.render_pass.clone()),
        None => desc.render_pass.clone(),
    };
    let Some(node) = reference else {
        return Ok((String::new(), RenderPassOutput::swapchain(swapchain_format)));
    };
    if node == graph.presentation_target() {
        return Ok((node, RenderPassOutput::swapchain(swapchain_format)));
    }
    match graph.render_pass_output(&node) {
        Some(output) => Ok((node, output)),
        None => {
            log::error!("Cannot find render pass '{node}'. Defaulting to swapchain");
            fallbacks.push(node.clone());
            Ok((node, RenderPassOutput::swapchain(swapchain_format)))
        }
    }
}

fn pipeline_creation(
    technique: &str,
    index: usize,
    desc: &PipelineDescription,
    shaders_dir: &Path,
    graph: &RenderGraph,
    swapchain_format: wgpu::TextureFormat,
    fallbacks: &mut Vec<String>,
) -> Result<TechniquePassCreation, TechniqueError> {
    let name = desc.name.clone().unwrap_or_else(|| index.to_string());

    let mut stages = Vec::with_capacity(desc.shaders.len());
    for shader in &desc.shaders {
        stages.push(ShaderStageCreation {
            stage: shader.stage.parse()?,
            name: shader.shader.clone(),
            source: shader_source(shaders_dir, shader)?,
        });
    }

    let depth = match &desc.depth {
        Some(depth) => DepthState {
            write: depth.write,
            test: Some(match &depth.test {
                Some(test) => test.parse()?,
                None => CompareOp::LessOrEqual,
            }),
        },
        None => DepthState {
            write: false,
            test: None,
        },
    };

    let mut blend = Vec::with_capacity(desc.blend.len());
    for state in &desc.blend {
        blend.push(BlendState {
            enable: state.enable,
            src_colour: state.src_colour.parse()?,
            dst_colour: state.dst_colour.parse()?,
            op: state.op.parse()?,
        });
    }

    // Compute pipelines bind to their node by name only.
    let (render_pass, output) = if stages.iter().any(|s| s.stage == ShaderStage::Compute) {
        (
            desc.render_pass.clone().unwrap_or_default(),
            RenderPassOutput::swapchain(swapchain_format),
        )
    } else {
        resolve_render_pass(desc, graph, swapchain_format, fallbacks)?
    };
    Ok(TechniquePassCreation {
        name: name.clone(),
        render_pass,
        pipeline: PipelineCreation {
            name: format!("{technique}/{name}"),
            stages,
            depth,
            blend,
            cull: desc.cull.as_deref().map(str::parse::<CullMode>).transpose()?.unwrap_or_default(),
            topology: desc
                .topology
                .as_deref()
                .map(str::parse::<PrimitiveTopology>)
                .transpose()?
                .unwrap_or_default(),
            render_pass: output,
        },
    })
}

/// Parses a technique file and reads its shaders.
pub fn load_technique(
    path: &Path,
    shaders_dir: &Path,
    graph: &RenderGraph,
    swapchain_format: wgpu::TextureFormat,
) -> Result<LoadedTechnique, TechniqueError> {
    let desc = TechniqueDescription::from_file(path)?;
    let mut fallbacks = Vec::new();
    let mut passes = Vec::with_capacity(desc.pipelines.len());
    for (index, pipeline) in desc.pipelines.iter().enumerate() {
        passes.push(pipeline_creation(
            &desc.name,
            index,
            pipeline,
            shaders_dir,
            graph,
            swapchain_format,
            &mut fallbacks,
        )?);
    }
    Ok(LoadedTechnique {
        creation: TechniqueCreation {
            name: desc.name,
            source: Some(path.to_path_buf()),
            passes,
        },
        fallbacks,
    })
}

/// Loads a technique file into the cache. A technique already cached under
/// the same name has its pipelines rebuilt in place.
pub fn load_into_cache(
    cache: &mut RendererResourceCache,
    path: &Path,
    shaders_dir: &Path,
    graph: &RenderGraph,
) -> Result<(TechniqueHandle, LoadedTechnique), TechniqueError> {
    let swapchain_format = cache.device().swapchain_format();
    let loaded = load_technique(path, shaders_dir, graph, swapchain_format)?;
    let handle = match cache.technique_by_name(&loaded.creation.name) {
        Some(handle) => {
            cache.replace_technique(handle, &loaded.creation)?;
            handle
        }
        None => cache.create_technique(&loaded.creation)?,
    };
    Ok((handle, loaded))
}

/// Technique files in `dir`, sorted by name.
pub fn technique_files(dir: &Path) -> Result<Vec<PathBuf>, TechniqueError> {
    let entries = fs::read_dir(dir).map_err(|source| TechniqueError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BlendFactor, BlendOp, ShaderStage};

    #[test]
    fn parses_pipeline_fields() {
        let desc = TechniqueDescription::from_json(
            r#"{
                "name": "t",
                "pipelines": [ {
                    "shaders": [ { "stage": "compute", "shader": "a.wgsl", "includes": ["b.wgsl"] } ],
                    "depth": { "write": 1, "test": "equal" },
                    "blend": [ { "enable": "true", "src_colour": "SRC_ALPHA", "dst_colour": "ONE_MINUS_SRC_ALPHA", "op": "REVERSE_SUBTRACT" } ],
                    "cull": "front",
                    "render_pass_output": { "custom": [ { "format": "VK_FORMAT_D32_SFLOAT", "op": "load" } ] }
                } ]
            }"#,
            Path::new("t.json"),
        )
        .unwrap();
        let pipeline = &desc.pipelines[0];
        assert_eq!(pipeline.shaders[0].stage.parse::<ShaderStage>().unwrap(), ShaderStage::Compute);
        assert_eq!(pipeline.shaders[0].includes, vec!["b.wgsl".to_string()]);
        let depth = pipeline.depth.as_ref().unwrap();
        assert!(depth.write);
        assert_eq!(depth.test.as_deref(), Some("equal"));
        assert!(pipeline.blend[0].enable);
        assert_eq!(pipeline.blend[0].src_colour.parse::<BlendFactor>().unwrap(), BlendFactor::SrcAlpha);
        assert_eq!(pipeline.blend[0].op.parse::<BlendOp>().unwrap(), BlendOp::ReverseSubtract);
        assert_eq!(pipeline.cull.as_deref().map(str::parse::<CullMode>), Some(Ok(CullMode::Front)));

        let output = custom_output(&pipeline.render_pass_output.as_ref().unwrap().custom).unwrap();
        assert_eq!(output.depth, Some((wgpu::TextureFormat::Depth32Float, LoadOp::Load)));
        assert!(output.color.is_empty());
    }

    #[test]
    fn malformed_json_names_the_file() {
        let err = TechniqueDescription::from_json("{ \"pipelines\": [] }", Path::new("broken.json")).unwrap_err();
        assert!(matches!(err, TechniqueError::Parse { ref path, .. } if path == Path::new("broken.json")));
    }
}
