//! On-disk render graph format.

use std::path::Path;

use serde::{Deserialize, Deserializer};

use super::GraphError;

#[derive(Debug, Clone, Deserialize)]
pub struct RenderGraphDescription {
    #[serde(default)]
    pub name: Option<String>,
    pub passes: Vec<PassDescription>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Graphics,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Attachment,
    Texture,
    Buffer,
    /// Writes into a resource of the same name produced by an earlier pass.
    Reference,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PassDescription {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: NodeType,
    #[serde(default = "enabled_default", deserialize_with = "flag")]
    pub enabled: bool,
    #[serde(default)]
    pub inputs: Vec<InputDescription>,
    #[serde(default)]
    pub outputs: Vec<OutputDescription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ResourceType,
    #[serde(default)]
    pub external: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OutputDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<ResourceType>,
    #[serde(default)]
    pub external: bool,
    pub format: Option<String>,
    pub op: Option<String>,
    /// Extent relative to the swapchain.
    pub scale: Option<[f32; 2]>,
    /// Absolute extent in texels, or bytes for buffers.
    pub size: Option<SizeDescription>,
    pub resize: Option<bool>,
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth: Option<f32>,
    pub clear_stencil: Option<u32>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SizeDescription {
    Bytes(u64),
    Extent([u32; 2]),
}

fn enabled_default() -> bool {
    true
}

/// Accepts `true`/`false`, numeric flags (`0` disables) and the same as
/// strings.
pub(crate) fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(f64),
        Text(String),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Number(n) => n != 0.0,
        Flag::Text(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "on" | "enabled"),
    })
}

impl RenderGraphDescription {
    pub fn from_json(text: &str) -> Result<Self, GraphError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, GraphError> {
        let text = std::fs::read_to_string(path).map_err(|source| GraphError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_passes_with_defaults() {
        let desc = RenderGraphDescription::from_json(
            r#"{
                "name": "test",
                "passes": [
                    {
                        "name": "gbuffer",
                        "outputs": [
                            { "type": "attachment", "name": "albedo", "format": "VK_FORMAT_R8G8B8A8_UNORM", "op": "clear", "scale": [1, 1] },
                            { "type": "buffer", "name": "counts", "size": 256 }
                        ]
                    },
                    {
                        "name": "cull",
                        "type": "compute",
                        "enabled": 0,
                        "inputs": [ { "type": "buffer", "name": "counts" } ]
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(desc.name.as_deref(), Some("test"));
        let gbuffer = &desc.passes[0];
        assert_eq!(gbuffer.kind, NodeType::Graphics);
        assert!(gbuffer.enabled);
        assert_eq!(gbuffer.outputs[0].scale, Some([1.0, 1.0]));
        assert_eq!(gbuffer.outputs[1].size, Some(SizeDescription::Bytes(256)));

        let cull = &desc.passes[1];
        assert_eq!(cull.kind, NodeType::Compute);
        assert!(!cull.enabled);
        assert_eq!(cull.inputs[0].kind, ResourceType::Buffer);
    }

    #[test]
    fn rejects_unknown_resource_type() {
        let result = RenderGraphDescription::from_json(
            r#"{ "passes": [ { "name": "a", "inputs": [ { "type": "mystery", "name": "x" } ] } ] }"#,
        );
        assert!(matches!(result, Err(GraphError::Parse(_))));
    }
}
