use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use glam::UVec2;
use serde::Deserialize;
use thiserror::Error;

use crate::loader::OverflowPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid size '{0}', expected WIDTHxHEIGHT")]
    Size(String),
    #[error("invalid loader config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoaderMode {
    /// A dedicated thread runs the loader.
    #[default]
    Thread,
    /// The frame loop runs one loader step per frame.
    PerFrame,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub file_load_capacity: usize,
    pub upload_capacity: usize,
    pub staging_size: u64,
    pub overflow_policy: OverflowPolicy,
    pub mode: LoaderMode,
    pub idle_sleep_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            file_load_capacity: 16,
            upload_capacity: 16,
            staging_size: 64 * 1024 * 1024,
            overflow_policy: OverflowPolicy::Reject,
            mode: LoaderMode::Thread,
            idle_sleep_ms: 1,
        }
    }
}

impl LoaderConfig {
    /// A per-frame loader drains its queues on the thread that fills them,
    /// so a blocking push there never returns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == LoaderMode::PerFrame && self.overflow_policy == OverflowPolicy::Block {
            return Err(ConfigError::Invalid(
                "overflow_policy 'block' needs mode 'thread'".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub textures: usize,
    pub buffers: usize,
    pub samplers: usize,
    pub techniques: usize,
    pub materials: usize,
    pub graph_nodes: usize,
    pub graph_resources: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            textures: 512,
            buffers: 4096,
            samplers: 32,
            techniques: 128,
            materials: 256,
            graph_nodes: 64,
            graph_resources: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub render_graph: PathBuf,
    pub techniques_dir: PathBuf,
    pub shaders_dir: PathBuf,
    /// Name of the external graph resource bound to the swapchain image.
    pub presentation_target: String,
    pub swapchain_size: [u32; 2],
    pub workers: usize,
    pub hot_reload: bool,
    pub loader: LoaderConfig,
    pub pools: PoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            render_graph: PathBuf::from("resources/render_graph.json"),
            techniques_dir: PathBuf::from("resources/techniques"),
            shaders_dir: PathBuf::from("resources/shaders"),
            presentation_target: "swapchain".to_string(),
            swapchain_size: [800, 600],
            workers: 4,
            hot_reload: false,
            loader: LoaderConfig::default(),
            pools: PoolConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn swapchain_extent(&self) -> UVec2 {
        UVec2::from(self.swapchain_size)
    }

    /// Command line values override the file.
    pub fn apply_args(&mut self, args: &CliArgs) {
        if let Some(path) = &args.render_graph {
            self.render_graph = path.clone();
        }
        if let Some(width) = args.width {
            self.swapchain_size[0] = width;
        }
        if let Some(height) = args.height {
            self.swapchain_size[1] = height;
        }
        if let Some(workers) = args.workers {
            self.workers = workers;
        }
        if args.hot_reload {
            self.hot_reload = true;
        }
    }
}

pub fn parse_size(text: &str) -> Result<UVec2, ConfigError> {
    let (w, h) = text
        .split_once(['x', 'X'])
        .ok_or_else(|| ConfigError::Size(text.to_string()))?;
    let parse = |v: &str| v.trim().parse::<u32>().map_err(|_| ConfigError::Size(text.to_string()));
    Ok(UVec2::new(parse(w)?, parse(h)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Headless,
    Wgpu,
}

#[derive(Debug, Parser)]
#[command(version, about = "Render graph and async loader driver")]
pub struct CliArgs {
    /// Engine config JSON; defaults apply when omitted
    #[arg(short, long, env = "RENDER_CORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Render graph JSON, overrides the config file
    #[arg(short, long, env = "RENDER_CORE_GRAPH")]
    pub render_graph: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value = "headless", env = "RENDER_CORE_BACKEND")]
    pub backend: Backend,

    #[arg(short, long, default_value_t = 3)]
    pub frames: u32,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    #[arg(long)]
    pub workers: Option<usize>,

    /// Resize to WIDTHxHEIGHT after the first frame
    #[arg(long)]
    pub resize_to: Option<String>,

    /// Texture files to stream through the loader while rendering
    #[arg(long = "texture")]
    pub textures: Vec<PathBuf>,

    #[arg(long)]
    pub hot_reload: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "workers": 2, "loader": { "overflow_policy": "block" } }"#)
                .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.loader.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.loader.upload_capacity, 16);
        assert_eq!(config.loader.staging_size, 64 * 1024 * 1024);
        assert_eq!(config.presentation_target, "swapchain");
    }

    #[test]
    fn args_override_file_values() {
        let args = CliArgs::parse_from(["render-core", "--width", "1024", "-r", "graph.json"]);
        let mut config = EngineConfig::default();
        config.apply_args(&args);
        assert_eq!(config.swapchain_extent(), UVec2::new(1024, 600));
        assert_eq!(config.render_graph, PathBuf::from("graph.json"));
    }

    #[test]
    fn blocking_overflow_needs_a_loader_thread() {
        let mut loader = LoaderConfig {
            overflow_policy: OverflowPolicy::Block,
            ..LoaderConfig::default()
        };
        assert!(loader.validate().is_ok());
        loader.mode = LoaderMode::PerFrame;
        assert!(matches!(loader.validate(), Err(ConfigError::Invalid(_))));
        loader.overflow_policy = OverflowPolicy::Reject;
        assert!(loader.validate().is_ok());
    }

    #[test]
    fn size_parsing() {
        assert_eq!(parse_size("1280x720").unwrap(), UVec2::new(1280, 720));
        assert!(parse_size("1280").is_err());
        assert!(parse_size("ax2").is_err());
    }
}
