//! String vocabularies used by render graph and technique files, and their
//! mapping onto wgpu.

use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

string_enum!(BlendFactor, "blend factor", {
    Zero => "ZERO",
    One => "ONE",
    SrcColor => "SRC_COLOR",
    OneMinusSrcColor => "ONE_MINUS_SRC_COLOR",
    DstColor => "DST_COLOR",
    OneMinusDstColor => "ONE_MINUS_DST_COLOR",
    SrcAlpha => "SRC_ALPHA",
    OneMinusSrcAlpha => "ONE_MINUS_SRC_ALPHA",
    DstAlpha => "DST_ALPHA",
    OneMinusDstAlpha => "ONE_MINUS_DST_ALPHA",
    ConstantColor => "CONSTANT_COLOR",
    OneMinusConstantColor => "ONE_MINUS_CONSTANT_COLOR",
    ConstantAlpha => "CONSTANT_ALPHA",
    OneMinusConstantAlpha => "ONE_MINUS_CONSTANT_ALPHA",
    SrcAlphaSaturate => "SRC_ALPHA_SATURATE",
    Src1Color => "SRC1_COLOR",
    OneMinusSrc1Color => "ONE_MINUS_SRC1_COLOR",
    Src1Alpha => "SRC1_ALPHA",
    OneMinusSrc1Alpha => "ONE_MINUS_SRC1_ALPHA",
});

string_enum!(BlendOp, "blend op", {
    Add => "ADD",
    Subtract => "SUBTRACT",
    ReverseSubtract => "REVERSE_SUBTRACT",
    Min => "MIN",
    Max => "MAX",
});

string_enum!(CompareOp, "depth test", {
    Never => "never",
    Less => "less",
    Equal => "equal",
    LessOrEqual => "less_or_equal",
    Greater => "greater",
    NotEqual => "not_equal",
    GreaterOrEqual => "greater_or_equal",
    Always => "always",
});

string_enum!(CullMode, "cull mode", {
    None => "none",
    Back => "back",
    Front => "front",
});

string_enum!(ShaderStage, "shader stage", {
    Vertex => "vertex",
    Fragment => "fragment",
    Compute => "compute",
    Mesh => "mesh",
    Task => "task",
});

string_enum!(PrimitiveTopology, "topology", {
    PointList => "point_list",
    LineList => "line_list",
    LineStrip => "line_strip",
    TriangleList => "triangle_list",
    TriangleStrip => "triangle_strip",
});

string_enum!(LoadOp, "load op", {
    Clear => "clear",
    Load => "load",
    DontCare => "dont_care",
});

impl Default for CullMode {
    fn default() -> Self {
        CullMode::None
    }
}

impl Default for PrimitiveTopology {
    fn default() -> Self {
        PrimitiveTopology::TriangleList
    }
}

impl From<BlendFactor> for wgpu::BlendFactor {
    fn from(value: BlendFactor) -> Self {
        match value {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::SrcColor => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::DstColor => wgpu::BlendFactor::Dst,
            BlendFactor::OneMinusDstColor => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
            // wgpu has a single blend constant for colour and alpha
            BlendFactor::ConstantColor | BlendFactor::ConstantAlpha => wgpu::BlendFactor::Constant,
            BlendFactor::OneMinusConstantColor | BlendFactor::OneMinusConstantAlpha => {
                wgpu::BlendFactor::OneMinusConstant
            }
            BlendFactor::SrcAlphaSaturate => wgpu::BlendFactor::SrcAlphaSaturated,
            BlendFactor::Src1Color => wgpu::BlendFactor::Src1,
            BlendFactor::OneMinusSrc1Color => wgpu::BlendFactor::OneMinusSrc1,
            BlendFactor::Src1Alpha => wgpu::BlendFactor::Src1Alpha,
            BlendFactor::OneMinusSrc1Alpha => wgpu::BlendFactor::OneMinusSrc1Alpha,
        }
    }
}

impl From<BlendOp> for wgpu::BlendOperation {
    fn from(value: BlendOp) -> Self {
        match value {
            BlendOp::Add => wgpu::BlendOperation::Add,
            BlendOp::Subtract => wgpu::BlendOperation::Subtract,
            BlendOp::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOp::Min => wgpu::BlendOperation::Min,
            BlendOp::Max => wgpu::BlendOperation::Max,
        }
    }
}

impl From<CompareOp> for wgpu::CompareFunction {
    fn from(value: CompareOp) -> Self {
        match value {
            CompareOp::Never => wgpu::CompareFunction::Never,
            CompareOp::Less => wgpu::CompareFunction::Less,
            CompareOp::Equal => wgpu::CompareFunction::Equal,
            CompareOp::LessOrEqual => wgpu::CompareFunction::LessEqual,
            CompareOp::Greater => wgpu::CompareFunction::Greater,
            CompareOp::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareOp::GreaterOrEqual => wgpu::CompareFunction::GreaterEqual,
            CompareOp::Always => wgpu::CompareFunction::Always,
        }
    }
}

impl CullMode {
    pub fn to_wgpu(self) -> Option<wgpu::Face> {
        match self {
            CullMode::None => None,
            CullMode::Back => Some(wgpu::Face::Back),
            CullMode::Front => Some(wgpu::Face::Front),
        }
    }
}

impl From<PrimitiveTopology> for wgpu::PrimitiveTopology {
    fn from(value: PrimitiveTopology) -> Self {
        match value {
            PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
            PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
            PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        }
    }
}

/// Accepts Vulkan-style names (`VK_FORMAT_R16G16B16A16_SFLOAT`, with or
/// without the prefix) and a few wgpu-style names.
pub fn parse_texture_format(name: &str) -> Result<wgpu::TextureFormat, ParseEnumError> {
    use wgpu::TextureFormat as F;
    let short = name.strip_prefix("VK_FORMAT_").unwrap_or(name);
    let format = match short {
        "R8_UNORM" | "r8unorm" => F::R8Unorm,
        "R8G8_UNORM" | "rg8unorm" => F::Rg8Unorm,
        "R8G8B8A8_UNORM" | "rgba8unorm" => F::Rgba8Unorm,
        "R8G8B8A8_SRGB" | "rgba8unorm-srgb" => F::Rgba8UnormSrgb,
        "B8G8R8A8_UNORM" | "bgra8unorm" => F::Bgra8Unorm,
        "B8G8R8A8_SRGB" | "bgra8unorm-srgb" => F::Bgra8UnormSrgb,
        "A2B10G10R10_UNORM_PACK32" | "rgb10a2unorm" => F::Rgb10a2Unorm,
        "B10G11R11_UFLOAT_PACK32" | "rg11b10ufloat" => F::Rg11b10Ufloat,
        "R16_SFLOAT" | "r16float" => F::R16Float,
        "R16G16_SFLOAT" | "rg16float" => F::Rg16Float,
        "R16G16B16A16_SFLOAT" | "rgba16float" => F::Rgba16Float,
        "R32_SFLOAT" | "r32float" => F::R32Float,
        "R32_UINT" | "r32uint" => F::R32Uint,
        "R32G32_SFLOAT" | "rg32float" => F::Rg32Float,
        "R32G32B32A32_SFLOAT" | "rgba32float" => F::Rgba32Float,
        "D16_UNORM" | "depth16unorm" => F::Depth16Unorm,
        "D32_SFLOAT" | "depth32float" => F::Depth32Float,
        "D24_UNORM_S8_UINT" | "depth24plus-stencil8" => F::Depth24PlusStencil8,
        "D32_SFLOAT_S8_UINT" | "depth32float-stencil8" => F::Depth32FloatStencil8,
        _ => {
            return Err(ParseEnumError {
                kind: "texture format",
                value: name.to_string(),
            })
        }
    };
    Ok(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_factor_names_round_trip() {
        assert_eq!(BlendFactor::ALL.len(), 19);
        for factor in BlendFactor::ALL {
            assert_eq!(factor.as_str().parse::<BlendFactor>(), Ok(*factor));
        }
        for op in BlendOp::ALL {
            assert_eq!(op.as_str().parse::<BlendOp>(), Ok(*op));
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = "SRC_COLOUR".parse::<BlendFactor>().unwrap_err();
        assert_eq!(err.kind, "blend factor");
        assert!("less_equal".parse::<CompareOp>().is_err());
        assert!("geometry".parse::<ShaderStage>().is_err());
    }

    #[test]
    fn depth_test_names() {
        assert_eq!("less_or_equal".parse(), Ok(CompareOp::LessOrEqual));
        assert_eq!("equal".parse(), Ok(CompareOp::Equal));
        assert_eq!("never".parse(), Ok(CompareOp::Never));
        assert_eq!("always".parse(), Ok(CompareOp::Always));
    }

    #[test]
    fn vulkan_format_names() {
        assert_eq!(
            parse_texture_format("VK_FORMAT_R16G16B16A16_SFLOAT"),
            Ok(wgpu::TextureFormat::Rgba16Float)
        );
        assert_eq!(parse_texture_format("D32_SFLOAT"), Ok(wgpu::TextureFormat::Depth32Float));
        assert!(parse_texture_format("VK_FORMAT_R4G4_UNORM_PACK8").is_err());
    }
}
