use std::{path::Path, time::Instant};

use ddsfile::{Caps2, Dds, DxgiFormat};
use glam::UVec2;
use thiserror::Error;

use super::requests::TextureData;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to parse dds: {0}")]
    Dds(String),
    #[error("unsupported dds format {0:?}")]
    UnsupportedDdsFormat(Option<DxgiFormat>),
}

pub fn dds_format_to_wgpu(format: DxgiFormat) -> Option<wgpu::TextureFormat> {
    let format = match format {
        DxgiFormat::BC1_UNorm => wgpu::TextureFormat::Bc1RgbaUnorm,
        DxgiFormat::BC1_UNorm_sRGB => wgpu::TextureFormat::Bc1RgbaUnormSrgb,
        DxgiFormat::BC2_UNorm => wgpu::TextureFormat::Bc2RgbaUnorm,
        DxgiFormat::BC2_UNorm_sRGB => wgpu::TextureFormat::Bc2RgbaUnormSrgb,
        DxgiFormat::BC3_UNorm => wgpu::TextureFormat::Bc3RgbaUnorm,
        DxgiFormat::BC3_UNorm_sRGB => wgpu::TextureFormat::Bc3RgbaUnormSrgb,
        DxgiFormat::BC4_UNorm => wgpu::TextureFormat::Bc4RUnorm,
        DxgiFormat::BC4_SNorm => wgpu::TextureFormat::Bc4RSnorm,
        DxgiFormat::BC5_UNorm => wgpu::TextureFormat::Bc5RgUnorm,
        DxgiFormat::BC5_SNorm => wgpu::TextureFormat::Bc5RgSnorm,
        DxgiFormat::BC6H_UF16 => wgpu::TextureFormat::Bc6hRgbUfloat,
        DxgiFormat::BC6H_SF16 => wgpu::TextureFormat::Bc6hRgbFloat,
        DxgiFormat::BC7_UNorm => wgpu::TextureFormat::Bc7RgbaUnorm,
        DxgiFormat::BC7_UNorm_sRGB => wgpu::TextureFormat::Bc7RgbaUnormSrgb,
        DxgiFormat::R8_UNorm => wgpu::TextureFormat::R8Unorm,
        DxgiFormat::R8G8B8A8_UNorm => wgpu::TextureFormat::Rgba8Unorm,
        DxgiFormat::R8G8B8A8_UNorm_sRGB => wgpu::TextureFormat::Rgba8UnormSrgb,
        DxgiFormat::R16G16B16A16_Float => wgpu::TextureFormat::Rgba16Float,
        DxgiFormat::R32G32B32A32_Float => wgpu::TextureFormat::Rgba32Float,
        _ => return None,
    };
    Some(format)
}

fn load_dds(bytes: &[u8]) -> Result<TextureData, DecodeError> {
    let dds = Dds::read(bytes).map_err(|e| DecodeError::Dds(format!("{e:?}")))?;
    let dxgi = dds.get_dxgi_format();
    let format = dxgi
        .and_then(dds_format_to_wgpu)
        .ok_or(DecodeError::UnsupportedDdsFormat(dxgi))?;
    let is_cubemap = dds.header.caps2.contains(Caps2::CUBEMAP);
    let array_layers = if is_cubemap { 6 } else { dds.get_num_array_layers() };

    Ok(TextureData {
        extent: UVec2::new(dds.get_width(), dds.get_height()),
        mip_levels: dds.get_num_mipmap_levels(),
        array_layers,
        format,
        data: dds.data,
    })
}

fn load_image(bytes: &[u8], srgb: bool) -> Result<TextureData, DecodeError> {
    let img = image::load_from_memory(bytes)?;
    let extent = UVec2::new(img.width(), img.height());
    let (data, format) = match (&img, srgb) {
        (image::DynamicImage::ImageRgb32F(_) | image::DynamicImage::ImageRgba32F(_), false) => (
            bytemuck::cast_slice(&img.to_rgba32f().into_raw()).to_vec(),
            wgpu::TextureFormat::Rgba32Float,
        ),
        (_, true) => (img.to_rgba8().into_raw(), wgpu::TextureFormat::Rgba8UnormSrgb),
        (_, false) => (img.to_rgba8().into_raw(), wgpu::TextureFormat::Rgba8Unorm),
    };

    Ok(TextureData {
        data,
        extent,
        mip_levels: 1,
        array_layers: 1,
        format,
    })
}

/// Reads and decodes a texture file. DDS is detected by its magic, every
/// other file goes through `image`.
pub fn load_texture(path: &Path, srgb: bool) -> Result<TextureData, DecodeError> {
    let start = Instant::now();
    let bytes = std::fs::read(path).map_err(|source| DecodeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let data = if bytes.starts_with(b"DDS ") {
        load_dds(&bytes)?
    } else {
        load_image(&bytes, srgb)?
    };
    log::debug!("File {} read in {:?}", path.display(), start.elapsed());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_decodes_to_rgba8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checker.png");
        let img = image::RgbaImage::from_fn(4, 2, |x, y| image::Rgba([x as u8, y as u8, 7, 255]));
        img.save(&path).unwrap();

        let data = load_texture(&path, false).unwrap();
        assert_eq!(data.extent, UVec2::new(4, 2));
        assert_eq!(data.format, wgpu::TextureFormat::Rgba8Unorm);
        assert_eq!(data.data.len(), 4 * 2 * 4);
        assert_eq!(&data.data[4..8], &[1, 0, 7, 255]);

        let srgb = load_texture(&path, true).unwrap();
        assert_eq!(srgb.format, wgpu::TextureFormat::Rgba8UnormSrgb);
    }

    #[test]
    fn missing_and_garbage_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_texture(&dir.path().join("nope.png"), false),
            Err(DecodeError::Io { .. })
        ));

        let garbage = dir.path().join("garbage.png");
        std::fs::write(&garbage, b"definitely not an image").unwrap();
        assert!(matches!(load_texture(&garbage, false), Err(DecodeError::Image(_))));
    }
}
