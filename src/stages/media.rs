use std::io::Cursor;

use anyhow::{Context, Result, anyhow, bail};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{
    CompressionType as PngCompressionType, FilterType as PngFilterType, PngEncoder,
};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat};
use serde_json::Value;
use tracing::debug;
use webp::Encoder as WebpEncoder;

use super::markup::minify_svg;
use super::{reject_unknown, take_bool, take_u8};
use crate::pipeline::{Artifact, PipelineContext, Stage, StageParameters};

/// Re-encodes raster images and cleans up SVG markup. The optimized bytes are
/// only kept when they are smaller than the input.
pub struct OptimizeImageStage {
    jpeg_quality: u8,
    png_level: u8,
    svg_remove_view_box: bool,
    webp_quality: Option<u8>,
}

impl OptimizeImageStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let jpeg_quality = take_u8(&mut params, "jpeg_quality")?.unwrap_or(75);
        let png_level = take_u8(&mut params, "png_level")?.unwrap_or(5);
        let svg_remove_view_box = take_bool(&mut params, "svg_remove_view_box").unwrap_or(true);
        let webp_quality = take_u8(&mut params, "webp_quality")?;
        reject_unknown("optimize_image", &params)?;

        if !(1..=100).contains(&jpeg_quality) {
            bail!("jpeg_quality must be between 1 and 100, got {jpeg_quality}");
        }
        if png_level > 7 {
            bail!("png_level must be between 0 and 7, got {png_level}");
        }
        if let Some(quality) = webp_quality
            && quality > 100
        {
            bail!("webp_quality must be between 0 and 100, got {quality}");
        }
        Ok(Self {
            jpeg_quality,
            png_level,
            svg_remove_view_box,
            webp_quality,
        })
    }

    fn optimize(&self, artifact: &Artifact) -> Result<Option<Vec<u8>>> {
        let extension = artifact.extension().unwrap_or_default();
        let optimized = match extension.as_str() {
            "jpg" | "jpeg" => {
                let image = decode(&artifact.data, ImageFormat::Jpeg)?;
                Some(encode_jpeg(&image, self.jpeg_quality)?)
            }
            "png" => {
                let image = decode(&artifact.data, ImageFormat::Png)?;
                Some(encode_png(&image, self.png_level)?)
            }
            "webp" => match self.webp_quality {
                Some(quality) => {
                    let image = decode(&artifact.data, ImageFormat::WebP)?;
                    Some(encode_webp(&image, quality)?)
                }
                None => None,
            },
            "svg" => {
                let markup = artifact.text()?;
                Some(minify_svg(markup, self.svg_remove_view_box).into_bytes())
            }
            _ => None,
        };
        Ok(optimized)
    }
}

impl Stage for OptimizeImageStage {
    fn name(&self) -> &'static str {
        "optimize_image"
    }

    fn run(&self, artifact: &mut Artifact, _ctx: &PipelineContext) -> Result<()> {
        let original = artifact.data.len();
        let optimized = self
            .optimize(artifact)
            .with_context(|| format!("Failed to optimize {}", artifact.input_path.display()))?;

        let kept = match optimized {
            Some(bytes) if bytes.len() < original => {
                artifact.replace_data(bytes);
                true
            }
            _ => false,
        };
        debug!(
            file = %artifact.relative.display(),
            original_bytes = original,
            output_bytes = artifact.data.len(),
            kept_optimized = kept,
            "Image optimized"
        );
        artifact
            .metadata
            .insert("image.original_bytes".to_string(), Value::from(original));
        artifact.metadata.insert(
            "image.output_bytes".to_string(),
            Value::from(artifact.data.len()),
        );
        Ok(())
    }
}

fn decode(data: &[u8], format: ImageFormat) -> Result<DynamicImage> {
    image::load_from_memory_with_format(data, format)
        .with_context(|| format!("Failed to decode {format:?} image"))
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut cursor = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut cursor, quality)
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .context("JPEG encode failed")?;
    Ok(cursor.into_inner())
}

fn encode_png(image: &DynamicImage, level: u8) -> Result<Vec<u8>> {
    let compression = match level {
        0..=2 => PngCompressionType::Fast,
        3..=5 => PngCompressionType::Default,
        _ => PngCompressionType::Best,
    };
    // Re-encode in the source color type so grayscale and 16-bit images stay as they are.
    let color: ExtendedColorType = image.color().into();
    let mut cursor = Cursor::new(Vec::new());
    PngEncoder::new_with_quality(&mut cursor, compression, PngFilterType::Adaptive)
        .write_image(image.as_bytes(), image.width(), image.height(), color)
        .context("PNG encode failed")?;
    Ok(cursor.into_inner())
}

fn encode_webp(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let encoder = WebpEncoder::from_image(image)
        .map_err(|err| anyhow!("Failed to prepare WebP encoder: {err}"))?;
    Ok(encoder.encode(f32::from(quality)).to_vec())
}
