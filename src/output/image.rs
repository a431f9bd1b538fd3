//! PNG rasterization for image surfaces

use base64::Engine as _;

use super::value::ImageSurface;

/// Encode an RGBA surface as a base64 PNG
pub(crate) fn encode_png_base64(surface: &ImageSurface) -> Result<String, png::EncodingError> {
    let mut buf = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buf, surface.width, surface.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&surface.pixels)?;
        writer.finish()?;
    }
    Ok(base64::engine::general_purpose::STANDARD.encode(buf))
}
