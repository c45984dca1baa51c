use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, RgbaImage};

/// A decoded raster frame, RGBA8, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StillFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl StillFrame {
    pub fn solid(width: u32, height: u32, pixel: [u8; 4]) -> Self {
        let mut rgba = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            rgba.extend_from_slice(&pixel);
        }
        Self { width, height, rgba }
    }

    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let image = RgbaImage::from_raw(self.width, self.height, self.rgba.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))?;
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .context("failed to encode still frame as PNG")?;
        Ok(out.into_inner())
    }
}

/// Decode any supported image payload into a [`StillFrame`].
pub fn decode_image_bytes(bytes: &[u8]) -> Result<StillFrame> {
    let image = image::load_from_memory(bytes)
        .context("failed to decode image bytes")?
        .to_rgba8();
    Ok(StillFrame {
        width: image.width(),
        height: image.height(),
        rgba: image.into_raw(),
    })
}

pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64.encode(png))
}

/// Split a `data:` URL into its media type and decoded payload.
pub fn parse_data_url(url: &str) -> Option<(String, Vec<u8>)> {
    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let media_type = header.strip_suffix(";base64")?;
    let bytes = BASE64.decode(payload).ok()?;
    Some((media_type.to_owned(), bytes))
}
