use std::io::Cursor;

use async_trait::async_trait;
use axum::body::Bytes;
use image::{codecs::jpeg::JpegEncoder, DynamicImage, ImageFormat};

use crate::{format::TargetFormat, Error};

const JPEG_QUALITY: u8 = 80;
const WEBP_QUALITY: f32 = 80.0;

/// Re-encodes an uploaded image into a requested format.
#[async_trait]
pub trait Codec: Send + Sync {
    async fn encode(&self, data: Bytes, format: TargetFormat) -> Result<Vec<u8>, Error>;
}

/// [`Codec`] backed by the `image` and `webp` crates, run on the blocking pool.
#[derive(Clone, Copy, Default)]
pub struct ImageCodec;

#[async_trait]
impl Codec for ImageCodec {
    async fn encode(&self, data: Bytes, format: TargetFormat) -> Result<Vec<u8>, Error> {
        tokio::task::spawn_blocking(move || convert_image(&data, format)).await?
    }
}

pub fn convert_image(data: &[u8], format: TargetFormat) -> Result<Vec<u8>, Error> {
    let image = image::load_from_memory(data)?;
    let mut output = Vec::new();
    match format {
        TargetFormat::Jpg => {
            // JPEG carries no alpha channel
            let encoder = JpegEncoder::new_with_quality(&mut output, JPEG_QUALITY);
            DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
        }
        TargetFormat::Png => {
            image.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
        }
        TargetFormat::Gif => {
            DynamicImage::ImageRgba8(image.to_rgba8())
                .write_to(&mut Cursor::new(&mut output), ImageFormat::Gif)?;
        }
        TargetFormat::Webp => output = encode_webp(&image)?,
    }
    Ok(output)
}

fn encode_webp(image: &DynamicImage) -> Result<Vec<u8>, Error> {
    let rgba;
    let image = match image {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => image,
        other => {
            rgba = DynamicImage::ImageRgba8(other.to_rgba8());
            &rgba
        }
    };
    let encoder =
        webp::Encoder::from_image(image).map_err(|source| Error::WebPStr(source.to_owned()))?;
    Ok(encoder.encode(WEBP_QUALITY).to_vec())
}
