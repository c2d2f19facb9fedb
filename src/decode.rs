use base64::Engine;
use image::DynamicImage;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Failed to read image data: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),
}

/// Decodes an inbound frame payload into an image.
///
/// Browser clients send canvas captures as `data:image/jpeg;base64,<data>`;
/// everything up to and including the first comma is treated as the data-URI
/// header and stripped.
pub fn decode_frame(payload: &str) -> Result<DynamicImage, DecodeError> {
    let data = payload
        .split_once(',')
        .map_or(payload, |(_, encoded)| encoded);

    let bytes = base64::engine::general_purpose::STANDARD.decode(data.trim())?;

    let reader = image::ImageReader::new(Cursor::new(&bytes)).with_guessed_format()?;
    Ok(reader.decode()?)
}
