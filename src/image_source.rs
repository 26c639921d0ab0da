use crate::leaf_model::ModelError;
use image::{DynamicImage, ImageFormat};

/// Decodes PNG or JPEG bytes. Other formats are refused even when the image
/// crate could read them.
pub fn decode_image(bytes: &[u8], max_bytes: usize) -> Result<DynamicImage, ModelError> {
    if bytes.len() > max_bytes {
        return Err(ModelError::ImageTooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }
    let format = image::guess_format(bytes)?;
    match format {
        ImageFormat::Png | ImageFormat::Jpeg => {}
        other => return Err(ModelError::UnsupportedFormat(format!("{other:?}"))),
    }
    Ok(image::load_from_memory_with_format(bytes, format)?)
}

/// Downloads an image, giving up as soon as the body grows past `max_bytes`.
pub async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, ModelError> {
    tracing::debug!(%url, "fetching image");
    let mut response = client.get(url).send().await?.error_for_status()?;
    if let Some(length) = response.content_length() {
        let length = usize::try_from(length).unwrap_or(usize::MAX);
        if length > max_bytes {
            return Err(ModelError::ImageTooLarge {
                size: length,
                limit: max_bytes,
            });
        }
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let size = bytes.len() + chunk.len();
        if size > max_bytes {
            return Err(ModelError::ImageTooLarge {
                size,
                limit: max_bytes,
            });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

#[cfg(test)]
pub(crate) fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), format)
        .unwrap();
    bytes
}
