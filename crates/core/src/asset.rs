//! Decoded images held by the memory tier and handed to callers.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;

use crate::Error;

/// A decoded image plus the size of the bytes it was decoded from.
///
/// Cloning is cheap: the pixel data is shared. The memory cache accounts for
/// assets by `encoded_len`, not by their decoded size.
#[derive(Clone)]
pub struct Asset {
    image: Arc<DynamicImage>,
    encoded_len: usize,
    content_type: Option<String>,
}

impl Asset {
    /// Decode encoded image bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the bytes are not an image the `image`
    /// crate can read.
    pub fn decode(bytes: &Bytes, content_type: Option<&str>) -> Result<Self, Error> {
        let image = image::load_from_memory(bytes).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(Self { image: Arc::new(image), encoded_len: bytes.len(), content_type: content_type.map(str::to_string) })
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Whether both handles share the same decoded pixels.
    pub fn ptr_eq(&self, other: &Asset) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("encoded_len", &self.encoded_len)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Encode a `width`x`height` PNG whose size grows with its area.
#[cfg(any(test, feature = "test-util"))]
pub fn test_png(width: u32, height: u32) -> Vec<u8> {
    use image::{ImageBuffer, Rgb};

    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
        let seed = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503);
        Rgb([(seed >> 24) as u8, (seed >> 16) as u8, (seed >> 8) as u8])
    });
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encoding to memory cannot fail");
    bytes
}
