//! Helpers for neural style transfer experiments on VGG19: bringing images into the
//! network's input format and back, showing arrays as images and caching numeric
//! functions between notebook runs.
pub mod cache;
pub mod display;
pub mod preprocess;

pub use preprocess::{deprocess, prep_image, ImagePreprocessor};

use std::path::Path;

use image::{DynamicImage, RgbImage};
use ndarray::{Array2, Array3, ArrayD, ShapeError};
use nshare::ToNdarray3;
use thiserror::Error;

pub type ImageIoResult<T> = Result<T, ImageIoError>;

#[derive(Error, Debug)]
pub enum ImageIoError {
    #[error("Could not read or write image: {0}")]
    ImageError(#[from] image::ImageError),
    #[error("Image has an unexpected shape: {0}")]
    ShapeError(#[from] ShapeError),
    #[error("Expected an array of shape (height, width, 3), got {0:?}")]
    ChannelError(Vec<usize>),
}

/// Reads an image file. Grayscale files become (height, width) arrays, everything else
/// is converted to (height, width, 3) RGB.
pub fn get_img<P: AsRef<Path>>(path: P) -> ImageIoResult<ArrayD<u8>> {
    let img = image::open(path)?;
    image_to_ndarray(&img)
}

/// Converts an image to an array in (height, width[, channel]) layout.
pub fn image_to_ndarray(img: &DynamicImage) -> ImageIoResult<ArrayD<u8>> {
    match img {
        DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_) => {
            let gray = img.to_luma8();
            let (width, height) = gray.dimensions();
            let arr = Array2::from_shape_vec((height as usize, width as usize), gray.into_raw())?;
            Ok(arr.into_dyn())
        }
        _ => {
            // nshare hands out (C,H,W), we want (H,W,C)
            let chw = img.to_rgb8().into_ndarray3();
            Ok(chw.permuted_axes([1, 2, 0]).into_dyn())
        }
    }
}

/// Turns a (height, width, 3) array into an RGB image.
pub fn array_to_image(arr: &Array3<u8>) -> ImageIoResult<RgbImage> {
    let (height, width, channels) = arr.dim();
    if channels != 3 {
        return Err(ImageIoError::ChannelError(arr.shape().to_vec()));
    }
    let raw: Vec<u8> = arr.iter().copied().collect();
    RgbImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| ImageIoError::ChannelError(arr.shape().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb};
    use tempfile::tempdir;

    #[test]
    fn test_rgb_image_to_ndarray() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(2, 1, Rgb([10, 20, 30]));

        let arr = image_to_ndarray(&DynamicImage::ImageRgb8(img)).unwrap();

        assert_eq!(arr.shape(), &[2, 3, 3]);
        assert_eq!(arr[[1, 2, 0]], 10);
        assert_eq!(arr[[1, 2, 2]], 30);
    }

    #[test]
    fn test_gray_image_to_ndarray() {
        let mut img = GrayImage::new(4, 1);
        img.put_pixel(3, 0, Luma([200]));

        let arr = image_to_ndarray(&DynamicImage::ImageLuma8(img)).unwrap();

        assert_eq!(arr.shape(), &[1, 4]);
        assert_eq!(arr[[0, 3]], 200);
    }

    #[test]
    fn test_array_to_image() {
        let arr = Array3::from_shape_fn((2, 3, 3), |(y, x, c)| (y * 9 + x * 3 + c) as u8);

        let img = array_to_image(&arr).unwrap();

        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(1, 1), &Rgb([12, 13, 14]));
        assert!(array_to_image(&Array3::zeros((2, 2, 4))).is_err());
    }

    #[test]
    fn test_saved_image_prepares_like_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("content.png");
        let arr = Array3::from_shape_fn((8, 6, 3), |(y, x, c)| (y * 20 + x * 7 + c * 50) as u8);
        array_to_image(&arr).unwrap().save(&path).unwrap();

        let loaded = get_img(&path).unwrap();
        let (raw_loaded, tensor_loaded) = prep_image(&loaded, 6, 8, false, None).unwrap();
        let (raw, tensor) = prep_image(&arr, 6, 8, false, None).unwrap();

        assert_eq!(raw_loaded, raw);
        assert_eq!(tensor_loaded, tensor);

        dir.close().unwrap();
    }
}
