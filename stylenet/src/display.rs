//! Showing arrays as images. Arrays are encoded to PNG and handed to a `DisplaySink`,
//! which stands for whatever the surrounding environment uses to show images.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::{codecs::png::PngEncoder, ColorType, ImageError};
use ndarray::{ArrayBase, ArrayD, Data, Dimension};
use ndarray_npy::{read_npy, ReadNpyError};
use thiserror::Error;

/// Styling options passed through to the sink unchanged (e.g. `width`).
pub type DisplayOptions = BTreeMap<String, String>;

pub type DisplayResult<T> = Result<T, DisplayError>;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Could not encode image: {0}")]
    EncodingError(#[from] ImageError),
    #[error("Could not write image. Filesystem reported error\n {0}.")]
    IoError(#[from] std::io::Error),
    #[error("Could not read array: {0}")]
    NpyError(#[from] ReadNpyError),
}

/// Sample types that can be shown. Integers are taken as they are, floats are
/// expected in [0, 1].
pub trait DisplaySample: Copy {
    fn to_display(self) -> u8;
}

impl DisplaySample for u8 {
    fn to_display(self) -> u8 {
        self
    }
}

impl DisplaySample for f32 {
    fn to_display(self) -> u8 {
        (self.max(0.).min(1.) * 255.) as u8
    }
}

impl DisplaySample for f64 {
    fn to_display(self) -> u8 {
        (self.max(0.).min(1.) * 255.) as u8
    }
}

/// Receives encoded images.
pub trait DisplaySink {
    fn display(&mut self, data: &[u8], format: &str, options: &DisplayOptions)
        -> DisplayResult<()>;
}

/// Encodes an array of shape (height, width), (height, width, 3) or (height, width, 4)
/// as PNG.
pub fn encode_png<S, D>(ima: &ArrayBase<S, D>) -> DisplayResult<Vec<u8>>
where
    S: Data,
    S::Elem: DisplaySample,
    D: Dimension,
{
    let color = match ima.shape() {
        [_, _] => ColorType::L8,
        [_, _, 3] => ColorType::Rgb8,
        [_, _, 4] => ColorType::Rgba8,
        shape => {
            return Err(DisplayError::InvalidInput(format!(
                "expected shape (height, width), (height, width, 3) or (height, width, 4), got {:?}",
                shape
            )))
        }
    };
    let (height, width) = (ima.shape()[0], ima.shape()[1]);
    if height == 0 || width == 0 {
        return Err(DisplayError::InvalidInput(format!(
            "cannot display an empty image of shape {:?}",
            ima.shape()
        )));
    }

    // iter() walks the array in logical order, independent of the memory layout
    let raw: Vec<u8> = ima.iter().map(|v| v.to_display()).collect();

    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes).encode(&raw, width as u32, height as u32, color)?;
    Ok(bytes)
}

/// Encodes the array as PNG and shows it on the given sink.
pub fn display_img_array<S, D>(
    ima: &ArrayBase<S, D>,
    sink: &mut dyn DisplaySink,
    options: &DisplayOptions,
) -> DisplayResult<()>
where
    S: Data,
    S::Elem: DisplaySample,
    D: Dimension,
{
    let bytes = encode_png(ima)?;
    sink.display(&bytes, "png", options)
}

/// Reads a `.npy` file holding `u8`, `f32` or `f64` samples and displays it.
pub fn display_npy<P: AsRef<Path>>(
    path: P,
    sink: &mut dyn DisplaySink,
    options: &DisplayOptions,
) -> DisplayResult<()> {
    let path = path.as_ref();
    match read_npy::<_, ArrayD<u8>>(path) {
        Ok(ima) => return display_img_array(&ima, sink, options),
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        Err(err) => return Err(err.into()),
    }
    match read_npy::<_, ArrayD<f32>>(path) {
        Ok(ima) => return display_img_array(&ima, sink, options),
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        Err(err) => return Err(err.into()),
    }
    match read_npy::<_, ArrayD<f64>>(path) {
        Ok(ima) => display_img_array(&ima, sink, options),
        Err(ReadNpyError::WrongDescriptor(descr)) => Err(DisplayError::InvalidInput(format!(
            "unsupported dtype {} in {}, expected u8, f32 or f64",
            descr,
            path.display()
        ))),
        Err(err) => Err(err.into()),
    }
}

/// Writes every displayed image to `<dir>/<prefix>-<n>.<format>`.
pub struct FileSink {
    dir: PathBuf,
    prefix: String,
    written: Vec<PathBuf>,
}

impl FileSink {
    pub fn new<P: AsRef<Path>>(dir: P, prefix: &str) -> DisplayResult<FileSink> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(FileSink {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
            written: Vec::new(),
        })
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl DisplaySink for FileSink {
    fn display(
        &mut self,
        data: &[u8],
        format: &str,
        options: &DisplayOptions,
    ) -> DisplayResult<()> {
        let path = self.dir.join(format!(
            "{}-{}.{}",
            self.prefix,
            self.written.len(),
            format
        ));
        fs::write(&path, data)?;
        log::info!("Displayed image as {} {:?}", path.display(), options);
        self.written.push(path);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayedImage {
    pub data: Vec<u8>,
    pub format: String,
    pub options: DisplayOptions,
}

/// Keeps everything it is shown in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub displayed: Vec<DisplayedImage>,
}

impl DisplaySink for MemorySink {
    fn display(
        &mut self,
        data: &[u8],
        format: &str,
        options: &DisplayOptions,
    ) -> DisplayResult<()> {
        self.displayed.push(DisplayedImage {
            data: data.to_vec(),
            format: format.to_string(),
            options: options.clone(),
        });
        Ok(())
    }
}
