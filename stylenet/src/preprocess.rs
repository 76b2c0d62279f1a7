//! Conversion between images and the input format of the VGG19 network.
//!
//! The network expects a (1, 3, height, width) tensor with the per-channel mean of the
//! training set subtracted. `prep_image` brings an arbitrary image into that format
//! (aspect preserving resize, central crop, optional desaturation), `deprocess` turns
//! a network tensor back into an 8-bit image.
use ndarray::*;
use thiserror::Error;

/// Per-channel means in blue, green, red order.
pub const MEAN_VALUES: [f32; 3] = [104., 117., 123.];

/// Channel order used when none is given explicitly. With `false` the tensor is
/// stored in blue, green, red order, as the pretrained weights expect.
pub const DEFAULT_BGR: bool = false;

/// Luminance weights for red, green and blue.
const GRAY_WEIGHTS: [f64; 3] = [0.2125, 0.7154, 0.0721];

pub type PrepResult<T> = Result<T, PrepError>;

#[derive(Error, Debug)]
pub enum PrepError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Computes the size of the aspect preserving resize, before cropping. The side that
/// is relatively shorter is scaled to its target, the other one follows with its
/// size rounded down.
pub fn resized_shape(
    height: usize,
    width: usize,
    target_width: usize,
    target_height: usize,
) -> (usize, usize) {
    if height * target_width < width * target_height {
        (target_height, width * target_height / height)
    } else {
        (height * target_width / width, target_width)
    }
}

/// Turns an image into a network input.
///
/// `image` is either (height, width) grayscale or (height, width, 3) RGB, with samples
/// in [0, 255]. Returns the resized and cropped image as 8-bit preview (RGB, same layout
/// as the input) and the normalized (1, 3, target_height, target_width) tensor.
///
/// If `grayscale_blend` is given, the image is blended towards its grayscale version by
/// that factor before normalization; `Some(0.0)` and `None` both leave it untouched.
pub fn prep_image<S, D>(
    image: &ArrayBase<S, D>,
    target_width: usize,
    target_height: usize,
    bgr: bool,
    grayscale_blend: Option<f64>,
) -> PrepResult<(Array3<u8>, Array4<f32>)>
where
    S: Data,
    S::Elem: Copy + Into<f64>,
    D: Dimension,
{
    if target_width == 0 || target_height == 0 {
        return Err(PrepError::InvalidInput(format!(
            "target size has to be positive, got {}x{}",
            target_width, target_height
        )));
    }
    let blend = match grayscale_blend {
        Some(b) if !(0. ..=1.).contains(&b) => {
            return Err(PrepError::InvalidInput(format!(
                "grayscale blend has to be in [0, 1], got {}",
                b
            )))
        }
        Some(b) if b > 0. => Some(b),
        _ => None,
    };

    let im = to_color(image.view().into_dyn())?;
    let (height, width, _) = im.dim();
    let (new_height, new_width) = resized_shape(height, width, target_width, target_height);
    let resized = resize_bilinear(&im, new_height, new_width);

    // central crop
    let top = new_height / 2 - target_height / 2;
    let left = new_width / 2 - target_width / 2;
    let mut im = resized
        .slice(s![top..top + target_height, left..left + target_width, ..])
        .to_owned();

    let rawim = im.mapv(|v| v as u8);

    if let Some(b) = blend {
        blend_grayscale(&mut im, b, bgr);
    }

    // (height, width, channel) -> (channel, height, width)
    let chw = im.permuted_axes([2, 0, 1]);
    let ordered = if bgr {
        chw.view()
    } else {
        chw.slice(s![..;-1, .., ..])
    };

    let mut tensor: Array3<f32> = Array::zeros((3, target_height, target_width));
    for ((mut out, plane), &mean) in tensor
        .outer_iter_mut()
        .zip(ordered.outer_iter())
        .zip(MEAN_VALUES.iter())
    {
        out.zip_mut_with(&plane, |o, &v| *o = (v - f64::from(mean)) as f32);
    }

    Ok((rawim, tensor.insert_axis(Axis(0))))
}

/// Turns a network tensor of shape (1, 3, height, width) back into a displayable
/// (height, width, 3) RGB image. Values are clipped to [0, 255].
pub fn deprocess<S>(x: &ArrayBase<S, Ix4>, bgr: bool) -> PrepResult<Array3<u8>>
where
    S: Data<Elem = f32>,
{
    let (batch, channels, height, width) = x.dim();
    if batch == 0 || channels != 3 {
        return Err(PrepError::InvalidInput(format!(
            "expected a tensor of shape (1, 3, height, width), got {:?}",
            x.shape()
        )));
    }
    let image = x.index_axis(Axis(0), 0);

    let mut out = Array3::zeros((height, width, 3));
    for c in 0..3 {
        let source = if bgr { c } else { 2 - c };
        let mean = MEAN_VALUES[source];
        out.index_axis_mut(Axis(2), c)
            .zip_mut_with(&image.index_axis(Axis(0), source), |o, &v| {
                *o = (v + mean).max(0.).min(255.) as u8
            });
    }
    Ok(out)
}

/// Size and channel configuration of a network input, shared by the forward and the
/// inverse transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImagePreprocessor {
    pub width: usize,
    pub height: usize,
    pub bgr: bool,
    pub grayscale_blend: Option<f64>,
}

impl ImagePreprocessor {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            bgr: DEFAULT_BGR,
            grayscale_blend: None,
        }
    }

    pub fn with_bgr(self, bgr: bool) -> Self {
        Self { bgr, ..self }
    }

    pub fn with_grayscale_blend(self, blend: f64) -> Self {
        Self {
            grayscale_blend: Some(blend),
            ..self
        }
    }

    pub fn prep<S, D>(&self, image: &ArrayBase<S, D>) -> PrepResult<(Array3<u8>, Array4<f32>)>
    where
        S: Data,
        S::Elem: Copy + Into<f64>,
        D: Dimension,
    {
        prep_image(
            image,
            self.width,
            self.height,
            self.bgr,
            self.grayscale_blend,
        )
    }

    pub fn deprocess<S>(&self, x: &ArrayBase<S, Ix4>) -> PrepResult<Array3<u8>>
    where
        S: Data<Elem = f32>,
    {
        deprocess(x, self.bgr)
    }
}

/// Converts a grayscale or RGB image of any sample type to (height, width, 3) floats.
fn to_color<A>(image: ArrayViewD<'_, A>) -> PrepResult<Array3<f64>>
where
    A: Copy + Into<f64>,
{
    let shape = image.shape().to_vec();
    let color: Array3<f64> = match *shape.as_slice() {
        [height, width] => {
            let gray = image
                .into_dimensionality::<Ix2>()
                .map_err(|e| PrepError::InvalidInput(e.to_string()))?;
            Array3::from_shape_fn((height, width, 3), |(y, x, _)| gray[[y, x]].into())
        }
        [_, _, 3] => image
            .into_dimensionality::<Ix3>()
            .map_err(|e| PrepError::InvalidInput(e.to_string()))?
            .mapv(|v| v.into()),
        _ => {
            return Err(PrepError::InvalidInput(format!(
                "expected an image of rank 2 (height, width) or 3 (height, width, 3), got shape {:?}",
                shape
            )))
        }
    };
    if color.is_empty() {
        return Err(PrepError::InvalidInput(format!(
            "image is empty, shape {:?}",
            color.shape()
        )));
    }
    Ok(color)
}

/// Blends every pixel towards its luminance. If `bgr` is set, the luminance weights are
/// applied to the channels in reversed order.
fn blend_grayscale(im: &mut Array3<f64>, blend: f64, bgr: bool) {
    let weights = if bgr {
        [GRAY_WEIGHTS[2], GRAY_WEIGHTS[1], GRAY_WEIGHTS[0]]
    } else {
        GRAY_WEIGHTS
    };
    for mut pixel in im.lanes_mut(Axis(2)) {
        let gray: f64 = pixel.iter().zip(weights.iter()).map(|(v, w)| v * w).sum();
        pixel.mapv_inplace(|v| gray * blend + v * (1. - blend));
    }
}

/// Bilinear resize that keeps the value range. Pixel centers are aligned (the sample
/// for output pixel i lies at (i + 0.5) * scale - 0.5), borders are extended.
fn resize_bilinear(im: &Array3<f64>, new_height: usize, new_width: usize) -> Array3<f64> {
    let (height, width, channels) = im.dim();
    if (height, width) == (new_height, new_width) {
        return im.clone();
    }
    let rows = sample_positions(height, new_height);
    let cols = sample_positions(width, new_width);

    Array3::from_shape_fn((new_height, new_width, channels), |(y, x, c)| {
        let (y0, y1, fy) = rows[y];
        let (x0, x1, fx) = cols[x];
        let top = im[[y0, x0, c]] * (1. - fx) + im[[y0, x1, c]] * fx;
        let bottom = im[[y1, x0, c]] * (1. - fx) + im[[y1, x1, c]] * fx;
        top * (1. - fy) + bottom * fy
    })
}

/// For every output index: the two neighbouring source indices and the weight of the
/// second one.
fn sample_positions(size: usize, new_size: usize) -> Vec<(usize, usize, f64)> {
    let scale = size as f64 / new_size as f64;
    let last = (size - 1) as f64;
    (0..new_size)
        .map(|i| {
            let src = ((i as f64 + 0.5) * scale - 0.5).max(0.).min(last);
            let lower = src.floor() as usize;
            let upper = (lower + 1).min(size - 1);
            (lower, upper, src - lower as f64)
        })
        .collect()
}
