//! VGG19 as used for neural style transfer: the layer stack of Simonyan & Zisserman's
//! configuration E with average instead of max pooling, plus loaders for the
//! pretrained ("normalized") parameter lists.
//!
//! The crate only provides the inference path. Activations are kept in Pytorch layout
//! (channels, height, width), the network input in (batch, channels, height, width).
pub mod activation_functions;
pub mod convolutions;
pub mod models;
pub mod pooling;
pub mod weight_loader;

pub use models::{load_vgg19, load_vgg19_with_config, ModelError, Vgg19, Vgg19Config};

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

/// Activations of a single image, (channels, height, width)
pub type InternalDataRepresentation = ndarray::Array3<ImagePrecision>;
/// Convolution weights, (output channels, input channels, kernel height, kernel width)
pub type ConvKernel = ndarray::Array4<WeightPrecision>;
