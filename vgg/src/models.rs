//! The VGG19 layer stack used for neural style transfer.
//!
//! The network is rebuilt layer by layer (16 convolutions, 5 average pools) and its
//! parameters are assigned in bulk from an ordered list, exactly in the order in
//! which they were exported: for each convolution the kernel, then the bias.
use std::collections::HashMap;
use std::path::Path;

use ndarray::*;
use thiserror::Error;

use crate::{
    activation_functions::ReluLayer,
    convolutions::ConvolutionLayer,
    pooling::AveragePoolLayer,
    weight_loader::{open_weights, WeightError, WeightLoader},
    ConvKernel, ImagePrecision, InternalDataRepresentation, WeightPrecision,
};

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Could not load network weights: {0}")]
    LoadError(#[from] WeightError),
    #[error("Network has {expected} parameters, but {actual} parameter arrays were given")]
    ParamCountError { expected: usize, actual: usize },
    #[error("Parameter {name} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Invalid network input: {0}")]
    InvalidInput(String),
    #[error("Network has no layer named {0}")]
    UnknownLayer(String),
}

/// Number of convolutions in each of the five blocks.
const BLOCK_DEPTHS: [usize; 5] = [2, 2, 4, 4, 4];
const INPUT_CHANNELS: usize = 3;
const KERNEL_SIZE: usize = 3;
const PADDING: usize = 1;
const POOL_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// 3x3 convolution with padding 1, followed by a rectifier
    Convolution {
        input_channels: usize,
        output_channels: usize,
    },
    /// 2x2 average pooling with stride 2, padding excluded
    AveragePool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    pub name: String,
    pub kind: LayerKind,
}

/// Architecture knobs. The default is the standard VGG19 computing cross-correlations
/// (`flip_filters` unset), which is how the pretrained Caffe weights are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vgg19Config {
    /// Output channels of the convolutions in each block
    pub block_widths: [usize; 5],
    pub flip_filters: bool,
}

impl Default for Vgg19Config {
    fn default() -> Self {
        Self {
            block_widths: [64, 128, 256, 512, 512],
            flip_filters: false,
        }
    }
}

impl Vgg19Config {
    /// Layers in declaration order, from input to output.
    pub fn architecture(&self) -> Vec<LayerSpec> {
        let mut layers = Vec::new();
        let mut input_channels = INPUT_CHANNELS;
        for (block, (&depth, &width)) in BLOCK_DEPTHS.iter().zip(&self.block_widths).enumerate() {
            for conv in 0..depth {
                layers.push(LayerSpec {
                    name: format!("conv{}_{}", block + 1, conv + 1),
                    kind: LayerKind::Convolution {
                        input_channels,
                        output_channels: width,
                    },
                });
                input_channels = width;
            }
            layers.push(LayerSpec {
                name: format!("pool{}", block + 1),
                kind: LayerKind::AveragePool,
            });
        }
        layers
    }

    /// Names and shapes of all trainable parameters, in the order they are stored
    /// in a weight file.
    pub fn param_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::new();
        for layer in self.architecture() {
            if let LayerKind::Convolution {
                input_channels,
                output_channels,
            } = layer.kind
            {
                shapes.push((
                    format!("{}.W", layer.name),
                    vec![output_channels, input_channels, KERNEL_SIZE, KERNEL_SIZE],
                ));
                shapes.push((format!("{}.b", layer.name), vec![output_channels]));
            }
        }
        shapes
    }
}

enum Layer {
    Convolution(ConvolutionLayer, ReluLayer),
    Pool(AveragePoolLayer),
}

impl Layer {
    fn forward(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        match self {
            Layer::Convolution(conv, relu) => {
                let mut z = conv.convolve(x);
                relu.activate_inplace(&mut z);
                z
            }
            Layer::Pool(pool) => pool.pool(x),
        }
    }
}

/// VGG19 with loaded parameters, ready for feature extraction.
pub struct Vgg19 {
    config: Vgg19Config,
    layers: Vec<(String, Layer)>,
}

impl Vgg19 {
    /// Builds the network from the given parameter list (see `Vgg19Config::param_shapes`
    /// for the expected order).
    pub fn from_param_values(
        config: Vgg19Config,
        values: Vec<ArrayD<WeightPrecision>>,
    ) -> ModelResult<Vgg19> {
        let layers = build_layers(&config, values)?;
        Ok(Vgg19 { config, layers })
    }

    pub fn from_loader(config: Vgg19Config, loader: &mut dyn WeightLoader) -> ModelResult<Vgg19> {
        let values = loader.param_values()?;
        Self::from_param_values(config, values)
    }

    /// Replaces all parameters of the network. On error the network is left untouched.
    pub fn set_all_param_values(&mut self, values: Vec<ArrayD<WeightPrecision>>) -> ModelResult<()> {
        self.layers = build_layers(&self.config, values)?;
        Ok(())
    }

    /// All parameters in the order `set_all_param_values` expects them.
    pub fn get_all_param_values(&self) -> Vec<ArrayD<WeightPrecision>> {
        let mut values = Vec::new();
        for (_, layer) in &self.layers {
            if let Layer::Convolution(conv, _) = layer {
                values.push(conv.kernel().clone().into_dyn());
                values.push(conv.bias().clone().into_dyn());
            }
        }
        values
    }

    pub fn config(&self) -> &Vgg19Config {
        &self.config
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(name, _)| name.as_str())
    }

    /// Runs the whole network and returns the activations of every layer by name.
    ///
    /// The input has to be a (1, 3, height, width) tensor, e.g. the output of
    /// the image preprocessing.
    pub fn forward(
        &self,
        input: &Array4<ImagePrecision>,
    ) -> ModelResult<HashMap<String, InternalDataRepresentation>> {
        let mut x = self.check_input(input)?;
        let mut activations = HashMap::with_capacity(self.layers.len());
        for (name, layer) in &self.layers {
            x = layer.forward(&x);
            activations.insert(name.clone(), x.clone());
        }
        Ok(activations)
    }

    /// Returns the activations of the requested layers, in the requested order.
    /// The forward pass stops after the deepest requested layer.
    pub fn features(
        &self,
        input: &Array4<ImagePrecision>,
        names: &[&str],
    ) -> ModelResult<Vec<InternalDataRepresentation>> {
        let mut deepest = 0;
        for name in names {
            let position = self
                .layers
                .iter()
                .position(|(layer_name, _)| layer_name == name)
                .ok_or_else(|| ModelError::UnknownLayer(name.to_string()))?;
            deepest = deepest.max(position + 1);
        }

        let mut x = self.check_input(input)?;
        let mut collected: HashMap<&str, InternalDataRepresentation> = HashMap::new();
        for (name, layer) in self.layers.iter().take(deepest) {
            x = layer.forward(&x);
            if names.contains(&name.as_str()) {
                collected.insert(name.as_str(), x.clone());
            }
        }
        log::debug!("Computed {} of {} layers", deepest, self.layers.len());

        names
            .iter()
            .map(|name| {
                collected
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ModelError::UnknownLayer(name.to_string()))
            })
            .collect()
    }

    fn check_input(&self, input: &Array4<ImagePrecision>) -> ModelResult<InternalDataRepresentation> {
        let (batch, channels, _, _) = input.dim();
        if batch != 1 || channels != INPUT_CHANNELS {
            return Err(ModelError::InvalidInput(format!(
                "expected shape (1, {}, height, width), got {:?}",
                INPUT_CHANNELS,
                input.shape()
            )));
        }
        Ok(input.index_axis(Axis(0), 0).to_owned())
    }
}

/// Checks every parameter against the architecture before building anything, so a
/// mismatching file is rejected as a whole.
fn build_layers(
    config: &Vgg19Config,
    values: Vec<ArrayD<WeightPrecision>>,
) -> ModelResult<Vec<(String, Layer)>> {
    let shapes = config.param_shapes();
    if values.len() != shapes.len() {
        return Err(ModelError::ParamCountError {
            expected: shapes.len(),
            actual: values.len(),
        });
    }
    for ((name, expected), value) in shapes.iter().zip(&values) {
        if value.shape() != expected.as_slice() {
            return Err(ModelError::ShapeMismatch {
                name: name.clone(),
                expected: expected.clone(),
                actual: value.shape().to_vec(),
            });
        }
    }

    let count = values.len();
    let mut params = values.into_iter();
    let mut layers = Vec::new();
    for spec in config.architecture() {
        let layer = match spec.kind {
            LayerKind::Convolution { .. } => {
                let (kernel, bias) = match (params.next(), params.next()) {
                    (Some(kernel), Some(bias)) => (kernel, bias),
                    _ => {
                        return Err(ModelError::ParamCountError {
                            expected: shapes.len(),
                            actual: count,
                        })
                    }
                };
                let kernel: ConvKernel = into_dim(&spec.name, kernel)?;
                let bias: Array1<WeightPrecision> = into_dim(&spec.name, bias)?;
                Layer::Convolution(
                    ConvolutionLayer::new(kernel, bias, 1, PADDING, config.flip_filters),
                    ReluLayer::new(),
                )
            }
            LayerKind::AveragePool => Layer::Pool(AveragePoolLayer::new(POOL_SIZE)),
        };
        layers.push((spec.name, layer));
    }
    Ok(layers)
}

fn into_dim<D: Dimension>(
    layer: &str,
    value: ArrayD<WeightPrecision>,
) -> ModelResult<Array<WeightPrecision, D>> {
    let actual = value.shape().to_vec();
    value
        .into_dimensionality::<D>()
        .map_err(|_| ModelError::ShapeMismatch {
            name: layer.to_string(),
            expected: Vec::new(),
            actual,
        })
}

/// Reconstructs the standard VGG19 and loads its pretrained parameters from a
/// `.npz` or `.json` weight file.
pub fn load_vgg19<P: AsRef<Path>>(path: P) -> ModelResult<Vgg19> {
    load_vgg19_with_config(path, Vgg19Config::default())
}

pub fn load_vgg19_with_config<P: AsRef<Path>>(path: P, config: Vgg19Config) -> ModelResult<Vgg19> {
    let path = path.as_ref();
    let mut loader = open_weights(path)?;
    let net = Vgg19::from_loader(config, loader.as_mut())?;
    log::info!(
        "Loaded VGG19 ({} layers) from {}",
        net.layers.len(),
        path.display()
    );
    Ok(net)
}
