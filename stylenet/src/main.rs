//! Command line interface for preparing images for VGG19, turning network tensors back
//! into images and extracting VGG19 features.

use env_logger::Builder;
use ndarray::Array4;
use ndarray_npy::{read_npy, write_npy};
use quicli::prelude::*;
use std::{fs, path::PathBuf};
use structopt::StructOpt;
use stylenet::{
    array_to_image, deprocess,
    display::{display_npy, DisplayOptions, FileSink},
    get_img, ImagePreprocessor,
};
use vgg::{load_vgg19_with_config, Vgg19Config};

/// Layers used for content and style losses when no layer is given
const DEFAULT_LAYERS: [&str; 6] = [
    "conv1_1", "conv2_1", "conv3_1", "conv4_1", "conv4_2", "conv5_1",
];

/// Prepares an image as network input
#[derive(Debug, StructOpt)]
struct PrepOpts {
    /// Path to the image
    #[structopt(parse(from_os_str))]
    image: PathBuf,
    /// Target width
    #[structopt(short = "W", long = "width", default_value = "224")]
    width: usize,
    /// Target height
    #[structopt(short = "H", long = "height", default_value = "224")]
    height: usize,
    /// Produce channels in BGR order
    #[structopt(long = "bgr")]
    bgr: bool,
    /// Amount of grayscale mixed into the image, between 0 and 1
    #[structopt(long = "grayscale-blend")]
    grayscale_blend: Option<f64>,
    /// Output path, writes to /path/to/image.npy if not available
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
    /// Also saves the resized image here
    #[structopt(long = "preview", parse(from_os_str))]
    preview: Option<PathBuf>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Turns a network tensor back into an image
#[derive(Debug, StructOpt)]
struct DeprocessOpts {
    /// Path to a (1, 3, height, width) float32 .npy file
    #[structopt(parse(from_os_str))]
    tensor: PathBuf,
    /// Output image path
    #[structopt(parse(from_os_str))]
    output: PathBuf,
    /// Tensor channels are in BGR order
    #[structopt(long = "bgr")]
    bgr: bool,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Shows an array as PNG
#[derive(Debug, StructOpt)]
struct DisplayOpts {
    /// Path to a .npy file holding u8, f32 or f64 values (floats in [0, 1])
    #[structopt(parse(from_os_str))]
    array: PathBuf,
    /// Directory the images are written to
    #[structopt(long = "dir", default_value = ".", parse(from_os_str))]
    dir: PathBuf,
    /// File name prefix of the written images
    #[structopt(long = "prefix", default_value = "img")]
    prefix: String,
    /// Display option in the form key=value, can be repeated
    #[structopt(long = "option", parse(try_from_str = "parse_option"))]
    options: Vec<(String, String)>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Computes VGG19 activations for an image
#[derive(Debug, StructOpt)]
struct FeaturesOpts {
    /// Path to the weights (.npz or .json)
    #[structopt(parse(from_os_str))]
    weights: PathBuf,
    /// Path to the image
    #[structopt(parse(from_os_str))]
    image: PathBuf,
    /// Layer to extract, can be repeated. Defaults to the usual style transfer layers.
    #[structopt(short = "l", long = "layer")]
    layers: Vec<String>,
    #[structopt(short = "W", long = "width", default_value = "224")]
    width: usize,
    #[structopt(short = "H", long = "height", default_value = "224")]
    height: usize,
    #[structopt(long = "bgr")]
    bgr: bool,
    /// Flip the kernels spatially (true convolution) instead of cross-correlating
    #[structopt(long = "flip-filters")]
    flip_filters: bool,
    /// Output directory, one <layer>.npy per layer
    #[structopt(short = "o", long = "output", default_value = ".", parse(from_os_str))]
    output: PathBuf,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Image helpers for neural style transfer on VGG19.
#[derive(Debug, StructOpt)]
#[structopt(name = "stylenet")]
enum Stylenet {
    #[structopt(name = "prep", about = "Resizes, crops and normalizes an image for VGG19.")]
    Prep(PrepOpts),
    #[structopt(
        name = "deprocess",
        about = "Converts a preprocessed tensor back into an image."
    )]
    Deprocess(DeprocessOpts),
    #[structopt(name = "display", about = "Encodes an array as PNG and writes it out.")]
    Display(DisplayOpts),
    #[structopt(
        name = "features",
        about = "Runs VGG19 on an image and saves the activations of the requested layers."
    )]
    Features(FeaturesOpts),
}

fn parse_option(s: &str) -> Result<(String, String), String> {
    let mut parts = s.splitn(2, '=');
    match (parts.next(), parts.next()) {
        (Some(key), Some(value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

/// Trait for the subcommands that stylenet uses
trait StylenetOpts {
    /// Performs the subcommand
    fn run(&self) -> CliResult;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

impl StylenetOpts for PrepOpts {
    fn run(&self) -> CliResult {
        let img = get_img(&self.image)?;
        let mut preprocessor = ImagePreprocessor::new(self.width, self.height).with_bgr(self.bgr);
        if let Some(blend) = self.grayscale_blend {
            preprocessor = preprocessor.with_grayscale_blend(blend);
        }
        let (raw, tensor) = preprocessor.prep(&img)?;

        let output = match &self.output {
            Some(p) => p.clone(),
            None => self.image.with_extension("npy"),
        };
        write_npy(&output, &tensor)?;
        log::info!("Wrote tensor of shape {:?} to {}", tensor.shape(), output.display());

        if let Some(preview) = &self.preview {
            array_to_image(&raw)?.save(preview)?;
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl StylenetOpts for DeprocessOpts {
    fn run(&self) -> CliResult {
        let tensor: Array4<f32> = read_npy(&self.tensor)?;
        let img = deprocess(&tensor, self.bgr)?;
        array_to_image(&img)?.save(&self.output)?;
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl StylenetOpts for DisplayOpts {
    fn run(&self) -> CliResult {
        let options: DisplayOptions = self.options.iter().cloned().collect();
        let mut sink = FileSink::new(&self.dir, &self.prefix)?;

        display_npy(&self.array, &mut sink, &options)?;
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl StylenetOpts for FeaturesOpts {
    fn run(&self) -> CliResult {
        let config = Vgg19Config {
            flip_filters: self.flip_filters,
            ..Vgg19Config::default()
        };
        let model = load_vgg19_with_config(&self.weights, config)?;

        let img = get_img(&self.image)?;
        let (_, tensor) = ImagePreprocessor::new(self.width, self.height)
            .with_bgr(self.bgr)
            .prep(&img)?;

        let layers: Vec<&str> = if self.layers.is_empty() {
            DEFAULT_LAYERS.to_vec()
        } else {
            self.layers.iter().map(String::as_str).collect()
        };
        let features = model.features(&tensor, &layers)?;

        fs::create_dir_all(&self.output)?;
        for (name, activation) in layers.iter().zip(features) {
            let path = self.output.join(format!("{}.npy", name));
            write_npy(&path, &activation)?;
            log::info!("{}: {:?} -> {}", name, activation.shape(), path.display());
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl StylenetOpts for Stylenet {
    fn run(&self) -> CliResult {
        match self {
            Stylenet::Prep(c) => c.run(),
            Stylenet::Deprocess(c) => c.run(),
            Stylenet::Display(c) => c.run(),
            Stylenet::Features(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            Stylenet::Prep(c) => c.get_verbosity(),
            Stylenet::Deprocess(c) => c.get_verbosity(),
            Stylenet::Display(c) => c.get_verbosity(),
            Stylenet::Features(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = Stylenet::from_args();
    args.setup_env_logger()?;
    args.run()
}
