use crate::{ConvKernel, ImagePrecision, InternalDataRepresentation, WeightPrecision};
use ndarray::*;

/// Rust implementation of a convolutional layer with bias.
/// The weight matrix shall have dimension (in that order)
/// output channels x input channels x kernel height x kernel width
/// (the order in which Lasagne and pytorch save their weights).
pub struct ConvolutionLayer {
    /// Weight matrix of the kernel
    kernel: ConvKernel,
    /// Kernel flattened to (output channels, input channels * kernel height * kernel width),
    /// already flipped if the layer performs a true convolution
    kernel_matrix: Array2<WeightPrecision>,
    bias: Array1<WeightPrecision>,
    kernel_height: usize,
    kernel_width: usize,
    stride: usize,
    /// Number of zeros added on every border
    padding: usize,
    num_input_channels: usize,
    num_output_channels: usize,
}

impl ConvolutionLayer {
    /// Creates a new layer. If `flip_filters` is set, the kernel is flipped spatially
    /// before being applied (a convolution in the mathematical sense), otherwise the
    /// layer computes a cross-correlation.
    pub fn new(
        weights: ConvKernel,
        bias: Array1<WeightPrecision>,
        stride: usize,
        padding: usize,
        flip_filters: bool,
    ) -> ConvolutionLayer {
        let (num_output_channels, num_input_channels, kernel_height, kernel_width) = weights.dim();

        debug_assert!(stride > 0, "Stride of 0 passed");
        debug_assert_eq!(bias.len(), num_output_channels);

        let kernel_matrix = flatten_kernel(&weights, flip_filters);

        ConvolutionLayer {
            kernel: weights,
            kernel_matrix,
            bias,
            kernel_height,
            kernel_width,
            stride,
            padding,
            num_input_channels,
            num_output_channels,
        }
    }

    pub fn kernel(&self) -> &ConvKernel {
        &self.kernel
    }

    pub fn bias(&self) -> &Array1<WeightPrecision> {
        &self.bias
    }

    /// Spatial output size for an input of the given height and width.
    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        let extent = |size: usize, kernel: usize| {
            (size + 2 * self.padding)
                .checked_sub(kernel)
                .map_or(0, |s| s / self.stride + 1)
        };
        (
            extent(height, self.kernel_height),
            extent(width, self.kernel_width),
        )
    }

    /// Performs a convolution on the given image data using this layers parameters.
    /// We unroll the image in im2col style, so the convolution becomes a single matrix
    /// product, as described here:
    /// https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
    ///
    /// The image has to be passed as (channels, height, width).
    pub fn convolve(&self, image: &InternalDataRepresentation) -> InternalDataRepresentation {
        let (channels, height, width) = image.dim();
        debug_assert_eq!(channels, self.num_input_channels);

        let padded = self.pad(image);
        let (new_height, new_width) = self.output_size(height, width);

        let im_col = self.im2col(padded.view(), new_height, new_width);
        // shape: (output channels, new_height * new_width)
        let products = self.kernel_matrix.dot(&im_col.t());

        let mut output: Array3<ImagePrecision> =
            Array::zeros((self.num_output_channels, new_height, new_width));
        for (mut plane, row) in output.outer_iter_mut().zip(products.outer_iter()) {
            for (out, value) in plane.iter_mut().zip(row.iter()) {
                *out = *value;
            }
        }
        output += &self
            .bias
            .view()
            .insert_axis(Axis(1))
            .insert_axis(Axis(2));
        output
    }

    fn pad(&self, image: &InternalDataRepresentation) -> Array3<ImagePrecision> {
        if self.padding == 0 {
            return image.clone();
        }
        let (channels, height, width) = image.dim();
        let p = self.padding;
        let mut padded = Array::zeros((channels, height + 2 * p, width + 2 * p));
        padded
            .slice_mut(s![.., p..p + height, p..p + width])
            .assign(image);
        padded
    }

    /// Every row holds one receptive field, flattened in (channel, row, column) order.
    fn im2col(
        &self,
        padded: ArrayView3<ImagePrecision>,
        new_height: usize,
        new_width: usize,
    ) -> Array2<ImagePrecision> {
        let patch_len = self.num_input_channels * self.kernel_height * self.kernel_width;
        let mut img_matrix = Array::zeros((new_height * new_width, patch_len));

        for i in 0..new_height {
            let i_with_stride = i * self.stride;
            for j in 0..new_width {
                let j_with_stride = j * self.stride;
                let patch = padded.slice(s![
                    ..,
                    i_with_stride..i_with_stride + self.kernel_height,
                    j_with_stride..j_with_stride + self.kernel_width
                ]);
                let mut row = img_matrix.row_mut(i * new_width + j);
                for (dst, src) in row.iter_mut().zip(patch.iter()) {
                    *dst = *src;
                }
            }
        }
        img_matrix
    }
}

fn flatten_kernel(weights: &ConvKernel, flip_filters: bool) -> Array2<WeightPrecision> {
    let (filters, channels, kernel_height, kernel_width) = weights.dim();
    let oriented = if flip_filters {
        weights.slice(s![.., .., ..;-1, ..;-1])
    } else {
        weights.view()
    };

    let mut matrix = Array::zeros((filters, channels * kernel_height * kernel_width));
    for (mut row, filter) in matrix.outer_iter_mut().zip(oriented.outer_iter()) {
        for (dst, src) in row.iter_mut().zip(filter.iter()) {
            *dst = *src;
        }
    }
    matrix
}
