//! Average pooling. VGG19 for style transfer uses it in place of the max pooling
//! of the classification network.
use ndarray::*;

use crate::{ImagePrecision, InternalDataRepresentation};

/// Average pooling over square windows that never counts padded cells. Windows that would stick out of the
/// padded input are dropped, so the output size is rounded down.
pub struct AveragePoolLayer {
    pool_size: usize,
    stride: usize,
    padding: usize,
}

impl AveragePoolLayer {
    /// Pooling with stride equal to the pool size and no padding.
    pub fn new(pool_size: usize) -> Self {
        Self::with_stride(pool_size, pool_size, 0)
    }

    pub fn with_stride(pool_size: usize, stride: usize, padding: usize) -> Self {
        debug_assert!(pool_size > 0, "Pool size of 0 passed");
        debug_assert!(stride > 0, "Stride of 0 passed");
        Self {
            pool_size,
            stride,
            padding,
        }
    }

    /// Spatial output size for an input of the given height and width.
    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        let extent = |size: usize| {
            (size + 2 * self.padding)
                .checked_sub(self.pool_size)
                .map_or(0, |s| s / self.stride + 1)
        };
        (extent(height), extent(width))
    }

    /// Pools every channel of x, which is expected in (channels, height, width) layout.
    pub fn pool(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        let (channels, height, width) = x.dim();
        let (new_height, new_width) = self.output_size(height, width);
        let mut z: Array3<ImagePrecision> = Array::zeros((channels, new_height, new_width));

        for i in 0..new_height {
            let (row_start, row_end) = self.window(i, height);
            for j in 0..new_width {
                let (col_start, col_end) = self.window(j, width);
                let cells = ((row_end - row_start) * (col_end - col_start)) as ImagePrecision;
                let window = x.slice(s![.., row_start..row_end, col_start..col_end]);
                for c in 0..channels {
                    z[[c, i, j]] = window.index_axis(Axis(0), c).sum() / cells;
                }
            }
        }
        z
    }

    /// Window of output position `index`, clipped to the unpadded input.
    fn window(&self, index: usize, size: usize) -> (usize, usize) {
        let start = (index * self.stride).saturating_sub(self.padding);
        let end = (index * self.stride + self.pool_size)
            .saturating_sub(self.padding)
            .min(size);
        (start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_pool() {
        let x = array![[
            [1., 2., 3., 4.],
            [5., 6., 7., 8.],
            [0., 0., 1., 1.],
            [0., 4., 1., 1.]
        ]];
        let pool = AveragePoolLayer::new(2);

        assert_eq!(pool.pool(&x), array![[[3.5, 5.5], [1., 1.]]]);
    }

    #[test]
    fn test_odd_borders_are_ignored() {
        let x = Array::from_shape_vec((2, 3, 5), (0..30).map(|v| v as f32).collect()).unwrap();
        let pool = AveragePoolLayer::new(2);

        let pooled = pool.pool(&x);
        assert_eq!(pooled.dim(), (2, 1, 2));
        // (0 + 1 + 5 + 6) / 4
        assert_eq!(pooled[[0, 0, 0]], 3.);
        // (17 + 18 + 22 + 23) / 4
        assert_eq!(pooled[[1, 0, 1]], 20.);
    }

    #[test]
    fn test_padding_is_excluded() {
        let x = array![[[4., 8.], [12., 16.]]];
        let pool = AveragePoolLayer::with_stride(2, 2, 1);

        // the corner windows only contain a single real pixel each
        assert_eq!(pool.output_size(2, 2), (2, 2));
        assert_eq!(pool.pool(&x), x);
    }

    #[test]
    fn test_too_small_input() {
        let x = array![[[1.]]];
        let pool = AveragePoolLayer::new(2);

        assert_eq!(pool.pool(&x).dim(), (1, 0, 0));
    }
}
