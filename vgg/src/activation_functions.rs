//! Activation functions for the network. VGG19 only uses the rectifier,
//! which is exposed as a layer as well as a free function.
use ndarray::*;

use crate::{ImagePrecision, InternalDataRepresentation};

/// Relu implementation
pub fn relu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| x.max(0.))
}

/// Relu as a layer.
#[derive(Default)]
pub struct ReluLayer {}

impl ReluLayer {
    pub fn new() -> Self {
        Self {}
    }

    pub fn activate(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        relu(x)
    }

    pub fn activate_inplace(&self, x: &mut InternalDataRepresentation) {
        x.mapv_inplace(|a| a.max(0.));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu() {
        let x = Array::from_shape_vec((1, 2, 2), vec![1., -2., 3., -4.]).unwrap();
        let out = Array::from_shape_vec((1, 2, 2), vec![1., 0., 3., 0.]).unwrap();
        let relu_layer = ReluLayer::new();
        assert_eq!(relu_layer.activate(&x), out);
    }

    #[test]
    fn test_relu_inplace() {
        let mut x = array![[[-0.5, 0.5]]];
        ReluLayer::new().activate_inplace(&mut x);
        assert_eq!(x, array![[[0., 0.5]]]);
    }

    #[test]
    fn test_relu_free_function() {
        assert_eq!(relu(&array![-1., 0., 2.]), array![0., 0., 2.]);
    }
}
