use candle_core::{Result, Tensor};
use candle_nn::ops::sigmoid;

use crate::layers::Layer;

/// Element-wise activation. Usable standalone as a (kernel-less) layer or as
/// the activation slot of `Dense`/`Conv1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Gelu,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => xs.relu(),
            Self::Gelu => xs.gelu(),
            Self::Tanh => xs.tanh(),
            Self::Sigmoid => sigmoid(xs),
        }
    }
}

impl Layer for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.apply(xs)
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        Ok(input_shape.to_vec())
    }

    fn clone_frozen(&self) -> Result<Self> {
        Ok(*self)
    }
}
