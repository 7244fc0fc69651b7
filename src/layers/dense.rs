use candle_core::{bail, DType, Device, Result, Shape, Tensor, Var};
use candle_nn::init::DEFAULT_KAIMING_NORMAL;

use crate::layers::{Activation, Layer};

/// Fully connected layer with a channels-last kernel of shape
/// `(in_dim, out_dim)` and an optional bias of shape `(out_dim,)`.
#[derive(Debug, Clone)]
pub struct Dense {
    kernel: Var,
    bias: Option<Var>,
    activation: Option<Activation>,
}

impl Dense {
    pub fn new(in_dim: usize, out_dim: usize, use_bias: bool, device: &Device) -> Result<Self> {
        let kernel =
            DEFAULT_KAIMING_NORMAL.var(Shape::from((in_dim, out_dim)), DType::F32, device)?;
        let bias = if use_bias {
            Some(Var::zeros(out_dim, DType::F32, device)?)
        } else {
            None
        };

        Ok(Self {
            kernel,
            bias,
            activation: None,
        })
    }

    /// Build from existing tensors, e.g. deserialized weights.
    pub fn from_weights(kernel: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if kernel.rank() != 2 {
            bail!(
                "Dense kernel must be (in_dim, out_dim), got {:?}",
                kernel.shape()
            );
        }

        Ok(Self {
            kernel: Var::from_tensor(&kernel)?,
            bias: bias.map(|b| Var::from_tensor(&b)).transpose()?,
            activation: None,
        })
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn in_dim(&self) -> usize {
        self.kernel.dims()[0]
    }

    pub fn out_dim(&self) -> usize {
        self.kernel.dims()[1]
    }
}

impl Layer for Dense {
    /// Expects input of shape (..., in_dim) and returns (..., out_dim).
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_with_kernel(xs, self.kernel.as_tensor())
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let mut shape = input_shape.to_vec();
        match shape.last_mut() {
            Some(last) => *last = self.out_dim(),
            None => bail!("Dense expects at least one input axis"),
        }
        Ok(shape)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = vec![self.kernel.clone()];
        if let Some(bias) = &self.bias {
            vars.push(bias.clone());
        }
        vars
    }

    fn kernel(&self) -> Option<&Var> {
        Some(&self.kernel)
    }

    fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    fn forward_with_kernel(&self, xs: &Tensor, kernel: &Tensor) -> Result<Tensor> {
        let mut ys = xs.broadcast_matmul(kernel)?;
        if let Some(bias) = &self.bias {
            ys = ys.broadcast_add(bias.as_tensor())?;
        }
        match &self.activation {
            Some(activation) => activation.apply(&ys),
            None => Ok(ys),
        }
    }

    fn clone_frozen(&self) -> Result<Self> {
        let bias = match &self.bias {
            Some(bias) => Some(Var::from_tensor(&bias.as_tensor().detach())?),
            None => None,
        };

        Ok(Self {
            kernel: Var::from_tensor(&self.kernel.as_tensor().detach())?,
            bias,
            activation: None,
        })
    }
}
