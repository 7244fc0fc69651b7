use candle_core::{bail, DType, Device, Result, Shape, Tensor, Var};
use candle_nn::{init::DEFAULT_KAIMING_NORMAL, Conv1dConfig};

use crate::layers::{Activation, Layer};

/// 1-D convolution over channels-last input `(batch, length, in_channels)`
/// with a kernel of shape `(kernel_size, in_channels, out_channels)`.
///
/// candle's conv kernels are `(out, in, k)` over NCL input, so the forward
/// pass permutes in and out; keeping the stored kernel channels-last keeps
/// the output-channel axis last for the weight-norm wrapper.
#[derive(Debug, Clone)]
pub struct Conv1d {
    kernel: Var,
    bias: Option<Var>,
    cfg: Conv1dConfig,
    activation: Option<Activation>,
}

impl Conv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        cfg: Conv1dConfig,
        use_bias: bool,
        device: &Device,
    ) -> Result<Self> {
        let kernel = DEFAULT_KAIMING_NORMAL.var(
            Shape::from((kernel_size, in_channels, out_channels)),
            DType::F32,
            device,
        )?;
        let bias = if use_bias {
            Some(Var::zeros(out_channels, DType::F32, device)?)
        } else {
            None
        };

        Ok(Self {
            kernel,
            bias,
            cfg,
            activation: None,
        })
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn out_channels(&self) -> usize {
        self.kernel.dims()[2]
    }

    fn kernel_size(&self) -> usize {
        self.kernel.dims()[0]
    }
}

impl Layer for Conv1d {
    /// Expects input of shape (batch, length, in_channels) and returns
    /// (batch, length_out, out_channels).
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_with_kernel(xs, self.kernel.as_tensor())
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let [batch, length, _in_channels] = *input_shape else {
            bail!(
                "Conv1d expects a (batch, length, in_channels) input, got {input_shape:?}"
            );
        };
        let span = self.cfg.dilation * (self.kernel_size() - 1) + 1;
        let length_out = (length + 2 * self.cfg.padding - span) / self.cfg.stride + 1;
        Ok(vec![batch, length_out, self.out_channels()])
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
        // (batch, length, in) -> (batch, in, length)
        let xs_ncl = xs.transpose(1, 2)?.contiguous()?;
        // (k, in, out) -> (out, in, k)
        let weight = kernel.permute((2, 1, 0))?.contiguous()?;
        let ys = xs_ncl.conv1d(
            &weight,
            self.cfg.padding,
            self.cfg.stride,
            self.cfg.dilation,
            self.cfg.groups,
        )?;
        // back to (batch, length_out, out)
        let mut ys = ys.transpose(1, 2)?;
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
            cfg: self.cfg,
            activation: None,
        })
    }
}
