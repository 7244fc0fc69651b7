use candle_core::{bail, DType, Device, Result, Shape, Tensor, Var};
use candle_nn::{init::DEFAULT_KAIMING_NORMAL, ops::sigmoid};

use crate::layers::Layer;

/// GRU cell with fused gate kernels.
///
/// The three gates (update, reset, candidate) are fused along the last axis:
/// `kernel` is `(in_dim, 3 * units)` and `recurrent_kernel` is
/// `(units, 3 * units)`. The fused layout is what makes the per-channel
/// statistics of data-dependent initialization three times narrower than the
/// recurrent kernel's channel axis.
#[derive(Debug, Clone)]
pub struct GruCell {
    kernel: Var,
    recurrent_kernel: Var,
    bias: Option<Var>,
    units: usize,
}

impl GruCell {
    pub fn new(in_dim: usize, units: usize, use_bias: bool, device: &Device) -> Result<Self> {
        let kernel =
            DEFAULT_KAIMING_NORMAL.var(Shape::from((in_dim, 3 * units)), DType::F32, device)?;
        let recurrent_kernel =
            DEFAULT_KAIMING_NORMAL.var(Shape::from((units, 3 * units)), DType::F32, device)?;
        let bias = if use_bias {
            Some(Var::zeros(3 * units, DType::F32, device)?)
        } else {
            None
        };

        Ok(Self {
            kernel,
            recurrent_kernel,
            bias,
            units,
        })
    }

    pub fn units(&self) -> usize {
        self.units
    }

    /// One step on `x` of shape (batch, in_dim) and state `h` of shape
    /// (batch, units). The recurrent kernel is supplied by the caller so
    /// wrappers can substitute it.
    fn step(&self, x: &Tensor, h: &Tensor, recurrent_kernel: &Tensor) -> Result<Tensor> {
        let mut gates_x = x.broadcast_matmul(self.kernel.as_tensor())?; // (batch, 3u)
        if let Some(bias) = &self.bias {
            gates_x = gates_x.broadcast_add(bias.as_tensor())?;
        }
        let gates_h = h.broadcast_matmul(recurrent_kernel)?; // (batch, 3u)

        let u = self.units;
        let xz = gates_x.narrow(1, 0, u)?;
        let xr = gates_x.narrow(1, u, u)?;
        let xh = gates_x.narrow(1, 2 * u, u)?;
        let hz = gates_h.narrow(1, 0, u)?;
        let hr = gates_h.narrow(1, u, u)?;
        let hh = gates_h.narrow(1, 2 * u, u)?;

        let z = sigmoid(&(xz + hz)?)?;
        let r = sigmoid(&(xr + hr)?)?;
        let candidate = (xh + (r * hh)?)?.tanh()?;

        // h' = z * h + (1 - z) * candidate
        (&z * h)? + ((1f64 - &z)? * candidate)?
    }

    fn frozen(&self) -> Result<Self> {
        let bias = match &self.bias {
            Some(bias) => Some(Var::from_tensor(&bias.as_tensor().detach())?),
            None => None,
        };

        Ok(Self {
            kernel: Var::from_tensor(&self.kernel.as_tensor().detach())?,
            recurrent_kernel: Var::from_tensor(&self.recurrent_kernel.as_tensor().detach())?,
            bias,
            units: self.units,
        })
    }
}

/// GRU layer: runs its cell over a (batch, steps, in_dim) sequence and
/// returns the last hidden state of shape (batch, units).
#[derive(Debug, Clone)]
pub struct Gru {
    cell: GruCell,
}

impl Gru {
    pub fn new(in_dim: usize, units: usize, use_bias: bool, device: &Device) -> Result<Self> {
        Ok(Self {
            cell: GruCell::new(in_dim, units, use_bias, device)?,
        })
    }

    pub fn cell(&self) -> &GruCell {
        &self.cell
    }

    fn run(&self, xs: &Tensor, recurrent_kernel: &Tensor) -> Result<Tensor> {
        let (batch, steps, _in_dim) = xs.dims3()?;
        let mut h = Tensor::zeros((batch, self.cell.units), xs.dtype(), xs.device())?;
        for t in 0..steps {
            let x_t = xs.narrow(1, t, 1)?.squeeze(1)?;
            h = self.cell.step(&x_t, &h, recurrent_kernel)?;
        }
        Ok(h)
    }
}

impl Layer for Gru {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.run(xs, self.cell.recurrent_kernel.as_tensor())
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let [batch, _steps, _in_dim] = *input_shape else {
            bail!("Gru expects a (batch, steps, in_dim) input, got {input_shape:?}");
        };
        Ok(vec![batch, self.cell.units])
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = vec![
            self.cell.kernel.clone(),
            self.cell.recurrent_kernel.clone(),
        ];
        if let Some(bias) = &self.cell.bias {
            vars.push(bias.clone());
        }
        vars
    }

    fn kernel(&self) -> Option<&Var> {
        Some(&self.cell.kernel)
    }

    fn recurrent_kernel(&self) -> Option<&Var> {
        Some(&self.cell.recurrent_kernel)
    }

    fn forward_with_kernel(&self, xs: &Tensor, kernel: &Tensor) -> Result<Tensor> {
        self.run(xs, kernel)
    }

    // Gate activations stay in place; only the weights are frozen.
    fn clone_frozen(&self) -> Result<Self> {
        Ok(Self {
            cell: self.cell.frozen()?,
        })
    }
}
