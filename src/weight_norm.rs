use candle_core::{bail, DType, Error, Result, Tensor, Var, D};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::layers::Layer;

/// Epsilon inside the square root of the direction norm.
const NORM_EPSILON: f64 = 1e-12;
/// Epsilon added to the batch variance during data-dependent init.
const VARIANCE_EPSILON: f64 = 1e-10;

/// Serializable configuration of the wrapper. The wrapped layer's own
/// configuration is the host's concern and is not duplicated here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightNormConfig {
    pub data_init: bool,
}

/// Weight normalization wrapper (Salimans & Kingma, 2016).
///
/// Reparameterizes the wrapped layer's kernel `w` into a direction `v` (the
/// kernel itself, left in place) and a learned per-output-channel scale `g`,
/// so that every forward pass computes with
///
/// `w = g * v / ||v||`
///
/// where the norm runs over all kernel axes except the last. Gradients flow
/// through `g` and `v` instead of the raw kernel. For recurrent layers the
/// reparameterized tensor is the cell's recurrent kernel.
///
/// `g` starts as ones and is set exactly once, lazily on the first call:
/// either to the per-channel norm of `v`, or (with `data_init`) from the
/// per-channel statistics of the first batch pushed through a frozen,
/// activation-stripped duplicate of the wrapped layer.
#[derive(Debug, Clone)]
pub struct WeightNorm<L: Layer> {
    layer: L,
    frozen: Option<L>,
    g: Var,
    /// Persisted scalar flag, 0 until the one-time init has run. Never reset.
    initialized: Var,
    data_init: bool,
    is_recurrent: bool,
    channels: usize,
}

impl<L: Layer> WeightNorm<L> {
    pub fn new(layer: L, data_init: bool) -> Result<Self> {
        let Some(kernel) = layer.kernel() else {
            bail!("WeightNorm must wrap a layer that contains a kernel for weights")
        };
        let is_recurrent = layer.recurrent_kernel().is_some();
        if data_init && is_recurrent {
            warn!(
                "WeightNorm: using data_init = true with recurrent layers \
                 is advised against by the paper, use data_init = false"
            );
        }

        let direction = match layer.recurrent_kernel() {
            Some(recurrent_kernel) => recurrent_kernel,
            None => kernel,
        };
        let Some(&channels) = direction.dims().last() else {
            bail!("WeightNorm kernel must have at least one axis")
        };
        let dtype = direction.dtype();
        let device = direction.device().clone();

        let g = Var::ones(channels, dtype, &device)?;
        let initialized = Var::zeros((), DType::U8, &device)?;
        let frozen = if data_init {
            Some(layer.clone_frozen()?)
        } else {
            None
        };

        Ok(Self {
            layer,
            frozen,
            g,
            initialized,
            data_init,
            is_recurrent,
            channels,
        })
    }

    pub fn layer(&self) -> &L {
        &self.layer
    }

    /// The learned per-output-channel scale.
    pub fn g(&self) -> &Var {
        &self.g
    }

    pub fn config(&self) -> WeightNormConfig {
        WeightNormConfig {
            data_init: self.data_init,
        }
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.initialized.as_tensor().to_scalar::<u8>()? != 0)
    }

    /// The direction tensor `v`: the wrapped layer's kernel, or the cell's
    /// recurrent kernel for recurrent layers.
    fn direction(&self) -> Result<&Var> {
        let direction = if self.is_recurrent {
            self.layer.recurrent_kernel()
        } else {
            self.layer.kernel()
        };
        direction.ok_or_else(|| Error::Msg("wrapped layer lost its kernel".to_string()))
    }

    /// `g * v / ||v||`, the tensor substituted for the wrapped layer's kernel
    /// on every call.
    pub fn effective_kernel(&self) -> Result<Tensor> {
        let v = self.direction()?.as_tensor().clone();
        let flat = v.reshape(((), self.channels))?;
        let norm = (flat.sqr()?.sum_keepdim(0)? + NORM_EPSILON)?.sqrt()?; // (1, channels)
        let unit = flat.broadcast_div(&norm)?;
        unit.broadcast_mul(self.g.as_tensor())?.reshape(v.dims())
    }

    /// Lazily initializes on the first call, then runs the wrapped layer's
    /// own computation with the substituted kernel.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        if !self.is_initialized()? {
            self.initialize(xs)?;
        }
        // The init assignments above are sequenced before this read of g.
        let kernel = self.effective_kernel()?;
        self.layer.forward_with_kernel(xs, &kernel)
    }

    /// Output shape is whatever the wrapped layer reports.
    pub fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        self.layer.output_shape(input_shape)
    }

    /// Permanently bakes the current effective kernel into the wrapped
    /// layer and returns it, ending the reparameterization. Irreversible.
    pub fn remove(self) -> Result<L> {
        let kernel = self.effective_kernel()?.detach();
        self.direction()?.set(&kernel)?;
        Ok(self.layer)
    }

    /// One-time setup of `g` (and, with `data_init`, the bias). Runs exactly
    /// once per wrapper lifetime; a second invocation is a misuse error.
    fn initialize(&self, xs: &Tensor) -> Result<()> {
        if self.is_initialized()? {
            bail!("the layer has already been initialized");
        }

        if self.data_init {
            self.data_dep_init(xs)?;
        } else {
            self.init_norm()?;
        }

        let one = Tensor::ones((), DType::U8, self.initialized.device())?;
        self.initialized.set(&one)
    }

    /// `g <- ||v||` per output channel of the flattened direction.
    fn init_norm(&self) -> Result<()> {
        let v = self.direction()?.as_tensor().detach();
        let flat = v.reshape(((), self.channels))?;
        let norm = flat.sqr()?.sum(0)?.sqrt()?; // (channels,)
        self.g.set(&norm)
    }

    /// Scales `g` by `1/sqrt(var + eps)` of the init batch's pre-activation
    /// outputs and shifts the bias by `-mean` times that factor, so the first
    /// post-init outputs have roughly zero mean and unit variance per channel.
    fn data_dep_init(&self, xs: &Tensor) -> Result<()> {
        let Some(frozen) = &self.frozen else {
            bail!("data-dependent initialization requires the frozen duplicate")
        };
        let x_init = frozen.forward(xs)?.detach();

        let stats_width = x_init.dim(D::Minus1)?;
        let flat = x_init.reshape(((), stats_width))?;
        let mean = flat.mean(0)?; // (stats_width,)
        let variance = flat.broadcast_sub(&mean)?.sqr()?.mean(0)?;
        let mut scale = (variance + VARIANCE_EPSILON)?.sqrt()?.recip()?;

        // Fused recurrent kernels tile the statistics' channels across their
        // gates; a width that is not an exact multiple fails in the shape
        // check of the assignment below.
        if stats_width != self.channels {
            scale = scale.repeat(self.channels / stats_width)?;
        }

        self.g.set(&self.g.as_tensor().mul(&scale)?)?;
        if let Some(bias) = self.layer.bias() {
            bias.set(&mean.neg()?.mul(&scale)?)?;
        }
        Ok(())
    }
}

impl<L: Layer> Layer for WeightNorm<L> {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        WeightNorm::forward(self, xs)
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        WeightNorm::output_shape(self, input_shape)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.layer.trainable_vars();
        vars.push(self.g.clone());
        vars
    }

    fn clone_frozen(&self) -> Result<Self> {
        bail!("WeightNorm cannot be frozen, freeze the wrapped layer instead")
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Result, Tensor};

    use candle_nn::Conv1dConfig;

    use super::*;
    use crate::layers::{Activation, Conv1d, Dense, Gru};

    // Kernel with column norms 5 and 13.
    fn dense_fixture(device: &Device) -> Result<Dense> {
        let kernel = Tensor::new(&[[3f32, 5.], [4., 12.], [0., 0.]], device)?;
        let bias = Tensor::zeros(2, DType::F32, device)?;
        Dense::from_weights(kernel, Some(bias))
    }

    fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!(
                (a - e).abs() <= tolerance,
                "expected {expected:?}, got {actual:?}"
            );
        }
    }

    #[test]
    fn test_first_call_flips_flag_exactly_once() -> Result<()> {
        let device = Device::Cpu;
        let wn = WeightNorm::new(dense_fixture(&device)?, false)?;
        assert!(!wn.is_initialized()?);

        let xs = Tensor::new(&[[1f32, 2., 3.]], &device)?;
        wn.forward(&xs)?;
        assert!(wn.is_initialized()?);
        wn.forward(&xs)?;
        assert!(wn.is_initialized()?);

        // Re-triggering the one-time init is a misuse error.
        assert!(wn.initialize(&xs).is_err());
        assert!(wn.is_initialized()?);
        Ok(())
    }

    #[test]
    fn test_norm_init_sets_scale_to_kernel_norm() -> Result<()> {
        let device = Device::Cpu;
        let wn = WeightNorm::new(dense_fixture(&device)?, false)?;

        let xs = Tensor::new(&[[1f32, 2., 3.]], &device)?;
        wn.forward(&xs)?;

        let g = wn.g().as_tensor().to_vec1::<f32>()?;
        assert_close(&g, &[5., 13.], 1e-5);
        Ok(())
    }

    #[test]
    fn test_norm_init_effective_kernel_equals_original() -> Result<()> {
        // With g = ||v||, g * v / ||v|| collapses back to v, so the wrapper
        // must reproduce the plain layer exactly.
        let device = Device::Cpu;
        let dense = dense_fixture(&device)?;
        let wn = WeightNorm::new(dense_fixture(&device)?, false)?;

        let xs = Tensor::new(&[[1f32, 2., 3.], [-2., 0.5, 1.]], &device)?;
        let wrapped = wn.forward(&xs)?.to_vec2::<f32>()?;
        let plain = dense.forward(&xs)?.to_vec2::<f32>()?;
        for (w, p) in wrapped.iter().zip(plain.iter()) {
            assert_close(w, p, 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_data_init_whitens_linear_outputs() -> Result<()> {
        // A pass-through 1x1 linear layer: pre-activation outputs equal the
        // inputs, so after init bias ~ -mean/std and g ~ 1/std.
        let device = Device::Cpu;
        let kernel = Tensor::new(&[[1f32]], &device)?;
        let bias = Tensor::zeros(1, DType::F32, &device)?;
        let dense = Dense::from_weights(kernel, Some(bias))?;
        let wn = WeightNorm::new(dense, true)?;

        // mean 2.5, variance 1.25
        let xs = Tensor::new(&[[1f32], [2.], [3.], [4.]], &device)?;
        let ys = wn.forward(&xs)?;

        let std = 1.25f32.sqrt();
        let g = wn.g().as_tensor().to_vec1::<f32>()?;
        assert_close(&g, &[1. / std], 1e-4);
        let bias = wn.layer().bias().expect("bias").as_tensor().to_vec1::<f32>()?;
        assert_close(&bias, &[-2.5 / std], 1e-4);

        // First outputs are the whitened batch.
        let ys: Vec<f32> = ys.flatten_all()?.to_vec1()?;
        assert_close(
            &ys,
            &[-1.5 / std, -0.5 / std, 0.5 / std, 1.5 / std],
            1e-4,
        );
        Ok(())
    }

    #[test]
    fn test_forward_is_deterministic_after_init() -> Result<()> {
        let device = Device::Cpu;
        let wn = WeightNorm::new(dense_fixture(&device)?, true)?;

        let xs = Tensor::new(&[[0.5f32, -1., 2.], [1., 1., 1.]], &device)?;
        let first = wn.forward(&xs)?.to_vec2::<f32>()?;
        let second = wn.forward(&xs)?.to_vec2::<f32>()?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_remove_bakes_in_effective_kernel() -> Result<()> {
        let device = Device::Cpu;
        let kernel = Tensor::new(&[[1f32, -2.], [0.5, 1.]], &device)?;
        let bias = Tensor::zeros(2, DType::F32, &device)?;
        let dense = Dense::from_weights(kernel, Some(bias))?.with_activation(Activation::Relu);
        let wn = WeightNorm::new(dense, true)?;

        let init_batch = Tensor::new(&[[1f32, 0.], [0., 1.], [1., 1.], [2., -1.]], &device)?;
        wn.forward(&init_batch)?;

        let probe = Tensor::new(&[[0.3f32, -0.7], [1.5, 0.2]], &device)?;
        let before = wn.forward(&probe)?.to_vec2::<f32>()?;

        let unwrapped = wn.remove()?;
        let after = unwrapped.forward(&probe)?.to_vec2::<f32>()?;
        for (b, a) in before.iter().zip(after.iter()) {
            assert_close(b, a, 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_norm_init_handles_conv_kernels() -> Result<()> {
        // The norm runs over every kernel axis except the channel axis, so a
        // (k, in, out) conv kernel behaves like its (k * in, out) flattening.
        let device = Device::Cpu;
        let conv = Conv1d::new(2, 4, 3, Conv1dConfig::default(), true, &device)?;
        let wn = WeightNorm::new(conv.clone(), false)?;

        let xs = Tensor::randn(0f32, 1., (2, 6, 2), &device)?;
        let wrapped = wn.forward(&xs)?;
        let plain = conv.forward(&xs)?;
        assert_eq!(wrapped.dims(), &[2, 4, 4]);

        let wrapped: Vec<f32> = wrapped.flatten_all()?.to_vec1()?;
        let plain: Vec<f32> = plain.flatten_all()?.to_vec1()?;
        assert_close(&wrapped, &plain, 1e-5);
        Ok(())
    }

    #[test]
    fn test_recurrent_data_init_tiles_scale_across_gates() -> Result<()> {
        let device = Device::Cpu;
        let gru = Gru::new(2, 3, true, &device)?;
        let wn = WeightNorm::new(gru, true)?;

        let xs = Tensor::randn(0f32, 1., (4, 6, 2), &device)?;
        wn.forward(&xs)?;

        // g spans the fused (units, 3 * units) kernel; the per-channel factor
        // must repeat identically for each of the three gates.
        let g = wn.g().as_tensor().to_vec1::<f32>()?;
        assert_eq!(g.len(), 9);
        assert_close(&g[0..3], &g[3..6], 1e-6);
        assert_close(&g[3..6], &g[6..9], 1e-6);
        Ok(())
    }

    #[test]
    fn test_kernel_less_layer_is_rejected() {
        let err = WeightNorm::new(Activation::Relu, false);
        assert!(err.is_err());
        assert!(err.unwrap_err().to_string().contains("kernel"));
    }

    #[test]
    fn test_output_shape_is_delegated() -> Result<()> {
        let device = Device::Cpu;
        let wn = WeightNorm::new(dense_fixture(&device)?, false)?;
        assert_eq!(wn.output_shape(&[7, 3])?, vec![7, 2]);
        Ok(())
    }

    #[test]
    fn test_config_round_trips_data_init() -> Result<()> {
        let device = Device::Cpu;
        let wn = WeightNorm::new(dense_fixture(&device)?, true)?;

        let json = serde_json::to_string(&wn.config()).map_err(Error::wrap)?;
        let config: WeightNormConfig = serde_json::from_str(&json).map_err(Error::wrap)?;
        assert!(config.data_init);
        Ok(())
    }
}
