pub mod activation;
pub mod conv;
pub mod dense;
pub mod recurrent;

pub use activation::Activation;
pub use conv::Conv1d;
pub use dense::Dense;
pub use recurrent::{Gru, GruCell};

use candle_core::{bail, Result, Tensor, Var};

/// Common surface of every wrappable layer.
///
/// Kernel-bearing layers override the introspection hooks below; anything
/// else keeps the `None` defaults and gets rejected by `WeightNorm::new`.
/// The convention throughout is channels-last: the last axis of a kernel is
/// its output-channel axis.
pub trait Layer: Clone {
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Output shape for the given input shape, batch dimension included.
    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>>;

    /// Parameters to hand to an optimizer.
    fn trainable_vars(&self) -> Vec<Var> {
        Vec::new()
    }

    /// The layer's weight kernel, if it has one.
    fn kernel(&self) -> Option<&Var> {
        None
    }

    /// The recurrent kernel of the inner cell, for recurrent layers.
    fn recurrent_kernel(&self) -> Option<&Var> {
        None
    }

    /// The layer-level bias, if it has one.
    fn bias(&self) -> Option<&Var> {
        None
    }

    /// Run the layer's own computation with a substituted kernel. Recurrent
    /// layers substitute the recurrent kernel and keep their input kernel.
    fn forward_with_kernel(&self, _xs: &Tensor, _kernel: &Tensor) -> Result<Tensor> {
        bail!("layer does not carry a kernel")
    }

    /// Structural duplicate with detached, non-trainable weights, used for
    /// statistics passes. Non-recurrent implementations also strip their
    /// activation so the duplicate yields pre-activation outputs.
    fn clone_frozen(&self) -> Result<Self>;
}
