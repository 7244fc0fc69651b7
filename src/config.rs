use candle_core::Device;

/// Hyperparameters of the synthetic-regression training demo.
pub struct Config {
    pub in_dim: usize,
    pub hidden_dim: usize,
    pub out_dim: usize,
    pub n_samples: usize,
    pub batch_size: usize,
    pub max_steps: usize,
    pub log_x_steps: usize,
    pub learning_rate: f64,
    pub device: Device,
}

impl Default for Config {
    fn default() -> Self {
        let device = Device::cuda_if_available(0).unwrap();

        Self {
            in_dim: 16,
            hidden_dim: 32,
            out_dim: 1,
            n_samples: 512,
            batch_size: 64,
            max_steps: 500,
            log_x_steps: 50,
            learning_rate: 1e-3,
            device,
        }
    }
}
