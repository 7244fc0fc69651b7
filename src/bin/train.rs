use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{loss, Optimizer};
use candle_optimisers::adam::{Adam, ParamsAdam};
use clap::{value_parser, Arg};
use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use log::info;
use weightnorm::config::Config;
use weightnorm::layers::{Activation, Dense, Layer};
use weightnorm::weight_norm::WeightNorm;

fn progress_bar_style(name: &str) -> ProgressStyle {
    ProgressStyle::with_template(&format!(
        "{{spinner:.green}} {{elapsed_precise}} {}: {{wide_bar}} {{pos}}/{{len}}",
        name
    ))
    .unwrap()
}

fn main() -> Result<()> {
    let env = Env::default().default_filter_or("info");
    let logger = env_logger::Builder::from_env(env).build();
    let level = logger.filter();
    let multi = MultiProgress::new();
    LogWrapper::new(multi.clone(), logger).try_init().unwrap();
    log::set_max_level(level);

    let mut config = Config::default();
    let device = config.device.clone();

    let matches = clap::Command::new("train")
        .about("Train a weight-normalized MLP on synthetic regression data")
        .bin_name("train")
        .styles(Default::default())
        .arg(
            Arg::new("steps")
                .value_name("N")
                .help("Number of optimizer steps")
                .short('s')
                .long("steps")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("data-init")
                .value_name("BOOL")
                .help("Initialize the weight-norm scale from the first batch instead of the kernel norm")
                .long("data-init")
                .default_value("true")
                .value_parser(value_parser!(bool)),
        )
        .get_matches();
    if let Some(steps) = matches.get_one::<usize>("steps") {
        config.max_steps = *steps;
    }
    let data_init = *matches.get_one::<bool>("data-init").unwrap();

    info!("Using GPU: {:?}", !device.is_cpu());

    // Synthetic linear regression target with a bit of noise.
    let w_true = Tensor::randn(0f32, 1., (config.in_dim, config.out_dim), &device)?;
    let xs = Tensor::randn(0f32, 1., (config.n_samples, config.in_dim), &device)?;
    let noise = Tensor::randn(0f32, 0.05, (config.n_samples, config.out_dim), &device)?;
    let ys = (xs.matmul(&w_true)? + noise)?;

    info!("Create model (data_init: {data_init})");
    let hidden = WeightNorm::new(
        Dense::new(config.in_dim, config.hidden_dim, true, &device)?
            .with_activation(Activation::Relu),
        data_init,
    )?;
    let output = Dense::new(config.hidden_dim, config.out_dim, true, &device)?;

    let mut vars = hidden.trainable_vars();
    vars.extend(output.trainable_vars());
    let mut optimizer = Adam::new(
        vars,
        ParamsAdam {
            lr: config.learning_rate,
            ..Default::default()
        },
    )?;

    let num_batches = config.n_samples / config.batch_size;
    let progress_steps = multi.add(ProgressBar::new(config.max_steps as u64));
    progress_steps.set_style(progress_bar_style("Steps"));
    for step in 0..config.max_steps {
        let offset = (step % num_batches) * config.batch_size;
        let batch_xs = xs.narrow(0, offset, config.batch_size)?;
        let batch_ys = ys.narrow(0, offset, config.batch_size)?;

        // The very first forward runs the wrapper's one-time initialization
        // on this batch.
        let predictions = output.forward(&hidden.forward(&batch_xs)?)?;
        let loss = loss::mse(&predictions, &batch_ys)?;
        optimizer.backward_step(&loss)?;

        if step % config.log_x_steps == 0 {
            info!(
                "--- Step {step}/{} loss: {} ---",
                config.max_steps,
                loss.to_scalar::<f32>()?
            );
        }
        progress_steps.inc(1);
    }
    progress_steps.finish();

    // Bake the reparameterization into a plain kernel and check the
    // unwrapped layer reproduces the wrapper's outputs.
    let probe = xs.narrow(0, 0, 4)?;
    let before = output.forward(&hidden.forward(&probe)?)?;
    let baked = hidden.remove()?;
    let after = output.forward(&baked.forward(&probe)?)?;
    let max_diff = (&before - &after)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    info!("Removed weight normalization, max output drift: {max_diff:e}");

    Ok(())
}
