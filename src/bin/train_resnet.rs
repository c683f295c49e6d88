//! ResNet-as-ODE layer-parallel training entry point, mirroring the
//! original's `backward_scaling.py` driver script: parses CLI options,
//! builds one `ResnetBlock` per locally-owned step, runs a handful of
//! forward/backward steps over synthetic data, and reports timings.

use braidnet::comm::{Comm, MpiComm};
use braidnet::config::Options;
use braidnet::layer::Layer;
use braidnet::resnet::layer::ResnetBlock;
use braidnet::LayerParallel;
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Options::parse();
    let comm: &'static dyn Comm = Box::leak(Box::new(MpiComm::world()));

    if let Err(e) = opts.validate(comm.size()) {
        tracing::error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }
    tracing::info!(%opts, rank = comm.rank(), size = comm.size(), "starting ResNet layer-parallel training");

    if let Err(e) = run(comm, &opts) {
        tracing::error!(error = %e, "training run failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(comm: &'static dyn Comm, opts: &Options) -> braidnet::BraidResult<()> {
    let device = Device::Cpu;
    let local_steps = opts.steps / comm.size();
    let dim = opts.channels;

    let layers: Vec<Box<dyn Layer>> = (0..local_steps)
        .map(|i| {
            let name = format!("rank{}_block{}", comm.rank(), i);
            Ok(Box::new(ResnetBlock::new(dim, dim * 2, &device, name)?) as Box<dyn Layer>)
        })
        .collect::<braidnet::BraidResult<_>>()?;

    let mut module = LayerParallel::new(comm, layers, vec![opts.batch, dim], device.clone(), 0.0, opts.tf)?;
    module.set_print_level(opts.verbosity);
    module.set_cfactor(opts.cfactor)?;

    let x = if comm.rank() == 0 {
        Tensor::randn(0f32, 1f32, (opts.batch, dim), &device)?
    } else {
        Tensor::zeros((opts.batch, dim), DType::F32, &device)?
    };

    {
        let _timer = module.timers().timer("train_resnet.total");
        let y = module.forward(x)?;
        let target = Tensor::zeros_like(&y)?;
        let loss = (y - target)?.sqr()?.sum_all()?;
        module.zero_grad();
        loss.backward()?;
    }

    tracing::info!(report = %module.timers().report(), "done");
    Ok(())
}
