//! LSTM layer-parallel training entry point: the RNN counterpart to
//! `train_resnet.rs`. Each rank owns a contiguous chunk of the input
//! sequence and shares one `LstmCellLayer` whose gradient is all-reduced
//! across ranks after the backward solve.

use braidnet::comm::{Comm, MpiComm};
use braidnet::config::Options;
use braidnet::rnn::cell::LstmCellLayer;
use braidnet::RnnParallel;
use candle_core::{Device, Tensor};
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
    tracing::info!(%opts, rank = comm.rank(), size = comm.size(), "starting RNN layer-parallel training");

    if let Err(e) = run(comm, &opts) {
        tracing::error!(error = %e, "training run failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(comm: &'static dyn Comm, opts: &Options) -> braidnet::BraidResult<()> {
    let device = Device::Cpu;
    let input_size = opts.channels;
    let hidden_size = opts.channels;
    let local_seq_len = opts.steps / comm.size();

    let cell = LstmCellLayer::new(input_size, hidden_size, &device, format!("rank{}_cell", comm.rank()))?;
    let x_local = Tensor::randn(0f32, 1f32, (opts.batch, local_seq_len, input_size), &device)?;

    let mut module = RnnParallel::new(comm, cell, x_local, device.clone(), 0.0, opts.tf)?;
    module.set_print_level(opts.verbosity);
    module.set_cfactor(opts.cfactor)?;

    let h0 = Tensor::zeros((opts.batch, hidden_size), candle_core::DType::F32, &device)?;
    let c0 = h0.clone();

    let (h, c) = module.forward(h0, c0)?;
    let target_h = Tensor::zeros_like(&h)?;
    let loss = ((h - target_h)?.sqr()?.sum_all()? + c.sqr()?.sum_all()?)?;
    module.zero_grad();
    loss.backward()?;

    tracing::info!(rank = comm.rank(), "done");
    Ok(())
}
