//! C8: `LayerParallelModule` — the user-facing differentiable wrapper
//! (`LayerParallel` for ResNet, `RnnParallel` for RNN in SPEC_FULL.md §4.8).

use crate::autograd::{RnnAutogradOp, ResnetAutogradOp};
use crate::braid::BraidOptions;
use crate::comm::Comm;
use crate::error::BraidResult;
use crate::layer::Layer;
use crate::resnet::forward::ForwardResNetApp;
use crate::rnn::cell::LstmCellLayer;
use crate::rnn::forward::ForwardRnnApp;
use candle_core::{Tensor, Var};
use std::cell::RefCell;
use std::rc::Rc;

const FINAL_RESULT_TAG: i32 = 99;

/// Runs `f` only on rank 0, returning `None` elsewhere — a helper for
/// composing this module into a larger network where only one rank should
/// perform some side effect (§6, "Exposed to the user").
pub fn comp_op<T>(comm: &dyn Comm, f: impl FnOnce() -> T) -> Option<T> {
    if comm.rank() == 0 {
        Some(f())
    } else {
        None
    }
}

/// User-facing ResNet layer-parallel module.
pub struct LayerParallel {
    fwd: Rc<RefCell<ForwardResNetApp<'static>>>,
    comm: &'static dyn Comm,
    shape: Vec<usize>,
    options: BraidOptions,
    training: bool,
    timers: crate::timer::TimerRegistry,
}

impl LayerParallel {
    pub fn new(comm: &'static dyn Comm, layers: Vec<Box<dyn Layer>>, shape: Vec<usize>, device: candle_core::Device, t0: f64, tf: f64) -> BraidResult<Self> {
        let fwd = ForwardResNetApp::new(comm, layers, shape.clone(), device, t0, tf)?;
        Ok(Self {
            fwd: Rc::new(RefCell::new(fwd)),
            comm,
            shape,
            options: BraidOptions::default(),
            training: true,
            timers: crate::timer::TimerRegistry::new(),
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn set_print_level(&mut self, level: u8) {
        self.options.print_level = level;
    }

    pub fn set_num_relax(&mut self, n: u32, level: Option<usize>) {
        let tag = level.map(|l| l as i32).unwrap_or(-1);
        self.options.nrelax.retain(|(l, _)| *l != tag);
        self.options.nrelax.push((tag, n as usize));
    }

    pub fn set_cfactor(&mut self, cf: u32) -> BraidResult<()> {
        if cf < 2 {
            return Err(crate::error::BraidError::InvalidCFactor(cf));
        }
        self.options.cfactor = cf;
        Ok(())
    }

    pub fn set_skip_downcycle(&mut self, skip: bool) {
        self.options.skip_downcycle = skip;
    }

    pub fn timers(&self) -> &crate::timer::TimerRegistry {
        &self.timers
    }

    /// Outer list of local (+ ghost) layers, inner list of each layer's
    /// `Var` parameters — the order `pack`/`unpack`/the all-reduce rely on.
    pub fn parameters(&self) -> Vec<Vec<Var>> {
        let fwd = self.fwd.borrow();
        (0..fwd.local_steps())
            .filter_map(|idx| fwd.layer(idx).map(|l| l.parameters()))
            .collect()
    }

    pub fn zero_grad(&self) {
        let mut fwd = self.fwd.borrow_mut();
        for idx in 0..fwd.local_steps() {
            if let Some(layer) = fwd.layer_mut(idx) {
                layer.zero_grad();
            }
        }
    }

    /// `copyVectorFromRoot` (§4.8): broadcasts a tensor from rank 0 to every
    /// rank, byte-for-byte via the shared `Comm` wrapper.
    pub fn copy_vector_from_root(&self, t: &Tensor) -> BraidResult<Tensor> {
        let mut bytes = if self.comm.rank() == 0 {
            let mut buf = crate::serialize::SerializationBuffer::new();
            buf.write_tensor(t)?;
            buf.into_bytes()
        } else {
            Vec::new()
        };
        self.comm.broadcast_bytes(&mut bytes, 0)?;
        let mut reader = crate::serialize::SerializationBuffer::from_bytes(bytes);
        reader.read_tensor(t.shape().dims(), t.device())
    }

    /// `getFinalOnRoot` (§4.8): ships the terminal rank's result back to
    /// rank 0 so the caller can read it uniformly regardless of rank.
    pub fn get_final_on_root(&self, maybe_result: Option<Tensor>, device: &candle_core::Device) -> BraidResult<Option<Tensor>> {
        let size = self.comm.size();
        if size == 1 {
            return Ok(maybe_result);
        }
        let terminal = size - 1;
        if self.comm.rank() == terminal {
            let t = maybe_result.expect("terminal rank must hold the result");
            let mut buf = crate::serialize::SerializationBuffer::new();
            buf.write_tensor(&t)?;
            self.comm.send_bytes(&buf.into_bytes(), 0, FINAL_RESULT_TAG)?;
            if self.comm.rank() == 0 {
                Ok(Some(t))
            } else {
                Ok(None)
            }
        } else if self.comm.rank() == 0 {
            let bytes = self.comm.recv_bytes(terminal, FINAL_RESULT_TAG)?;
            let mut reader = crate::serialize::SerializationBuffer::from_bytes(bytes);
            Ok(Some(reader.read_tensor(&self.shape, device)?))
        } else {
            Ok(None)
        }
    }

    /// Runs the forward solve through the autograd bridge; the returned
    /// tensor sits on `candle`'s tape with `ResnetAutogradOp::bwd` wired as
    /// its backward.
    pub fn forward(&self, x: Tensor) -> BraidResult<Tensor> {
        let broadcast_x = self.copy_vector_from_root(&x)?;
        let op = ResnetAutogradOp {
            fwd: self.fwd.clone(),
            shape: self.shape.clone(),
            comm: self.comm,
            training: self.training,
        };
        Ok(broadcast_x.apply_op1(op)?)
    }
}

/// One cell must be shared across the whole sequence (§4.7) — torchbraid
/// builds it on rank 0 and broadcasts it before the solve, analogous to
/// `LayerParallel::copy_vector_from_root` but for a `Layer`'s serialized
/// bytes rather than a fixed-shape tensor. Without this every rank trains
/// its own independently-initialized cell and the gradient all-reduce sums
/// grads belonging to different weights.
fn broadcast_cell_from_root(comm: &dyn Comm, fwd: &mut ForwardRnnApp<'static>, device: &candle_core::Device) -> BraidResult<()> {
    let mut bytes = if comm.rank() == 0 { fwd.cell().serialize()? } else { Vec::new() };
    comm.broadcast_bytes(&mut bytes, 0)?;
    if comm.rank() != 0 {
        *fwd.cell_mut() = LstmCellLayer::from_bytes(&bytes, device)?;
    }
    Ok(())
}

/// User-facing RNN layer-parallel module.
pub struct RnnParallel {
    fwd: Rc<RefCell<ForwardRnnApp<'static>>>,
    comm: &'static dyn Comm,
    batch: usize,
    hidden_size: usize,
    options: BraidOptions,
}

impl RnnParallel {
    pub fn new(comm: &'static dyn Comm, cell: LstmCellLayer, x_local: Tensor, device: candle_core::Device, t0: f64, tf: f64) -> BraidResult<Self> {
        let (batch, _, _) = x_local.dims3()?;
        let hidden_size = cell.hidden_size();
        let mut fwd = ForwardRnnApp::new(comm, cell, x_local, device.clone(), t0, tf)?;
        broadcast_cell_from_root(comm, &mut fwd, &device)?;
        Ok(Self {
            fwd: Rc::new(RefCell::new(fwd)),
            comm,
            batch,
            hidden_size,
            options: BraidOptions::default(),
        })
    }

    pub fn set_print_level(&mut self, level: u8) {
        self.options.print_level = level;
    }

    pub fn set_cfactor(&mut self, cf: u32) -> BraidResult<()> {
        if cf < 2 {
            return Err(crate::error::BraidError::InvalidCFactor(cf));
        }
        self.options.cfactor = cf;
        Ok(())
    }

    pub fn parameters(&self) -> Vec<Vec<Var>> {
        vec![self.fwd.borrow().cell().parameters()]
    }

    pub fn zero_grad(&self) {
        self.fwd.borrow_mut().cell_mut().zero_grad();
    }

    /// Forward through the autograd bridge. Returns `(h, c)` unpacked from
    /// the op's stacked output tensor.
    pub fn forward(&self, h0: Tensor, c0: Tensor) -> BraidResult<(Tensor, Tensor)> {
        let op = RnnAutogradOp {
            fwd: self.fwd.clone(),
            batch: self.batch,
            hidden_size: self.hidden_size,
            comm: self.comm,
        };
        let stacked = h0.apply_op2(&c0, op)?;
        Ok((stacked.get(0)?, stacked.get(1)?))
    }
}
