//! C9: `AutogradBridge` — the custom differentiable op that lets the MGRIT
//! solve sit on `candle`'s reverse-mode tape (§4.9 of SPEC_FULL.md).
//!
//! `candle_core::CustomOp1`/`CustomOp2`'s trait methods take no extra
//! context parameter (unlike Python's `ctx`-object `torch.autograd.Function`
//! idiom the original binds to), so the forward/backward app pair is
//! captured by the op struct instead of threaded positionally — the one
//! place this binding necessarily departs from the source's shape,
//! documented here rather than silently.

use crate::comm::Comm;
use crate::error::BraidResult;
use crate::resnet::backward::BackwardResNetApp;
use crate::resnet::forward::ForwardResNetApp;
use crate::rnn::backward::BackwardRnnApp;
use crate::rnn::forward::ForwardRnnApp;
use candle_core::{CpuStorage, CustomOp1, CustomOp2, Layout, Result as CResult, Shape, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

fn to_candle_err(e: crate::error::BraidError) -> candle_core::Error {
    candle_core::Error::Msg(e.to_string())
}

fn flatten_f32(storage: &CpuStorage, layout: &Layout) -> CResult<(Vec<f32>, Vec<usize>)> {
    let slice = storage.as_slice::<f32>()?;
    let dims = layout.shape().dims().to_vec();
    // Reference-driver simplification: only contiguous layouts are
    // supported, which every tensor this crate produces internally is.
    Ok((slice[layout.start_offset()..layout.start_offset() + layout.shape().elem_count()].to_vec(), dims))
}

fn reduce_and_scatter(comm: &dyn Comm, ledger: crate::serialize::GradList, device: &candle_core::Device) -> BraidResult<crate::serialize::GradList> {
    let size = crate::serialize::buffer_size(&ledger)?;
    let mut buf = vec![0f32; size];
    crate::serialize::pack(&ledger, &mut buf)?;
    comm.all_reduce_sum_f32(&mut buf)?;
    let mut reduced = ledger;
    crate::serialize::unpack(&mut reduced, &buf, device)?;
    Ok(reduced)
}

/// `AutogradBridge` for the ResNet variant: `x` is the single tensor input.
pub struct ResnetAutogradOp {
    pub fwd: Rc<RefCell<ForwardResNetApp<'static>>>,
    pub shape: Vec<usize>,
    pub comm: &'static dyn Comm,
    pub training: bool,
}

impl CustomOp1 for ResnetAutogradOp {
    fn name(&self) -> &'static str {
        "braidnet-resnet-layer-parallel"
    }

    fn cpu_fwd(&self, s1: &CpuStorage, l1: &Layout) -> CResult<(CpuStorage, Shape)> {
        let (data, dims) = flatten_f32(s1, l1)?;
        let x = Tensor::from_vec(data, dims.as_slice(), &candle_core::Device::Cpu)?;
        let out = self
            .fwd
            .borrow_mut()
            .run(x, self.training)
            .map_err(to_candle_err)?
            .unwrap_or(Tensor::zeros(dims.as_slice(), candle_core::DType::F32, &candle_core::Device::Cpu)?);
        let shape = out.shape().clone();
        let flat = out.flatten_all()?.to_vec1::<f32>()?;
        Ok((CpuStorage::F32(flat), shape))
    }

    fn bwd(&self, _arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> CResult<Option<Tensor>> {
        let upstream = if self.comm.rank() == self.comm.size() - 1 {
            Some(grad_res.copy()?)
        } else {
            None
        };
        let mut fwd = self.fwd.borrow_mut();
        let mut bwd = BackwardResNetApp::new(&mut fwd, self.shape.clone());
        let (grad_x, ledger) = bwd.run(upstream).map_err(to_candle_err)?;
        let reduced = reduce_and_scatter(self.comm, ledger, grad_res.device()).map_err(to_candle_err)?;
        scatter_into_layers_resnet(&mut fwd, reduced).map_err(to_candle_err)?;
        let grad_x = grad_x.unwrap_or(Tensor::zeros(self.shape.as_slice(), candle_core::DType::F32, grad_res.device())?);
        Ok(Some(grad_x))
    }
}

fn scatter_into_layers_resnet(fwd: &mut ForwardResNetApp<'_>, reduced: crate::serialize::GradList) -> BraidResult<()> {
    for (idx, grads) in reduced.into_iter().enumerate() {
        if let Some(layer) = fwd.layer_mut(idx) {
            layer.set_grads(grads)?;
        }
    }
    Ok(())
}

/// `AutogradBridge` for the RNN variant: inputs are `(h, c)`; the output is
/// a single tensor stacking `[h_new; c_new]` along a new leading axis
/// (`CustomOp2`'s contract is one tensor in, one tensor out — the pair is
/// packed/unpacked across the op boundary by `RnnParallel::forward`).
pub struct RnnAutogradOp {
    pub fwd: Rc<RefCell<ForwardRnnApp<'static>>>,
    pub batch: usize,
    pub hidden_size: usize,
    pub comm: &'static dyn Comm,
}

impl CustomOp2 for RnnAutogradOp {
    fn name(&self) -> &'static str {
        "braidnet-rnn-layer-parallel"
    }

    fn cpu_fwd(&self, s1: &CpuStorage, l1: &Layout, s2: &CpuStorage, l2: &Layout) -> CResult<(CpuStorage, Shape)> {
        let (h_data, dims) = flatten_f32(s1, l1)?;
        let (c_data, _) = flatten_f32(s2, l2)?;
        let device = candle_core::Device::Cpu;
        let h0 = Tensor::from_vec(h_data, dims.as_slice(), &device)?;
        let c0 = Tensor::from_vec(c_data, dims.as_slice(), &device)?;
        let (h_new, c_new) = self.fwd.borrow_mut().run(h0, c0).map_err(to_candle_err)?.unwrap_or((
            Tensor::zeros(dims.as_slice(), candle_core::DType::F32, &device)?,
            Tensor::zeros(dims.as_slice(), candle_core::DType::F32, &device)?,
        ));
        let stacked = Tensor::stack(&[&h_new, &c_new], 0)?;
        let shape = stacked.shape().clone();
        let flat = stacked.flatten_all()?.to_vec1::<f32>()?;
        Ok((CpuStorage::F32(flat), shape))
    }

    fn bwd(&self, _h: &Tensor, _c: &Tensor, _res: &Tensor, grad_res: &Tensor) -> CResult<(Option<Tensor>, Option<Tensor>)> {
        let grad_h = grad_res.get(0)?;
        let grad_c = grad_res.get(1)?;
        let upstream = if self.comm.rank() == self.comm.size() - 1 {
            Some((grad_h.copy()?, grad_c.copy()?))
        } else {
            None
        };
        let mut fwd = self.fwd.borrow_mut();
        let mut bwd = BackwardRnnApp::new(&mut fwd, self.batch, self.hidden_size, grad_res.device().clone());
        let ((gh, gc), ledger) = bwd.run(upstream).map_err(to_candle_err)?;
        let reduced = reduce_and_scatter(self.comm, ledger, grad_res.device()).map_err(to_candle_err)?;
        fwd.cell_mut().set_grads(reduced.into_iter().next().unwrap_or_default()).map_err(to_candle_err)?;

        let device = grad_res.device();
        let shape = &[self.batch, self.hidden_size][..];
        let gh = gh.map(Ok).unwrap_or_else(|| Tensor::zeros(shape, candle_core::DType::F32, device))?;
        let gc = gc.map(Ok).unwrap_or_else(|| Tensor::zeros(shape, candle_core::DType::F32, device))?;
        Ok((Some(gh), Some(gc)))
    }
}
