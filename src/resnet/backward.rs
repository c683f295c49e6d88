//! `BackwardResNetApp` (C6 of SPEC_FULL.md).

use crate::braid::core::Core;
use crate::braid::{AccessStatus, BraidApp, BraidOptions};
use crate::comm::Comm;
use crate::error::BraidResult;
use crate::resnet::forward::ForwardResNetApp;
use crate::serialize::{tensor_byte_size, GradList, SerializationBuffer};
use crate::vector::BraidVector;
use candle_core::Tensor;

/// Runs the multigrid solve on reverted ranks over the adjoint, recomputing
/// each step's primal from `ForwardResNetApp` and harvesting VJPs.
pub struct BackwardResNetApp<'a, 'f> {
    fwd: &'f mut ForwardResNetApp<'a>,
    shape: Vec<usize>,
    initial: Option<Tensor>,
    final_grad_x: Option<Tensor>,
}

impl<'a, 'f> BackwardResNetApp<'a, 'f> {
    pub fn new(fwd: &'f mut ForwardResNetApp<'a>, shape: Vec<usize>) -> Self {
        Self {
            fwd,
            shape,
            initial: None,
            final_grad_x: None,
        }
    }

    fn comm(&self) -> &'a dyn Comm {
        self.fwd.comm()
    }

    /// `step`'s logic proper, separated so `step` can catch and log any
    /// failure without aborting the solve (§4.6, §7: "nothing in backward
    /// is allowed to abort the solver").
    fn step_inner(&mut self, w_in: &BraidVector, w_out: &mut BraidVector, tstart: f64, tstop: f64, level: usize) -> BraidResult<()> {
        let tf = self.fwd.tf();
        let (y, x, idx) = self.fwd.primal_with_grad(tf - tstop, tf - tstart, level)?;

        let cotangent = w_in.tensor(0).detach();
        let weighted = (&y * &cotangent)?.sum_all()?;
        let grad_store = weighted.backward()?;

        let grad_x = grad_store
            .get(&x)
            .cloned()
            .unwrap_or(Tensor::zeros_like(&x)?);
        w_out.replace_tensor(0, grad_x);

        let params = self
            .fwd
            .layer(idx)
            .expect("primal_with_grad only returns owned indices")
            .parameters();
        for (j, p) in params.iter().enumerate() {
            if let Some(g) = grad_store.get(p.as_tensor()) {
                self.fwd.accumulate_layer_grad(idx, j, g)?;
            }
        }
        Ok(())
    }

    /// `run(W)` (§4.6): drives the adjoint solve, then harvests per-layer
    /// parameter gradients into the ledger, dropping the duplicate layer
    /// every non-root rank inherits from reverted-rank addressing.
    pub fn run(&mut self, upstream_grad: Option<Tensor>) -> BraidResult<(Option<Tensor>, GradList)> {
        self.initial = upstream_grad;
        self.final_grad_x = None;
        let core = Core::new(
            self.comm(),
            BraidOptions {
                reverted_ranks: true,
                final_relax: true,
                ..Default::default()
            },
            self.fwd.t0(),
            self.fwd.tf(),
            self.fwd.local_steps(),
        );
        let result = core.run(self)?;
        if let Some(v) = result {
            self.final_grad_x = Some(v.tensor(0).copy()?);
        }

        // `first` drops the duplicate every non-root rank inherits from
        // reverted-rank addressing (§4.6). Slots before `first` still get a
        // ledger entry — zero-filled rather than omitted — so every rank's
        // ledger has the same length and per-slot shape for the all-reduce
        // (see `crate::layer::full_grads`).
        let first = if self.comm().rank() == 0 { 0 } else { 1 };
        let n = self.fwd.local_steps();
        let mut ledger: GradList = Vec::with_capacity(n);
        for idx in 0..n {
            if idx < first {
                let layer = self.fwd.layer(idx).expect("owned layer index");
                let zeroed = layer
                    .parameters()
                    .iter()
                    .map(|p| Ok(Some(p.as_tensor().zeros_like()?)))
                    .collect::<BraidResult<Vec<_>>>()?;
                ledger.push(zeroed);
            } else {
                let layer = self.fwd.layer_mut(idx).expect("owned layer index");
                ledger.push(crate::layer::full_grads(layer)?);
                layer.zero_grad();
            }
        }
        Ok((self.final_grad_x.clone(), ledger))
    }
}

impl<'a, 'f> BraidApp for BackwardResNetApp<'a, 'f> {
    fn init(&mut self, _t: f64) -> BraidResult<BraidVector> {
        let g = self
            .initial
            .take()
            .unwrap_or(Tensor::zeros(self.shape.as_slice(), candle_core::DType::F32, &candle_core::Device::Cpu)?);
        Ok(BraidVector::new(vec![g], 0))
    }

    fn clone_vector(&self, v: &BraidVector) -> BraidResult<BraidVector> {
        v.deep_clone()
    }

    fn sum(&self, alpha: f64, x: &BraidVector, beta: f64, y: &mut BraidVector) -> BraidResult<()> {
        x.axpy_into(alpha, beta, y)
    }

    fn spatial_norm(&self, v: &BraidVector) -> BraidResult<f64> {
        v.spatial_norm()
    }

    fn access(&mut self, _v: &BraidVector, _status: &AccessStatus) -> BraidResult<()> {
        Ok(())
    }

    fn buf_size(&self) -> usize {
        tensor_byte_size(&self.shape) + 8 + 8
    }

    fn buf_pack(&self, v: &BraidVector, buf: &mut SerializationBuffer) -> BraidResult<()> {
        v.pack(buf)
    }

    fn buf_unpack(&self, buf: &mut SerializationBuffer, level: usize) -> BraidResult<BraidVector> {
        BraidVector::unpack(buf, &[self.shape.clone()], level, &candle_core::Device::Cpu)
    }

    fn step(&mut self, u: &mut BraidVector, tstart: f64, tstop: f64, level: usize) -> BraidResult<()> {
        let mut w_out = u.deep_clone()?;
        match self.step_inner(u, &mut w_out, tstart, tstop, level) {
            Ok(()) => {
                *u = w_out;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, tstart, tstop, level, "backward step failed, swallowing and continuing solve");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::FakeComm;
    use crate::layer::Layer;
    use crate::resnet::layer::ResnetBlock;
    use candle_core::{DType, Device};

    fn identity_layers(n: usize, dim: usize, device: &Device) -> Vec<Box<dyn Layer>> {
        (0..n)
            .map(|i| Box::new(ResnetBlock::zeroed(dim, 4, device, format!("block{i}")).unwrap()) as Box<dyn Layer>)
            .collect()
    }

    #[test]
    fn identity_backward_on_single_rank_returns_cotangent_as_grad() {
        let device = Device::Cpu;
        let comms = FakeComm::ring(1);
        let mut fwd =
            ForwardResNetApp::new(&comms[0], identity_layers(4, 3, &device), vec![1, 3], device.clone(), 0.0, 1.0)
                .unwrap();
        let x = Tensor::ones((1, 3), DType::F32, &device).unwrap();
        fwd.run(x.clone(), true).unwrap();

        let mut bwd = BackwardResNetApp::new(&mut fwd, vec![1, 3]);
        let cotangent = Tensor::ones((1, 3), DType::F32, &device).unwrap();
        let (grad_x, ledger) = bwd.run(Some(cotangent.clone())).unwrap();
        let grad_x = grad_x.unwrap();
        assert_eq!(grad_x.to_vec2::<f32>().unwrap(), cotangent.to_vec2::<f32>().unwrap());
        assert_eq!(ledger.len(), 4);
        for layer_grads in &ledger {
            for g in layer_grads {
                if let Some(t) = g {
                    let sum: f32 = t.sum_all().unwrap().to_scalar().unwrap();
                    assert_eq!(sum, 0.0);
                }
            }
        }
    }
}
