//! `ForwardResNetApp` (C5 of SPEC_FULL.md).

use crate::braid::{AccessStatus, BraidApp};
use crate::comm::Comm;
use crate::error::{BraidError, BraidResult};
use crate::layer::Layer;
use crate::resnet::layer::ResnetBlock;
use crate::serialize::{tensor_byte_size, SerializationBuffer};
use crate::vector::BraidVector;
use candle_core::{Device, Tensor, Var};

const LEFT_SHIFT_TAG: i32 = 10;

/// Owns `n` locally-trained residual blocks plus, at index `n`, a ghost
/// copy of the next rank's first block (or `None` on the last rank) —
/// `LayerModels` in SPEC_FULL.md §3.
pub struct ForwardResNetApp<'a> {
    comm: &'a dyn Comm,
    models: Vec<Option<Box<dyn Layer>>>,
    shape: Vec<usize>,
    device: Device,
    t0: f64,
    tf: f64,
    local_steps: usize,
    layer_data_size: usize,
    /// Checkpointed input to each local step, populated during `step` and
    /// read back by `primal_with_grad` for the backward recompute.
    states: Vec<Option<Tensor>>,
    initial: Option<Tensor>,
    result: Option<Tensor>,
}

impl<'a> ForwardResNetApp<'a> {
    pub fn new(
        comm: &'a dyn Comm,
        layers: Vec<Box<dyn Layer>>,
        shape: Vec<usize>,
        device: Device,
        t0: f64,
        tf: f64,
    ) -> BraidResult<Self> {
        let local_steps = layers.len();
        let mut models: Vec<Option<Box<dyn Layer>>> = layers.into_iter().map(Some).collect();
        let mut app = Self {
            comm,
            models,
            shape,
            device,
            t0,
            tf,
            local_steps,
            layer_data_size: 0,
            states: vec![None; local_steps],
            initial: None,
            result: None,
        };
        app.models.push(None);
        app.exchange_ghost()?;
        app.layer_data_size = app
            .models
            .iter()
            .flatten()
            .map(|l| l.serialize().map(|b| b.len()))
            .collect::<BraidResult<Vec<_>>>()?
            .into_iter()
            .max()
            .unwrap_or(0);
        Ok(app)
    }

    fn dt0(&self) -> f64 {
        (self.tf - self.t0) / (self.local_steps * self.comm.size()) as f64
    }

    /// Left-shift exchange (§4.5): send local layer 0 leftward, receive a
    /// ghost copy of the next rank's layer 0 from the right.
    fn exchange_ghost(&mut self) -> BraidResult<()> {
        let rank = self.comm.rank();
        let size = self.comm.size();
        if rank > 0 {
            let bytes = self.models[0]
                .as_ref()
                .expect("rank owns at least one local layer")
                .serialize()?;
            self.comm.send_bytes(&bytes, rank - 1, LEFT_SHIFT_TAG)?;
        }
        if rank < size - 1 {
            let bytes = self.comm.recv_bytes(rank + 1, LEFT_SHIFT_TAG)?;
            let ghost = ResnetBlock::from_bytes(&bytes, &self.device)?;
            self.models[self.local_steps] = Some(Box::new(ghost));
        } else {
            self.models[self.local_steps] = None;
        }
        Ok(())
    }

    /// Redoes the left-shift exchange; call before each backward solve
    /// since parameters may have changed since the last forward.
    pub fn update_parallel_weights(&mut self) -> BraidResult<()> {
        self.exchange_ghost()
    }

    /// `floor(tstart/dt0 + eps) - r*n`, clamped — `None` signals an
    /// out-of-ownership probe the caller should no-op on.
    fn local_index(&self, tstart: f64) -> Option<usize> {
        let dt0 = self.dt0();
        let global = (tstart / dt0 + 1e-7).floor() as i64;
        let local = global - (self.comm.rank() * self.local_steps) as i64;
        if local < 0 || local as usize > self.local_steps {
            None
        } else {
            Some(local as usize)
        }
    }

    /// Recomputes the primal for one fine step with `requires_grad` on the
    /// input, for `BackwardResNetApp::step` to differentiate through.
    /// Returns `(y, x, local_index)`.
    pub fn primal_with_grad(&self, tstart: f64, tstop: f64, level: usize) -> BraidResult<(Tensor, Tensor, usize)> {
        let _ = tstop;
        let idx = self
            .local_index(tstart)
            .filter(|i| *i < self.local_steps)
            .ok_or_else(|| BraidError::Comm(format!("primal_with_grad: tstart {tstart} outside owned range at level {level}")))?;
        let x0 = self.states[idx]
            .clone()
            .ok_or_else(|| BraidError::Comm(format!("no checkpointed primal state at local index {idx}")))?;
        let x = Var::from_tensor(&x0)?;
        let layer = self.models[idx]
            .as_ref()
            .expect("local index within owned range always has a layer");
        let y = layer.forward(x.as_tensor())?;
        Ok((y, x.as_tensor().clone(), idx))
    }

    pub fn accumulate_layer_grad(&mut self, idx: usize, param_idx: usize, grad: &Tensor) -> BraidResult<()> {
        self.models[idx]
            .as_mut()
            .expect("idx within owned range")
            .accumulate_grad(param_idx, grad)
    }

    pub fn layer(&self, idx: usize) -> Option<&dyn Layer> {
        self.models[idx].as_deref()
    }

    pub fn layer_mut(&mut self, idx: usize) -> Option<&mut (dyn Layer + 'static)> {
        self.models[idx].as_deref_mut()
    }

    pub fn local_steps(&self) -> usize {
        self.local_steps
    }

    pub fn t0(&self) -> f64 {
        self.t0
    }

    pub fn tf(&self) -> f64 {
        self.tf
    }

    pub fn comm(&self) -> &'a dyn Comm {
        self.comm
    }

    pub fn result(&self) -> Option<&Tensor> {
        self.result.as_ref()
    }

    /// `run(x)` (§4.5): re-syncs ghost weights if training, then drives the
    /// multigrid solve. Returns the final tensor on the rank that owns the
    /// terminal time, `None` elsewhere.
    pub fn run(&mut self, x: Tensor, training: bool) -> BraidResult<Option<Tensor>> {
        if training {
            self.update_parallel_weights()?;
        }
        self.initial = Some(x);
        self.result = None;
        let core = crate::braid::core::Core::new(
            self.comm,
            crate::braid::BraidOptions {
                reverted_ranks: false,
                ..Default::default()
            },
            self.t0,
            self.tf,
            self.local_steps,
        );
        core.run(self)?;
        Ok(self.result.clone())
    }
}

impl<'a> BraidApp for ForwardResNetApp<'a> {
    fn init(&mut self, _t: f64) -> BraidResult<BraidVector> {
        let x = self
            .initial
            .take()
            .ok_or_else(|| BraidError::Comm("ForwardResNetApp::run must set the initial condition".into()))?;
        Ok(BraidVector::new(vec![x], 0))
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

    fn access(&mut self, v: &BraidVector, status: &AccessStatus) -> BraidResult<()> {
        if status.done {
            self.result = Some(v.tensor(0).copy()?);
        }
        Ok(())
    }

    fn buf_size(&self) -> usize {
        tensor_byte_size(&self.shape) + 8 + self.layer_data_size + 8
    }

    fn buf_pack(&self, v: &BraidVector, buf: &mut SerializationBuffer) -> BraidResult<()> {
        v.pack(buf)
    }

    fn buf_unpack(&self, buf: &mut SerializationBuffer, level: usize) -> BraidResult<BraidVector> {
        BraidVector::unpack(buf, &[self.shape.clone()], level, &self.device)
    }

    fn step(&mut self, u: &mut BraidVector, tstart: f64, tstop: f64, level: usize) -> BraidResult<()> {
        let Some(idx) = self.local_index(tstart) else {
            tracing::warn!(tstart, tstop, level, "local index out of ownership range, no-op");
            return Ok(());
        };
        if idx > self.local_steps {
            tracing::warn!(tstart, tstop, level, idx, "local index beyond ghost slot, no-op");
            return Ok(());
        }

        if u.send_flag() {
            if let Some(bytes) = u.layer_data() {
                let refreshed = ResnetBlock::from_bytes(bytes, &self.device)?;
                self.models[idx] = Some(Box::new(refreshed));
            }
        }

        let layer = self.models[idx]
            .as_ref()
            .ok_or_else(|| BraidError::Comm(format!("no layer owned at local index {idx}")))?;
        let x = u.tensor(0).copy()?;
        if idx < self.local_steps {
            self.states[idx] = Some(x.copy()?);
        }
        let y = layer.forward(&x)?;
        u.replace_tensor(0, y);
        u.set_send_flag(false);
        u.set_layer_data(None);

        // torchbraid's `setVectorLayer(tstop, ...)` attaches the layer at the
        // *stop* time, not the one just applied above — at a rank's last
        // local step that resolves to the ghost slot (the next rank's first
        // block), which is what the receiving rank is meant to adopt as its
        // own `models[0]`. `None` on the last rank, where there is no next
        // block to hand off.
        if let Some(stop_idx) = self.local_index(tstop) {
            if let Some(stop_layer) = self.models[stop_idx].as_ref() {
                u.set_layer_data(Some(stop_layer.serialize()?));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::FakeComm;
    use candle_core::DType;

    fn identity_layers(n: usize, dim: usize, device: &Device) -> Vec<Box<dyn Layer>> {
        (0..n)
            .map(|i| Box::new(ResnetBlock::zeroed(dim, 4, device, format!("block{i}")).unwrap()) as Box<dyn Layer>)
            .collect()
    }

    #[test]
    fn single_rank_identity_forward_is_identity() {
        let device = Device::Cpu;
        let comms = FakeComm::ring(1);
        let mut app = ForwardResNetApp::new(&comms[0], identity_layers(4, 3, &device), vec![1, 3], device.clone(), 0.0, 1.0)
            .unwrap();
        let x = Tensor::ones((1, 3), DType::F32, &device).unwrap();
        let y = app.run(x.clone(), false).unwrap().unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn two_rank_identity_matches_single_rank() {
        let device = Device::Cpu;
        let comms = FakeComm::ring(2);
        let mut app0 =
            ForwardResNetApp::new(&comms[0], identity_layers(2, 3, &device), vec![1, 3], device.clone(), 0.0, 1.0)
                .unwrap();
        let mut app1 =
            ForwardResNetApp::new(&comms[1], identity_layers(2, 3, &device), vec![1, 3], device.clone(), 0.0, 1.0)
                .unwrap();
        let x = Tensor::ones((1, 3), DType::F32, &device).unwrap();
        let r0 = app0.run(x.clone(), false).unwrap();
        let r1 = app1.run(x.clone(), false).unwrap();
        assert!(r0.is_none());
        assert_eq!(r1.unwrap().to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
    }
}
