//! `ForwardRnnApp` (C7 of SPEC_FULL.md).

use crate::braid::{AccessStatus, BraidApp};
use crate::comm::Comm;
use crate::error::{BraidError, BraidResult};
use crate::rnn::cell::LstmCellLayer;
use crate::serialize::{tensor_byte_size, SerializationBuffer};
use crate::vector::BraidVector;
use candle_core::{DType, Device, Tensor, Var};

/// One shared LSTM cell per rank (not one per step, as in the ResNet
/// variant); the multigrid vector is the `(h, c)` pair and the rank's input
/// chunk `x_local` drives `step` from the side (§4.7).
pub struct ForwardRnnApp<'a> {
    comm: &'a dyn Comm,
    cell: LstmCellLayer,
    x_local: Tensor,
    batch: usize,
    hidden_size: usize,
    device: Device,
    t0: f64,
    tf: f64,
    local_steps: usize,
    states: Vec<Option<(Tensor, Tensor)>>,
    initial: Option<(Tensor, Tensor)>,
    result: Option<(Tensor, Tensor)>,
}

impl<'a> ForwardRnnApp<'a> {
    /// `x_local` is `(batch, local_seq_len, input_size)`; `local_seq_len`
    /// fixes `local_steps`.
    pub fn new(comm: &'a dyn Comm, cell: LstmCellLayer, x_local: Tensor, device: Device, t0: f64, tf: f64) -> BraidResult<Self> {
        let (batch, local_steps, _input_size) = x_local.dims3()?;
        let hidden_size = cell.hidden_size();
        Ok(Self {
            comm,
            cell,
            x_local,
            batch,
            hidden_size,
            device,
            t0,
            tf,
            local_steps,
            states: vec![None; local_steps],
            initial: None,
            result: None,
        })
    }

    fn dt0(&self) -> f64 {
        (self.tf - self.t0) / (self.local_steps * self.comm.size()) as f64
    }

    fn local_index(&self, tstart: f64) -> Option<usize> {
        let dt0 = self.dt0();
        let global = (tstart / dt0 + 1e-7).floor() as i64;
        let local = global - (self.comm.rank() * self.local_steps) as i64;
        if local < 0 || local as usize >= self.local_steps {
            None
        } else {
            Some(local as usize)
        }
    }

    pub fn cell(&self) -> &LstmCellLayer {
        &self.cell
    }

    pub fn cell_mut(&mut self) -> &mut LstmCellLayer {
        &mut self.cell
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

    pub fn result(&self) -> Option<&(Tensor, Tensor)> {
        self.result.as_ref()
    }

    fn input_at(&self, idx: usize) -> BraidResult<Tensor> {
        Ok(self.x_local.narrow(1, idx, 1)?.squeeze(1)?)
    }

    /// Recomputes one fine step with `h`/`c` as grad-enabled leaves.
    /// Returns `(h_new, c_new, h_in, c_in, local_index)`.
    pub fn primal_with_grad(
        &self,
        tstart: f64,
        tstop: f64,
        level: usize,
    ) -> BraidResult<(Tensor, Tensor, Tensor, Tensor, usize)> {
        let _ = tstop;
        let idx = self
            .local_index(tstart)
            .ok_or_else(|| BraidError::Comm(format!("primal_with_grad: tstart {tstart} outside owned range at level {level}")))?;
        let (h0, c0) = self.states[idx]
            .clone()
            .ok_or_else(|| BraidError::Comm(format!("no checkpointed (h,c) at local index {idx}")))?;
        let h = Var::from_tensor(&h0)?;
        let c = Var::from_tensor(&c0)?;
        let x_t = self.input_at(idx)?;
        let (h_new, c_new) = self.cell.step(&x_t, h.as_tensor(), c.as_tensor())?;
        Ok((h_new, c_new, h.as_tensor().clone(), c.as_tensor().clone(), idx))
    }

    /// `run(x0, h0, c0)` (§4.5's `run`, generalized to the RNN's two-tensor
    /// vector): input chunk is fixed at construction, only the initial
    /// hidden/cell state varies per call.
    pub fn run(&mut self, h0: Tensor, c0: Tensor) -> BraidResult<Option<(Tensor, Tensor)>> {
        self.initial = Some((h0, c0));
        self.result = None;
        let core = crate::braid::core::Core::new(
            self.comm,
            crate::braid::BraidOptions {
                reverted_ranks: false,
                final_relax: true,
                ..Default::default()
            },
            self.t0,
            self.tf,
            self.local_steps,
        );
        core.run(self)?;
        Ok(self.result.clone())
    }

    pub fn zero_hidden(&self) -> BraidResult<(Tensor, Tensor)> {
        let h = Tensor::zeros((self.batch, self.hidden_size), DType::F32, &self.device)?;
        let c = h.copy()?;
        Ok((h, c))
    }
}

impl<'a> BraidApp for ForwardRnnApp<'a> {
    fn init(&mut self, _t: f64) -> BraidResult<BraidVector> {
        let (h, c) = self
            .initial
            .take()
            .ok_or_else(|| BraidError::Comm("ForwardRnnApp::run must set the initial (h, c)".into()))?;
        Ok(BraidVector::new(vec![h, c], 0))
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
            self.result = Some((v.tensor(0).copy()?, v.tensor(1).copy()?));
        }
        Ok(())
    }

    fn buf_size(&self) -> usize {
        2 * tensor_byte_size(&[self.batch, self.hidden_size]) + 8
    }

    fn buf_pack(&self, v: &BraidVector, buf: &mut SerializationBuffer) -> BraidResult<()> {
        v.pack(buf)
    }

    fn buf_unpack(&self, buf: &mut SerializationBuffer, level: usize) -> BraidResult<BraidVector> {
        let shape = vec![self.batch, self.hidden_size];
        BraidVector::unpack(buf, &[shape.clone(), shape], level, &self.device)
    }

    fn step(&mut self, u: &mut BraidVector, tstart: f64, tstop: f64, level: usize) -> BraidResult<()> {
        let Some(idx) = self.local_index(tstart) else {
            tracing::warn!(tstart, tstop, level, "local index out of ownership range, no-op");
            return Ok(());
        };
        let h_in = u.tensor(0).copy()?;
        let c_in = u.tensor(1).copy()?;
        self.states[idx] = Some((h_in.copy()?, c_in.copy()?));
        let x_t = self.input_at(idx)?;
        let (h_new, c_new) = self.cell.step(&x_t, &h_in, &c_in)?;
        u.replace_tensor(0, h_new);
        u.replace_tensor(1, c_new);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::FakeComm;

    #[test]
    fn single_rank_matches_manual_unrolled_steps() {
        let device = Device::Cpu;
        let comms = FakeComm::ring(1);
        let cell = LstmCellLayer::new(3, 4, &device, "cell").unwrap();
        let seq_len = 5;
        let x = Tensor::randn(0f32, 1f32, (1, seq_len, 3), &device).unwrap();

        let mut app = ForwardRnnApp::new(&comms[0], LstmCellLayer::new(3, 4, &device, "cell2").unwrap(), x.clone(), device.clone(), 0.0, 1.0).unwrap();
        // overwrite with a clone of the same weights as `cell` for a controlled comparison
        *app.cell_mut() = LstmCellLayer::from_bytes(&cell.serialize().unwrap(), &device).unwrap();

        let (h0, c0) = app.zero_hidden().unwrap();
        let (h_out, c_out) = app.run(h0.clone(), c0.clone()).unwrap().unwrap();

        let mut h = h0;
        let mut c = c0;
        for t in 0..seq_len {
            let x_t = x.narrow(1, t, 1).unwrap().squeeze(1).unwrap();
            let (h2, c2) = cell.step(&x_t, &h, &c).unwrap();
            h = h2;
            c = c2;
        }
        assert_eq!(h_out.to_vec2::<f32>().unwrap(), h.to_vec2::<f32>().unwrap());
        assert_eq!(c_out.to_vec2::<f32>().unwrap(), c.to_vec2::<f32>().unwrap());
    }
}
