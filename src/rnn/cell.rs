//! `LstmCellLayer`: the RNN-side `Layer` variant (§3, §4.7 of SPEC_FULL.md).
//!
//! One cell is shared across every local time step on a rank (as opposed to
//! `ResnetBlock`, one instance per step) — generalized from the same
//! teacher `Linear` shape (weights + biases + gradients + name) but with
//! the four-gate LSTM update written out by hand, since `candle_nn`'s own
//! `rnn::LSTM` builds its weights from a `VarBuilder` rather than exposing
//! `Var`s this crate can harvest gradients from directly.

use crate::error::BraidResult;
use crate::layer::{Layer, LayerKind, TensorBlob};
use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

/// Stacked-gate LSTM cell: `w_ih: (input, 4*hidden)`, `w_hh: (hidden, 4*hidden)`,
/// gate order `[input, forget, candidate, output]`, matching the common
/// PyTorch `LSTMCell` layout the original network was trained against.
pub struct LstmCellLayer {
    w_ih: Var,
    w_hh: Var,
    b_ih: Var,
    b_hh: Var,
    hidden_size: usize,
    grads: [Option<Tensor>; 4],
    name: String,
}

impl LstmCellLayer {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        device: &Device,
        name: impl Into<String>,
    ) -> BraidResult<Self> {
        let scale = 1.0 / (hidden_size as f64).sqrt();
        let gate_size = 4 * hidden_size;
        let w_ih = Var::from_tensor(&(Tensor::randn(0f32, 1f32, (input_size, gate_size), device)? * scale)?)?;
        let w_hh = Var::from_tensor(&(Tensor::randn(0f32, 1f32, (hidden_size, gate_size), device)? * scale)?)?;
        let b_ih = Var::from_tensor(&Tensor::zeros(gate_size, DType::F32, device)?)?;
        let b_hh = Var::from_tensor(&Tensor::zeros(gate_size, DType::F32, device)?)?;
        Ok(Self {
            w_ih,
            w_hh,
            b_ih,
            b_hh,
            hidden_size,
            grads: [None, None, None, None],
            name: name.into(),
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn from_bytes(bytes: &[u8], device: &Device) -> BraidResult<Self> {
        let wire: LstmCellWire = bincode::deserialize(bytes)?;
        Ok(Self {
            w_ih: Var::from_tensor(&wire.w_ih.to_tensor(device)?)?,
            w_hh: Var::from_tensor(&wire.w_hh.to_tensor(device)?)?,
            b_ih: Var::from_tensor(&wire.b_ih.to_tensor(device)?)?,
            b_hh: Var::from_tensor(&wire.b_hh.to_tensor(device)?)?,
            hidden_size: wire.hidden_size,
            grads: [None, None, None, None],
            name: wire.name,
        })
    }

    /// One LSTM update: `x` is `(batch, input_size)`, `h`/`c` are
    /// `(batch, hidden_size)`. Returns the new `(h, c)` pair.
    pub fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> BraidResult<(Tensor, Tensor)> {
        let gates = x
            .matmul(self.w_ih.as_tensor())?
            .broadcast_add(self.b_ih.as_tensor())?
            .add(&h.matmul(self.w_hh.as_tensor())?.broadcast_add(self.b_hh.as_tensor())?)?;

        let hs = self.hidden_size;
        let i = candle_nn::ops::sigmoid(&gates.narrow(1, 0, hs)?)?;
        let f = candle_nn::ops::sigmoid(&gates.narrow(1, hs, hs)?)?;
        let g = gates.narrow(1, 2 * hs, hs)?.tanh()?;
        let o = candle_nn::ops::sigmoid(&gates.narrow(1, 3 * hs, hs)?)?;

        let c_new = ((f * c)? + (i * g)?)?;
        let h_new = (o * c_new.tanh()?)?;
        Ok((h_new, c_new))
    }
}

#[derive(Serialize, Deserialize)]
struct LstmCellWire {
    w_ih: TensorBlob,
    w_hh: TensorBlob,
    b_ih: TensorBlob,
    b_hh: TensorBlob,
    hidden_size: usize,
    name: String,
}

impl Layer for LstmCellLayer {
    /// Single-tensor `Layer::forward` is not the cell's primary entry point
    /// (see `step`, which is what `ForwardRnnApp`/`BackwardRnnApp` actually
    /// call); this exists only to satisfy the shared `Layer` capability set,
    /// running one step from a zeroed hidden/cell state.
    fn forward(&self, input: &Tensor) -> BraidResult<Tensor> {
        let (batch, _) = input.dims2()?;
        let device = input.device();
        let zero_h = Tensor::zeros((batch, self.hidden_size), DType::F32, device)?;
        let zero_c = zero_h.clone();
        let (h, _c) = self.step(input, &zero_h, &zero_c)?;
        Ok(h)
    }

    fn parameters(&self) -> Vec<Var> {
        vec![self.w_ih.clone(), self.w_hh.clone(), self.b_ih.clone(), self.b_hh.clone()]
    }

    fn grads(&self) -> Vec<Option<Tensor>> {
        self.grads.to_vec()
    }

    fn set_grads(&mut self, grads: Vec<Option<Tensor>>) -> BraidResult<()> {
        for (slot, g) in self.grads.iter_mut().zip(grads.into_iter()) {
            *slot = g;
        }
        Ok(())
    }

    fn accumulate_grad(&mut self, index: usize, grad: &Tensor) -> BraidResult<()> {
        crate::layer::accumulate(&mut self.grads[index], grad)
    }

    fn zero_grad(&mut self) {
        self.grads = [None, None, None, None];
    }

    fn serialize(&self) -> BraidResult<Vec<u8>> {
        let wire = LstmCellWire {
            w_ih: TensorBlob::from_tensor(self.w_ih.as_tensor())?,
            w_hh: TensorBlob::from_tensor(self.w_hh.as_tensor())?,
            b_ih: TensorBlob::from_tensor(self.b_ih.as_tensor())?,
            b_hh: TensorBlob::from_tensor(self.b_hh.as_tensor())?,
            hidden_size: self.hidden_size,
            name: self.name.clone(),
        };
        Ok(bincode::serialize(&wire)?)
    }

    fn kind(&self) -> LayerKind {
        LayerKind::LstmCell
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_preserves_batch_and_hidden_shape() {
        let device = Device::Cpu;
        let cell = LstmCellLayer::new(4, 6, &device, "cell").unwrap();
        let x = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        let h = Tensor::zeros((2, 6), DType::F32, &device).unwrap();
        let c = Tensor::zeros((2, 6), DType::F32, &device).unwrap();
        let (h2, c2) = cell.step(&x, &h, &c).unwrap();
        assert_eq!(h2.dims(), &[2, 6]);
        assert_eq!(c2.dims(), &[2, 6]);
    }

    #[test]
    fn serialize_round_trips_weights() {
        let device = Device::Cpu;
        let cell = LstmCellLayer::new(3, 5, &device, "cell1").unwrap();
        let bytes = cell.serialize().unwrap();
        let back = LstmCellLayer::from_bytes(&bytes, &device).unwrap();
        assert_eq!(back.name(), "cell1");
        assert_eq!(back.hidden_size(), 5);
    }
}
