//! `ResnetBlock`: the ResNet-side `Layer` variant (§3, §4.5 of SPEC_FULL.md).
//!
//! Generalizes the teacher's `Linear` (`src/layers/linear.rs`: weights,
//! biases, a `grad_weights`/`grad_biases` pair, a name) to the residual
//! two-layer block the ODE reading of a ResNet calls for: `y = x + f(x)`
//! with `f` a small MLP, using `candle_core::Var` in place of `ndarray`
//! arrays so the block can sit on the `candle` autograd tape.

use crate::error::BraidResult;
use crate::layer::{Layer, LayerKind, TensorBlob};
use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

/// One residual block: `y = x + W2 . relu(W1 . x + b1) + b2`.
///
/// Parameter order (fixed, load-bearing — see `Layer::parameters`'s
/// contract on ordering): `[w1, b1, w2, b2]`.
pub struct ResnetBlock {
    w1: Var,
    b1: Var,
    w2: Var,
    b2: Var,
    grads: [Option<Tensor>; 4],
    name: String,
}

impl ResnetBlock {
    pub fn new(dim: usize, hidden_dim: usize, device: &Device, name: impl Into<String>) -> BraidResult<Self> {
        let scale = 1.0 / (dim as f64).sqrt();
        let w1 = Var::from_tensor(&(Tensor::randn(0f32, 1f32, (dim, hidden_dim), device)? * scale)?)?;
        let b1 = Var::from_tensor(&Tensor::zeros(hidden_dim, DType::F32, device)?)?;
        let w2 = Var::from_tensor(&(Tensor::randn(0f32, 1f32, (hidden_dim, dim), device)? * scale)?)?;
        let b2 = Var::from_tensor(&Tensor::zeros(dim, DType::F32, device)?)?;
        Ok(Self {
            w1,
            b1,
            w2,
            b2,
            grads: [None, None, None, None],
            name: name.into(),
        })
    }

    /// Identity block used by the identity-path test scenarios (§8,
    /// "ResNet-identity", "ResNet-scale"): zeroed weights so `f(x) = 0` and
    /// the block reduces to `y = x`.
    pub fn zeroed(dim: usize, hidden_dim: usize, device: &Device, name: impl Into<String>) -> BraidResult<Self> {
        let mut block = Self::new(dim, hidden_dim, device, name)?;
        block.w1 = Var::from_tensor(&Tensor::zeros((dim, hidden_dim), DType::F32, device)?)?;
        block.w2 = Var::from_tensor(&Tensor::zeros((hidden_dim, dim), DType::F32, device)?)?;
        Ok(block)
    }

    pub fn from_bytes(bytes: &[u8], device: &Device) -> BraidResult<Self> {
        let wire: ResnetBlockWire = bincode::deserialize(bytes)?;
        Ok(Self {
            w1: Var::from_tensor(&wire.w1.to_tensor(device)?)?,
            b1: Var::from_tensor(&wire.b1.to_tensor(device)?)?,
            w2: Var::from_tensor(&wire.w2.to_tensor(device)?)?,
            b2: Var::from_tensor(&wire.b2.to_tensor(device)?)?,
            grads: [None, None, None, None],
            name: wire.name,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct ResnetBlockWire {
    w1: TensorBlob,
    b1: TensorBlob,
    w2: TensorBlob,
    b2: TensorBlob,
    name: String,
}

impl Layer for ResnetBlock {
    fn forward(&self, input: &Tensor) -> BraidResult<Tensor> {
        let hidden = input.matmul(self.w1.as_tensor())?.broadcast_add(self.b1.as_tensor())?;
        let hidden = hidden.relu()?;
        let residual = hidden.matmul(self.w2.as_tensor())?.broadcast_add(self.b2.as_tensor())?;
        Ok((input + residual)?)
    }

    fn parameters(&self) -> Vec<Var> {
        vec![self.w1.clone(), self.b1.clone(), self.w2.clone(), self.b2.clone()]
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
        let wire = ResnetBlockWire {
            w1: TensorBlob::from_tensor(self.w1.as_tensor())?,
            b1: TensorBlob::from_tensor(self.b1.as_tensor())?,
            w2: TensorBlob::from_tensor(self.w2.as_tensor())?,
            b2: TensorBlob::from_tensor(self.b2.as_tensor())?,
            name: self.name.clone(),
        };
        Ok(bincode::serialize(&wire)?)
    }

    fn kind(&self) -> LayerKind {
        LayerKind::ResnetBlock
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_block_passes_input_through() {
        let device = Device::Cpu;
        let block = ResnetBlock::zeroed(4, 8, &device, "block0").unwrap();
        let x = Tensor::ones((1, 4), DType::F32, &device).unwrap();
        let y = block.forward(&x).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn serialize_round_trips_weights() {
        let device = Device::Cpu;
        let block = ResnetBlock::new(3, 5, &device, "block1").unwrap();
        let bytes = block.serialize().unwrap();
        let back = ResnetBlock::from_bytes(&bytes, &device).unwrap();
        assert_eq!(back.name(), "block1");
        assert_eq!(
            back.w1.as_tensor().to_vec2::<f32>().unwrap(),
            block.w1.as_tensor().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn accumulate_grad_sums_across_calls() {
        let device = Device::Cpu;
        let mut block = ResnetBlock::new(2, 2, &device, "block2").unwrap();
        let g = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        block.accumulate_grad(0, &g).unwrap();
        block.accumulate_grad(0, &g).unwrap();
        let accumulated = block.grads()[0].clone().unwrap();
        assert_eq!(accumulated.to_vec2::<f32>().unwrap(), vec![vec![2.0, 2.0], vec![2.0, 2.0]]);
        block.zero_grad();
        assert!(block.grads()[0].is_none());
    }
}
