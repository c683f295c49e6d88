//! C2: BraidVector — the multigrid driver's opaque per-time-point state.

use crate::error::BraidResult;
use crate::serialize::SerializationBuffer;
use candle_core::{Device, Tensor};

/// Owned bundle of tensor(s) plus the (optional) serialized layer that
/// defines the step ending at this vector's time. ResNet vectors hold one
/// tensor; RNN vectors hold two (`hidden`, `cell`).
#[derive(Clone)]
pub struct BraidVector {
    tensors: Vec<Tensor>,
    level: usize,
    layer_data: Option<Vec<u8>>,
    send_flag: bool,
}

impl BraidVector {
    pub fn new(tensors: Vec<Tensor>, level: usize) -> Self {
        assert!(!tensors.is_empty(), "BraidVector must own at least one tensor");
        Self {
            tensors,
            level,
            layer_data: None,
            send_flag: false,
        }
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn tensor(&self, i: usize) -> &Tensor {
        &self.tensors[i]
    }

    pub fn replace_tensor(&mut self, i: usize, t: Tensor) {
        self.tensors[i] = t;
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn send_flag(&self) -> bool {
        self.send_flag
    }

    pub fn set_send_flag(&mut self, flag: bool) {
        self.send_flag = flag;
    }

    pub fn layer_data(&self) -> Option<&[u8]> {
        self.layer_data.as_deref()
    }

    pub fn set_layer_data(&mut self, data: Option<Vec<u8>>) {
        self.layer_data = data;
    }

    /// Deep-copies every tensor, shallow-clones `layer_data`, and resets
    /// `send_flag` — a freshly cloned vector has never "just been
    /// received" (SPEC_FULL.md §4.2).
    pub fn deep_clone(&self) -> BraidResult<Self> {
        let tensors = self
            .tensors
            .iter()
            .map(|t| t.copy())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            tensors,
            level: self.level,
            layer_data: self.layer_data.clone(),
            send_flag: false,
        })
    }

    /// `w <- alpha * self + beta * w`, elementwise across every owned
    /// tensor (the `sum` callback of the `BraidApp` contract).
    pub fn axpy_into(&self, alpha: f64, beta: f64, w: &mut BraidVector) -> BraidResult<()> {
        for (x, y) in self.tensors.iter().zip(w.tensors.iter_mut()) {
            let scaled_x = (x * alpha)?;
            let scaled_y = (&*y * beta)?;
            *y = (scaled_x + scaled_y)?;
        }
        Ok(())
    }

    /// L2 norm across all component tensors.
    pub fn spatial_norm(&self) -> BraidResult<f64> {
        let mut total = 0f64;
        for t in &self.tensors {
            let sq = t.sqr()?.sum_all()?.to_scalar::<f32>()?;
            total += sq as f64;
        }
        Ok(total.sqrt())
    }

    pub fn pack(&self, buf: &mut SerializationBuffer) -> BraidResult<()> {
        for t in &self.tensors {
            buf.write_tensor(t)?;
        }
        buf.write_blob(self.layer_data.as_deref());
        Ok(())
    }

    pub fn unpack(
        buf: &mut SerializationBuffer,
        shapes: &[Vec<usize>],
        level: usize,
        device: &Device,
    ) -> BraidResult<Self> {
        let mut tensors = Vec::with_capacity(shapes.len());
        for shape in shapes {
            tensors.push(buf.read_tensor(shape, device)?);
        }
        let layer_data = buf.read_blob();
        let mut v = Self::new(tensors, level);
        v.layer_data = layer_data;
        v.send_flag = v.layer_data.is_some();
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn one(v: f32) -> Tensor {
        Tensor::from_vec(vec![v, v], 2, &Device::Cpu).unwrap()
    }

    #[test]
    fn clone_is_deep_and_resets_send_flag() {
        let mut v = BraidVector::new(vec![one(1.0)], 0);
        v.set_send_flag(true);
        v.set_layer_data(Some(vec![9]));

        let clone = v.deep_clone().unwrap();
        assert!(!clone.send_flag());
        assert_eq!(clone.layer_data(), Some(&[9][..]));

        v.replace_tensor(0, one(5.0));
        assert_eq!(clone.tensor(0).to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
        assert_eq!(v.tensor(0).to_vec1::<f32>().unwrap(), vec![5.0, 5.0]);
    }

    #[test]
    fn pack_unpack_round_trips() {
        let mut v = BraidVector::new(vec![one(2.0), one(3.0)], 0);
        v.set_layer_data(Some(vec![1, 2, 3]));
        v.set_send_flag(true);

        let mut buf = SerializationBuffer::new();
        v.pack(&mut buf).unwrap();
        let mut reader = SerializationBuffer::from_bytes(buf.into_bytes());
        let back = BraidVector::unpack(&mut reader, &[vec![2], vec![2]], 0, &Device::Cpu).unwrap();

        assert_eq!(back.tensor(0).to_vec1::<f32>().unwrap(), vec![2.0, 2.0]);
        assert_eq!(back.tensor(1).to_vec1::<f32>().unwrap(), vec![3.0, 3.0]);
        assert_eq!(back.layer_data(), Some(&[1, 2, 3][..]));
        assert!(back.send_flag());
    }

    #[test]
    fn axpy_matches_expected_linear_combination() {
        let x = BraidVector::new(vec![one(1.0)], 0);
        let mut w = BraidVector::new(vec![one(2.0)], 0);
        x.axpy_into(2.0, 3.0, &mut w).unwrap();
        // 2*1 + 3*2 = 8
        assert_eq!(w.tensor(0).to_vec1::<f32>().unwrap(), vec![8.0, 8.0]);
    }
}
