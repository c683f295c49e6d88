//! C3: SerializationBuffer — marshalling for `BraidVector`s and for the
//! nested parameter-gradient lists that feed the all-reduce.

use crate::error::BraidResult;
use candle_core::{Device, Tensor};

/// A flat byte cursor used to pack/unpack `BraidVector`s for point-to-point
/// exchange. Writes and reads happen in the same order on every use, which
/// is what makes `pack ∘ unpack = identity` and cross-rank pack-size
/// agreement possible.
#[derive(Default, Clone)]
pub struct SerializationBuffer {
    bytes: Vec<u8>,
    cursor: usize,
}

impl SerializationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, cursor: 0 }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn write_f32_slice(&mut self, values: &[f32]) {
        for v in values {
            self.bytes.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn read_f32_vec(&mut self, count: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(&self.bytes[self.cursor..self.cursor + 4]);
            out.push(f32::from_le_bytes(arr));
            self.cursor += 4;
        }
        out
    }

    /// Writes a length-prefixed byte blob (used for optional `layer_data`).
    pub fn write_blob(&mut self, blob: Option<&[u8]>) {
        match blob {
            Some(bytes) => {
                self.bytes.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                self.bytes.extend_from_slice(bytes);
            }
            None => self.bytes.extend_from_slice(&u64::MAX.to_le_bytes()),
        }
    }

    pub fn read_blob(&mut self) -> Option<Vec<u8>> {
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&self.bytes[self.cursor..self.cursor + 8]);
        self.cursor += 8;
        let len = u64::from_le_bytes(len_bytes);
        if len == u64::MAX {
            return None;
        }
        let len = len as usize;
        let blob = self.bytes[self.cursor..self.cursor + len].to_vec();
        self.cursor += len;
        Some(blob)
    }

    pub fn write_tensor(&mut self, t: &Tensor) -> BraidResult<()> {
        let flat = t.flatten_all()?.to_vec1::<f32>()?;
        self.write_f32_slice(&flat);
        Ok(())
    }

    pub fn read_tensor(&mut self, shape: &[usize], device: &Device) -> BraidResult<Tensor> {
        let numel: usize = shape.iter().product();
        let data = self.read_f32_vec(numel);
        Ok(Tensor::from_vec(data, shape, device)?)
    }
}

/// Byte size a tensor of the given shape occupies when packed (`f32`, 4
/// bytes per element).
pub fn tensor_byte_size(shape: &[usize]) -> usize {
    shape.iter().product::<usize>() * std::mem::size_of::<f32>()
}

/// Nested gradient list as harvested by `BackwardResNetApp`/`BackwardRnnApp`:
/// outer index over owned layers, inner index over that layer's parameter
/// tensors. `None` is the "not required" sentinel.
pub type GradList = Vec<Vec<Option<Tensor>>>;

/// Element count of a nested gradient list — identical on every rank after
/// a correct harvest, since layer/parameter ordering is rank-independent
/// (SPEC_FULL.md §8).
pub fn buffer_size(grads: &GradList) -> BraidResult<usize> {
    let mut total = 0usize;
    for sublist in grads {
        for item in sublist {
            if let Some(t) = item {
                total += t.elem_count();
            }
        }
    }
    Ok(total)
}

/// Writes `grads` into `buf` (outer index slowest, then inner, then the
/// tensor's own row-major order). `None` entries contribute zero elements.
pub fn pack(grads: &GradList, buf: &mut [f32]) -> BraidResult<()> {
    let mut offset = 0;
    for sublist in grads {
        for item in sublist {
            if let Some(t) = item {
                let flat = t.flatten_all()?.to_vec1::<f32>()?;
                buf[offset..offset + flat.len()].copy_from_slice(&flat);
                offset += flat.len();
            }
        }
    }
    Ok(())
}

/// Reads `buf` in the same order `pack` wrote it, replacing each `Some`
/// entry's tensor value in place (preserving its shape).
pub fn unpack(grads: &mut GradList, buf: &[f32], device: &Device) -> BraidResult<()> {
    let mut offset = 0;
    for sublist in grads.iter_mut() {
        for item in sublist.iter_mut() {
            if let Some(t) = item {
                let numel = t.elem_count();
                let shape = t.shape().clone();
                let slice = &buf[offset..offset + numel];
                *t = Tensor::from_slice(slice, shape, device)?;
                offset += numel;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn pack_unpack_round_trips_a_braid_vector_like_blob() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &device).unwrap();
        let mut buf = SerializationBuffer::new();
        buf.write_tensor(&t).unwrap();
        buf.write_blob(Some(b"layer-bytes"));
        let bytes = buf.into_bytes();

        let mut reader = SerializationBuffer::from_bytes(bytes);
        let back = reader.read_tensor(&[2, 2], &device).unwrap();
        let blob = reader.read_blob().unwrap();
        assert_eq!(back.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(blob, b"layer-bytes");
    }

    #[test]
    fn none_blob_round_trips() {
        let mut buf = SerializationBuffer::new();
        buf.write_blob(None);
        let mut reader = SerializationBuffer::from_bytes(buf.into_bytes());
        assert!(reader.read_blob().is_none());
    }

    #[test]
    fn grad_list_buffer_size_and_round_trip() {
        let device = Device::Cpu;
        let a = Tensor::from_vec(vec![1.0f32, 2.0], 2, &device).unwrap();
        let grads: GradList = vec![vec![Some(a.clone()), None], vec![Some(a)]];
        let size = buffer_size(&grads).unwrap();
        assert_eq!(size, 4);

        let mut buf = vec![0.0f32; size];
        pack(&grads, &mut buf).unwrap();
        assert_eq!(buf, vec![1.0, 2.0, 1.0, 2.0]);

        let mut round = grads.clone();
        let doubled: Vec<f32> = buf.iter().map(|v| v * 2.0).collect();
        unpack(&mut round, &doubled, &device).unwrap();
        assert_eq!(
            round[0][0].as_ref().unwrap().to_vec1::<f32>().unwrap(),
            vec![2.0, 4.0]
        );
    }
}
