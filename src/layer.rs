//! The `Layer` capability set (§3, §9 of SPEC_FULL.md): a polymorphic
//! object with `{forward, parameters, zero_grad, serialize, deserialize}`,
//! dispatched via `Box<dyn Layer>` rather than an inheritance chain —
//! directly generalized from the teacher's `Layer` trait in `lib.rs`
//! (`forward`/`backward`/`update`/`name`) to the capability set MGRIT
//! needs.

use crate::error::{BraidError, BraidResult};
use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};

/// Which concrete layer a serialized blob decodes to. Stands in for
/// `typetag::serde`'s type tag: `candle_core::Var` is deliberately not
/// `serde`-(de)serializable, so dispatch is done by hand here instead of by
/// derive, mirroring the teacher's manual `Storage` `Serialize`/
/// `Deserialize` impl (pull to host, write raw floats) rather than
/// reaching for a derive that does not apply to this tensor type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    ResnetBlock,
    LstmCell,
}

/// A layer's trainable-weight capability set. ResNet layers are one per
/// time step (plus a ghost); the RNN layer is a single cell shared across
/// every local time step.
pub trait Layer: Send {
    fn forward(&self, input: &Tensor) -> BraidResult<Tensor>;

    /// Ordered, stable list of trainable parameters. Order must match
    /// across every rank (it drives `SerializationBuffer::pack`/`unpack`
    /// and the gradient all-reduce).
    fn parameters(&self) -> Vec<Var>;

    /// Current accumulated gradient per parameter, in `parameters()` order.
    fn grads(&self) -> Vec<Option<Tensor>>;

    /// Overwrites the accumulated gradient per parameter (used after the
    /// gradient all-reduce unpacks a reduced buffer back into each layer).
    fn set_grads(&mut self, grads: Vec<Option<Tensor>>) -> BraidResult<()>;

    /// Accumulates `grad` for parameter at `index` (called once per step
    /// during `BackwardResNetApp::step`/`BackwardRnnApp::step`, since a
    /// shared RNN cell is stepped through many times per backward solve).
    fn accumulate_grad(&mut self, index: usize, grad: &Tensor) -> BraidResult<()>;

    fn zero_grad(&mut self);

    fn serialize(&self) -> BraidResult<Vec<u8>>;

    fn kind(&self) -> LayerKind;

    fn name(&self) -> &str;
}

/// Reconstructs a boxed layer from `kind`-tagged bytes produced by
/// [`Layer::serialize`].
pub fn deserialize_layer(kind: LayerKind, bytes: &[u8], device: &Device) -> BraidResult<Box<dyn Layer>> {
    match kind {
        LayerKind::ResnetBlock => Ok(Box::new(crate::resnet::layer::ResnetBlock::from_bytes(bytes, device)?)),
        LayerKind::LstmCell => Ok(Box::new(crate::rnn::cell::LstmCellLayer::from_bytes(bytes, device)?)),
    }
}

/// Flat, device-independent representation of a single weight tensor,
/// used by every `Layer::serialize`/`from_bytes` implementation.
#[derive(Serialize, Deserialize)]
pub(crate) struct TensorBlob {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorBlob {
    pub fn from_tensor(t: &Tensor) -> BraidResult<Self> {
        Ok(Self {
            shape: t.shape().dims().to_vec(),
            data: t.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> BraidResult<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

/// Adds `grad` onto `slot`, allocating a fresh zero tensor first if `slot`
/// is still `None` — the gradient-accumulation behavior the original
/// relies on from the tensor library (`p.grad += ...`), reproduced by hand
/// here since `candle`'s `GradStore` only exists for the duration of one
/// `Tensor::backward()` call.
pub(crate) fn accumulate(slot: &mut Option<Tensor>, grad: &Tensor) -> BraidResult<()> {
    *slot = Some(match slot.take() {
        Some(existing) => (existing + grad)?,
        None => grad.clone(),
    });
    Ok(())
}

pub(crate) fn unknown_kind_err(name: &str) -> BraidError {
    BraidError::UnknownLayerKind(name.to_string())
}

/// `grads()` with every `None` entry materialized as a zero tensor shaped
/// like its parameter. Used when building the parameter-gradient ledger
/// (§4.3, §4.9): every rank's ledger must have identical shape at every
/// slot for the gradient all-reduce to align, so a "not required" grad is
/// represented as an explicit zero contribution rather than an omitted
/// element — the "zeros on non-owning ranks" alternative SPEC_FULL.md
/// §4.9 calls out.
pub fn full_grads(layer: &dyn Layer) -> BraidResult<Vec<Option<Tensor>>> {
    let params = layer.parameters();
    let grads = layer.grads();
    params
        .iter()
        .zip(grads.into_iter())
        .map(|(p, g)| match g {
            Some(t) => Ok(Some(t)),
            None => Ok(Some(p.as_tensor().zeros_like()?)),
        })
        .collect()
}
