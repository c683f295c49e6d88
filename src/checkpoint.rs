//! Model checkpointing: ambient persistence for `Layer` lists (SPEC_FULL.md
//! §6, "Persisted state"). The distilled protocol itself keeps no state
//! across runs, but the teacher's own `examples/graph_persistence.rs` and
//! `tests/persistence_flow_tests.rs` establish that a serializable model is
//! part of this codebase's stack, so a checkpoint format is carried here
//! too.
//!
//! The teacher serializes its whole `Graph` as one `serde_json` document via
//! `typetag::serde` on `dyn Operation`. `candle_core::Var` cannot derive
//! `Serialize`/`Deserialize` (it wraps device storage), so `Layer::serialize`
//! already hand-rolls a `kind`-tagged byte encoding (see `layer.rs`) instead
//! of `typetag`. A checkpoint here is therefore a `serde_json` manifest
//! (layer kinds, names, and ordering) plus one `bincode`-framed byte blob per
//! layer, rather than one flat JSON document — the same two-tier shape the
//! teacher's JSON-plus-raw-float `Storage` impl already uses under the hood.

use crate::error::BraidResult;
use crate::layer::{deserialize_layer, Layer, LayerKind};
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// One layer's entry in the manifest: enough to redispatch deserialization
/// without inspecting the blob itself.
#[derive(Serialize, Deserialize)]
struct LayerManifestEntry {
    kind: LayerKind,
    name: String,
    byte_len: usize,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    /// Bumped if the on-disk layout changes; checked on load.
    format_version: u32,
    entries: Vec<LayerManifestEntry>,
}

const FORMAT_VERSION: u32 = 1;

/// A checkpoint holds a manifest (`serde_json`, human-inspectable) and the
/// concatenated `bincode`-length-prefixed layer blobs it describes.
pub struct Checkpoint {
    manifest: Manifest,
    blobs: Vec<Vec<u8>>,
}

impl Checkpoint {
    /// Captures the current weights of `layers` into an in-memory
    /// checkpoint, ready for `to_bytes`.
    pub fn capture(layers: &[Box<dyn Layer>]) -> BraidResult<Self> {
        let mut entries = Vec::with_capacity(layers.len());
        let mut blobs = Vec::with_capacity(layers.len());
        for layer in layers {
            let blob = layer.serialize()?;
            entries.push(LayerManifestEntry {
                kind: layer.kind(),
                name: layer.name().to_string(),
                byte_len: blob.len(),
            });
            blobs.push(blob);
        }
        Ok(Self {
            manifest: Manifest {
                format_version: FORMAT_VERSION,
                entries,
            },
            blobs,
        })
    }

    /// Serializes the checkpoint to a single self-describing byte stream: a
    /// `bincode`-framed `serde_json` manifest string, followed by each
    /// layer's blob in manifest order.
    pub fn to_bytes(&self) -> BraidResult<Vec<u8>> {
        let manifest_json = serde_json::to_string(&self.manifest).map_err(json_err)?;
        let mut out = bincode::serialize(&manifest_json)?;
        for blob in &self.blobs {
            out.extend_from_slice(blob);
        }
        Ok(out)
    }

    /// Reverses `to_bytes`, rebuilding boxed layers on `device`.
    pub fn load(bytes: &[u8], device: &Device) -> BraidResult<Vec<Box<dyn Layer>>> {
        let mut cursor = std::io::Cursor::new(bytes);
        let manifest_json: String = bincode::deserialize_from(&mut cursor)?;
        let manifest: Manifest = serde_json::from_str(&manifest_json).map_err(json_err)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(crate::error::BraidError::Comm(format!(
                "checkpoint format_version {} unsupported (expected {FORMAT_VERSION})",
                manifest.format_version
            )));
        }

        let consumed = cursor.position() as usize;
        let mut rest = &bytes[consumed..];
        let mut layers = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            if rest.len() < entry.byte_len {
                return Err(crate::error::BraidError::Comm(format!(
                    "checkpoint truncated: layer {:?} expected {} bytes, {} remain",
                    entry.name,
                    entry.byte_len,
                    rest.len()
                )));
            }
            let (blob, tail) = rest.split_at(entry.byte_len);
            layers.push(deserialize_layer(entry.kind, blob, device)?);
            rest = tail;
        }
        Ok(layers)
    }
}

fn json_err(e: serde_json::Error) -> crate::error::BraidError {
    crate::error::BraidError::Comm(format!("checkpoint manifest: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resnet::layer::ResnetBlock;
    use candle_core::Device;

    #[test]
    fn round_trips_a_layer_list() {
        let device = Device::Cpu;
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(ResnetBlock::new(3, 4, &device, "block0").unwrap()),
            Box::new(ResnetBlock::new(3, 4, &device, "block1").unwrap()),
        ];
        let checkpoint = Checkpoint::capture(&layers).unwrap();
        let bytes = checkpoint.to_bytes().unwrap();

        let loaded = Checkpoint::load(&bytes, &device).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name(), "block0");
        assert_eq!(loaded[1].name(), "block1");

        let x = candle_core::Tensor::ones((1, 3), candle_core::DType::F32, &device).unwrap();
        let original = layers[0].forward(&x).unwrap().to_vec2::<f32>().unwrap();
        let restored = loaded[0].forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn rejects_truncated_bytes() {
        let device = Device::Cpu;
        let layers: Vec<Box<dyn Layer>> = vec![Box::new(ResnetBlock::new(3, 4, &device, "block0").unwrap())];
        let checkpoint = Checkpoint::capture(&layers).unwrap();
        let mut bytes = checkpoint.to_bytes().unwrap();
        bytes.truncate(bytes.len() - 4);
        assert!(Checkpoint::load(&bytes, &device).is_err());
    }
}
