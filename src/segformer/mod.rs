//! Segformer generator: the segmentation network together with the parameter store it is
//! built from, so pretrained weights can be patched in place before export.

mod convert;
mod model;

use crate::error::{Result, SegTraceError};
use crate::hf::HfModel;
use crate::weights::{self, LoadOutcome, ParameterStore, Snapshot};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::{debug, info};
pub use model::Config;
pub use model::HiddenAct;
pub use model::SemanticSegmentationModel;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// What to build on top of a [Config].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub num_channels: usize,
    pub image_size: usize,
    pub num_classes: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            num_channels: 3,
            image_size: 512,
            num_classes: 2,
        }
    }
}

pub struct Segformer {
    config: Config,
    options: BuildOptions,
    varmap: VarMap,
    model: SemanticSegmentationModel,
    device: Device,
}

impl Segformer {
    /// Build a randomly initialised network on `device`. The channel count of `options`
    /// overrides the one in `config`.
    pub fn new(config: Config, options: BuildOptions, device: &Device) -> Result<Self> {
        let config = Config {
            num_channels: options.num_channels,
            ..config
        };
        config.check().map_err(SegTraceError::InvalidConfig)?;
        if options.num_channels == 0 || options.num_classes == 0 {
            return Err(SegTraceError::InvalidConfig(
                "channel and class counts must be > 0".to_string(),
            ));
        }
        if options.image_size == 0 {
            return Err(SegTraceError::InvalidConfig(
                "image size must be > 0".to_string(),
            ));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = SemanticSegmentationModel::new(&config, options.num_classes, vb)?;
        debug!(
            "built segformer with {} parameter tensors on {:?}",
            varmap.all_vars().len(),
            device
        );
        Ok(Self {
            config,
            options,
            varmap,
            model,
            device: device.clone(),
        })
    }

    /// Read a HuggingFace style `config.json` and build from it.
    pub fn from_config_file<P: AsRef<Path>>(
        config: P,
        options: BuildOptions,
        device: &Device,
    ) -> Result<Self> {
        let config: Config = serde_json::from_str(&std::fs::read_to_string(config)?)?;
        debug!("loaded config: {:?}", config);
        Self::new(config, options, device)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> BuildOptions {
        self.options
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The parameter store of the network.
    pub fn net(&self) -> &VarMap {
        &self.varmap
    }

    /// Restore weights from a snapshot file, dropping a decode head trained for another
    /// number of classes. Checkpoints in the mmseg SegFormer layout are renamed first.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<LoadOutcome> {
        let path = path.as_ref();
        let snapshot = Snapshot::read(path, &self.device)?;
        info!("loading {} tensors from {:?}", snapshot.len(), path);
        let snapshot = convert::to_hf_layout(snapshot)?;
        weights::load_snapshot(&mut self.varmap, snapshot)
    }

    /// Current parameters by name.
    pub fn state_dict(&self) -> Result<BTreeMap<String, Tensor>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| SegTraceError::ParameterStore(e.to_string()))?;
        Ok(data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }

    /// Rebuild the network on `device` carrying over every parameter.
    pub fn to_device(self, device: &Device) -> Result<Self> {
        if self.device.same_device(device) {
            return Ok(self);
        }
        let mut moved = Self::new(self.config.clone(), self.options, device)?;
        let snapshot: Snapshot = self.state_dict()?.into_iter().collect();
        let report = weights::apply_non_strict(&mut moved.varmap, &snapshot)?;
        debug!(
            "moved {} parameters to {:?}",
            report.applied.len(),
            device
        );
        Ok(moved)
    }

    /// (B, C, H, W) -> (B, num_classes, H / 4, W / 4) logits
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.model.forward(x)?)
    }

    /// Names and dims of every parameter.
    pub fn parameter_shapes(&self) -> Result<BTreeMap<String, Vec<usize>>> {
        self.varmap.parameter_shapes()
    }
}

impl HfModel for Segformer {
    type Options = BuildOptions;

    fn from_hf_files(
        config: PathBuf,
        weights: Option<PathBuf>,
        options: &BuildOptions,
        device: &Device,
    ) -> Result<Self> {
        let mut segformer = Self::from_config_file(config, *options, device)?;
        if let Some(weights) = weights {
            segformer.load_weights(weights)?;
        }
        Ok(segformer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use std::collections::HashMap;

    fn tiny_config() -> Config {
        Config {
            num_channels: 3,
            num_encoder_blocks: 2,
            depths: vec![1, 1],
            sr_ratios: vec![2, 1],
            hidden_sizes: vec![8, 16],
            patch_sizes: vec![7, 3],
            strides: vec![4, 2],
            num_attention_heads: vec![1, 2],
            mlp_ratios: vec![2, 2],
            hidden_act: HiddenAct::Gelu,
            layer_norm_eps: 1e-6,
            decoder_hidden_size: 8,
        }
    }

    fn options(num_classes: usize) -> BuildOptions {
        BuildOptions {
            num_channels: 3,
            image_size: 32,
            num_classes,
        }
    }

    fn flat(tensor: &Tensor) -> Result<Vec<f32>> {
        Ok(tensor.flatten_all()?.to_vec1::<f32>()?)
    }

    #[test]
    fn test_rejects_empty_image_size() {
        let result = Segformer::new(
            tiny_config(),
            BuildOptions {
                image_size: 0,
                ..options(2)
            },
            &Device::Cpu,
        );
        assert!(matches!(result, Err(SegTraceError::InvalidConfig(_))));
    }

    #[test]
    fn test_image_size_off_the_stride_grid() -> Result<()> {
        let segformer = Segformer::new(
            tiny_config(),
            BuildOptions {
                image_size: 36,
                ..options(2)
            },
            &Device::Cpu,
        )?;
        let x = Tensor::rand(0f32, 1f32, (1, 3, 36, 36), &Device::Cpu)?;
        assert_eq!(segformer.forward(&x)?.dims(), &[1, 2, 9, 9]);
        Ok(())
    }

    #[test]
    fn test_channels_override_config() -> Result<()> {
        let segformer = Segformer::new(
            tiny_config(),
            BuildOptions {
                num_channels: 1,
                ..options(2)
            },
            &Device::Cpu,
        )?;
        assert_eq!(segformer.config().num_channels, 1);
        let shapes = segformer.parameter_shapes()?;
        assert_eq!(
            shapes["segformer.encoder.patch_embeddings.0.proj.weight"],
            vec![8, 1, 7, 7]
        );
        Ok(())
    }

    #[test]
    fn test_pretrained_head_with_other_class_count() -> Result<()> {
        // a checkpoint trained for 5 classes, restored into a 2 class model
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pretrained.safetensors");
        let pretrained = Segformer::new(tiny_config(), options(5), &Device::Cpu)?;
        let tensors: HashMap<String, Tensor> = pretrained.state_dict()?.into_iter().collect();
        candle_core::safetensors::save(&tensors, &path)?;

        let mut segformer = Segformer::new(tiny_config(), options(2), &Device::Cpu)?;
        let head_before = flat(&segformer.state_dict()?["decode_head.classifier.weight"])?;
        let outcome = segformer.load_weights(&path)?;

        match &outcome {
            LoadOutcome::HeadDropped { dropped, report } => {
                assert!(dropped.iter().all(|name| name.starts_with("decode_head.")));
                assert!(dropped.contains(&"decode_head.classifier.weight".to_string()));
                assert!(report
                    .applied
                    .iter()
                    .all(|name| name.starts_with("segformer.")));
                assert!(report.unexpected.is_empty());
            }
            other => panic!("expected the head to be dropped, got {other:?}"),
        }

        let restored = segformer.state_dict()?;
        let name = "segformer.encoder.block.0.0.attention.self.query.weight";
        let expected = flat(&tensors[name])?;
        let actual = flat(&restored[name])?;
        assert!(expected
            .iter()
            .zip(&actual)
            .all(|(&a, &b)| approx_eq!(f32, a, b, ulps = 2)));
        assert_eq!(
            flat(&restored["decode_head.classifier.weight"])?,
            head_before
        );
        Ok(())
    }

    #[test]
    fn test_same_class_count_applies_everything() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pretrained.safetensors");
        let pretrained = Segformer::new(tiny_config(), options(2), &Device::Cpu)?;
        pretrained.net().save(&path)?;

        let mut segformer = Segformer::new(tiny_config(), options(2), &Device::Cpu)?;
        let outcome = segformer.load_weights(&path)?;
        assert!(!outcome.head_dropped());
        assert!(outcome.report().missing.is_empty());

        let x = Tensor::rand(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu)?;
        let expected = flat(&pretrained.forward(&x)?)?;
        let actual = flat(&segformer.forward(&x)?)?;
        assert!(expected
            .iter()
            .zip(&actual)
            .all(|(&a, &b)| approx_eq!(f32, a, b, epsilon = 1e-5)));
        Ok(())
    }

    #[test]
    fn test_load_checkpoint_in_mmseg_layout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mit_b0.safetensors");
        let kv = Tensor::rand(0f32, 1f32, (16, 8), &Device::Cpu)?;
        let tensors: HashMap<String, Tensor> = [
            (
                "backbone.patch_embed1.proj.weight".to_string(),
                Tensor::ones((8, 3, 7, 7), DType::F32, &Device::Cpu)?,
            ),
            ("backbone.block1.0.attn.kv.weight".to_string(), kv.clone()),
            (
                "decode_head.linear_pred.weight".to_string(),
                Tensor::ones((2, 8, 1, 1), DType::F32, &Device::Cpu)?,
            ),
        ]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&tensors, &path)?;

        let mut segformer = Segformer::new(tiny_config(), options(2), &Device::Cpu)?;
        let outcome = segformer.load_weights(&path)?;
        assert!(!outcome.head_dropped());
        assert!(outcome.report().unexpected.is_empty());
        assert_eq!(outcome.report().applied.len(), 4);

        let restored = segformer.state_dict()?;
        assert_eq!(
            flat(&restored["segformer.encoder.patch_embeddings.0.proj.weight"])?,
            vec![1f32; 8 * 3 * 7 * 7]
        );
        assert_eq!(
            flat(&restored["segformer.encoder.block.0.0.attention.self.key.weight"])?,
            flat(&kv.narrow(0, 0, 8)?)?
        );
        assert_eq!(
            flat(&restored["segformer.encoder.block.0.0.attention.self.value.weight"])?,
            flat(&kv.narrow(0, 8, 8)?)?
        );
        assert_eq!(
            flat(&restored["decode_head.classifier.weight"])?,
            vec![1f32; 16]
        );
        Ok(())
    }

    #[test]
    fn test_to_same_device_keeps_parameters() -> Result<()> {
        let segformer = Segformer::new(tiny_config(), options(2), &Device::Cpu)?;
        let before = flat(&segformer.state_dict()?["decode_head.classifier.weight"])?;
        let segformer = segformer.to_device(&Device::Cpu)?;
        let after = flat(&segformer.state_dict()?["decode_head.classifier.weight"])?;
        assert_eq!(before, after);
        Ok(())
    }
}
