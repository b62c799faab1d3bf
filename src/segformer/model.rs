//! Segformer
//!
//! SegFormer: Simple and Efficient Design for Semantic Segmentation with Transformers, by
//! Enze Xie, Wenhai Wang, Zhiding Yu, Anima Anandkumar, Jose M. Alvarez, Ping Luo.
//!
//! Parameter names follow the HuggingFace layout, the encoder lives under `segformer.` and
//! the all-MLP head under `decode_head.`.
//!
//! https://huggingface.co/docs/transformers/model_doc/segformer

use crate::weights::DECODE_HEAD_MARKER;
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, layer_norm, linear, Activation, BatchNorm, Conv2d,
    Conv2dConfig, LayerNorm, Linear, VarBuilder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenAct {
    Gelu,
    GeluNew,
    Relu,
    Silu,
}

impl From<HiddenAct> for Activation {
    fn from(act: HiddenAct) -> Self {
        match act {
            HiddenAct::Gelu => Activation::Gelu,
            HiddenAct::GeluNew => Activation::NewGelu,
            HiddenAct::Relu => Activation::Relu,
            HiddenAct::Silu => Activation::Silu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    pub num_channels: usize,
    pub num_encoder_blocks: usize,
    pub depths: Vec<usize>,
    pub sr_ratios: Vec<usize>,
    pub hidden_sizes: Vec<usize>,
    pub patch_sizes: Vec<usize>,
    pub strides: Vec<usize>,
    pub num_attention_heads: Vec<usize>,
    pub mlp_ratios: Vec<usize>,
    pub hidden_act: HiddenAct,
    pub layer_norm_eps: f64,
    pub decoder_hidden_size: usize,
}

impl Config {
    /// MiT-b0 encoder with a 256 wide decode head
    pub fn mit_b0() -> Self {
        Self {
            num_channels: 3,
            num_encoder_blocks: 4,
            depths: vec![2, 2, 2, 2],
            sr_ratios: vec![8, 4, 2, 1],
            hidden_sizes: vec![32, 64, 160, 256],
            patch_sizes: vec![7, 3, 3, 3],
            strides: vec![4, 2, 2, 2],
            num_attention_heads: vec![1, 2, 5, 8],
            mlp_ratios: vec![4, 4, 4, 4],
            hidden_act: HiddenAct::Gelu,
            layer_norm_eps: 1e-6,
            decoder_hidden_size: 256,
        }
    }

    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        let n = self.num_encoder_blocks;
        if n == 0 {
            return Err("num_encoder_blocks must be > 0".to_string());
        }
        let per_block = [
            ("depths", self.depths.len()),
            ("sr_ratios", self.sr_ratios.len()),
            ("hidden_sizes", self.hidden_sizes.len()),
            ("patch_sizes", self.patch_sizes.len()),
            ("strides", self.strides.len()),
            ("num_attention_heads", self.num_attention_heads.len()),
            ("mlp_ratios", self.mlp_ratios.len()),
        ];
        for (name, len) in per_block {
            if len != n {
                return Err(format!(
                    "{name} has {len} entries but num_encoder_blocks is {n}"
                ));
            }
        }
        for (i, (&hidden, &heads)) in self
            .hidden_sizes
            .iter()
            .zip(&self.num_attention_heads)
            .enumerate()
        {
            if heads == 0 || hidden % heads != 0 {
                return Err(format!(
                    "block {i}: hidden size {hidden} is not divisible by {heads} heads"
                ));
            }
        }
        if self.strides.contains(&0) || self.sr_ratios.contains(&0) {
            return Err("strides and sr_ratios must be > 0".to_string());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::mit_b0()
    }
}

#[derive(Debug, Clone)]
struct OverlapPatchEmbeddings {
    proj: Conv2d,
    layer_norm: LayerNorm,
}

impl OverlapPatchEmbeddings {
    fn new(
        config: &Config,
        patch_size: usize,
        stride: usize,
        num_channels: usize,
        hidden_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let proj = conv2d(
            num_channels,
            hidden_size,
            patch_size,
            Conv2dConfig {
                padding: patch_size / 2,
                stride,
                ..Default::default()
            },
            vb.pp("proj"),
        )?;
        let layer_norm = layer_norm(hidden_size, config.layer_norm_eps, vb.pp("layer_norm"))?;
        Ok(Self { proj, layer_norm })
    }

    /// (B, C, H, W) -> (B, H' * W', hidden), H', W'
    fn forward(&self, x: &Tensor) -> Result<(Tensor, usize, usize)> {
        let x = self.proj.forward(x)?;
        let (_, _, h, w) = x.dims4()?;
        let x = x.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        let x = self.layer_norm.forward(&x)?;
        Ok((x, h, w))
    }
}

#[derive(Debug, Clone)]
struct EfficientSelfAttention {
    num_attention_heads: usize,
    attention_head_size: usize,
    query: Linear,
    key: Linear,
    value: Linear,
    sr: Option<(Conv2d, LayerNorm)>,
}

impl EfficientSelfAttention {
    fn new(
        config: &Config,
        hidden_size: usize,
        num_attention_heads: usize,
        sequence_reduction_ratio: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let query = linear(hidden_size, hidden_size, vb.pp("query"))?;
        let key = linear(hidden_size, hidden_size, vb.pp("key"))?;
        let value = linear(hidden_size, hidden_size, vb.pp("value"))?;
        let sr = if sequence_reduction_ratio > 1 {
            let conv = conv2d(
                hidden_size,
                hidden_size,
                sequence_reduction_ratio,
                Conv2dConfig {
                    stride: sequence_reduction_ratio,
                    ..Default::default()
                },
                vb.pp("sr"),
            )?;
            let norm = layer_norm(hidden_size, config.layer_norm_eps, vb.pp("layer_norm"))?;
            Some((conv, norm))
        } else {
            None
        };
        Ok(Self {
            num_attention_heads,
            attention_head_size: hidden_size / num_attention_heads,
            query,
            key,
            value,
            sr,
        })
    }

    /// (B, N, C) -> (B, heads, N, head_size)
    fn transpose_for_scores(&self, x: &Tensor) -> Result<Tensor> {
        let (b, n, _) = x.dims3()?;
        x.reshape((b, n, self.num_attention_heads, self.attention_head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
        let (b, n, c) = x.dims3()?;
        let query = self.transpose_for_scores(&self.query.forward(x)?)?;
        let reduced = match &self.sr {
            Some((conv, norm)) => {
                let x = x.transpose(1, 2)?.reshape((b, c, height, width))?;
                let x = conv
                    .forward(&x)?
                    .flatten_from(2)?
                    .transpose(1, 2)?
                    .contiguous()?;
                norm.forward(&x)?
            }
            None => x.clone(),
        };
        let key = self.transpose_for_scores(&self.key.forward(&reduced)?)?;
        let value = self.transpose_for_scores(&self.value.forward(&reduced)?)?;

        let scale = 1.0 / (self.attention_head_size as f64).sqrt();
        let scores = (query.matmul(&key.t()?.contiguous()?)? * scale)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        probs
            .matmul(&value)?
            .transpose(1, 2)?
            .reshape((b, n, c))
    }
}

#[derive(Debug, Clone)]
struct Attention {
    attention: EfficientSelfAttention,
    output: Linear,
}

impl Attention {
    fn new(
        config: &Config,
        hidden_size: usize,
        num_attention_heads: usize,
        sequence_reduction_ratio: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let attention = EfficientSelfAttention::new(
            config,
            hidden_size,
            num_attention_heads,
            sequence_reduction_ratio,
            vb.pp("self"),
        )?;
        let output = linear(hidden_size, hidden_size, vb.pp("output").pp("dense"))?;
        Ok(Self { attention, output })
    }

    fn forward(&self, x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
        let x = self.attention.forward(x, height, width)?;
        self.output.forward(&x)
    }
}

#[derive(Debug, Clone)]
struct MixFfn {
    dense1: Linear,
    dwconv: Conv2d,
    act: Activation,
    dense2: Linear,
}

impl MixFfn {
    fn new(config: &Config, hidden_size: usize, mlp_ratio: usize, vb: VarBuilder) -> Result<Self> {
        let hidden_features = hidden_size * mlp_ratio;
        let dense1 = linear(hidden_size, hidden_features, vb.pp("dense1"))?;
        let dwconv = conv2d(
            hidden_features,
            hidden_features,
            3,
            Conv2dConfig {
                padding: 1,
                groups: hidden_features,
                ..Default::default()
            },
            vb.pp("dwconv").pp("dwconv"),
        )?;
        let dense2 = linear(hidden_features, hidden_size, vb.pp("dense2"))?;
        Ok(Self {
            dense1,
            dwconv,
            act: config.hidden_act.into(),
            dense2,
        })
    }

    fn forward(&self, x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
        let x = self.dense1.forward(x)?;
        let (b, _, c) = x.dims3()?;
        let x = x.transpose(1, 2)?.reshape((b, c, height, width))?;
        let x = self
            .dwconv
            .forward(&x)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;
        let x = self.act.forward(&x)?;
        self.dense2.forward(&x)
    }
}

#[derive(Debug, Clone)]
struct Layer {
    layer_norm_1: LayerNorm,
    attention: Attention,
    layer_norm_2: LayerNorm,
    mlp: MixFfn,
}

impl Layer {
    fn new(config: &Config, block: usize, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_sizes[block];
        let layer_norm_1 = layer_norm(hidden_size, config.layer_norm_eps, vb.pp("layer_norm_1"))?;
        let attention = Attention::new(
            config,
            hidden_size,
            config.num_attention_heads[block],
            config.sr_ratios[block],
            vb.pp("attention"),
        )?;
        let layer_norm_2 = layer_norm(hidden_size, config.layer_norm_eps, vb.pp("layer_norm_2"))?;
        let mlp = MixFfn::new(config, hidden_size, config.mlp_ratios[block], vb.pp("mlp"))?;
        Ok(Self {
            layer_norm_1,
            attention,
            layer_norm_2,
            mlp,
        })
    }

    fn forward(&self, x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
        let attended = self
            .attention
            .forward(&self.layer_norm_1.forward(x)?, height, width)?;
        let x = (x + attended)?;
        let mixed = self
            .mlp
            .forward(&self.layer_norm_2.forward(&x)?, height, width)?;
        x + mixed
    }
}

#[derive(Debug, Clone)]
struct Encoder {
    patch_embeddings: Vec<OverlapPatchEmbeddings>,
    blocks: Vec<Vec<Layer>>,
    layer_norms: Vec<LayerNorm>,
}

impl Encoder {
    fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let mut patch_embeddings = Vec::with_capacity(config.num_encoder_blocks);
        let mut blocks = Vec::with_capacity(config.num_encoder_blocks);
        let mut layer_norms = Vec::with_capacity(config.num_encoder_blocks);
        for i in 0..config.num_encoder_blocks {
            let in_channels = if i == 0 {
                config.num_channels
            } else {
                config.hidden_sizes[i - 1]
            };
            patch_embeddings.push(OverlapPatchEmbeddings::new(
                config,
                config.patch_sizes[i],
                config.strides[i],
                in_channels,
                config.hidden_sizes[i],
                vb.pp(format!("patch_embeddings.{i}")),
            )?);
            let block = (0..config.depths[i])
                .map(|j| Layer::new(config, i, vb.pp(format!("block.{i}.{j}"))))
                .collect::<Result<Vec<_>>>()?;
            blocks.push(block);
            layer_norms.push(layer_norm(
                config.hidden_sizes[i],
                config.layer_norm_eps,
                vb.pp(format!("layer_norm.{i}")),
            )?);
        }
        Ok(Self {
            patch_embeddings,
            blocks,
            layer_norms,
        })
    }

    /// one (B, hidden_i, H_i, W_i) feature map per encoder block
    fn forward(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let mut hidden_states = Vec::with_capacity(self.blocks.len());
        let mut x = x.clone();
        for ((embeddings, block), norm) in self
            .patch_embeddings
            .iter()
            .zip(&self.blocks)
            .zip(&self.layer_norms)
        {
            let (mut h, height, width) = embeddings.forward(&x)?;
            for layer in block {
                h = layer.forward(&h, height, width)?;
            }
            let h = norm.forward(&h)?;
            let (b, _, c) = h.dims3()?;
            x = h.transpose(1, 2)?.reshape((b, c, height, width))?;
            hidden_states.push(x.clone());
        }
        Ok(hidden_states)
    }
}

#[derive(Debug, Clone)]
struct DecodeHead {
    linear_c: Vec<Linear>,
    linear_fuse: Conv2d,
    batch_norm: BatchNorm,
    classifier: Conv2d,
}

impl DecodeHead {
    fn new(config: &Config, num_labels: usize, vb: VarBuilder) -> Result<Self> {
        let linear_c = config
            .hidden_sizes
            .iter()
            .enumerate()
            .map(|(i, &hidden_size)| {
                linear(
                    hidden_size,
                    config.decoder_hidden_size,
                    vb.pp(format!("linear_c.{i}.proj")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let linear_fuse = conv2d_no_bias(
            config.decoder_hidden_size * config.num_encoder_blocks,
            config.decoder_hidden_size,
            1,
            Conv2dConfig::default(),
            vb.pp("linear_fuse"),
        )?;
        let batch_norm = batch_norm(config.decoder_hidden_size, 1e-5, vb.pp("batch_norm"))?;
        let classifier = conv2d(
            config.decoder_hidden_size,
            num_labels,
            1,
            Conv2dConfig::default(),
            vb.pp("classifier"),
        )?;
        Ok(Self {
            linear_c,
            linear_fuse,
            batch_norm,
            classifier,
        })
    }

    fn forward(&self, hidden_states: &[Tensor]) -> Result<Tensor> {
        let (_, _, height, width) = match hidden_states.first() {
            Some(first) => first.dims4()?,
            None => candle_core::bail!("decode head needs at least one feature map"),
        };
        let mut projected = Vec::with_capacity(hidden_states.len());
        for (state, mlp) in hidden_states.iter().zip(&self.linear_c) {
            let (b, _, h, w) = state.dims4()?;
            let x = mlp.forward(&state.flatten_from(2)?.transpose(1, 2)?.contiguous()?)?;
            let (_, _, c) = x.dims3()?;
            let x = x.transpose(1, 2)?.reshape((b, c, h, w))?;
            let x = if (h, w) == (height, width) {
                x
            } else {
                x.upsample_nearest2d(height, width)?
            };
            projected.push(x);
        }
        projected.reverse();
        let x = Tensor::cat(&projected, 1)?;
        let x = self.linear_fuse.forward(&x)?;
        let x = self.batch_norm.forward_t(&x, false)?.relu()?;
        self.classifier.forward(&x)
    }
}

#[derive(Debug, Clone)]
pub struct SemanticSegmentationModel {
    encoder: Encoder,
    decode_head: DecodeHead,
}

impl SemanticSegmentationModel {
    pub fn new(config: &Config, num_labels: usize, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder::new(config, vb.pp("segformer").pp("encoder"))?;
        let decode_head = DecodeHead::new(config, num_labels, vb.pp(DECODE_HEAD_MARKER))?;
        Ok(Self {
            encoder,
            decode_head,
        })
    }
}

impl Module for SemanticSegmentationModel {
    /// (B, C, H, W) -> (B, num_labels, H / 4, W / 4) logits
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden_states = self.encoder.forward(x)?;
        self.decode_head.forward(&hidden_states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

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

    #[test]
    fn test_segformer_config_from_json() {
        let config = r#"{
            "architectures": ["SegformerForSemanticSegmentation"],
            "attention_probs_dropout_prob": 0.0,
            "classifier_dropout_prob": 0.1,
            "decoder_hidden_size": 256,
            "depths": [2, 2, 2, 2],
            "drop_path_rate": 0.1,
            "hidden_act": "gelu",
            "hidden_dropout_prob": 0.0,
            "hidden_sizes": [32, 64, 160, 256],
            "initializer_range": 0.02,
            "layer_norm_eps": 1e-06,
            "mlp_ratios": [4, 4, 4, 4],
            "model_type": "segformer",
            "num_attention_heads": [1, 2, 5, 8],
            "num_channels": 3,
            "num_encoder_blocks": 4,
            "patch_sizes": [7, 3, 3, 3],
            "reshape_last_stage": true,
            "sr_ratios": [8, 4, 2, 1],
            "strides": [4, 2, 2, 2]
        }"#;
        let config: Config = serde_json::from_str(config).unwrap();
        assert_eq!(config, Config::mit_b0());
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_config_check_rejects_ragged_blocks() {
        let mut config = tiny_config();
        config.depths.push(1);
        assert!(config.check().is_err());
        let mut config = tiny_config();
        config.num_attention_heads = vec![3, 2];
        assert!(config.check().is_err());
    }

    #[test]
    fn test_parameter_names() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        SemanticSegmentationModel::new(&tiny_config(), 3, vb)?;
        let data = varmap.data().lock().unwrap();
        for name in [
            "segformer.encoder.patch_embeddings.0.proj.weight",
            "segformer.encoder.block.0.0.attention.self.sr.weight",
            "segformer.encoder.block.1.0.mlp.dwconv.dwconv.weight",
            "segformer.encoder.layer_norm.1.bias",
            "decode_head.linear_c.1.proj.weight",
            "decode_head.batch_norm.running_var",
            "decode_head.classifier.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert!(!data.contains_key("segformer.encoder.block.1.0.attention.self.sr.weight"));
        assert_eq!(data["decode_head.classifier.weight"].dims(), &[3, 8, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_segformer_forward_shape() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = SemanticSegmentationModel::new(&tiny_config(), 3, vb)?;
        let x = Tensor::rand(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu)?;
        let logits = model.forward(&x)?;
        assert_eq!(logits.dims(), &[2, 3, 8, 8]);
        Ok(())
    }
}
