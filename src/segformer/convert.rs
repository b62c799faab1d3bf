//! Rename checkpoints trained with the SegFormer (mmseg) code base (`backbone.block1.0.attn.q`,
//! `decode_head.linear_pred`, ...) to the HuggingFace layout the model is built with.

use crate::error::Result;
use crate::weights::Snapshot;
use candle_core::Tensor;
use log::debug;

const KV: &str = "attention.self.kv";

/// `patch_embed3` with prefix `patch_embed` -> 2
fn numbered(segment: &str, prefix: &str) -> Option<usize> {
    segment
        .strip_prefix(prefix)?
        .parse::<usize>()
        .ok()?
        .checked_sub(1)
}

fn encoder_name(stage: &str, tail: &[&str]) -> Option<String> {
    if let Some(i) = numbered(stage, "patch_embed") {
        let tail = match tail {
            ["proj", param] => format!("proj.{param}"),
            ["norm", param] => format!("layer_norm.{param}"),
            _ => return None,
        };
        return Some(format!("segformer.encoder.patch_embeddings.{i}.{tail}"));
    }
    if let Some(i) = numbered(stage, "block") {
        let [j, rest @ ..] = tail else {
            return None;
        };
        let rest = match rest {
            ["norm1", param] => format!("layer_norm_1.{param}"),
            ["norm2", param] => format!("layer_norm_2.{param}"),
            ["attn", "q", param] => format!("attention.self.query.{param}"),
            ["attn", "kv", param] => format!("{KV}.{param}"),
            ["attn", "sr", param] => format!("attention.self.sr.{param}"),
            ["attn", "norm", param] => format!("attention.self.layer_norm.{param}"),
            ["attn", "proj", param] => format!("attention.output.dense.{param}"),
            ["mlp", "fc1", param] => format!("mlp.dense1.{param}"),
            ["mlp", "fc2", param] => format!("mlp.dense2.{param}"),
            ["mlp", "dwconv", "dwconv", param] => format!("mlp.dwconv.dwconv.{param}"),
            _ => return None,
        };
        return Some(format!("segformer.encoder.block.{i}.{j}.{rest}"));
    }
    match (numbered(stage, "norm"), tail) {
        (Some(i), [param]) => Some(format!("segformer.encoder.layer_norm.{i}.{param}")),
        _ => None,
    }
}

fn decode_head_name(stage: &str, tail: &[&str]) -> Option<String> {
    if let Some(i) = numbered(stage, "linear_c") {
        return match tail {
            ["proj", param] => Some(format!("decode_head.linear_c.{i}.proj.{param}")),
            _ => None,
        };
    }
    match (stage, tail) {
        ("linear_fuse", ["conv", param]) => Some(format!("decode_head.linear_fuse.{param}")),
        ("linear_fuse", ["bn", param]) => Some(format!("decode_head.batch_norm.{param}")),
        ("linear_pred", [param]) => Some(format!("decode_head.classifier.{param}")),
        _ => None,
    }
}

/// HuggingFace name of a parameter in the mmseg layout, `None` for any other name.
fn hf_name(name: &str) -> Option<String> {
    let segments: Vec<&str> = name.split('.').collect();
    match segments.as_slice() {
        ["backbone", stage, tail @ ..] => encoder_name(stage, tail),
        ["decode_head", stage, tail @ ..] => decode_head_name(stage, tail),
        _ => None,
    }
}

/// Rename a snapshot in the mmseg SegFormer layout. The fused key/value projection is
/// split in two along its output dim. Snapshots already using HuggingFace names, or holding
/// nothing recognisable, are returned unchanged.
pub fn to_hf_layout(snapshot: Snapshot) -> Result<Snapshot> {
    let already_hf = snapshot
        .iter()
        .any(|(name, _)| name.starts_with("segformer."));
    if already_hf || !snapshot.iter().any(|(name, _)| hf_name(name).is_some()) {
        return Ok(snapshot);
    }
    let mut renamed = Vec::with_capacity(snapshot.len());
    for (name, tensor) in snapshot {
        match hf_name(&name) {
            Some(new_name) => match new_name.split_once(KV) {
                Some((prefix, param)) => {
                    let (key, value) = split_kv(&tensor)?;
                    renamed.push((format!("{prefix}attention.self.key{param}"), key));
                    renamed.push((format!("{prefix}attention.self.value{param}"), value));
                }
                None => renamed.push((new_name, tensor)),
            },
            None => {
                debug!("keeping {} as is", name);
                renamed.push((name, tensor));
            }
        }
    }
    debug!("renamed snapshot to the HuggingFace layout");
    Ok(renamed.into_iter().collect())
}

fn split_kv(tensor: &Tensor) -> Result<(Tensor, Tensor)> {
    let rows = tensor.dim(0)?;
    if rows % 2 != 0 {
        return Err(candle_core::Error::Msg(format!(
            "fused key/value parameter has an odd size {rows}"
        ))
        .into());
    }
    Ok((
        tensor.narrow(0, 0, rows / 2)?,
        tensor.narrow(0, rows / 2, rows / 2)?,
    ))
}
