//! Parameter snapshots and the tolerant weight loader
//!
//! A snapshot trained for a different number of classes carries a decode head whose
//! classifier does not fit the freshly built model. The loader first applies the whole
//! snapshot; on a shape mismatch it drops every decode head parameter and tries once more,
//! so the class-count independent encoder weights are always restored.

use crate::error::{Result, SegTraceError, ShapeMismatch};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::Path;

/// Name fragment shared by every parameter of the decode/classification head.
pub const DECODE_HEAD_MARKER: &str = "decode_head";

/// Nested key under which training checkpoints usually keep their parameters.
const STATE_DICT_KEY: &str = "state_dict";

/// Named tensor slots owned by a model.
pub trait ParameterStore {
    /// Names and dims of every slot.
    fn parameter_shapes(&self) -> Result<BTreeMap<String, Vec<usize>>>;

    /// Convert `value` to the dtype and device of the slot `name`, without writing it.
    fn prepare(&self, _name: &str, value: &Tensor) -> Result<Tensor> {
        Ok(value.clone())
    }

    /// Overwrite the slot `name` in place with a prepared value of the right shape.
    fn set_parameter(&mut self, name: &str, value: &Tensor) -> Result<()>;
}

impl ParameterStore for VarMap {
    fn parameter_shapes(&self) -> Result<BTreeMap<String, Vec<usize>>> {
        let data = self
            .data()
            .lock()
            .map_err(|e| SegTraceError::ParameterStore(e.to_string()))?;
        Ok(data
            .iter()
            .map(|(name, var)| (name.clone(), var.dims().to_vec()))
            .collect())
    }

    fn prepare(&self, name: &str, value: &Tensor) -> Result<Tensor> {
        let data = self
            .data()
            .lock()
            .map_err(|e| SegTraceError::ParameterStore(e.to_string()))?;
        let var = data
            .get(name)
            .ok_or_else(|| SegTraceError::ParameterStore(format!("no parameter named {name}")))?;
        Ok(value.to_dtype(var.dtype())?.to_device(var.device())?)
    }

    fn set_parameter(&mut self, name: &str, value: &Tensor) -> Result<()> {
        let data = self
            .data()
            .lock()
            .map_err(|e| SegTraceError::ParameterStore(e.to_string()))?;
        let var = data
            .get(name)
            .ok_or_else(|| SegTraceError::ParameterStore(format!("no parameter named {name}")))?;
        var.set(value)?;
        Ok(())
    }
}

/// An immutable name to tensor mapping read from a weights file.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    tensors: BTreeMap<String, Tensor>,
}

impl FromIterator<(String, Tensor)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Snapshot {
    type Item = (String, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

impl Snapshot {
    /// Read a snapshot from a `.safetensors` file or a PyTorch pickle (`.pt`, `.pth`,
    /// `.bin`, `.ckpt`). Files with another extension are tried as safetensors first.
    pub fn read<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let unreadable = |reason: String| SegTraceError::SnapshotUnreadable {
            path: path.to_path_buf(),
            reason,
        };
        if !path.is_file() {
            return Err(unreadable("no such file".to_string()));
        }
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let tensors = match extension.as_deref() {
            Some("safetensors") => read_safetensors(path, device),
            Some("pt" | "pth" | "bin" | "ckpt") => read_pickle(path, device),
            _ => read_safetensors(path, device).or_else(|e| {
                debug!("{:?} is not a safetensors file ({}), trying pickle", path, e);
                read_pickle(path, device)
            }),
        }
        .map_err(|e| unreadable(e.to_string()))?;
        if tensors.is_empty() {
            return Err(unreadable("file holds no tensors".to_string()));
        }
        debug!("read {} tensors from {:?}", tensors.len(), path);
        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    /// Split off every entry whose name contains `marker`, returning the remaining
    /// snapshot and the dropped names.
    pub fn without_matching(mut self, marker: &str) -> (Self, Vec<String>) {
        let dropped: Vec<String> = self
            .tensors
            .keys()
            .filter(|name| name.contains(marker))
            .cloned()
            .collect();
        for name in &dropped {
            self.tensors.remove(name);
        }
        (self, dropped)
    }
}

fn read_safetensors(path: &Path, device: &Device) -> candle_core::Result<BTreeMap<String, Tensor>> {
    Ok(candle_core::safetensors::load(path, device)?
        .into_iter()
        .collect())
}

fn read_pickle(path: &Path, device: &Device) -> candle_core::Result<BTreeMap<String, Tensor>> {
    let entries = match candle_core::pickle::read_all_with_key(path, Some(STATE_DICT_KEY)) {
        Ok(entries) if !entries.is_empty() => entries,
        Ok(_) => {
            debug!("{:?} has no '{}' entry, reading it flat", path, STATE_DICT_KEY);
            candle_core::pickle::read_all(path)?
        }
        Err(e) => {
            debug!(
                "cannot read '{}' from {:?} ({}), reading it flat",
                STATE_DICT_KEY, path, e
            );
            candle_core::pickle::read_all(path)?
        }
    };
    entries
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
        .collect()
}

/// What a non-strict apply did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Snapshot entries written into the store.
    pub applied: Vec<String>,
    /// Store slots the snapshot did not mention; left as they were.
    pub missing: Vec<String>,
    /// Snapshot entries the store has no slot for; ignored.
    pub unexpected: Vec<String>,
}

/// Apply every snapshot entry the store knows, ignoring the rest.
///
/// All shapes are checked and every value is converted before anything is written, so on
/// error the store is unchanged.
pub fn apply_non_strict<S>(store: &mut S, snapshot: &Snapshot) -> Result<ApplyReport>
where
    S: ParameterStore + ?Sized,
{
    let shapes = store.parameter_shapes()?;
    let mut report = ApplyReport::default();
    let mut mismatches = Vec::new();
    let mut to_apply = Vec::new();
    for (name, tensor) in snapshot.iter() {
        match shapes.get(name) {
            None => report.unexpected.push(name.clone()),
            Some(expected) if expected.as_slice() != tensor.dims() => {
                mismatches.push(ShapeMismatch {
                    name: name.clone(),
                    expected: expected.clone(),
                    found: tensor.dims().to_vec(),
                })
            }
            Some(_) => to_apply.push((name, tensor)),
        }
    }
    if !mismatches.is_empty() {
        return Err(SegTraceError::ShapeMismatch(mismatches));
    }
    let prepared = to_apply
        .into_iter()
        .map(|(name, tensor)| Ok((name, store.prepare(name, tensor)?)))
        .collect::<Result<Vec<_>>>()?;
    for (name, tensor) in prepared {
        store.set_parameter(name, &tensor)?;
        report.applied.push(name.clone());
    }
    report.missing = shapes
        .into_keys()
        .filter(|name| !snapshot.contains(name))
        .collect();
    Ok(report)
}

/// Result of a successful tolerant load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The whole snapshot fit.
    Applied(ApplyReport),
    /// The head entries did not fit and were left out.
    HeadDropped {
        dropped: Vec<String>,
        report: ApplyReport,
    },
}

impl LoadOutcome {
    pub fn report(&self) -> &ApplyReport {
        match self {
            Self::Applied(report) | Self::HeadDropped { report, .. } => report,
        }
    }

    pub fn head_dropped(&self) -> bool {
        matches!(self, Self::HeadDropped { .. })
    }
}

/// Apply `snapshot`, and if a shape mismatch gets in the way, retry once without the
/// entries whose name contains `head_marker`.
///
/// Only a shape mismatch triggers the retry. Any error of the retry is returned as is.
pub fn apply_with_head_fallback<S>(
    store: &mut S,
    snapshot: Snapshot,
    head_marker: &str,
) -> Result<LoadOutcome>
where
    S: ParameterStore + ?Sized,
{
    match apply_non_strict(store, &snapshot) {
        Ok(report) => Ok(LoadOutcome::Applied(report)),
        Err(SegTraceError::ShapeMismatch(mismatches)) => {
            for mismatch in &mismatches {
                debug!("size mismatch for {}", mismatch);
            }
            warn!(
                "pretrained {} may have the wrong number of classes, dropping it and retrying",
                head_marker
            );
            let (filtered, dropped) = snapshot.without_matching(head_marker);
            debug!("dropped {} {} parameters", dropped.len(), head_marker);
            let report = apply_non_strict(store, &filtered)?;
            Ok(LoadOutcome::HeadDropped { dropped, report })
        }
        Err(e) => Err(e),
    }
}

/// Read the snapshot at `path` and apply it to `store` with the decode head fallback.
///
/// The file is fully decoded before the store is touched.
pub fn load_weights<S, P>(store: &mut S, path: P, device: &Device) -> Result<LoadOutcome>
where
    S: ParameterStore + ?Sized,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let snapshot = Snapshot::read(path, device)?;
    info!("loading {} tensors from {:?}", snapshot.len(), path);
    load_snapshot(store, snapshot)
}

/// Apply an already decoded snapshot with the decode head fallback and log what happened.
pub fn load_snapshot<S>(store: &mut S, snapshot: Snapshot) -> Result<LoadOutcome>
where
    S: ParameterStore + ?Sized,
{
    let outcome = apply_with_head_fallback(store, snapshot, DECODE_HEAD_MARKER)?;
    let report = outcome.report();
    info!(
        "applied {} parameters, {} missing, {} unexpected",
        report.applied.len(),
        report.missing.len(),
        report.unexpected.len()
    );
    if report.applied.is_empty() {
        warn!(
            "none of the {} snapshot parameters matches the model, it keeps its initial weights",
            report.unexpected.len()
        );
    }
    if !report.missing.is_empty() {
        debug!("missing parameters: {:?}", report.missing);
    }
    if !report.unexpected.is_empty() {
        debug!("unexpected parameters: {:?}", report.unexpected);
    }
    Ok(outcome)
}
