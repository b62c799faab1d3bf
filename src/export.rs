//! Export a [Segformer] to a `.safetensors` weights file and a JSON manifest describing
//! how to rebuild and call it.

use crate::error::Result;
use crate::segformer::{Config, Segformer};
use candle_core::Tensor;
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    /// Run the network once on a random input and record the shapes it produced.
    Trace,
    /// Serialise without executing the network.
    Script,
}

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub mode: ExportMode,
    pub num_classes: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub config: Config,
    pub weights_file: String,
    pub input_shape: Option<Vec<usize>>,
    pub output_shape: Option<Vec<usize>>,
    pub parameters: BTreeMap<String, Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct Exported {
    pub weights: PathBuf,
    pub manifest: PathBuf,
    pub contents: Manifest,
}

/// file name stem of an export, e.g. `segformer_b0_cls2`
pub fn artifact_stem(num_classes: usize) -> String {
    format!("segformer_b0_cls{}", num_classes)
}

/// Record the input and output dims of one forward pass on random data.
fn trace(model: &Segformer) -> Result<(Vec<usize>, Vec<usize>)> {
    let options = model.options();
    let input = Tensor::rand(
        0f32,
        1f32,
        (1, options.num_channels, options.image_size, options.image_size),
        model.device(),
    )?;
    info!("tracing segformer with input {:?}...", input.dims());
    let now = Instant::now();
    let output = model.forward(&input)?;
    info!("trace took {:.3}s", now.elapsed().as_secs_f32());
    Ok((input.dims().to_vec(), output.dims().to_vec()))
}

/// Write `<stem>.safetensors` and `<stem>.json` under `output_dir`, creating it if needed.
pub fn export(model: &Segformer, mode: ExportMode, output_dir: &Path) -> Result<Exported> {
    let (input_shape, output_shape) = match mode {
        ExportMode::Trace => {
            let (input, output) = trace(model)?;
            (Some(input), Some(output))
        }
        ExportMode::Script => (None, None),
    };

    let parameters = model.parameter_shapes()?;
    for (name, shape) in &parameters {
        info!("{} {:?}", name, shape);
    }

    std::fs::DirBuilder::new().recursive(true).create(output_dir)?;
    let options = model.options();
    let stem = artifact_stem(options.num_classes);
    let weights_file = format!("{stem}.safetensors");
    let weights = output_dir.join(&weights_file);
    model.net().save(&weights)?;
    debug!("weights written to {:?}", weights);

    let contents = Manifest {
        mode,
        num_classes: options.num_classes,
        num_channels: options.num_channels,
        image_size: options.image_size,
        config: model.config().clone(),
        weights_file,
        input_shape,
        output_shape,
        parameters,
    };
    let manifest = output_dir.join(format!("{stem}.json"));
    let mut buf_writer = BufWriter::new(File::create(&manifest)?);
    serde_json::to_writer_pretty(&mut buf_writer, &contents)?;
    writeln!(&mut buf_writer)?;
    buf_writer.flush()?;
    info!("model exported to {:?}", weights);

    Ok(Exported {
        weights,
        manifest,
        contents,
    })
}
