#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use candle_core::Device;
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{debug, info};
use segtrace::export::{export, ExportMode};
use segtrace::hf::{HfModel, HfModelInfo};
use segtrace::segformer::{BuildOptions, Config, Segformer};
use std::path::PathBuf;

#[derive(Debug, ValueEnum, Clone, Copy)]
enum DeviceType {
    Cpu,
    Gpu,
    #[cfg(feature = "metal")]
    Metal,
}

impl TryInto<Device> for DeviceType {
    type Error = candle_core::Error;

    fn try_into(self) -> Result<Device, Self::Error> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Gpu => Device::new_cuda(0),
            #[cfg(feature = "metal")]
            Self::Metal => Device::new_metal(0),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Export a Segformer model for a segmentation task", long_about = None)]
struct Cli {
    #[arg(
        long,
        conflicts_with = "model_repo",
        help = "segformer config.json, defaults to the built-in mit-b0 config"
    )]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 2, help = "number of classes")]
    nclasses: usize,

    #[arg(
        long,
        alias = "image_size",
        default_value_t = 512,
        help = "size of the input image"
    )]
    image_size: usize,

    #[arg(long, help = "segformer pretrained weights (.safetensors or .pth)")]
    weights: Option<PathBuf>,

    #[arg(
        long,
        help = "hugging face repo to fetch the config, and weights unless --weights is given, from"
    )]
    model_repo: Option<String>,

    #[arg(
        long,
        default_value = "model.safetensors",
        help = "weights file name in the hugging face repo"
    )]
    weights_file_name: String,

    #[arg(
        long,
        default_value = "config.json",
        help = "config file name in the hugging face repo"
    )]
    config_file_name: String,

    #[arg(long, help = "trace the model instead of scripting it")]
    trace: bool,

    #[arg(
        short,
        long,
        alias = "output_dir",
        default_value = ".",
        help = "output directory"
    )]
    output_dir: PathBuf,

    #[arg(long = "device", value_enum, default_value_t = DeviceType::Cpu)]
    device_type: DeviceType,

    #[arg(short, long, help = "whether to enable verbose mode")]
    verbose: bool,
}

const NUM_CHANNELS: usize = 3;

impl Cli {
    fn build_options(&self) -> BuildOptions {
        BuildOptions {
            num_channels: NUM_CHANNELS,
            image_size: self.image_size,
            num_classes: self.nclasses,
        }
    }

    /// Build on the cpu and restore weights there, the target device comes later.
    fn get_model(&self) -> segtrace::Result<Segformer> {
        let options = self.build_options();
        let mut segformer = match (&self.model_repo, &self.config) {
            (Some(repo), _) => {
                let info = HfModelInfo {
                    model_type: "segformer",
                    repo: repo.clone(),
                    weights_file: match self.weights {
                        Some(_) => None,
                        None => Some(self.weights_file_name.clone()),
                    },
                    config_file: self.config_file_name.clone(),
                };
                Segformer::from_hf(info, &options, &Device::Cpu)?
            }
            (None, Some(config)) => {
                debug!("using config file {:?}", config);
                Segformer::from_config_file(config, options, &Device::Cpu)?
            }
            (None, None) => {
                debug!("using built-in mit-b0 config");
                Segformer::new(Config::mit_b0(), options, &Device::Cpu)?
            }
        };
        if let Some(weights) = &self.weights {
            segformer.load_weights(weights)?;
        }
        Ok(segformer)
    }
}

fn main() -> segtrace::Result<()> {
    let args = Cli::parse();
    let env = Env::new().filter_or("SEGTRACE_LOG", if args.verbose { "debug" } else { "info" });
    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Stdout)
        .init();

    let device: Device = args.device_type.try_into()?;
    debug!("using device {:?}", device);

    let model = args.get_model()?.to_device(&device)?;

    let mode = if args.trace {
        ExportMode::Trace
    } else {
        ExportMode::Script
    };
    let exported = export(&model, mode, &args.output_dir)?;
    info!(
        "{:?} export written to {:?} and {:?}",
        mode, exported.weights, exported.manifest
    );
    Ok(())
}
