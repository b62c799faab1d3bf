//! HuggingFace API

use crate::error::Result;
use candle_core::Device;
use hf_hub::api::sync::ApiBuilder;
use log::debug;
use std::path::PathBuf;

pub struct HfModelInfo {
    pub model_type: &'static str,
    pub repo: String,
    /// `None` builds from the config alone, leaving parameters randomly initialised.
    pub weights_file: Option<String>,
    pub config_file: String,
}

pub trait HfModel {
    type Options;

    fn from_hf(info: HfModelInfo, options: &Self::Options, device: &Device) -> Result<Self>
    where
        Self: Sized,
    {
        let api = ApiBuilder::new().with_progress(true).build()?;
        let repo = api.model(info.repo.clone());
        debug!(
            "using {} model from HuggingFace repo '{}'",
            info.model_type, info.repo,
        );
        let weights_file = match &info.weights_file {
            Some(weights_file) => {
                debug!("using {} weights file '{}'", info.model_type, weights_file);
                Some(repo.get(weights_file)?)
            }
            None => None,
        };
        let config_file = repo.get(&info.config_file)?;
        debug!(
            "using {} config file '{}'",
            info.model_type, info.config_file
        );
        Self::from_hf_files(config_file, weights_file, options, device)
    }

    fn from_hf_files(
        config: PathBuf,
        weights: Option<PathBuf>,
        options: &Self::Options,
        device: &Device,
    ) -> Result<Self>
    where
        Self: Sized;
}
