use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::flux::FluxVariant;
use crate::{DeviceMap, FluxLoader, Loader, SharedModel};

/// Supported model families, detected from the model name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelVariant {
    Flux(FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("DEV") {
                FluxVariant::Dev
            } else {
                FluxVariant::Schnell
            }))
        } else {
            None
        }
    }
}

/// Load a model based on its name and wrap it for sharing across sessions.
pub async fn load_model(model_name: &str, api: Api, device_map: DeviceMap) -> Result<SharedModel> {
    let variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model: {}", model_name))?;

    info!(model = model_name, ?variant, ?device_map, "Loading model");

    match variant {
        ModelVariant::Flux(flux_variant) => {
            let model = FluxLoader::load(flux_variant, api, device_map).await?;
            Ok(SharedModel::new(model))
        }
    }
}
