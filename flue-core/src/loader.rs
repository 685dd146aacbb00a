use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, ModelLike};

/// Downloads (or reuses cached) weights and builds a model on the chosen device.
pub trait Loader {
    type Model: ModelLike;
    type Variant;

    fn load(
        variant: Self::Variant,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
