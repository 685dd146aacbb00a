pub mod device_map;
pub mod error;
pub mod gobig;
pub mod loader;
mod loader_factory;
pub mod mask;
pub mod model;
pub mod plan;
pub mod progress;
pub mod request;
pub mod scheduler;
pub mod upscale;
mod util;

pub mod flux;

pub use device_map::*;
pub use error::*;
pub use flux::{FluxLoader, FluxModel, FluxVariant};
pub use loader::*;
pub use loader_factory::*;
pub use mask::*;
pub use model::*;
pub use plan::*;
pub use progress::*;
pub use request::*;
pub use scheduler::*;
pub use upscale::*;
pub(crate) use util::*;
