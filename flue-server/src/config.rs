use clap::Parser;

use crate::auth::Credentials;

/// Command line arguments, each with an environment fallback.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Flue image generation server")]
pub struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "FLUE_CPU")]
    pub cpu: bool,

    /// Model variant to use
    #[arg(long, env = "FLUE_MODEL", default_value = "black-forest-labs/FLUX.1-schnell")]
    pub model: String,

    /// Host address to bind the server to
    #[arg(long, env = "FLUE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "FLUE_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Username every client must present
    #[arg(long, env = "FLUE_USERNAME")]
    pub username: String,

    /// Password every client must present
    #[arg(long, env = "FLUE_PASSWORD", hide_env_values = true)]
    pub password: String,
}

impl Args {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.password)
    }
}
