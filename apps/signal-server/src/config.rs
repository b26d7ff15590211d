/// Signaling server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the signaling server binds to.
    pub port: u16,
    /// Origins allowed by the CORS layer.
    pub allowed_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables. Both variables have
    /// defaults, so this never fails.
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("SIGNAL_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| vec!["http://localhost:4200".to_string()]),
        }
    }
}
