use serde;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Settings {
    pub environment: String,
    pub repos_path: String,
    pub admin_port: u16,
    pub container: ContainerSettings,
    pub caddy: CaddySettings,
    pub github: GithubSettings,
    pub ip_echo_urls: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ContainerSettings {
    pub engine: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub health_timeout_seconds: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CaddySettings {
    pub admin_url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GithubSettings {
    pub api_url: String,
}

impl Settings {
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

impl GithubSettings {
    pub fn from_env() -> Self {
        let api_url = std::env::var("GITHUB_API_URL")
            .unwrap_or_else(|_| "https://api.github.com".to_string());
        GithubSettings { api_url }
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize our configuration reader
    let mut settings = config::Config::default();

    // Add configuration values from a file named `configuration`
    // with the .yaml extension
    settings.merge(config::File::with_name("configuration"))?; // .json, .toml, .yaml, .yml

    // Try to convert the configuration values it read into
    // our Settings type
    let mut config: Settings = settings.try_deserialize()?;

    // The GitHub API base may be overridden per environment
    if std::env::var("GITHUB_API_URL").is_ok() {
        config.github = GithubSettings::from_env();
    }

    Ok(config)
}
