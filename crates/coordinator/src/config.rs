use std::net::SocketAddr;

/// Runtime configuration, resolved once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: SocketAddr,
    pub swarm_addr: SocketAddr,
    pub database_url: String,
    pub jwt_secret: String,
    pub internal_api_key: String,
    pub account_service_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let http_port = env_port("HTTP_PORT", 3003);
        let swarm_port = env_port("SWARM_PORT", 3002);

        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            swarm_addr: SocketAddr::from(([0, 0, 0, 0], swarm_port)),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/chunkhive.db".to_string()),
            jwt_secret: std::env::var("SECRET_KEY")
                .unwrap_or_else(|_| "YOUR_SUPER_SECRET_KEY".to_string()),
            internal_api_key: std::env::var("INTERNAL_API_KEY")
                .unwrap_or_else(|_| "YOUR_INTERNAL_SERVICE_KEY".to_string()),
            account_service_url: std::env::var("ACCOUNT_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:3001".to_string()),
        }
    }
}

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
