//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    /// Browser origins allowed to call the API
    pub cors_origins: Vec<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Authentication
    pub supabase_jwt_secret: String,

    // Feature flags
    pub enable_billing: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_origins: parse_origins(
                &env::var("CORS_ORIGIN").unwrap_or_else(|_| "http://localhost:5173".to_string()),
            ),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            run_migrations: env::var("RUN_MIGRATIONS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),

            // Authentication
            supabase_jwt_secret: {
                let secret = env::var("SUPABASE_JWT_SECRET")
                    .map_err(|_| ConfigError::Missing("SUPABASE_JWT_SECRET"))?;
                // Bearer tokens are only as strong as the HS256 key
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "SUPABASE_JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Feature flags
            enable_billing: env::var("ENABLE_BILLING")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        })
    }
}

/// Comma-separated origin list, blanks dropped
fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const STRONG_SECRET: &str = "test-supabase-secret-at-least-32-characters";

    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("SUPABASE_JWT_SECRET", STRONG_SECRET);
    }

    fn cleanup_config() {
        env::remove_var("DATABASE_URL");
        env::remove_var("SUPABASE_JWT_SECRET");
        env::remove_var("CORS_ORIGIN");
        env::remove_var("ENABLE_BILLING");
    }

    #[test]
    #[serial]
    fn test_minimal_config_uses_defaults() {
        setup_minimal_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.cors_origins, vec!["http://localhost:5173".to_string()]);
        assert_eq!(config.database_max_connections, 10);
        assert!(config.enable_billing);
        assert!(!config.run_migrations);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        cleanup_config();
        env::set_var("SUPABASE_JWT_SECRET", STRONG_SECRET);

        match Config::from_env() {
            Err(ConfigError::Missing("DATABASE_URL")) => {}
            other => panic!("Expected Missing(DATABASE_URL), got: {:?}", other),
        }

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_supabase_secret_validation() {
        setup_minimal_config();

        // === Missing secret ===
        env::remove_var("SUPABASE_JWT_SECRET");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("SUPABASE_JWT_SECRET"))
        ));

        // === Short secret rejected ===
        env::set_var("SUPABASE_JWT_SECRET", "too-short");
        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));

        // === Strong secret accepted ===
        env::set_var("SUPABASE_JWT_SECRET", STRONG_SECRET);
        assert_eq!(Config::from_env().unwrap().supabase_jwt_secret, STRONG_SECRET);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_cors_origins_and_billing_flag() {
        setup_minimal_config();
        env::set_var("CORS_ORIGIN", "https://wedmatch.app, https://admin.wedmatch.app,");
        env::set_var("ENABLE_BILLING", "false");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.cors_origins,
            vec![
                "https://wedmatch.app".to_string(),
                "https://admin.wedmatch.app".to_string()
            ]
        );
        assert!(!config.enable_billing);

        cleanup_config();
    }
}
