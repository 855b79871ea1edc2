use crate::{env_or_default, env_required, ConfigError, FromEnv};

/// MongoDB configuration for the entity document store
#[derive(Clone, Debug)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

impl MongoConfig {
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
        }
    }
}

impl FromEnv for MongoConfig {
    /// Requires MONGO_URI; MONGO_DATABASE defaults to "campaigns"
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            uri: env_required("MONGO_URI")?,
            database: env_or_default("MONGO_DATABASE", "campaigns"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mongo_config_from_env_success() {
        temp_env::with_vars(
            [
                ("MONGO_URI", Some("mongodb://localhost:27017/?replicaSet=rs0")),
                ("MONGO_DATABASE", Some("worlds")),
            ],
            || {
                let config = MongoConfig::from_env().unwrap();
                assert_eq!(config.uri, "mongodb://localhost:27017/?replicaSet=rs0");
                assert_eq!(config.database, "worlds");
            },
        );
    }

    #[test]
    fn test_mongo_config_default_database() {
        temp_env::with_vars(
            [
                ("MONGO_URI", Some("mongodb://localhost:27017")),
                ("MONGO_DATABASE", None),
            ],
            || {
                let config = MongoConfig::from_env().unwrap();
                assert_eq!(config.database, "campaigns");
            },
        );
    }

    #[test]
    fn test_mongo_config_from_env_missing() {
        temp_env::with_var_unset("MONGO_URI", || {
            let err = MongoConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("MONGO_URI"));
        });
    }
}
