//! Configuration for the vector sync CLI

use core_config::mongodb::MongoConfig;
use core_config::{ConfigError, FromEnv};
use domain_vector_sync::{QdrantConfig, SyncConfig, VertexAIConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub sync: SyncConfig,
    pub mongo: MongoConfig,
    pub qdrant: QdrantConfig,
    pub vertex: VertexAIConfig,
}

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            sync: SyncConfig::from_env()?,
            mongo: MongoConfig::from_env()?,
            qdrant: QdrantConfig::from_env()?,
            vertex: VertexAIConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("MONGO_URI", Some("mongodb://localhost:27017")),
                ("GOOGLE_CLOUD_PROJECT", Some("campaign-tools")),
                ("VECTOR_ENVIRONMENT", Some("staging")),
                ("QDRANT_URL", None),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.sync.environment, "staging");
                assert_eq!(config.vertex.project_id, "campaign-tools");
                assert_eq!(config.mongo.database, "campaigns");
            },
        );
    }

    #[test]
    fn test_config_requires_mongo_uri() {
        temp_env::with_vars(
            [
                ("MONGO_URI", None::<&str>),
                ("GOOGLE_CLOUD_PROJECT", Some("campaign-tools")),
            ],
            || {
                assert!(matches!(
                    Config::from_env(),
                    Err(ConfigError::MissingEnvVar(key)) if key == "MONGO_URI"
                ));
            },
        );
    }
}
