//! Vector Sync CLI
//!
//! Administrative entry point for index lifecycle, entity synchronization
//! and reconciliation. Every command prints its result as JSON.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use domain_vector_sync::embedding::EmbeddingCache;
use domain_vector_sync::{
    CachingEmbeddingProvider, CreateIndexOptions, EmbeddingProvider, EntityType,
    MongoDocumentStore, QdrantIndexService, SyncOptions, TtlCache, VectorSyncService,
    VertexAIProvider,
};
use eyre::{Result, WrapErr};
use serde::Serialize;
use tracing::info;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "vector-sync")]
#[command(about = "Keep entity vectors and their indexes in sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an index for every entity type
    CreateIndexes {
        /// Schema version (defaults to VECTOR_SCHEMA_VERSION)
        #[arg(short, long)]
        schema_version: Option<u32>,

        /// Activate each index once created
        #[arg(short, long)]
        activate: bool,
    },

    /// Create the index of one entity type
    CreateIndex {
        entity_type: EntityType,

        #[arg(short, long)]
        schema_version: Option<u32>,

        /// Replace an existing index
        #[arg(short, long)]
        recreate: bool,

        #[arg(short, long)]
        activate: bool,
    },

    /// Deploy an index to the environment's endpoint
    Deploy {
        entity_type: EntityType,

        #[arg(short, long)]
        schema_version: Option<u32>,
    },

    /// Make a schema version the active index of its entity type
    Activate {
        entity_type: EntityType,

        #[arg(short, long)]
        schema_version: u32,
    },

    /// Delete an inactive index
    DeleteIndex {
        entity_type: EntityType,

        #[arg(short, long)]
        schema_version: u32,
    },

    /// Sync one entity
    Sync {
        entity_type: EntityType,
        entity_id: String,

        /// Re-embed even when already synced
        #[arg(short, long)]
        force: bool,
    },

    /// Sync every unsynced entity of a type, or of all types
    SyncAll {
        entity_type: Option<EntityType>,

        #[arg(short, long)]
        force: bool,
    },

    /// Remove an entity's vector and clear its sync state
    DeleteVectors {
        entity_type: EntityType,
        entity_id: String,
    },

    /// Compare entities against the active index
    Reconcile {
        entity_type: Option<EntityType>,

        /// Resync drifting entities and remove orphaned vectors
        #[arg(short, long)]
        repair: bool,
    },

    /// Show index statistics
    Stats { entity_type: Option<EntityType> },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn build_service(config: Config) -> Result<VectorSyncService> {
    info!("Connecting to MongoDB...");
    let store = MongoDocumentStore::connect(&config.mongo)
        .await
        .wrap_err("MongoDB connection failed")?;

    let index = QdrantIndexService::new(&config.qdrant).wrap_err("Qdrant client setup failed")?;

    let tokens = Arc::new(TtlCache::new(Duration::from_secs(3600), 4));
    let vertex = VertexAIProvider::new(config.vertex.clone(), tokens)
        .wrap_err("Vertex AI client setup failed")?;

    let ttl = config.sync.embedding_cache_ttl;
    let embeddings: Arc<dyn EmbeddingProvider> = if ttl.is_zero() {
        Arc::new(vertex)
    } else {
        let cache: Arc<EmbeddingCache> = Arc::new(TtlCache::new(ttl, 10_000));
        Arc::new(CachingEmbeddingProvider::new(vertex, cache))
    };

    VectorSyncService::new(config.sync, Arc::new(store), Arc::new(index), embeddings)
        .wrap_err("Invalid index schema configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();
    let config = Config::from_env().wrap_err("Failed to load configuration")?;
    let default_version = config.sync.schema_version;
    let service = build_service(config).await?;

    match cli.command {
        Commands::CreateIndexes {
            schema_version,
            activate,
        } => {
            let report = service
                .indexes()
                .create_all_indexes(
                    schema_version.unwrap_or(default_version),
                    CreateIndexOptions {
                        make_active: activate,
                        ..Default::default()
                    },
                )
                .await;
            print_json(&report)?;
        }

        Commands::CreateIndex {
            entity_type,
            schema_version,
            recreate,
            activate,
        } => {
            let metadata = service
                .indexes()
                .create_index(
                    entity_type,
                    schema_version.unwrap_or(default_version),
                    CreateIndexOptions {
                        recreate,
                        make_active: activate,
                        custom_structure: None,
                    },
                )
                .await?;
            print_json(&metadata)?;
        }

        Commands::Deploy {
            entity_type,
            schema_version,
        } => {
            let metadata = service
                .indexes()
                .deploy_index_to_endpoint(entity_type, schema_version.unwrap_or(default_version))
                .await?;
            print_json(&metadata)?;
        }

        Commands::Activate {
            entity_type,
            schema_version,
        } => {
            service
                .indexes()
                .set_active_index(entity_type, schema_version)
                .await?;
            let active = service.indexes().get_active_index(entity_type).await?;
            print_json(&active)?;
        }

        Commands::DeleteIndex {
            entity_type,
            schema_version,
        } => {
            service
                .indexes()
                .delete_index(entity_type, schema_version)
                .await?;
            print_json(&serde_json::json!({
                "deleted": service.indexes().index_key(entity_type, schema_version)
            }))?;
        }

        Commands::Sync {
            entity_type,
            entity_id,
            force,
        } => {
            let options = SyncOptions {
                force,
                ..Default::default()
            };
            let result = service
                .synchronizer()
                .sync_entity(&entity_id, entity_type, options)
                .await?;
            print_json(&result)?;
        }

        Commands::SyncAll { entity_type, force } => {
            let types = entity_type.map_or_else(|| EntityType::ALL.to_vec(), |t| vec![t]);
            let options = service.config().bulk_options(force);

            let mut summaries = Vec::new();
            for entity_type in types {
                summaries.push(
                    service
                        .synchronizer()
                        .sync_all_entities(entity_type, options)
                        .await?,
                );
            }
            print_json(&summaries)?;
        }

        Commands::DeleteVectors {
            entity_type,
            entity_id,
        } => {
            let deleted = service
                .synchronizer()
                .delete_entity_vectors(&entity_id, entity_type)
                .await?;
            print_json(&serde_json::json!({ "entityId": entity_id, "deleted": deleted }))?;
        }

        Commands::Reconcile {
            entity_type,
            repair,
        } => {
            let reports = match entity_type {
                Some(entity_type) => vec![
                    service
                        .reconciler()
                        .reconcile(entity_type, repair)
                        .await?,
                ],
                None => service.reconciler().reconcile_all(repair).await,
            };
            print_json(&reports)?;
        }

        Commands::Stats { entity_type } => {
            let stats = service.indexes().get_index_statistics(entity_type).await?;
            print_json(&stats)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_entity_type_argument_is_case_insensitive() {
        let cli = Cli::try_parse_from(["vector-sync", "sync", "character", "c-1", "--force"]).unwrap();
        match cli.command {
            Commands::Sync {
                entity_type,
                entity_id,
                force,
            } => {
                assert_eq!(entity_type, EntityType::Character);
                assert_eq!(entity_id, "c-1");
                assert!(force);
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn test_activate_requires_schema_version() {
        assert!(Cli::try_parse_from(["vector-sync", "activate", "quest"]).is_err());
        assert!(Cli::try_parse_from(["vector-sync", "activate", "quest", "-s", "2"]).is_ok());
    }
}
