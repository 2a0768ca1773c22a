//! Configuration validation.

use super::{CachePreset, Config, MigrationConfig, StateBackendKind};
use crate::error::{MigrateError, Result};

/// Largest page the engine will request from a collaborator.
const MAX_BATCH_SIZE: usize = 10_000;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_migration(&config.migration)?;

    if config.state.backend == StateBackendKind::File && config.state.dir.as_os_str().is_empty() {
        return Err(MigrateError::Config(
            "state.dir is required for the file backend".into(),
        ));
    }

    Ok(())
}

/// Validate migration behavior settings.
pub fn validate_migration(migration: &MigrationConfig) -> Result<()> {
    if migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if migration.batch_size > MAX_BATCH_SIZE {
        return Err(MigrateError::Config(format!(
            "migration.batch_size must be at most {}",
            MAX_BATCH_SIZE
        )));
    }

    // Only check if explicitly set
    if let Some(0) = migration.max_workers {
        return Err(MigrateError::Config(
            "migration.max_workers must be at least 1".into(),
        ));
    }

    if migration.retry.max_attempts == 0 {
        return Err(MigrateError::Config(
            "migration.retry.max_attempts must be at least 1".into(),
        ));
    }
    if migration.retry.base_delay_ms > migration.retry.max_delay_ms {
        return Err(MigrateError::Config(
            "migration.retry.base_delay_ms cannot exceed migration.retry.max_delay_ms".into(),
        ));
    }

    if let CachePreset::Custom { ttl_secs: 0 } = migration.cache {
        return Err(MigrateError::Config(
            "migration.cache.custom.ttl_secs must be at least 1".into(),
        ));
    }

    if migration.slow_operation_limit == 0 {
        return Err(MigrateError::Config(
            "migration.slow_operation_limit must be at least 1".into(),
        ));
    }

    Ok(())
}
