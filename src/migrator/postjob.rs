//! Cleanup after every table migrated. Failures here are logged and swallowed:
//! the data is already in place.

use super::prepare::drop_primary_key;
use crate::migration_log::MigrationLog;
use crate::target::TargetStore;
use log::{info, warn};

/// Drops the keys synthesized for dedup. Returns how many were dropped.
pub async fn drop_temporary_keys<S: TargetStore, L: MigrationLog>(store: &S, log: &L) -> usize {
    let keys = match log.temporary_keys().await {
        Ok(keys) => keys,
        Err(e) => {
            warn!("Failed to list temporary keys: {}", e);
            return 0;
        }
    };

    let mut dropped = 0;
    for (database, table) in keys {
        // the flag outlives a failed drop so the next post-job retries it
        if let Err(e) = drop_primary_key(store, &database, &table).await {
            warn!("Failed to drop temporary key of {}.{}: {}", database, table, e);
            continue;
        }
        info!("Dropped temporary key of {}.{}", database, table);
        dropped += 1;
        if let Err(e) = log.clear_temporary_key(&database, &table).await {
            warn!("Failed to clear temporary key flag of {}.{}: {}", database, table, e);
        }
    }
    dropped
}

pub async fn drop_meta<L: MigrationLog>(log: &L) {
    match log.discard().await {
        Ok(()) => info!("Discarded {} migration log", log.backend()),
        Err(e) => warn!("Failed to discard {} migration log: {}", log.backend(), e),
    }
}
