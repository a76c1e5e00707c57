//! Default location bootstrap.

use stockledger_core::store::StockStore;
use stockledger_core::{DateTime, Location, Result, Utc};

/// Return the default location, creating it under `code` if none exists.
///
/// Meant to run once at startup; the resulting id is handed to the engine
/// through its location resolver.
///
/// # Errors
///
/// Returns a storage error if the location cannot be read or inserted.
pub async fn ensure_default_location<S: StockStore>(
    store: &S,
    code: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Location> {
    if let Some(existing) = store.default_location().await? {
        return Ok(existing);
    }
    let created = store
        .insert_location(&Location::new_default(code, name, now))
        .await?;
    tracing::info!(code = %created.code, id = %created.id, "Default stock location created");
    Ok(created)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use stockledger_testing::InMemoryStockStore;

    #[tokio::test]
    async fn default_location_is_created_once() {
        let store = InMemoryStockStore::new();
        let now = Utc::now();

        let first = ensure_default_location(&store, "MAIN", "Main Warehouse", now).await.unwrap();
        let second = ensure_default_location(&store, "OTHER", "Ignored", now).await.unwrap();

        assert!(first.is_default);
        assert_eq!(first.id, second.id);
        assert_eq!(second.code, "MAIN");
    }
}
