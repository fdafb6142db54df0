//! Query event persistence (persist worker side)

use super::db::QueryStore;
use super::types::QueryRecord;
use crate::error::IngestError;
use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use std::sync::Arc;

pub struct QueryEventHandler {
    store: Arc<dyn QueryStore>,
}

impl QueryEventHandler {
    pub fn new(store: Arc<dyn QueryStore>) -> Self {
        Self { store }
    }

    /// Validate and persist one query payload, stamped with the current time
    pub async fn save(&self, payload: &str) -> Result<(), IngestError> {
        self.save_at(payload, Utc::now()).await
    }

    /// Validate and persist one query payload with an explicit processing time
    ///
    /// The payload is only checked for JSON syntax and is stored verbatim.
    /// `InvalidDocument` means nothing was written; `StoreWrite` means the
    /// caller should escalate.
    pub async fn save_at(
        &self,
        payload: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        serde_json::from_str::<IgnoredAny>(payload)?;

        self.store
            .insert_query_record(QueryRecord::new(payload, processed_time))
            .await
            .map_err(IngestError::StoreWrite)?;

        log::debug!("Query event saved ({} bytes)", payload.len());
        Ok(())
    }
}
