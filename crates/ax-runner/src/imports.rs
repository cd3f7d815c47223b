// Background price imports into the local store

use std::sync::Arc;

use ax_data::PriceNormalizer;
use ax_store::{ImportStatus, PriceImport, Store};
use ax_types::{invalid_parameter, AxResult, DataError, Interval};
use chrono::NaiveDate;
use tracing::{error, info};

pub struct ImportJob {
    store: Arc<Store>,
    normalizer: Option<PriceNormalizer>,
}

impl ImportJob {
    pub fn new(store: Arc<Store>, normalizer: Option<PriceNormalizer>) -> Self {
        Self { store, normalizer }
    }

    /// Record a pending import after checking its window.
    pub fn create(
        &self,
        owner: &str,
        name: &str,
        asset: &str,
        interval: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> AxResult<PriceImport> {
        if asset.trim().is_empty() {
            return Err(invalid_parameter!("asset", "must not be empty"));
        }
        let interval = Interval::parse(interval)?;
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(invalid_parameter!("start", "start date {} is after end date {}", start, end));
            }
        }
        self.store.create_import(owner, name, asset.trim(), interval, start, end)
    }

    /// Fetch and store the bars of a pending import.
    ///
    /// On failure the import is marked failed with the error text and the
    /// error is returned as well.
    pub async fn run(&self, import_id: i64) -> AxResult<PriceImport> {
        let import = self.store.get_import(import_id)?;
        self.store.set_import_status(import_id, ImportStatus::InProgress, None)?;
        info!(import_id, asset = %import.asset, interval = %import.interval, "Importing prices");

        match self.fetch_and_store(&import).await {
            Ok(stored) => {
                self.store.set_import_status(import_id, ImportStatus::Completed, None)?;
                info!(import_id, bars = stored, "Import completed");
                self.store.get_import(import_id)
            }
            Err(err) => {
                error!(import_id, error = %err, "Import failed");
                self.store
                    .set_import_status(import_id, ImportStatus::Failed, Some(&err.to_string()))?;
                Err(err)
            }
        }
    }

    async fn fetch_and_store(&self, import: &PriceImport) -> AxResult<usize> {
        let normalizer = self.normalizer.as_ref().ok_or_else(|| {
            DataError::SourceNotFound("no upstream price provider is configured for imports".to_string())
        })?;
        let series = normalizer
            .fetch(&import.asset, import.interval.as_str(), import.start, import.end)
            .await?;
        self.store.store_bars(import.id, &series)
    }
}
