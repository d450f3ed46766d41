use crate::fetcher::PaginatedFetcher;
use crate::gameflip::auth::Credentials;
use crate::gameflip::client::{ApiClient, ApiError};
use crate::gameflip::config::{STATUS_DRAFT, STATUS_ONSALE};
use crate::gameflip::listings::{self, PatchOp};
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

const OPERATION_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("delete threshold must be a non-negative number of hours, got {0}")]
    InvalidThreshold(f64),
    #[error("failed to retrieve account id: {0}")]
    OwnerLookup(#[source] ApiError),
    #[error("failed to enumerate listings: {0}")]
    Scan(#[source] ApiError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub drafted: usize,
    pub deleted: usize,
    pub failed_draft: usize,
    pub failed_delete: usize,
    /// On-sale listings without a readable creation time.
    pub skipped: usize,
}

/// Takes every on-sale listing older than `threshold_hours` off sale and
/// deletes it. A listing must be drafted before the remote accepts a delete.
pub async fn delete_stale(
    api: &ApiClient,
    fetcher: &PaginatedFetcher,
    credentials: &Credentials,
    threshold_hours: f64,
) -> Result<CleanupReport, CleanupError> {
    if !threshold_hours.is_finite() || threshold_hours < 0.0 {
        return Err(CleanupError::InvalidThreshold(threshold_hours));
    }
    let owner_id = listings::fetch_owner_id(api, credentials)
        .await
        .map_err(CleanupError::OwnerLookup)?;
    let candidates = fetcher
        .fetch_all(credentials, &owner_id, STATUS_ONSALE)
        .await
        .map_err(CleanupError::Scan)?;
    info!(
        target = "mcflip.api",
        %owner_id,
        candidates = candidates.len(),
        threshold_hours,
        "cleanup_started"
    );

    let mut report = CleanupReport::default();
    let draft_ops = [PatchOp::replace("/status", STATUS_DRAFT)];
    for listing in &candidates {
        let Some(created) = listing.created_at() else {
            warn!(target = "mcflip.api", listing_id = %listing.id, "cleanup_missing_created");
            report.skipped += 1;
            continue;
        };
        let age_hours = (Utc::now() - created).num_seconds() as f64 / 3600.0;
        if age_hours <= threshold_hours {
            continue;
        }

        match listings::patch_listing(api, credentials, &listing.id, &draft_ops).await {
            Ok(()) => {
                report.drafted += 1;
                sleep(OPERATION_DELAY).await;
                match listings::delete_listing(api, credentials, &listing.id).await {
                    Ok(()) => {
                        report.deleted += 1;
                        info!(target = "mcflip.api", listing_id = %listing.id, age_hours, "listing_deleted");
                    }
                    Err(err) => {
                        report.failed_delete += 1;
                        error!(target = "mcflip.api", listing_id = %listing.id, error = %err, "delete_failed");
                    }
                }
            }
            Err(err) => {
                report.failed_draft += 1;
                error!(target = "mcflip.api", listing_id = %listing.id, error = %err, "draft_failed");
            }
        }
        sleep(OPERATION_DELAY).await;
    }

    info!(target = "mcflip.api", ?report, "cleanup_completed");
    Ok(report)
}
