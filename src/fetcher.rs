//! Concurrent enumeration of a seller's listings.
//!
//! Pages are requested `concurrency` at a time and each batch is joined before
//! the next one is dispatched. Rate-limited pages go to a retry queue that is
//! drained before fresh offsets are attempted. A page that fails for any other
//! reason counts as an empty page instead of aborting the scan, so totals from
//! error-heavy runs are a lower bound.

use crate::gameflip::auth::{self, Credentials};
use crate::gameflip::client::{ApiClient, ApiError, RetryPolicy};
use crate::gameflip::config::{CONTENT_TYPE_JSON, FETCH_CONCURRENCY, PAGE_SIZE, listing_url};
use crate::gameflip::listings::{self, Listing, PageRequest};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub concurrency: usize,
    pub max_retries: u32,
    /// Upper bound on batches processed, retry batches included.
    pub max_pages: usize,
    pub start_offset: usize,
    pub page_size: usize,
    pub retry_delay: Duration,
    pub revalidate_every: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: *FETCH_CONCURRENCY,
            max_retries: 3,
            max_pages: 1000,
            start_offset: 0,
            page_size: PAGE_SIZE,
            retry_delay: Duration::from_millis(500),
            revalidate_every: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageErrorKind {
    RateLimited,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PageResult {
    pub items: Vec<Listing>,
    pub is_last_page: bool,
    pub error_kind: Option<PageErrorKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    LastPage,
    EmptyBatches,
    MaxPages,
}

#[derive(Debug, Clone)]
pub struct FetchReport {
    pub listings: Vec<Listing>,
    pub batches: usize,
    pub pages_requested: usize,
    pub failed_pages: usize,
    pub abandoned_pages: usize,
    pub stop_reason: StopReason,
}

#[derive(Clone)]
pub struct PaginatedFetcher {
    api: ApiClient,
    options: FetchOptions,
}

impl PaginatedFetcher {
    pub fn new(api: ApiClient, options: FetchOptions) -> Self {
        Self { api, options }
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Every listing reachable under the filter. Order follows batch and
    /// offset order, not remote insertion order.
    pub async fn fetch_all(
        &self,
        credentials: &Credentials,
        owner_id: &str,
        status_filter: &str,
    ) -> Result<Vec<Listing>, ApiError> {
        Ok(self
            .scan(credentials, owner_id, status_filter)
            .await?
            .listings)
    }

    /// One public URL per distinct listing content, first occurrence wins.
    pub async fn dedupe(
        &self,
        credentials: &Credentials,
        owner_id: &str,
        status_filter: &str,
    ) -> Result<Vec<String>, ApiError> {
        let listings = self.fetch_all(credentials, owner_id, status_filter).await?;
        Ok(unique_urls(&listings))
    }

    /// Runs the full scan. Only an unusable secret fails the call; page level
    /// errors are folded into the report.
    pub async fn scan(
        &self,
        credentials: &Credentials,
        owner_id: &str,
        status_filter: &str,
    ) -> Result<FetchReport, ApiError> {
        auth::headers(credentials, CONTENT_TYPE_JSON)?;

        let options = &self.options;
        let concurrency = options.concurrency.max(1);
        let page_policy = self.api.policy().clone().surface_rate_limits();

        let mut next_offset = options.start_offset;
        let mut retry_queue: VecDeque<(PageRequest, u32)> = VecDeque::new();
        let mut collected = Vec::new();
        let mut consecutive_empty_batches = 0;
        let mut batches = 0;
        let mut pages_requested = 0;
        let mut failed_pages = 0;
        let mut abandoned_pages = 0;
        let mut end_reached = false;

        let stop_reason = loop {
            if end_reached && retry_queue.is_empty() {
                break StopReason::LastPage;
            }
            if batches >= options.max_pages {
                break StopReason::MaxPages;
            }
            // Every attempt signs its own header; this only re-checks the secret.
            if batches > 0 && batches % options.revalidate_every.max(1) == 0 {
                auth::headers(credentials, CONTENT_TYPE_JSON)?;
                debug!(target = "mcflip.fetch", batches, "auth_secret_revalidated");
            }

            let batch: Vec<(PageRequest, u32)> = if retry_queue.is_empty() {
                let fresh = (0..concurrency)
                    .map(|i| {
                        let mut request = PageRequest::new(
                            owner_id,
                            next_offset + i * options.page_size,
                            status_filter,
                        );
                        request.page_size = options.page_size;
                        (request, 0)
                    })
                    .collect();
                next_offset += concurrency * options.page_size;
                fresh
            } else {
                sleep(options.retry_delay).await;
                let take = retry_queue.len().min(concurrency);
                retry_queue.drain(..take).collect()
            };

            pages_requested += batch.len();
            let results = join_all(
                batch
                    .iter()
                    .map(|(request, _)| self.fetch_page(&page_policy, credentials, request)),
            )
            .await;
            batches += 1;

            let mut new_items = 0;
            let mut rate_limited = false;
            for ((request, retries), result) in batch.into_iter().zip(results) {
                match result.error_kind {
                    Some(PageErrorKind::RateLimited) => {
                        rate_limited = true;
                        if retries < options.max_retries {
                            retry_queue.push_back((request, retries + 1));
                        } else {
                            abandoned_pages += 1;
                            warn!(
                                target = "mcflip.fetch",
                                offset = request.start_offset,
                                retries,
                                "page_abandoned_after_rate_limits"
                            );
                        }
                    }
                    Some(PageErrorKind::Failed) => failed_pages += 1,
                    None => {}
                }
                new_items += result.items.len();
                end_reached |= result.is_last_page;
                collected.extend(result.items);
            }

            debug!(
                target = "mcflip.fetch",
                batch = batches,
                new_items,
                queued = retry_queue.len(),
                "batch_complete"
            );

            if end_reached {
                continue;
            }
            if new_items == 0 && !rate_limited {
                consecutive_empty_batches += 1;
            } else {
                consecutive_empty_batches = 0;
            }
            if consecutive_empty_batches >= 2 {
                break StopReason::EmptyBatches;
            }
        };

        info!(
            target = "mcflip.fetch",
            owner_id,
            status = status_filter,
            total = collected.len(),
            batches,
            failed_pages,
            abandoned_pages,
            ?stop_reason,
            "scan_complete"
        );

        Ok(FetchReport {
            listings: collected,
            batches,
            pages_requested,
            failed_pages,
            abandoned_pages,
            stop_reason,
        })
    }

    async fn fetch_page(
        &self,
        policy: &RetryPolicy,
        credentials: &Credentials,
        request: &PageRequest,
    ) -> PageResult {
        match listings::fetch_listing_page(&self.api, policy, credentials, request).await {
            Ok(page) => PageResult {
                is_last_page: page.returned < request.page_size,
                items: page.listings,
                error_kind: None,
            },
            Err(ApiError::RateLimited) => PageResult {
                items: Vec::new(),
                is_last_page: false,
                error_kind: Some(PageErrorKind::RateLimited),
            },
            Err(err) => {
                warn!(
                    target = "mcflip.fetch",
                    offset = request.start_offset,
                    error = %err,
                    "page_failed_counted_empty"
                );
                PageResult {
                    items: Vec::new(),
                    is_last_page: false,
                    error_kind: Some(PageErrorKind::Failed),
                }
            }
        }
    }
}

/// Content identity of a listing: case and surrounding whitespace are ignored
/// in the text fields, tags compare as a set.
pub fn dedup_key(listing: &Listing) -> String {
    let norm = |s: &str| s.trim().to_lowercase();
    let price = match &listing.price {
        Value::Null => "0".to_string(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    let mut tags: Vec<&str> = listing.tags.iter().map(|t| t.trim()).collect();
    tags.sort_unstable();
    tags.dedup();

    [
        norm(&listing.name),
        price,
        norm(&listing.description),
        norm(&listing.platform),
        norm(&listing.category),
        tags.join(","),
    ]
    .join("\u{1f}")
}

pub fn unique_urls(listings: &[Listing]) -> Vec<String> {
    let mut seen = HashSet::new();
    listings
        .iter()
        .filter(|listing| seen.insert(dedup_key(listing)))
        .map(|listing| listing_url(&listing.id))
        .collect()
}
