use crate::gameflip::auth::Credentials;
use crate::gameflip::client::{ApiClient, ApiError};
use crate::gameflip::config::{STATUS_DRAFT, STATUS_ONSALE, listing_url};
use crate::gameflip::listings::{self, PatchOp};
use crate::gameflip::transport::HttpRequest;
use reqwest::Method;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// One listing to create. Everything except the image references is sent to
/// the remote API as the draft body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishJob {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub additional_images: Vec<String>,
    #[serde(flatten)]
    pub listing: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl PublishJob {
    pub fn name(&self) -> &str {
        self.listing
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
    }

    fn draft_body(&self) -> Value {
        let mut body = self.listing.clone();
        body.entry("status")
            .or_insert_with(|| Value::String(STATUS_DRAFT.into()));
        Value::Object(body)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhotoOutcome {
    pub url: String,
    pub display_order: i64,
    pub photo_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishResult {
    pub listing_id: String,
    pub listing_url: String,
    pub main_photo_id: Option<String>,
    pub cover_photo_set: bool,
    pub additional_photos: Vec<PhotoOutcome>,
    pub published: bool,
    pub target_status: String,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to create listing draft: {0}")]
    DraftRejected(#[source] ApiError),
}

#[derive(Debug, Error)]
enum PhotoError {
    #[error("photo slot: {0}")]
    Slot(ApiError),
    #[error("image download: {0}")]
    Download(String),
    #[error("image upload: {0}")]
    Upload(String),
    #[error("photo metadata: {0}")]
    Metadata(ApiError),
}

/// Creates listings end to end. Only draft creation can fail a job; every
/// later step degrades to a warning and is reported in the result.
#[derive(Clone)]
pub struct ListingPublisher {
    api: ApiClient,
    target_status: String,
}

impl ListingPublisher {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            target_status: STATUS_ONSALE.to_string(),
        }
    }

    pub async fn publish(
        &self,
        credentials: &Credentials,
        job: &PublishJob,
    ) -> Result<PublishResult, PublishError> {
        let started = Instant::now();
        let listing_id = listings::create_listing(&self.api, credentials, &job.draft_body())
            .await
            .map_err(|err| {
                warn!(target = "mcflip.publish", name = job.name(), error = %err, "draft_rejected");
                PublishError::DraftRejected(err)
            })?;
        crate::metrics::stage_elapsed("create_draft", started.elapsed().as_millis());
        info!(target = "mcflip.publish", %listing_id, name = job.name(), "draft_created");

        let mut main_photo_id = None;
        let mut cover_photo_set = false;
        if let Some(url) = job.image_url.as_deref().filter(|u| !u.trim().is_empty()) {
            let started = Instant::now();
            match self.upload_photo(credentials, &listing_id, url, 0).await {
                Ok(photo_id) => {
                    cover_photo_set = self.set_cover_photo(credentials, &listing_id, &photo_id).await;
                    main_photo_id = Some(photo_id);
                }
                Err(err) => {
                    warn!(target = "mcflip.publish", %listing_id, error = %err, "main_photo_failed");
                }
            }
            crate::metrics::stage_elapsed("main_photo", started.elapsed().as_millis());
        }

        let mut additional_photos = Vec::with_capacity(job.additional_images.len());
        for (index, url) in job.additional_images.iter().enumerate() {
            let display_order = index as i64 + 1;
            let photo_id = match self
                .upload_photo(credentials, &listing_id, url, display_order)
                .await
            {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!(
                        target = "mcflip.publish",
                        %listing_id,
                        display_order,
                        error = %err,
                        "additional_photo_failed"
                    );
                    None
                }
            };
            additional_photos.push(PhotoOutcome {
                url: url.clone(),
                display_order,
                photo_id,
            });
        }

        let status_ops = [PatchOp::replace("/status", self.target_status.as_str())];
        let published =
            match listings::patch_listing(&self.api, credentials, &listing_id, &status_ops).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        target = "mcflip.publish",
                        %listing_id,
                        status = %self.target_status,
                        error = %err,
                        "status_update_failed"
                    );
                    false
                }
            };

        info!(
            target = "mcflip.publish",
            %listing_id,
            published,
            has_cover = cover_photo_set,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "listing_processed"
        );

        Ok(PublishResult {
            listing_url: listing_url(&listing_id),
            listing_id,
            main_photo_id,
            cover_photo_set,
            additional_photos,
            published,
            target_status: self.target_status.clone(),
        })
    }

    async fn upload_photo(
        &self,
        credentials: &Credentials,
        listing_id: &str,
        image_url: &str,
        display_order: i64,
    ) -> Result<String, PhotoError> {
        let slot = listings::create_photo_slot(&self.api, credentials, listing_id)
            .await
            .map_err(PhotoError::Slot)?;

        let image = self
            .api
            .send_unsigned(HttpRequest::new(Method::GET, image_url))
            .await
            .map_err(|err| PhotoError::Download(err.to_string()))?;
        if image.status != 200 {
            return Err(PhotoError::Download(format!("HTTP {}", image.status)));
        }

        let upload = self
            .api
            .send_unsigned(HttpRequest::new(Method::PUT, slot.upload_url.as_str()).bytes(image.body))
            .await
            .map_err(|err| PhotoError::Upload(err.to_string()))?;
        if !(200..300).contains(&upload.status) {
            return Err(PhotoError::Upload(format!("HTTP {}", upload.status)));
        }

        let ops = [
            PatchOp::replace(format!("/photo/{}/status", slot.id), "active"),
            PatchOp::replace(format!("/photo/{}/display_order", slot.id), display_order),
        ];
        listings::patch_listing(&self.api, credentials, listing_id, &ops)
            .await
            .map_err(PhotoError::Metadata)?;
        Ok(slot.id)
    }

    async fn set_cover_photo(&self, credentials: &Credentials, listing_id: &str, photo_id: &str) -> bool {
        let ops = [PatchOp::replace("/cover_photo", photo_id)];
        match listings::patch_listing(&self.api, credentials, listing_id, &ops).await {
            Ok(()) => true,
            Err(err) => {
                warn!(target = "mcflip.publish", listing_id, error = %err, "cover_photo_failed");
                false
            }
        }
    }
}
