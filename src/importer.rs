use crate::gameflip::auth::Credentials;
use crate::gameflip::client::ApiClient;
use crate::gameflip::listings;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

// Most specific first: the slugged form would otherwise match the bare
// form and capture the slug.
static LISTING_URL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"gameflip\.com/(?:item|listing)/[^/]+/([a-zA-Z0-9-]+)",
        r"gameflip\.com/(?:i|p)/([a-zA-Z0-9-]+)",
        r"gameflip\.com/(?:item|listing)/([a-zA-Z0-9-]+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("no urls provided")]
    NoUrls,
    #[error("could not extract listing id from `{0}`")]
    UnrecognizedUrl(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedUrl {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub count: usize,
    pub data: Vec<Value>,
    pub skipped: Vec<SkippedUrl>,
}

pub fn extract_listing_id(url: &str) -> Result<String, ImportError> {
    LISTING_URL_PATTERNS
        .iter()
        .find_map(|re| re.captures(url))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ImportError::UnrecognizedUrl(url.to_string()))
}

/// Photo `view_url`s ordered by `display_order`. Photos without one come
/// last, by photo id.
fn image_urls(listing: &Value) -> Vec<Value> {
    let Some(photos) = listing.get("photo").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut ordered: Vec<(u64, &str)> = photos
        .values()
        .filter_map(|photo| {
            let url = photo.get("view_url").and_then(Value::as_str)?;
            let order = photo
                .get("display_order")
                .and_then(Value::as_u64)
                .unwrap_or(u64::MAX);
            Some((order, url))
        })
        .collect();
    // Stable, so ties keep the map's id order.
    ordered.sort_by_key(|(order, _)| *order);
    ordered
        .into_iter()
        .map(|(_, url)| Value::String(url.to_string()))
        .collect()
}

/// Fetches every listing referenced by `urls`, one at a time. Bad urls and
/// failed lookups are reported in `skipped` rather than failing the import.
pub async fn import_listings(
    api: &ApiClient,
    credentials: &Credentials,
    urls: &[String],
) -> Result<ImportReport, ImportError> {
    if urls.iter().all(|url| url.trim().is_empty()) {
        return Err(ImportError::NoUrls);
    }

    let mut data = Vec::new();
    let mut skipped = Vec::new();
    for url in urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
        let listing_id = match extract_listing_id(url) {
            Ok(id) => id,
            Err(err) => {
                warn!(target = "mcflip.api", url, "import_unrecognized_url");
                skipped.push(SkippedUrl {
                    url: url.to_string(),
                    reason: err.to_string(),
                });
                continue;
            }
        };

        match listings::get_listing(api, credentials, &listing_id).await {
            Ok(mut listing) => {
                let images = image_urls(&listing);
                if let Some(fields) = listing.as_object_mut() {
                    fields.insert("image_urls".into(), Value::Array(images));
                }
                data.push(listing);
            }
            Err(err) => {
                warn!(target = "mcflip.api", %listing_id, error = %err, "import_lookup_failed");
                skipped.push(SkippedUrl {
                    url: url.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    info!(
        target = "mcflip.api",
        imported = data.len(),
        skipped = skipped.len(),
        "import_completed"
    );
    Ok(ImportReport {
        count: data.len(),
        data,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gameflip::transport::mock::{MockTransport, failure, success};
    use serde_json::json;

    #[test]
    fn extracts_ids_from_known_url_shapes() {
        let cases = [
            ("https://gameflip.com/item/dragon-lore-ft/1a2b-3c4d", "1a2b-3c4d"),
            ("https://gameflip.com/listing/abc-123", "abc-123"),
            ("https://gameflip.com/i/xyz9", "xyz9"),
            ("gameflip.com/p/0f0f-aa", "0f0f-aa"),
        ];
        for (url, expected) in cases {
            assert_eq!(extract_listing_id(url).unwrap(), expected, "{url}");
        }
        assert!(matches!(
            extract_listing_id("https://example.com/item/1"),
            Err(ImportError::UnrecognizedUrl(_))
        ));
    }

    #[tokio::test]
    async fn import_collects_photo_urls_and_skips_failures() {
        let transport = MockTransport::new(|request| {
            if request.url.ends_with("/listing/good-1") {
                success(json!({
                    "id": "good-1",
                    "name": "Knife",
                    "photo": {
                        "p1": { "view_url": "https://img.test/p1.jpg" },
                        "p2": { "status": "pending" }
                    }
                }))
            } else {
                failure(404, "Listing not found")
            }
        });
        let api = ApiClient::new(transport.clone(), "https://api.test");
        let urls = vec![
            "https://gameflip.com/item/knife/good-1".to_string(),
            "https://gameflip.com/item/missing-9".to_string(),
            "https://example.com/nope".to_string(),
            "  ".to_string(),
        ];

        let report = import_listings(&api, &Credentials::new("k", "s"), &urls)
            .await
            .unwrap();

        assert_eq!(report.count, 1);
        assert_eq!(report.data[0]["image_urls"], json!(["https://img.test/p1.jpg"]));
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.skipped[0].reason, "Listing not found");
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn image_urls_follow_display_order() {
        let listing = json!({
            "photo": {
                "a-cover": { "view_url": "https://img.test/extra.jpg", "display_order": 2 },
                "b-main": { "view_url": "https://img.test/main.jpg", "display_order": 0 },
                "c-loose": { "view_url": "https://img.test/loose.jpg" },
                "d-side": { "view_url": "https://img.test/side.jpg", "display_order": 1 }
            }
        });
        assert_eq!(
            image_urls(&listing),
            vec![
                json!("https://img.test/main.jpg"),
                json!("https://img.test/side.jpg"),
                json!("https://img.test/extra.jpg"),
                json!("https://img.test/loose.jpg"),
            ]
        );
        assert!(image_urls(&json!({ "id": "no-photos" })).is_empty());
    }

    #[tokio::test]
    async fn empty_url_list_is_rejected() {
        let transport = MockTransport::new(|_| success(json!({})));
        let api = ApiClient::new(transport, "https://api.test");
        let err = import_listings(&api, &Credentials::new("k", "s"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::NoUrls));
    }
}
