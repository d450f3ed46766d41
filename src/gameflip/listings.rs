use crate::gameflip::auth::Credentials;
use crate::gameflip::client::{ApiClient, ApiError, RetryPolicy};
use crate::gameflip::config::PAGE_SIZE;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::warn;
use urlencoding::encode;

/// A remote listing. Only the attributes this service reads are typed, the
/// rest is carried through untouched in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default)]
    pub price: Value,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub platform: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub category: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub photo: BTreeMap<String, Photo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Listing {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Photo {
    #[serde(default)]
    pub view_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub display_order: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub owner_id: String,
    pub start_offset: usize,
    pub page_size: usize,
    pub status_filter: String,
}

impl PageRequest {
    pub fn new(owner_id: &str, start_offset: usize, status_filter: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            start_offset,
            page_size: PAGE_SIZE,
            status_filter: status_filter.to_string(),
        }
    }

    fn params(&self) -> Vec<(String, String)> {
        vec![
            ("owner".into(), self.owner_id.clone()),
            ("start".into(), self.start_offset.to_string()),
            ("limit".into(), self.page_size.to_string()),
            ("status".into(), self.status_filter.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ListingPage {
    pub listings: Vec<Listing>,
    /// Raw item count as returned, before dropping entries that failed to parse.
    pub returned: usize,
}

#[derive(Debug, Clone)]
pub struct PatchOp {
    pub op: &'static str,
    pub path: String,
    pub value: Value,
}

impl PatchOp {
    pub fn replace(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op: "replace",
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "op": self.op, "path": self.path, "value": self.value })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoSlot {
    pub id: String,
    pub upload_url: String,
}

fn missing(field: &str) -> ApiError {
    ApiError::RemoteRejected {
        status: 200,
        message: format!("response missing `{field}`"),
    }
}

fn data_str(body: &Value, pointer: &str) -> Option<String> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub async fn fetch_owner_id(api: &ApiClient, credentials: &Credentials) -> Result<String, ApiError> {
    let body = api
        .execute(Method::GET, "/account/me/profile", credentials, None, &[])
        .await?;
    data_str(&body, "/data/owner").ok_or_else(|| missing("data.owner"))
}

pub async fn fetch_listing_page(
    api: &ApiClient,
    policy: &RetryPolicy,
    credentials: &Credentials,
    request: &PageRequest,
) -> Result<ListingPage, ApiError> {
    let body = api
        .execute_with(
            policy,
            Method::GET,
            "/listing",
            credentials,
            None,
            &request.params(),
        )
        .await?;
    let items = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| missing("data"))?;

    let mut listings = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<Listing>(item.clone()) {
            Ok(listing) => listings.push(listing),
            Err(err) => warn!(
                target = "mcflip.gameflip",
                offset = request.start_offset,
                error = %err,
                "skipping_unparseable_listing"
            ),
        }
    }
    Ok(ListingPage {
        listings,
        returned: items.len(),
    })
}

pub async fn get_listing(
    api: &ApiClient,
    credentials: &Credentials,
    listing_id: &str,
) -> Result<Value, ApiError> {
    let endpoint = format!("/listing/{}", encode(listing_id));
    let body = api
        .execute(Method::GET, &endpoint, credentials, None, &[])
        .await?;
    body.get("data").cloned().ok_or_else(|| missing("data"))
}

pub async fn create_listing(
    api: &ApiClient,
    credentials: &Credentials,
    draft: &Value,
) -> Result<String, ApiError> {
    let body = api
        .execute(Method::POST, "/listing", credentials, Some(draft), &[])
        .await?;
    data_str(&body, "/data/id").ok_or_else(|| missing("data.id"))
}

pub async fn patch_listing(
    api: &ApiClient,
    credentials: &Credentials,
    listing_id: &str,
    ops: &[PatchOp],
) -> Result<(), ApiError> {
    let endpoint = format!("/listing/{}", encode(listing_id));
    let payload = Value::Array(ops.iter().map(PatchOp::to_json).collect());
    api.execute(Method::PATCH, &endpoint, credentials, Some(&payload), &[])
        .await?;
    Ok(())
}

pub async fn delete_listing(
    api: &ApiClient,
    credentials: &Credentials,
    listing_id: &str,
) -> Result<(), ApiError> {
    let endpoint = format!("/listing/{}", encode(listing_id));
    api.execute(Method::DELETE, &endpoint, credentials, None, &[])
        .await?;
    Ok(())
}

pub async fn create_photo_slot(
    api: &ApiClient,
    credentials: &Credentials,
    listing_id: &str,
) -> Result<PhotoSlot, ApiError> {
    let endpoint = format!("/listing/{}/photo", encode(listing_id));
    let body = api
        .execute(Method::POST, &endpoint, credentials, None, &[])
        .await?;
    Ok(PhotoSlot {
        id: data_str(&body, "/data/id").ok_or_else(|| missing("data.id"))?,
        upload_url: data_str(&body, "/data/upload_url")
            .ok_or_else(|| missing("data.upload_url"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gameflip::transport::RequestBody;
    use crate::gameflip::transport::mock::{MockTransport, success};
    use serde_json::json;

    fn creds() -> Credentials {
        Credentials::new("key", "secret")
    }

    #[test]
    fn listing_tolerates_nulls_and_keeps_unknown_fields() {
        let listing: Listing = serde_json::from_value(json!({
            "id": "abc",
            "name": "Skin",
            "description": null,
            "price": 1250,
            "created": "2024-03-01T12:30:00.000Z",
            "photo": { "p1": { "view_url": "https://img/p1.jpg" } },
            "kind": "item"
        }))
        .unwrap();
        assert_eq!(listing.description, "");
        assert_eq!(listing.extra["kind"], "item");
        assert_eq!(
            listing.created_at().unwrap().to_rfc3339(),
            "2024-03-01T12:30:00+00:00"
        );
        assert_eq!(
            listing.photo["p1"].view_url.as_deref(),
            Some("https://img/p1.jpg")
        );
    }

    #[test]
    fn patch_ops_serialize_as_json_patch() {
        let op = PatchOp::replace("/photo/p1/display_order", 2);
        assert_eq!(
            op.to_json(),
            json!({ "op": "replace", "path": "/photo/p1/display_order", "value": 2 })
        );
    }

    #[tokio::test]
    async fn patch_listing_sends_ops_as_json_patch_array() {
        let transport = MockTransport::new(|_| success(json!({})));
        let api = ApiClient::new(transport.clone(), "https://api.test");
        let ops = [
            PatchOp::replace("/status", "draft"),
            PatchOp::replace("/cover_photo", "p1"),
        ];

        patch_listing(&api, &creds(), "L1", &ops).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::PATCH);
        let RequestBody::Json(body) = &requests[0].body else {
            panic!("patch body must be json");
        };
        assert_eq!(
            body,
            &json!([
                { "op": "replace", "path": "/status", "value": "draft" },
                { "op": "replace", "path": "/cover_photo", "value": "p1" }
            ])
        );
    }

    #[tokio::test]
    async fn page_request_sends_filter_params() {
        let transport = MockTransport::new(|_| success(json!([{ "id": "1" }, { "bad": true }])));
        let api = ApiClient::new(transport.clone(), "https://api.test");
        let request = PageRequest::new("owner-1", 200, "onsale");

        let page = fetch_listing_page(&api, api.policy(), &creds(), &request)
            .await
            .unwrap();

        assert_eq!(page.returned, 2);
        assert_eq!(page.listings.len(), 1);
        let sent = &transport.requests()[0];
        assert_eq!(sent.query_value("owner"), Some("owner-1"));
        assert_eq!(sent.query_value("start"), Some("200"));
        assert_eq!(sent.query_value("limit"), Some("100"));
        assert_eq!(sent.query_value("status"), Some("onsale"));
    }

    #[tokio::test]
    async fn owner_lookup_reads_profile() {
        let transport = MockTransport::new(|_| success(json!({ "owner": "us-east-1:42" })));
        let api = ApiClient::new(transport, "https://api.test");
        assert_eq!(fetch_owner_id(&api, &creds()).await.unwrap(), "us-east-1:42");
    }
}
