use once_cell::sync::Lazy;
use std::env;

pub static API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("GAMEFLIP_API_URL")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://production-gameflip.fingershock.com/api/v1".to_string())
});

pub static ITEM_URL_PREFIX: Lazy<String> = Lazy::new(|| {
    env::var("GAMEFLIP_ITEM_URL")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://gameflip.com/item".to_string())
});

pub static FETCH_CONCURRENCY: Lazy<usize> = Lazy::new(|| {
    env::var("FETCH_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(5)
});

pub const PAGE_SIZE: usize = 100;
pub const TIME_STEP_SECS: u64 = 30;
pub const TOTP_DIGITS: u32 = 6;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_PATCH: &str = "application/json-patch+json";

pub const STATUS_ONSALE: &str = "onsale";
pub const STATUS_DRAFT: &str = "draft";

pub fn listing_url(listing_id: &str) -> String {
    format!("{}/{}", *ITEM_URL_PREFIX, listing_id)
}
