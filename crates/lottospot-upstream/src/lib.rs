//! Upstream lottery-operator API: draw fetcher + winner normalizer.

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use lottospot_core::WinnerRecord;
use reqwest::header;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "lottospot-upstream";

pub const DEFAULT_UPSTREAM_URL: &str =
    "https://www.dhlottery.co.kr/wnprchsplcsrch/selectLtWnShp.do";

/// Hard deadline on one upstream request.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One raw winner entry as the operator's API ships it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWinner {
    pub store_id: String,
    pub sequence_no: u32,
    pub shop_name: String,
    pub shop_address: String,
    pub win_rank: u8,
    pub sale_method_label: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Option<EnvelopeData>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    list: Option<Vec<RawWinner>>,
}

/// Result of one successful upstream round trip. A missing, null or empty
/// `list` means the draw has not been published yet, which is a normal
/// steady state between draws, not a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Page(Vec<RawWinner>),
    NoData,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream fetch timed out after {}s", FETCH_TIMEOUT.as_secs())]
    Timeout,
    #[error("upstream returned http status {status}")]
    Status { status: u16 },
    #[error("upstream request failed: {0}")]
    Transport(reqwest::Error),
    #[error("decoding upstream response: {0}")]
    Decode(#[from] serde_json::Error),
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err)
    }
}

/// Decodes a winner-page body, distinguishing "not yet published" from a
/// real payload.
pub fn decode_page(bytes: &[u8]) -> Result<FetchOutcome, serde_json::Error> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    match envelope.data.and_then(|d| d.list) {
        Some(list) if !list.is_empty() => Ok(FetchOutcome::Page(list)),
        _ => Ok(FetchOutcome::NoData),
    }
}

/// Fetches the raw winner list for one draw number.
///
/// One attempt per call, no retries: a failed fetch is surfaced to the
/// caller and the next scheduled run tries again.
#[derive(Debug, Clone)]
pub struct DrawFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl DrawFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building upstream http client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn from_env_or_default() -> anyhow::Result<Self> {
        let base_url = std::env::var("LOTTOSPOT_UPSTREAM_URL")
            .unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string());
        Self::new(base_url, FETCH_TIMEOUT)
    }

    pub async fn fetch(&self, draw_no: u32) -> Result<FetchOutcome, FetchError> {
        // Millisecond nonce defeats intermediary caches on top of the
        // explicit no-store directive.
        let nonce = Utc::now().timestamp_millis().to_string();
        let draw = draw_no.to_string();
        debug!(draw_no, "fetching winner page");

        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("srchWnShpRnk", "all"),
                ("srchLtEpsd", draw.as_str()),
                ("srchShpLctn", ""),
                ("_", nonce.as_str()),
            ])
            .header(header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(classify)?;
        Ok(decode_page(&body)?)
    }
}

/// Maps one upstream record into the canonical winner shape.
///
/// Structural mapping only: nothing validates that the rank is in {1, 2} or
/// that the coordinates are plausible, so malformed upstream entries
/// propagate as malformed records rather than being dropped. The creation
/// timestamp is assigned here, not taken from upstream.
pub fn normalize(raw: &RawWinner, draw_no: u32) -> WinnerRecord {
    WinnerRecord {
        draw_no,
        store_external_id: raw.store_id.clone(),
        sequence_no: raw.sequence_no,
        shop_name: raw.shop_name.clone(),
        address: raw.shop_address.clone(),
        rank: raw.win_rank,
        sale_method: raw.sale_method_label.clone(),
        lat: raw.lat,
        lng: raw.lng,
        created_at: Utc::now(),
    }
}

pub fn normalize_page(raws: &[RawWinner], draw_no: u32) -> Vec<WinnerRecord> {
    raws.iter().map(|raw| normalize(raw, draw_no)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_full_page() {
        let body = br#"{
            "data": {
                "list": [
                    {
                        "storeId": "11350001",
                        "sequenceNo": 1,
                        "shopName": "Lucky Mart",
                        "shopAddress": "123 Main St",
                        "winRank": 1,
                        "saleMethodLabel": "automatic",
                        "lat": 37.5665,
                        "lng": 126.978
                    }
                ]
            }
        }"#;
        match decode_page(body).unwrap() {
            FetchOutcome::Page(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].store_id, "11350001");
                assert_eq!(list[0].win_rank, 1);
            }
            FetchOutcome::NoData => panic!("expected page"),
        }
    }

    #[test]
    fn decode_empty_list_is_no_data() {
        let body = br#"{"data": {"list": []}}"#;
        assert_eq!(decode_page(body).unwrap(), FetchOutcome::NoData);
    }

    #[test]
    fn decode_null_list_is_no_data() {
        let body = br#"{"data": {"list": null}}"#;
        assert_eq!(decode_page(body).unwrap(), FetchOutcome::NoData);
    }

    #[test]
    fn decode_missing_data_is_no_data() {
        let body = br#"{}"#;
        assert_eq!(decode_page(body).unwrap(), FetchOutcome::NoData);
    }

    #[test]
    fn decode_garbage_is_an_error() {
        assert!(decode_page(b"<html>maintenance</html>").is_err());
    }

    #[test]
    fn normalize_maps_fields_and_stamps_creation_time() {
        let raw = RawWinner {
            store_id: "11350001".to_string(),
            sequence_no: 7,
            shop_name: "Lucky Mart".to_string(),
            shop_address: "123 Main St".to_string(),
            win_rank: 2,
            sale_method_label: "manual".to_string(),
            lat: 37.5,
            lng: 127.0,
        };
        let before = Utc::now();
        let record = normalize(&raw, 1300);
        assert_eq!(record.draw_no, 1300);
        assert_eq!(record.store_external_id, "11350001");
        assert_eq!(record.sequence_no, 7);
        assert_eq!(record.rank, 2);
        assert_eq!(record.sale_method, "manual");
        assert!(record.created_at >= before);
        assert_eq!(record.document_key(), "1300_11350001_7");
    }
}
