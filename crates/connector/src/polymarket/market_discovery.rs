//! Market discovery via the Gamma REST API.
//!
//! Pages through `GET {base}/markets?active=true&closed=false` and returns
//! each open market's CLOB token IDs, which are the asset IDs the market
//! channel subscribes by.

use async_trait::async_trait;
use polybook_metadata::DiscoveryConfig;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;
use crate::traits::MarketSource;
use crate::types::{AssetId, DiscoveredMarket};

const PAGE_SIZE: u32 = 100;

/// Gamma serves `clobTokenIds` either as a JSON array or as a string that
/// itself contains a JSON array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    List(Vec<String>),
    Encoded(String),
}

impl TokenIds {
    fn into_vec(self) -> Result<Vec<String>, serde_json::Error> {
        match self {
            TokenIds::List(ids) => Ok(ids),
            TokenIds::Encoded(raw) if raw.trim().is_empty() => Ok(Vec::new()),
            TokenIds::Encoded(raw) => serde_json::from_str(&raw),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    #[serde(default)]
    condition_id: Option<String>,
    #[serde(default)]
    clob_token_ids: Option<TokenIds>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    closed: Option<bool>,
    #[serde(default)]
    volume_num: Option<f64>,
    #[serde(default)]
    liquidity_num: Option<f64>,
}

pub struct GammaMarketSource {
    client: reqwest::Client,
    base_url: String,
    min_volume: Option<f64>,
    min_liquidity: Option<f64>,
}

impl GammaMarketSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            min_volume: None,
            min_liquidity: None,
        })
    }

    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let mut source = Self::new(config.base_url.clone())?;
        source.min_volume = config.min_volume;
        source.min_liquidity = config.min_liquidity;
        Ok(source)
    }

    pub fn with_min_volume(mut self, min_volume: f64) -> Self {
        self.min_volume = Some(min_volume);
        self
    }

    pub fn with_min_liquidity(mut self, min_liquidity: f64) -> Self {
        self.min_liquidity = Some(min_liquidity);
        self
    }

    fn page_url(&self, offset: u32) -> String {
        let mut url = format!(
            "{}/markets?active=true&closed=false&limit={}&offset={}",
            self.base_url, PAGE_SIZE, offset
        );
        if let Some(min_vol) = self.min_volume {
            url.push_str(&format!("&volume_num_min={}", min_vol));
        }
        if let Some(min_liq) = self.min_liquidity {
            url.push_str(&format!("&liquidity_num_min={}", min_liq));
        }
        url
    }
}

#[async_trait]
impl MarketSource for GammaMarketSource {
    async fn fetch_markets(&self) -> Result<Vec<DiscoveredMarket>, DiscoveryError> {
        let mut all_markets = Vec::new();
        let mut offset: u32 = 0;

        loop {
            let url = self.page_url(offset);
            debug!(url = %url, offset, "fetching markets page");

            let response = self.client.get(&url).send().await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(DiscoveryError::Api {
                    status: status.as_u16(),
                    body: body.chars().take(200).collect(),
                });
            }

            let page: Vec<GammaMarket> = serde_json::from_str(&body).map_err(|e| {
                DiscoveryError::Parse(format!("{}: {}", e, body.chars().take(200).collect::<String>()))
            })?;
            let page_count = page.len();

            for market in page {
                if market.closed.unwrap_or(false) {
                    continue;
                }
                let (Some(condition_id), Some(token_ids)) =
                    (market.condition_id, market.clob_token_ids)
                else {
                    continue;
                };
                let token_ids = match token_ids.into_vec() {
                    Ok(ids) => ids,
                    Err(e) => {
                        warn!(condition_id = %condition_id, error = %e, "unparseable clobTokenIds, skipping market");
                        continue;
                    }
                };
                if token_ids.is_empty() {
                    continue;
                }

                all_markets.push(DiscoveredMarket {
                    condition_id,
                    question: market.question,
                    asset_ids: token_ids.into_iter().map(AssetId::from).collect(),
                    volume: market.volume_num,
                    liquidity: market.liquidity_num,
                });
            }

            if page_count < PAGE_SIZE as usize {
                break;
            }
            offset += PAGE_SIZE;
        }

        info!(markets = all_markets.len(), "market discovery complete");
        Ok(all_markets)
    }
}

/// Unique asset IDs across `markets`, in sorted order, capped at
/// `max_assets` (0 means no cap). Both outcomes of a market are kept or
/// dropped together.
pub fn collect_asset_ids(markets: &[DiscoveredMarket], max_assets: usize) -> BTreeSet<AssetId> {
    let mut assets = BTreeSet::new();
    for market in markets {
        let new: Vec<&AssetId> = market
            .asset_ids
            .iter()
            .filter(|id| !assets.contains(*id))
            .collect();
        if max_assets > 0 && assets.len() + new.len() > max_assets {
            debug!(max_assets, "discovery asset cap reached");
            break;
        }
        assets.extend(new.into_iter().cloned());
    }
    assets
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn market(condition_id: &str, ids: &[&str]) -> DiscoveredMarket {
        DiscoveredMarket {
            condition_id: condition_id.to_string(),
            question: None,
            asset_ids: ids.iter().map(|id| AssetId::from(*id)).collect(),
            volume: None,
            liquidity: None,
        }
    }

    #[test]
    fn test_collect_asset_ids_deduplicates() {
        let markets = vec![
            market("0xabc", &["shared", "no_1"]),
            market("0xdef", &["shared", "no_2"]),
        ];
        let ids = collect_asset_ids(&markets, 0);
        assert_eq!(ids.len(), 3);
        assert!(ids.contains("shared"));
    }

    #[test]
    fn test_collect_asset_ids_cap_keeps_markets_whole() {
        let markets = vec![
            market("0x1", &["a_yes", "a_no"]),
            market("0x2", &["b_yes", "b_no"]),
        ];
        let ids = collect_asset_ids(&markets, 3);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("a_yes") && ids.contains("a_no"));
    }

    #[test]
    fn test_token_ids_both_encodings() {
        let json = r#"[
            {"conditionId": "0x1", "clobTokenIds": ["y", "n"]},
            {"conditionId": "0x2", "clobTokenIds": "[\"y2\", \"n2\"]"}
        ]"#;
        let markets: Vec<GammaMarket> = serde_json::from_str(json).unwrap();
        let ids: Vec<Vec<String>> = markets
            .into_iter()
            .map(|m| m.clob_token_ids.unwrap().into_vec().unwrap())
            .collect();
        assert_eq!(ids, vec![vec!["y", "n"], vec!["y2", "n2"]]);
    }

    #[tokio::test]
    async fn test_fetch_markets_paginates() {
        let server = MockServer::start().await;

        let first_page: Vec<serde_json::Value> = (0..PAGE_SIZE)
            .map(|i| {
                serde_json::json!({
                    "conditionId": format!("0x{}", i),
                    "clobTokenIds": format!("[\"yes_{}\", \"no_{}\"]", i, i),
                    "question": "Will it?",
                    "closed": false
                })
            })
            .collect();
        let second_page = serde_json::json!([
            {"conditionId": "0xlast", "clobTokenIds": ["yes_last", "no_last"], "closed": false},
            {"conditionId": "0xclosed", "clobTokenIds": ["x", "y"], "closed": true},
            {"conditionId": "0xempty", "clobTokenIds": []}
        ]);

        Mock::given(method("GET"))
            .and(path("/markets"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .and(query_param("offset", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(second_page))
            .mount(&server)
            .await;

        let source = GammaMarketSource::new(server.uri()).unwrap();
        let markets = source.fetch_markets().await.unwrap();
        assert_eq!(markets.len(), 101);
        assert_eq!(markets[100].condition_id, "0xlast");
        assert_eq!(collect_asset_ids(&markets, 0).len(), 202);
    }

    #[tokio::test]
    async fn test_fetch_markets_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let source = GammaMarketSource::new(server.uri()).unwrap();
        match source.fetch_markets().await {
            Err(DiscoveryError::Api { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("expected API error, got {:?}", other.map(|m| m.len())),
        }
    }

    #[test]
    fn test_page_url_filters() {
        let source = GammaMarketSource::new("http://gamma.test/")
            .unwrap()
            .with_min_volume(1000.0)
            .with_min_liquidity(50.0);
        let url = source.page_url(200);
        assert!(url.starts_with("http://gamma.test/markets?"));
        assert!(url.contains("offset=200"));
        assert!(url.contains("volume_num_min=1000"));
        assert!(url.contains("liquidity_num_min=50"));
    }
}
