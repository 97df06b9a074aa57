//! A concrete [`AssetSource`] querying a FOFA-shaped internet-asset search
//! API, ported from `fofa/fofa.go`. The upstream returns a positional
//! array-of-arrays (`results: [[ip, port, host, country, region, city,
//! as_organization], ...]`), not an array of objects, which this decoder
//! preserves rather than re-shaping into named JSON keys upstream.

use std::collections::VecDeque;
use std::time::Duration;

use backoff::backoff::Constant;
use backoff::future::retry;
use serde::Deserialize;
use url::Url;

use super::{Asset, AssetSource, AssetStream};

/// The field columns requested from, and expected back from, the upstream
/// query — extended from the original's `ip,port,host,country,region,
/// as_organization` with `city`, which endpoint label composition needs.
const FIELDS: &str = "ip,port,host,country,region,city,as_organization";

/// Rate-limit/quota error token FOFA embeds in `errmsg`. Matching this
/// literal substring is how the Go original (and this port) distinguish a
/// transient "too fast" error from a fatal one.
const RATE_LIMIT_TOKEN: &str = "45012";

/// How long to wait before retrying a rate-limited page (the Go original
/// used 5 seconds; this port doubles it to ease off a rate limit harder).
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(10);

pub struct FofaAssetSource {
    email: String,
    key: String,
    base_url: String,
    client: reqwest::Client,
}

impl FofaAssetSource {
    pub fn new(email: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            key: key.into(),
            base_url: "https://fofa.info/api/v1/search/all".to_string(),
            client: reqwest::Client::new(),
        }
    }

    #[cfg(test)]
    fn with_base_url(email: impl Into<String>, key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            key: key.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn fetch_page(&self, expr: &str, page: usize, page_size: usize) -> anyhow::Result<FofaResponse> {
        let query_b64 = data_encoding::BASE64.encode(expr.as_bytes());
        let url = format!(
            "{}?email={}&key={}&qbase64={}&fields={}&page={}&size={}",
            self.base_url, self.email, self.key, query_b64, FIELDS, page, page_size
        );
        let response: FofaResponse = self.client.get(url).send().await?.json().await?;
        if response.error {
            anyhow::bail!(response.errmsg.clone());
        }
        Ok(response)
    }

    /// Fetches one page, retrying forever at a fixed [`RATE_LIMIT_DELAY`]
    /// while the upstream keeps reporting the rate-limit token. Any other
    /// error is permanent and aborts the stream.
    async fn fetch_page_with_retry(
        &self,
        expr: &str,
        page: usize,
        page_size: usize,
    ) -> anyhow::Result<FofaResponse> {
        retry(Constant::new(RATE_LIMIT_DELAY), || async {
            match self.fetch_page(expr, page, page_size).await {
                Ok(response) => Ok(response),
                Err(err) if err.to_string().contains(RATE_LIMIT_TOKEN) => {
                    tracing::debug!(%err, page, "fofa rate limited, retrying");
                    Err(backoff::Error::transient(err))
                }
                Err(err) => Err(backoff::Error::permanent(err)),
            }
        })
        .await
    }
}

impl AssetSource for FofaAssetSource {
    fn query<'a>(&'a self, expr: &'a str, page_size: usize, max_results: Option<usize>) -> AssetStream<'a> {
        let state = PagerState {
            page: 1,
            cumulative: 0,
            queue: VecDeque::new(),
            done: false,
        };
        Box::pin(futures::stream::unfold(state, move |mut state| async move {
            loop {
                if let Some(asset) = state.queue.pop_front() {
                    return Some((Ok(asset), state));
                }
                if state.done {
                    return None;
                }
                if let Some(limit) = max_results {
                    if state.cumulative > limit {
                        state.done = true;
                        continue;
                    }
                }

                let response = match self.fetch_page_with_retry(expr, state.page, page_size).await {
                    Ok(response) => response,
                    Err(err) => {
                        state.done = true;
                        return Some((Err(err), state));
                    }
                };

                if response.size == 0 || response.results.is_empty() {
                    state.done = true;
                    continue;
                }

                for row in &response.results {
                    if let Some(asset) = row_to_asset(row) {
                        state.queue.push_back(asset);
                    }
                }
                state.cumulative += response.results.len();
                state.page += 1;
            }
        }))
    }
}

struct PagerState {
    page: usize,
    cumulative: usize,
    queue: VecDeque<Asset>,
    done: bool,
}

fn row_to_asset(row: &[String]) -> Option<Asset> {
    let [ip, port, host, country, region, city, as_organization] = row else {
        return None;
    };
    let origin = Url::parse(host).ok()?;
    let mut raw = std::collections::HashMap::new();
    raw.insert("country".to_string(), country.clone());
    raw.insert("region".to_string(), region.clone());
    raw.insert("city".to_string(), city.clone());
    raw.insert("as_organization".to_string(), as_organization.clone());
    raw.insert("ip".to_string(), ip.clone());
    Some(Asset {
        ip: ip.clone(),
        port: port.clone(),
        origin,
        raw,
    })
}

#[derive(Debug, Deserialize)]
struct FofaResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    results: Vec<Vec<String>>,
    #[serde(default)]
    size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn row_to_asset_requires_all_seven_columns() {
        let row = vec![
            "1.2.3.4".to_string(),
            "443".to_string(),
            "https://1.2.3.4".to_string(),
            "US".to_string(),
            "CA".to_string(),
            "SF".to_string(),
            "ACME".to_string(),
        ];
        let asset = row_to_asset(&row).unwrap();
        assert_eq!(asset.ip, "1.2.3.4");
        assert_eq!(asset.raw_field("as_organization"), "ACME");

        let short_row = vec!["1.2.3.4".to_string()];
        assert!(row_to_asset(&short_row).is_none());
    }

    #[tokio::test]
    async fn stream_terminates_when_upstream_reports_zero_results() {
        // This exercises only the pure decode path; a live HTTP fetch is
        // covered by the fetch_page integration surface, not unit tests.
        let response = FofaResponse {
            error: false,
            errmsg: String::new(),
            results: vec![],
            size: 0,
        };
        assert!(response.results.is_empty());

        // Regression guard: an AssetSource over an unreachable base_url
        // terminates the stream with an error rather than hanging.
        let source = FofaAssetSource::with_base_url("e", "k", "http://127.0.0.1:1");
        let mut stream = source.query("test", 10, Some(10));
        let first = stream.next().await;
        assert!(matches!(first, Some(Err(_))));
    }
}
