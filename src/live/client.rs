// =============================================================================
// Futures REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and the venue.
//
// Error bodies of shape `{code, msg}` are parsed into `VenueError` so the
// adapter can branch on numeric codes (idempotent margin switch, leverage
// fallback, post-only conflicts).
// =============================================================================

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::live::error::{VenueError, VenueResult};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const MAINNET_BASE: &str = "https://fapi.binance.com";
const TESTNET_BASE: &str = "https://testnet.binancefuture.com";

/// USD-M futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct FuturesClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl FuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client. `testnet` switches the base URL.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet { TESTNET_BASE } else { MAINNET_BASE }.to_string();
        debug!(base_url = %base_url, "FuturesClient initialised");

        Self {
            secret,
            base_url,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(query: &str, secret: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Full query string for a signed request: params + timestamp + recvWindow,
    /// with the signature appended last.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = Self::sign(&base, &self.secret);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> VenueResult<Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(VenueError::from)?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| VenueError::transport(format!("{path}: undecodable body: {e}")))?;

        if !status.is_success() {
            return Err(VenueError::from_response(status.as_u16(), &body));
        }
        Ok(body)
    }

    /// Signed GET.
    pub async fn get_signed(&self, path: &str, params: &str) -> VenueResult<Value> {
        self.request(reqwest::Method::GET, path, &self.signed_query(params))
            .await
    }

    /// Signed POST (parameters travel in the query string, venue convention).
    pub async fn post_signed(&self, path: &str, params: &str) -> VenueResult<Value> {
        self.request(reqwest::Method::POST, path, &self.signed_query(params))
            .await
    }

    /// Signed DELETE.
    pub async fn delete_signed(&self, path: &str, params: &str) -> VenueResult<Value> {
        self.request(reqwest::Method::DELETE, path, &self.signed_query(params))
            .await
    }

    /// Public (unsigned) GET.
    pub async fn get_public(&self, path: &str, params: &str) -> VenueResult<Value> {
        self.request(reqwest::Method::GET, path, params).await
    }

    // -------------------------------------------------------------------------
    // Endpoint wrappers
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/exchangeInfo (public).
    pub async fn exchange_info(&self) -> VenueResult<Value> {
        self.get_public("/fapi/v1/exchangeInfo", "").await
    }

    /// GET /fapi/v1/positionSide/dual (signed) — hedge vs one-way mode.
    pub async fn position_side_dual(&self) -> VenueResult<Value> {
        self.get_signed("/fapi/v1/positionSide/dual", "").await
    }

    /// POST /fapi/v1/leverage (signed).
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<Value> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.post_signed("/fapi/v1/leverage", &params).await
    }

    /// POST /fapi/v1/marginType (signed).
    pub async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> VenueResult<Value> {
        let params = format!("symbol={symbol}&marginType={margin_type}");
        self.post_signed("/fapi/v1/marginType", &params).await
    }

    /// GET /fapi/v1/leverageBracket (signed, best-effort).
    pub async fn leverage_brackets(&self, symbol: &str) -> VenueResult<Value> {
        let params = format!("symbol={symbol}");
        self.get_signed("/fapi/v1/leverageBracket", &params).await
    }

    /// POST /fapi/v1/order (signed). `params` is the fully assembled order
    /// parameter string (symbol, side, type, quantity, ...).
    pub async fn place_order(&self, params: &str) -> VenueResult<Value> {
        self.post_signed("/fapi/v1/order", params).await
    }

    /// GET /fapi/v1/order (signed) — order status.
    pub async fn query_order(&self, symbol: &str, order_id: i64) -> VenueResult<Value> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.get_signed("/fapi/v1/order", &params).await
    }

    /// DELETE /fapi/v1/order (signed).
    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> VenueResult<Value> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.delete_signed("/fapi/v1/order", &params).await
    }

    /// GET /fapi/v1/ticker/bookTicker (public) — top of book.
    pub async fn book_ticker(&self, symbol: &str) -> VenueResult<Value> {
        let params = format!("symbol={symbol}");
        self.get_public("/fapi/v1/ticker/bookTicker", &params).await
    }

    /// GET /fapi/v2/positionRisk (signed) — authoritative positions.
    pub async fn position_risk(&self) -> VenueResult<Value> {
        self.get_signed("/fapi/v2/positionRisk", "").await
    }

    /// GET /fapi/v1/income (signed) — income ledger from `start_ts`.
    pub async fn income(&self, start_ts: i64, limit: u32) -> VenueResult<Value> {
        let params = format!("startTime={start_ts}&limit={limit}");
        self.get_signed("/fapi/v1/income", &params).await
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_signature_matches_known_vector() {
        // Vector from the venue's signed-endpoint documentation.
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let sig = FuturesClient::sign(query, secret);
        assert_eq!(
            sig,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_query_shape() {
        let client = FuturesClient::new("key", "secret", false);
        let qs = client.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000&"));
        // The signature is appended last as 64 hex chars.
        let sig = qs.rsplit("signature=").next().unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_params_still_signed() {
        let client = FuturesClient::new("key", "secret", true);
        let qs = client.signed_query("");
        assert!(qs.starts_with("timestamp="));
        assert!(qs.contains("signature="));
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = FuturesClient::new("my-key", "my-secret", false);
        let text = format!("{client:?}");
        assert!(!text.contains("my-key"));
        assert!(!text.contains("my-secret"));
        assert!(text.contains("<redacted>"));
    }
}
