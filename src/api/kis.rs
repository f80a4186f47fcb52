use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;

use super::broker::BrokerClient;
use super::error::{GatewayError, GatewayResult};
use crate::models::{
    Balance, DailyBar, FinancialRatios, Holding, IndexSnapshot, OrderAck, OrderPrice, OrderSide,
    Quote, RankedStock,
};

const DEMO_BASE_URL: &str = "https://openapivts.koreainvestment.com:29443";
const LIVE_BASE_URL: &str = "https://openapi.koreainvestment.com:9443";
const DEMO_WS_URL: &str = "ws://ops.koreainvestment.com:21000";
const LIVE_WS_URL: &str = "ws://ops.koreainvestment.com:31000";

/// Message code the gateway uses for "too many requests per second"
const RATE_LIMIT_MSG_CODE: &str = "EGW00201";

/// Credentials and endpoints for the Korea Investment OpenAPI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub app_key: String,
    pub app_secret: String,
    pub account_no: String,
    pub demo: bool,
    pub base_url: Option<String>, // Overrides the demo/live default
    pub ws_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl BrokerConfig {
    pub fn base_url(&self) -> &str {
        match &self.base_url {
            Some(url) => url,
            None if self.demo => DEMO_BASE_URL,
            None => LIVE_BASE_URL,
        }
    }

    pub fn ws_url(&self) -> &str {
        match &self.ws_url {
            Some(url) => url,
            None if self.demo => DEMO_WS_URL,
            None => LIVE_WS_URL,
        }
    }

    /// Split into (CANO, ACNT_PRDT_CD): "12345678-01" or a trailing 2-digit product code
    pub fn account_parts(&self) -> (String, String) {
        let account = self.account_no.trim();
        if let Some((cano, product)) = account.split_once('-') {
            return (cano.to_string(), product.to_string());
        }
        if account.len() >= 10 {
            let (cano, product) = account.split_at(account.len() - 2);
            return (cano.to_string(), product.to_string());
        }
        (account.to_string(), "01".to_string())
    }

    /// Order TR id, prefixed V for the demo environment
    fn order_tr_id(&self, side: OrderSide) -> String {
        let base = match side {
            OrderSide::Buy => "TTC0802U",
            OrderSide::Sell => "TTC0801U",
        };
        format!("{}{}", if self.demo { "V" } else { "T" }, base)
    }

    fn balance_tr_id(&self) -> &'static str {
        if self.demo {
            "VTTC8434R"
        } else {
            "TTTC8434R"
        }
    }
}

// ===== Raw payloads (string-typed numbers as sent by the API)

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
    output: Option<Value>,
    output1: Option<Value>,
    output2: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    approval_key: String,
}

#[derive(Debug, Deserialize)]
struct RawPrice {
    stck_prpr: String,
    #[serde(default)]
    prdy_ctrt: String,
    #[serde(default)]
    acml_vol: String,
    #[serde(default)]
    stck_hgpr: String,
    #[serde(default)]
    stck_lwpr: String,
    #[serde(default)]
    per: String,
    #[serde(default)]
    pbr: String,
    #[serde(default)]
    eps: String,
    #[serde(default)]
    bps: String,
}

#[derive(Debug, Deserialize)]
struct RawDaily {
    stck_bsop_date: String,
    #[serde(default)]
    stck_oprc: String,
    #[serde(default)]
    stck_hgpr: String,
    #[serde(default)]
    stck_lwpr: String,
    stck_clpr: String,
    #[serde(default)]
    acml_vol: String,
}

#[derive(Debug, Deserialize)]
struct RawHolding {
    pdno: String,
    #[serde(default)]
    hldg_qty: String,
    #[serde(default)]
    pchs_avg_pric: String,
}

#[derive(Debug, Deserialize)]
struct RawCash {
    #[serde(default)]
    dnca_tot_amt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
struct RawOrder {
    #[serde(default)]
    odno: String,
}

#[derive(Debug, Deserialize)]
struct RawIndex {
    bstp_nmix_prpr: String,
    #[serde(default)]
    bstp_nmix_prdy_ctrt: String,
}

#[derive(Debug, Deserialize)]
struct RawRanked {
    mksc_shrn_iscd: String,
    #[serde(default)]
    hts_kor_isnm: String,
    #[serde(default)]
    stck_prpr: String,
    #[serde(default)]
    acml_vol: String,
    #[serde(default)]
    prdy_ctrt: String,
}

fn parse_f64(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

fn parse_u64(raw: &str) -> u64 {
    raw.trim().parse::<u64>().unwrap_or(0)
}

fn required_price(raw: &str, field: &str) -> GatewayResult<f64> {
    parse_f64(raw)
        .filter(|p| *p > 0.0)
        .ok_or_else(|| GatewayError::Malformed(format!("{} = {:?}", field, raw)))
}

impl RawPrice {
    fn into_quote(self, symbol: &str) -> GatewayResult<Quote> {
        let price = required_price(&self.stck_prpr, "stck_prpr")?;
        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            change_pct: parse_f64(&self.prdy_ctrt).unwrap_or(0.0),
            volume: parse_u64(&self.acml_vol),
            high: parse_f64(&self.stck_hgpr).unwrap_or(price),
            low: parse_f64(&self.stck_lwpr).unwrap_or(price),
        })
    }

    fn ratios(&self) -> FinancialRatios {
        let nonzero = |raw: &str| parse_f64(raw).filter(|v| *v != 0.0);
        FinancialRatios {
            per: nonzero(&self.per),
            pbr: nonzero(&self.pbr),
            eps: nonzero(&self.eps),
            bps: nonzero(&self.bps),
        }
    }
}

impl TryFrom<RawDaily> for DailyBar {
    type Error = GatewayError;

    fn try_from(raw: RawDaily) -> GatewayResult<Self> {
        let date = NaiveDate::parse_from_str(raw.stck_bsop_date.trim(), "%Y%m%d")
            .map_err(|e| GatewayError::Malformed(format!("date {:?}: {}", raw.stck_bsop_date, e)))?;
        let close = required_price(&raw.stck_clpr, "stck_clpr")?;
        Ok(DailyBar {
            date,
            open: parse_f64(&raw.stck_oprc).unwrap_or(close),
            high: parse_f64(&raw.stck_hgpr).unwrap_or(close),
            low: parse_f64(&raw.stck_lwpr).unwrap_or(close),
            close,
            volume: parse_u64(&raw.acml_vol),
        })
    }
}

impl From<RawRanked> for RankedStock {
    fn from(raw: RawRanked) -> Self {
        RankedStock {
            symbol: raw.mksc_shrn_iscd.trim().to_string(),
            name: raw.hts_kor_isnm.trim().to_string(),
            price: parse_f64(&raw.stck_prpr).unwrap_or(0.0),
            volume: parse_u64(&raw.acml_vol),
            change_pct: parse_f64(&raw.prdy_ctrt).unwrap_or(0.0),
        }
    }
}

fn take<T: DeserializeOwned>(value: Option<Value>, field: &str) -> GatewayResult<T> {
    let value = value.ok_or_else(|| GatewayError::Malformed(format!("missing {}", field)))?;
    Ok(serde_json::from_value(value)?)
}

/// REST client for the Korea Investment OpenAPI
pub struct KisClient {
    client: Client,
    config: BrokerConfig,
    token: RwLock<Option<String>>,
}

impl KisClient {
    pub fn new(config: BrokerConfig) -> GatewayResult<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url().trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> GatewayResult<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }

        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.config.app_key,
            "appsecret": self.config.app_secret,
        });
        let response = self.client.post(self.url("/oauth2/tokenP")).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Auth(format!(
                "token request failed with HTTP {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        tracing::info!("Access token obtained");
        *slot = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn headers(&self, tr_id: &str) -> GatewayResult<reqwest::header::HeaderMap> {
        use reqwest::header::{HeaderMap, HeaderValue};

        let token = self.access_token().await?;
        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: &str| -> GatewayResult<()> {
            let value = HeaderValue::from_str(value)
                .map_err(|e| GatewayError::Auth(format!("invalid header {}: {}", name, e)))?;
            headers.insert(name, value);
            Ok(())
        };
        put("authorization", &format!("Bearer {}", token))?;
        put("appkey", &self.config.app_key)?;
        put("appsecret", &self.config.app_secret)?;
        put("tr_id", tr_id)?;
        put("custtype", "P")?;
        Ok(headers)
    }

    /// Send and unwrap the common envelope, mapping throttling and rejections
    async fn send(&self, request: reqwest::RequestBuilder) -> GatewayResult<RawEnvelope> {
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::RateLimited);
        }

        let body = response.text().await?;
        if !status.is_success() {
            if body.contains(RATE_LIMIT_MSG_CODE) {
                return Err(GatewayError::RateLimited);
            }
            if status == StatusCode::UNAUTHORIZED {
                self.token.write().await.take();
            }
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: RawEnvelope = serde_json::from_str(&body)?;
        if envelope.rt_cd != "0" {
            if envelope.msg_cd == RATE_LIMIT_MSG_CODE {
                return Err(GatewayError::RateLimited);
            }
            return Err(GatewayError::Rejected {
                code: envelope.msg_cd,
                message: envelope.msg1,
            });
        }
        Ok(envelope)
    }

    async fn get(
        &self,
        path: &str,
        tr_id: &str,
        params: &[(&str, String)],
    ) -> GatewayResult<RawEnvelope> {
        let headers = self.headers(tr_id).await?;
        let request = self.client.get(self.url(path)).headers(headers).query(params);
        self.send(request).await
    }

    async fn fetch_price(&self, symbol: &str) -> GatewayResult<RawPrice> {
        let envelope = self
            .get(
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                "FHKST01010100",
                &[
                    ("fid_cond_mrkt_div_code", "J".to_string()),
                    ("fid_input_iscd", symbol.to_string()),
                ],
            )
            .await?;
        take(envelope.output, "output")
    }
}

#[async_trait]
impl BrokerClient for KisClient {
    async fn get_current_price(&self, symbol: &str) -> GatewayResult<Quote> {
        self.fetch_price(symbol).await?.into_quote(symbol)
    }

    async fn get_daily_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> GatewayResult<Vec<DailyBar>> {
        let envelope = self
            .get(
                "/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice",
                "FHKST03010100",
                &[
                    ("fid_cond_mrkt_div_code", "J".to_string()),
                    ("fid_input_iscd", symbol.to_string()),
                    ("fid_input_date_1", start.format("%Y%m%d").to_string()),
                    ("fid_input_date_2", end.format("%Y%m%d").to_string()),
                    ("fid_period_div_code", "D".to_string()),
                    ("fid_org_adj_prc", "1".to_string()),
                ],
            )
            .await?;

        let raw: Vec<RawDaily> = take(envelope.output2, "output2")?;
        // Rows without a close (holidays, padding) are skipped
        let mut bars: Vec<DailyBar> = raw
            .into_iter()
            .filter_map(|row| DailyBar::try_from(row).ok())
            .collect();
        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }

    async fn get_balance(&self) -> GatewayResult<Balance> {
        let (cano, product) = self.config.account_parts();
        let envelope = self
            .get(
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                self.config.balance_tr_id(),
                &[
                    ("CANO", cano),
                    ("ACNT_PRDT_CD", product),
                    ("AFHR_FLPR_YN", "N".to_string()),
                    ("OFL_YN", String::new()),
                    ("INQR_DVSN", "02".to_string()),
                    ("UNPR_DVSN", "01".to_string()),
                    ("FUND_STTL_ICLD_YN", "N".to_string()),
                    ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
                    ("PRCS_DVSN", "01".to_string()),
                    ("CTX_AREA_FK100", String::new()),
                    ("CTX_AREA_NK100", String::new()),
                ],
            )
            .await?;

        let holdings: Vec<RawHolding> = take(envelope.output1, "output1")?;
        let cash: Vec<RawCash> = take(envelope.output2, "output2")?;

        Ok(Balance {
            cash_available: cash
                .first()
                .and_then(|c| parse_f64(&c.dnca_tot_amt))
                .unwrap_or(0.0),
            holdings: holdings
                .into_iter()
                .map(|h| Holding {
                    symbol: h.pdno.trim().to_string(),
                    quantity: parse_u64(&h.hldg_qty),
                    avg_price: parse_f64(&h.pchs_avg_pric).unwrap_or(0.0),
                })
                .filter(|h| h.quantity > 0)
                .collect(),
        })
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        price: OrderPrice,
    ) -> GatewayResult<OrderAck> {
        let (cano, product) = self.config.account_parts();
        let (division, unit_price) = match price {
            OrderPrice::Market => ("01", "0".to_string()),
            OrderPrice::Limit(p) => ("00", format!("{:.0}", p)),
        };
        let body = serde_json::json!({
            "CANO": cano,
            "ACNT_PRDT_CD": product,
            "PDNO": symbol,
            "ORD_DVSN": division,
            "ORD_QTY": quantity.to_string(),
            "ORD_UNPR": unit_price,
        });

        let headers = self.headers(&self.config.order_tr_id(side)).await?;
        let request = self
            .client
            .post(self.url("/uapi/domestic-stock/v1/trading/order-cash"))
            .headers(headers)
            .json(&body);
        let envelope = self.send(request).await?;

        let order: Option<RawOrder> = envelope.output.map(serde_json::from_value).transpose()?;
        Ok(OrderAck {
            order_id: order.map(|o| o.odno).filter(|id| !id.is_empty()),
            // order-cash acknowledges acceptance only; fills arrive later
            fill_price: None,
        })
    }

    async fn get_index(&self, code: &str) -> GatewayResult<IndexSnapshot> {
        let envelope = self
            .get(
                "/uapi/domestic-stock/v1/quotations/inquire-index-price",
                "FHPUP02100000",
                &[
                    ("fid_cond_mrkt_div_code", "U".to_string()),
                    ("fid_input_iscd", code.to_string()),
                ],
            )
            .await?;

        let raw: RawIndex = take(envelope.output, "output")?;
        Ok(IndexSnapshot {
            code: code.to_string(),
            value: required_price(&raw.bstp_nmix_prpr, "bstp_nmix_prpr")?,
            change_pct: parse_f64(&raw.bstp_nmix_prdy_ctrt).unwrap_or(0.0),
        })
    }

    async fn get_volume_ranking(&self) -> GatewayResult<Vec<RankedStock>> {
        let envelope = self
            .get(
                "/uapi/domestic-stock/v1/quotations/volume-rank",
                "FHPST01710000",
                &[
                    ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
                    ("FID_COND_SCR_DIV_CODE", "20171".to_string()),
                    ("FID_INPUT_ISCD", "0000".to_string()),
                    ("FID_DIV_CLS_CODE", "0".to_string()),
                    ("FID_BLNG_CLS_CODE", "0".to_string()),
                    ("FID_TRGT_CLS_CODE", "111111111".to_string()),
                    ("FID_TRGT_EXLS_CLS_CODE", "000000".to_string()),
                    ("FID_INPUT_PRICE_1", String::new()),
                    ("FID_INPUT_PRICE_2", String::new()),
                    ("FID_VOL_CNT", String::new()),
                    ("FID_INPUT_DATE_1", String::new()),
                ],
            )
            .await?;

        let raw: Vec<RawRanked> = take(envelope.output, "output")?;
        Ok(raw.into_iter().map(RankedStock::from).collect())
    }

    async fn get_financial_ratios(&self, symbol: &str) -> GatewayResult<FinancialRatios> {
        Ok(self.fetch_price(symbol).await?.ratios())
    }

    async fn stream_approval_key(&self) -> GatewayResult<String> {
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.config.app_key,
            "secretkey": self.config.app_secret,
        });
        let response = self
            .client
            .post(self.url("/oauth2/Approval"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::Auth(format!(
                "approval key request failed with HTTP {}",
                response.status()
            )));
        }
        let approval: ApprovalResponse = response.json().await?;
        Ok(approval.approval_key)
    }
}
