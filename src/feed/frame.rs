//! Realtime frame classification and decoding.
//!
//! The stream carries three kinds of text frames:
//! - JSON control frames (subscription acks carrying the session AES key/iv,
//!   PINGPONG keepalives, encrypted JSON envelopes)
//! - pipe-delimited data frames `flag|tr_id|count|payload`, where flag `1`
//!   means the payload is AES-256-CBC encrypted and base64 encoded
//! - anything else, which is reported as unrecognised

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde_json::Value;

use super::error::{FeedError, FeedResult};
use crate::models::Tick;

pub const TRADE_TR_ID: &str = "H0STCNT0";
pub const PINGPONG_TR_ID: &str = "PINGPONG";

// H0STCNT0 field positions
const F_SYMBOL: usize = 0;
const F_TIME: usize = 1;
const F_PRICE: usize = 2;
const F_TRADE_VOLUME: usize = 12;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Session decryption parameters from a subscription ack
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCipher {
    key: [u8; 32],
    iv: [u8; 16],
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher(..)")
    }
}

impl SessionCipher {
    /// Key and iv are taken as UTF-8 bytes, truncated or zero-padded to 32/16
    pub fn from_strings(key: &str, iv: &str) -> Self {
        let mut k = [0u8; 32];
        let mut v = [0u8; 16];
        let kb = key.as_bytes();
        let vb = iv.as_bytes();
        k[..kb.len().min(32)].copy_from_slice(&kb[..kb.len().min(32)]);
        v[..vb.len().min(16)].copy_from_slice(&vb[..vb.len().min(16)]);
        Self { key: k, iv: v }
    }

    pub fn decrypt(&self, encoded: &str) -> FeedResult<String> {
        let mut buf = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| FeedError::Decrypt(format!("base64: {}", e)))?;
        let decryptor = Aes256CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| FeedError::Decrypt(e.to_string()))?;
        let plain = decryptor
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|_| FeedError::Decrypt("bad padding".to_string()))?;
        String::from_utf8(plain.to_vec()).map_err(|e| FeedError::Decrypt(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SubscribeAck {
        tr_key: String,
        message: String,
        cipher: Option<SessionCipher>,
    },
    PingPong,
    Trades(Vec<Tick>),
    /// Well-formed but not market data (other TR ids, unsubscribe acks, errors)
    Other(String),
}

/// Decoding context owned by one connection
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub cipher: Option<SessionCipher>,
    pub offset: FixedOffset, // Exchange local time
}

impl FrameContext {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            cipher: None,
            offset,
        }
    }

    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    pub fn parse(&self, text: &str) -> FeedResult<Frame> {
        parse_frame(text, self, self.today())
    }
}

pub fn parse_frame(text: &str, ctx: &FrameContext, date: NaiveDate) -> FeedResult<Frame> {
    let text = text.trim();
    if text.starts_with('{') {
        return parse_json(text, ctx, date);
    }
    if text.contains('|') {
        return parse_pipe(text, ctx, date);
    }
    Err(FeedError::Parse(truncate(text)))
}

fn truncate(text: &str) -> String {
    text.chars().take(80).collect()
}

fn parse_json(text: &str, ctx: &FrameContext, date: NaiveDate) -> FeedResult<Frame> {
    let value: Value = serde_json::from_str(text)?;
    let header = &value["header"];
    let body = &value["body"];
    let tr_id = header["tr_id"].as_str().unwrap_or_default();

    if tr_id == PINGPONG_TR_ID {
        return Ok(Frame::PingPong);
    }

    if header["encrypt"].as_str() == Some("Y") {
        if let Some(encrypted) = body.as_str() {
            let cipher = ctx
                .cipher
                .as_ref()
                .ok_or_else(|| FeedError::Decrypt("no session key yet".to_string()))?;
            return parse_records(tr_id, &cipher.decrypt(encrypted)?, 1, ctx, date);
        }
    }

    let message = body["msg1"].as_str().unwrap_or_default().to_string();
    if body["rt_cd"].as_str().is_some_and(|rt| rt != "0") {
        return Ok(Frame::Other(format!("rejected: {}", message)));
    }

    let output = &body["output"];
    let cipher = match (output["key"].as_str(), output["iv"].as_str()) {
        (Some(key), Some(iv)) => Some(SessionCipher::from_strings(key, iv)),
        _ => None,
    };

    if message.contains("SUBSCRIBE") || cipher.is_some() {
        return Ok(Frame::SubscribeAck {
            tr_key: header["tr_key"].as_str().unwrap_or_default().to_string(),
            message,
            cipher,
        });
    }

    Ok(Frame::Other(format!("{} {}", tr_id, message)))
}

fn parse_pipe(text: &str, ctx: &FrameContext, date: NaiveDate) -> FeedResult<Frame> {
    let mut parts = text.splitn(4, '|');
    let (Some(flag), Some(tr_id), Some(count), Some(payload)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(FeedError::Parse(truncate(text)));
    };

    let count: usize = count.trim().parse().unwrap_or(1);

    if flag == "1" {
        let cipher = ctx
            .cipher
            .as_ref()
            .ok_or_else(|| FeedError::Decrypt("no session key yet".to_string()))?;
        let plain = cipher.decrypt(payload)?;
        return parse_records(tr_id, &plain, count, ctx, date);
    }

    parse_records(tr_id, payload, count, ctx, date)
}

/// `count` caret-delimited records concatenated into one payload
fn parse_records(
    tr_id: &str,
    payload: &str,
    count: usize,
    ctx: &FrameContext,
    date: NaiveDate,
) -> FeedResult<Frame> {
    if tr_id != TRADE_TR_ID {
        return Ok(Frame::Other(tr_id.to_string()));
    }

    let fields: Vec<&str> = payload.split('^').collect();
    let count = count.max(1);
    let width = if fields.len() % count == 0 {
        fields.len() / count
    } else {
        fields.len()
    };

    let ticks = fields
        .chunks(width.max(1))
        .map(|record| parse_trade(record, ctx.offset, date))
        .collect::<FeedResult<Vec<_>>>()?;
    Ok(Frame::Trades(ticks))
}

fn parse_trade(fields: &[&str], offset: FixedOffset, date: NaiveDate) -> FeedResult<Tick> {
    if fields.len() <= F_TRADE_VOLUME {
        return Err(FeedError::Parse(format!(
            "trade record has {} fields",
            fields.len()
        )));
    }

    let symbol = fields[F_SYMBOL].trim();
    let price: f64 = fields[F_PRICE]
        .trim()
        .parse()
        .map_err(|_| FeedError::Parse(format!("price {:?}", fields[F_PRICE])))?;
    if symbol.is_empty() || price <= 0.0 {
        return Err(FeedError::Parse(format!("bad trade {} @ {}", symbol, price)));
    }
    let volume: u64 = fields[F_TRADE_VOLUME].trim().parse().unwrap_or(0);

    Ok(Tick::new(
        symbol,
        price,
        volume,
        trade_time(fields[F_TIME], offset, date)?,
    ))
}

fn trade_time(hhmmss: &str, offset: FixedOffset, date: NaiveDate) -> FeedResult<DateTime<Utc>> {
    let time = NaiveTime::parse_from_str(hhmmss.trim(), "%H%M%S")
        .map_err(|_| FeedError::Parse(format!("time {:?}", hhmmss)))?;
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| FeedError::Parse(format!("time {:?}", hhmmss)))
}

/// Subscribe (`true`) or unsubscribe request for one symbol
pub fn subscription_request(approval_key: &str, symbol: &str, subscribe: bool) -> String {
    serde_json::json!({
        "header": {
            "approval_key": approval_key,
            "custtype": "P",
            "tr_type": if subscribe { "1" } else { "2" },
            "content-type": "utf-8",
        },
        "body": {
            "input": {
                "tr_id": TRADE_TR_ID,
                "tr_key": symbol,
            }
        }
    })
    .to_string()
}
