use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{
    config::ApiKeys,
    error::ExchangeError,
    exchange::ExchangeClient,
    rate_limit::RateLimiter,
    types::{
        Balance, Fill, Kline, MarginMode, MarketType, Order, OrderBook, OrderRequest, OrderSide,
        OrderStatus, OrderType, Position, Result, StreamEvent, Subscription, Ticker, Trade,
    },
};
use crate::utils::SignatureHelper;

const REST_URL: &str = "https://www.okx.com";
const WS_PUBLIC_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const WS_PRIVATE_URL: &str = "wss://ws.okx.com:8443/ws/v5/private";

/// OKX交易所实现
///
/// 所有响应走统一的 {code, msg, data} 信封，code != "0" 即失败。
pub struct OkxExchange {
    api_keys: ApiKeys,
    client: reqwest::Client,
    market_type: MarketType,
    limiter: Arc<RateLimiter>,
}

/// OKX REST响应信封
#[derive(Deserialize)]
struct OkxEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

/// OKX订单数据(REST与WS推送共用字段)
#[derive(Deserialize)]
struct OkxOrder {
    #[serde(rename = "ordId")]
    ord_id: String,
    #[serde(rename = "clOrdId", default)]
    cl_ord_id: String,
    #[serde(rename = "instId")]
    inst_id: String,
    side: String,
    #[serde(rename = "ordType")]
    ord_type: String,
    #[serde(default)]
    px: String,
    sz: String,
    #[serde(rename = "accFillSz", default)]
    acc_fill_sz: String,
    state: String,
    #[serde(rename = "cTime", default)]
    c_time: String,
    #[serde(rename = "uTime", default)]
    u_time: String,
}

impl OkxExchange {
    pub fn new(
        market_type: MarketType,
        api_keys: ApiKeys,
        requests_per_second: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("RustGrid/0.1")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ExchangeError::Other(format!("创建HTTP客户端失败: {}", e)))?;

        Ok(Self {
            api_keys,
            client,
            market_type,
            limiter: Arc::new(RateLimiter::new(requests_per_second)),
        })
    }

    /// OKX要求ISO8601毫秒时间戳参与签名
    fn iso_timestamp() -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    fn unwrap_envelope<T>(&self, envelope: OkxEnvelope<T>) -> Result<Vec<T>> {
        match envelope.code.as_str() {
            "0" => Ok(envelope.data),
            "50011" => Err(ExchangeError::RateLimitError(envelope.msg, None)),
            "50111" | "50113" | "50114" => Err(ExchangeError::AuthError(envelope.msg)),
            code => Err(ExchangeError::ApiError {
                code: code.parse().unwrap_or(-1),
                message: envelope.msg,
            }),
        }
    }

    async fn send_public_request<T>(
        &self,
        path: &str,
        params: Option<HashMap<String, String>>,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        self.limiter.acquire().await?;

        let mut url = format!("{}{}", REST_URL, path);
        if let Some(params) = params {
            if !params.is_empty() {
                url = format!("{}?{}", url, SignatureHelper::build_query_string(&params));
            }
        }

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let code = response.status().as_u16() as i32;
            let text = response.text().await.unwrap_or_default();
            self.limiter.report_error().await;
            return Err(ExchangeError::ApiError {
                code,
                message: text,
            });
        }

        let envelope: OkxEnvelope<T> = response
            .json()
            .await
            .map_err(|e| ExchangeError::ParseError(format!("JSON解析错误: {}", e)))?;
        self.unwrap_envelope(envelope)
    }

    async fn send_signed_request<T>(
        &self,
        method: &str,
        path: &str,
        query: Option<HashMap<String, String>>,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        self.limiter.acquire().await?;

        let request_path = match &query {
            Some(params) if !params.is_empty() => {
                format!("{}?{}", path, SignatureHelper::build_query_string(params))
            }
            _ => path.to_string(),
        };
        let body_text = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();

        let timestamp = Self::iso_timestamp();
        let signature = SignatureHelper::okx_signature(
            &self.api_keys.api_secret,
            &timestamp,
            method,
            &request_path,
            &body_text,
        );

        let url = format!("{}{}", REST_URL, request_path);
        let mut request = match method {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            _ => return Err(ExchangeError::Other(format!("不支持的HTTP方法: {}", method))),
        };

        request = request
            .header("OK-ACCESS-KEY", &self.api_keys.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header(
                "OK-ACCESS-PASSPHRASE",
                self.api_keys.passphrase.as_deref().unwrap_or(""),
            )
            .header("Content-Type", "application/json");

        if !body_text.is_empty() {
            request = request.body(body_text);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let code = response.status().as_u16() as i32;
            let text = response.text().await.unwrap_or_default();
            self.limiter.report_error().await;
            return match code {
                429 => Err(ExchangeError::RateLimitError(text, None)),
                401 => Err(ExchangeError::AuthError(text)),
                _ => Err(ExchangeError::ApiError {
                    code,
                    message: text,
                }),
            };
        }

        let envelope: OkxEnvelope<T> = response
            .json()
            .await
            .map_err(|e| ExchangeError::ParseError(format!("JSON解析错误: {}", e)))?;
        self.unwrap_envelope(envelope)
    }

    fn parse_state(state: &str) -> OrderStatus {
        match state {
            "live" => OrderStatus::Open,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" | "mmp_canceled" => OrderStatus::Canceled,
            _ => OrderStatus::Pending,
        }
    }

    fn parse_side(side: &str) -> OrderSide {
        if side.eq_ignore_ascii_case("buy") {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }

    fn to_order(&self, raw: OkxOrder) -> Order {
        let amount = raw.sz.parse::<f64>().unwrap_or(0.0);
        let filled = raw.acc_fill_sz.parse::<f64>().unwrap_or(0.0);

        Order {
            id: raw.ord_id,
            client_order_id: Some(raw.cl_ord_id).filter(|c| !c.is_empty()),
            symbol: raw.inst_id,
            side: Self::parse_side(&raw.side),
            order_type: if raw.ord_type == "market" {
                OrderType::Market
            } else {
                OrderType::Limit
            },
            amount,
            price: raw.px.parse::<f64>().ok().filter(|p| *p > 0.0),
            filled,
            remaining: (amount - filled).max(0.0),
            status: Self::parse_state(&raw.state),
            market_type: self.market_type,
            timestamp: parse_millis(&raw.c_time),
            last_update: Some(parse_millis(&raw.u_time)),
        }
    }
}

fn parse_millis(text: &str) -> DateTime<Utc> {
    text.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl ExchangeClient for OkxExchange {
    fn name(&self) -> &str {
        "okx"
    }

    async fn connect(&self) -> Result<()> {
        self.health_check().await
    }

    async fn authenticate(&self) -> Result<()> {
        if self.api_keys.api_key.is_empty() {
            return Err(ExchangeError::AuthError("缺少API密钥".to_string()));
        }

        let _: Vec<serde_json::Value> = self
            .send_signed_request("GET", "/api/v5/account/config", None, None)
            .await?;
        log::info!("✅ OKX 认证成功");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "instId")]
            inst_id: String,
            last: String,
            #[serde(rename = "bidPx", default)]
            bid_px: String,
            #[serde(rename = "askPx", default)]
            ask_px: String,
            #[serde(rename = "high24h", default)]
            high: String,
            #[serde(rename = "low24h", default)]
            low: String,
            #[serde(rename = "vol24h", default)]
            volume: String,
            ts: String,
        }

        let mut params = HashMap::new();
        params.insert("instId".to_string(), symbol.to_string());

        let mut data: Vec<Raw> = self
            .send_public_request("/api/v5/market/ticker", Some(params))
            .await?;
        let raw = data.pop().ok_or_else(|| {
            ExchangeError::ParseError(format!("OKX行情为空: {}", symbol))
        })?;

        Ok(Ticker {
            symbol: raw.inst_id,
            high: raw.high.parse().unwrap_or(0.0),
            low: raw.low.parse().unwrap_or(0.0),
            bid: raw.bid_px.parse().unwrap_or(0.0),
            ask: raw.ask_px.parse().unwrap_or(0.0),
            last: raw.last.parse().unwrap_or(0.0),
            volume: raw.volume.parse().unwrap_or(0.0),
            timestamp: parse_millis(&raw.ts),
        })
    }

    async fn get_order_book(&self, symbol: &str, limit: Option<u32>) -> Result<OrderBook> {
        #[derive(Deserialize)]
        struct Raw {
            bids: Vec<Vec<String>>,
            asks: Vec<Vec<String>>,
            ts: String,
        }

        let mut params = HashMap::new();
        params.insert("instId".to_string(), symbol.to_string());
        params.insert("sz".to_string(), limit.unwrap_or(20).to_string());

        let mut data: Vec<Raw> = self
            .send_public_request("/api/v5/market/books", Some(params))
            .await?;
        let raw = data.pop().ok_or_else(|| {
            ExchangeError::ParseError(format!("OKX订单簿为空: {}", symbol))
        })?;

        let parse_levels = |levels: Vec<Vec<String>>| -> Vec<[f64; 2]> {
            levels
                .into_iter()
                .filter_map(|row| {
                    let p = row.first()?.parse().ok()?;
                    let q = row.get(1)?.parse().ok()?;
                    Some([p, q])
                })
                .collect()
        };

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: parse_levels(raw.bids),
            asks: parse_levels(raw.asks),
            timestamp: parse_millis(&raw.ts),
        })
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Kline>> {
        let mut params = HashMap::new();
        params.insert("instId".to_string(), symbol.to_string());
        params.insert("bar".to_string(), interval.to_string());
        params.insert("limit".to_string(), limit.unwrap_or(100).to_string());

        let data: Vec<Vec<String>> = self
            .send_public_request("/api/v5/market/candles", Some(params))
            .await?;

        Ok(data
            .into_iter()
            .filter_map(|row| {
                let open_time = parse_millis(row.first()?);
                let get = |idx: usize| row.get(idx).and_then(|s| s.parse::<f64>().ok());
                Some(Kline {
                    symbol: symbol.to_string(),
                    interval: interval.to_string(),
                    open_time,
                    close_time: open_time,
                    open: get(1)?,
                    high: get(2)?,
                    low: get(3)?,
                    close: get(4)?,
                    volume: get(5).unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn get_trades(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Trade>> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "tradeId")]
            trade_id: String,
            px: String,
            sz: String,
            side: String,
            ts: String,
        }

        let mut params = HashMap::new();
        params.insert("instId".to_string(), symbol.to_string());
        params.insert("limit".to_string(), limit.unwrap_or(100).to_string());

        let data: Vec<Raw> = self
            .send_public_request("/api/v5/market/trades", Some(params))
            .await?;

        Ok(data
            .into_iter()
            .map(|t| Trade {
                id: t.trade_id,
                symbol: symbol.to_string(),
                side: Self::parse_side(&t.side),
                amount: t.sz.parse().unwrap_or(0.0),
                price: t.px.parse().unwrap_or(0.0),
                timestamp: parse_millis(&t.ts),
            })
            .collect())
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        #[derive(Deserialize)]
        struct Detail {
            ccy: String,
            #[serde(rename = "cashBal", default)]
            cash_bal: String,
            #[serde(rename = "availBal", default)]
            avail_bal: String,
            #[serde(rename = "frozenBal", default)]
            frozen_bal: String,
        }
        #[derive(Deserialize)]
        struct Raw {
            details: Vec<Detail>,
        }

        let data: Vec<Raw> = self
            .send_signed_request("GET", "/api/v5/account/balance", None, None)
            .await?;

        Ok(data
            .into_iter()
            .flat_map(|r| r.details)
            .map(|d| Balance {
                currency: d.ccy,
                total: d.cash_bal.parse().unwrap_or(0.0),
                free: d.avail_bal.parse().unwrap_or(0.0),
                used: d.frozen_bal.parse().unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "instId")]
            inst_id: String,
            pos: String,
            #[serde(rename = "avgPx", default)]
            avg_px: String,
            #[serde(rename = "markPx", default)]
            mark_px: String,
            #[serde(rename = "upl", default)]
            upl: String,
            #[serde(default)]
            lever: String,
            #[serde(rename = "uTime", default)]
            u_time: String,
        }

        let mut params = HashMap::new();
        params.insert("instId".to_string(), symbol.to_string());

        let data: Vec<Raw> = self
            .send_signed_request("GET", "/api/v5/account/positions", Some(params), None)
            .await?;

        Ok(data
            .into_iter()
            .find(|p| p.inst_id == symbol)
            .map(|p| Position {
                symbol: p.inst_id,
                amount: p.pos.parse().unwrap_or(0.0),
                entry_price: p.avg_px.parse().unwrap_or(0.0),
                mark_price: p.mark_px.parse().unwrap_or(0.0),
                unrealized_pnl: p.upl.parse().unwrap_or(0.0),
                leverage: p.lever.parse().unwrap_or(1),
                timestamp: parse_millis(&p.u_time),
            })
            .filter(|p| p.amount.abs() > f64::EPSILON))
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        let mut params = HashMap::new();
        params.insert("instId".to_string(), symbol.to_string());

        let data: Vec<OkxOrder> = self
            .send_signed_request("GET", "/api/v5/trade/orders-pending", Some(params), None)
            .await?;
        Ok(data.into_iter().map(|o| self.to_order(o)).collect())
    }

    async fn get_order_history(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Order>> {
        let mut params = HashMap::new();
        params.insert("instId".to_string(), symbol.to_string());
        params.insert(
            "instType".to_string(),
            match self.market_type {
                MarketType::Spot => "SPOT".to_string(),
                MarketType::Futures => "SWAP".to_string(),
            },
        );
        params.insert("limit".to_string(), limit.unwrap_or(100).to_string());

        let data: Vec<OkxOrder> = self
            .send_signed_request("GET", "/api/v5/trade/orders-history", Some(params), None)
            .await?;
        Ok(data.into_iter().map(|o| self.to_order(o)).collect())
    }

    async fn get_recent_fills(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Fill>> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "tradeId")]
            trade_id: String,
            #[serde(rename = "ordId")]
            ord_id: String,
            #[serde(rename = "clOrdId", default)]
            cl_ord_id: String,
            #[serde(rename = "instId")]
            inst_id: String,
            side: String,
            #[serde(rename = "fillPx")]
            fill_px: String,
            #[serde(rename = "fillSz")]
            fill_sz: String,
            #[serde(default)]
            fee: String,
            ts: String,
        }

        let mut params = HashMap::new();
        params.insert("instId".to_string(), symbol.to_string());
        params.insert("limit".to_string(), limit.unwrap_or(100).to_string());

        let data: Vec<Raw> = self
            .send_signed_request("GET", "/api/v5/trade/fills", Some(params), None)
            .await?;

        Ok(data
            .into_iter()
            .map(|f| Fill {
                id: f.trade_id,
                order_id: f.ord_id,
                client_order_id: Some(f.cl_ord_id).filter(|c| !c.is_empty()),
                symbol: f.inst_id,
                side: Self::parse_side(&f.side),
                price: f.fill_px.parse().unwrap_or(0.0),
                amount: f.fill_sz.parse().unwrap_or(0.0),
                // OKX手续费为负数表示支出
                fee: f.fee.parse::<f64>().map(f64::abs).unwrap_or(0.0),
                timestamp: parse_millis(&f.ts),
            })
            .collect())
    }

    async fn create_order(&self, request: OrderRequest) -> Result<Order> {
        log::info!(
            "📤 [okx] 提交订单 关联ID={} {} {} {:?} 数量={} 价格={:?}",
            request.client_order_id,
            request.symbol,
            request.side,
            request.order_type,
            request.amount,
            request.price
        );

        let td_mode = match self.market_type {
            MarketType::Spot => "cash",
            MarketType::Futures => "cross",
        };
        let mut body = serde_json::json!({
            "instId": request.symbol,
            "tdMode": td_mode,
            "clOrdId": request.client_order_id,
            "side": match request.side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            "ordType": match request.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
            },
            "sz": request.amount.to_string(),
        });
        if let Some(price) = request.price {
            body["px"] = serde_json::Value::String(price.to_string());
        }
        if request.reduce_only == Some(true) {
            body["reduceOnly"] = serde_json::Value::Bool(true);
        }

        #[derive(Deserialize)]
        struct Ack {
            #[serde(rename = "ordId")]
            ord_id: String,
            #[serde(rename = "sCode")]
            s_code: String,
            #[serde(rename = "sMsg", default)]
            s_msg: String,
        }

        let result: Result<Vec<Ack>> = self
            .send_signed_request("POST", "/api/v5/trade/order", None, Some(body))
            .await;

        let acks = match result {
            Ok(acks) => acks,
            Err(ExchangeError::ApiError { message, .. }) => {
                return Err(ExchangeError::OrderRejected {
                    client_order_id: request.client_order_id,
                    reason: message,
                })
            }
            Err(e) => return Err(e),
        };

        let ack = acks.into_iter().next().ok_or_else(|| {
            ExchangeError::ParseError("OKX下单响应为空".to_string())
        })?;
        if ack.s_code != "0" {
            return Err(ExchangeError::OrderRejected {
                client_order_id: request.client_order_id,
                reason: ack.s_msg,
            });
        }

        Ok(Order {
            id: ack.ord_id,
            client_order_id: Some(request.client_order_id),
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            amount: request.amount,
            price: request.price,
            filled: 0.0,
            remaining: request.amount,
            status: OrderStatus::Open,
            market_type: self.market_type,
            timestamp: Utc::now(),
            last_update: None,
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<Order> {
        log::info!("📤 [okx] 撤销订单 ID={} 交易对={}", order_id, symbol);

        let body = serde_json::json!({
            "instId": symbol,
            "ordId": order_id,
        });

        let _: Vec<serde_json::Value> = self
            .send_signed_request("POST", "/api/v5/trade/cancel-order", None, Some(body))
            .await
            .map_err(|e| match e {
                ExchangeError::ApiError { code, .. } if code == 51400 || code == 51401 => {
                    ExchangeError::OrderNotFound {
                        order_id: order_id.to_string(),
                        symbol: symbol.to_string(),
                    }
                }
                other => other,
            })?;

        // OKX撤单响应不带完整订单，回查一次状态
        let mut orders = self.get_order_history(symbol, Some(20)).await?;
        let found = orders
            .drain(..)
            .find(|o| o.id == order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
                symbol: symbol.to_string(),
            });
        found
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        log::info!("📤 [okx] 撤销全部挂单 交易对={}", symbol);

        // OKX没有按交易对全撤的端点，逐个撤销
        let open_orders = self.get_open_orders(symbol).await?;
        let mut canceled = Vec::new();
        for order in open_orders {
            match self.cancel_order(&order.id, symbol).await {
                Ok(o) => canceled.push(o),
                Err(ExchangeError::OrderNotFound { .. }) => {}
                Err(e) => log::warn!("[okx] 撤销订单 {} 失败: {}", order.id, e),
            }
        }
        Ok(canceled)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        if self.market_type == MarketType::Spot {
            return Ok(());
        }

        let body = serde_json::json!({
            "instId": symbol,
            "lever": leverage.to_string(),
            "mgnMode": "cross",
        });

        let _: Vec<serde_json::Value> = self
            .send_signed_request("POST", "/api/v5/account/set-leverage", None, Some(body))
            .await?;
        log::info!("✅ [okx] {} 杠杆已设置为 {}x", symbol, leverage);
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<()> {
        if self.market_type == MarketType::Spot {
            return Ok(());
        }

        // OKX的保证金模式随杠杆设置一起提交
        let body = serde_json::json!({
            "instId": symbol,
            "lever": "1",
            "mgnMode": mode.to_string(),
        });

        let _: Vec<serde_json::Value> = self
            .send_signed_request("POST", "/api/v5/account/set-leverage", None, Some(body))
            .await?;
        log::info!("✅ [okx] {} 保证金模式已设置为 {}", symbol, mode);
        Ok(())
    }

    async fn stream_endpoint(&self, needs_auth: bool) -> Result<String> {
        Ok(if needs_auth {
            WS_PRIVATE_URL.to_string()
        } else {
            WS_PUBLIC_URL.to_string()
        })
    }

    fn auth_message(&self) -> Result<Option<String>> {
        if self.api_keys.api_key.is_empty() {
            return Ok(None);
        }

        let timestamp = SignatureHelper::timestamp_seconds().to_string();
        let sign = SignatureHelper::okx_signature(
            &self.api_keys.api_secret,
            &timestamp,
            "GET",
            "/users/self/verify",
            "",
        );

        Ok(Some(
            serde_json::json!({
                "op": "login",
                "args": [{
                    "apiKey": self.api_keys.api_key,
                    "passphrase": self.api_keys.passphrase.as_deref().unwrap_or(""),
                    "timestamp": timestamp,
                    "sign": sign,
                }]
            })
            .to_string(),
        ))
    }

    fn build_subscribe_messages(&self, subscriptions: &[Subscription]) -> Result<Vec<String>> {
        let inst_type = match self.market_type {
            MarketType::Spot => "SPOT",
            MarketType::Futures => "SWAP",
        };

        let args: Vec<serde_json::Value> = subscriptions
            .iter()
            .map(|sub| match sub {
                Subscription::Ticker(symbol) => {
                    serde_json::json!({"channel": "tickers", "instId": symbol})
                }
                Subscription::OrderBook(symbol) => {
                    serde_json::json!({"channel": "books5", "instId": symbol})
                }
                Subscription::Trades(symbol) => {
                    serde_json::json!({"channel": "trades", "instId": symbol})
                }
                Subscription::UserData => {
                    serde_json::json!({"channel": "orders", "instType": inst_type})
                }
            })
            .collect();

        if args.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![serde_json::json!({
            "op": "subscribe",
            "args": args,
        })
        .to_string()])
    }

    fn heartbeat_message(&self) -> String {
        "ping".to_string()
    }

    fn is_heartbeat_reply(&self, message: &str) -> bool {
        message == "pong"
    }

    fn is_subscribe_ack(&self, message: &str) -> bool {
        message.contains("\"event\":\"subscribe\"")
    }

    fn parse_stream_message(&self, message: &str) -> Result<Vec<StreamEvent>> {
        let value: serde_json::Value = match serde_json::from_str(message) {
            Ok(v) => v,
            Err(_) => return Ok(Vec::new()),
        };

        let channel = value
            .pointer("/arg/channel")
            .and_then(|c| c.as_str())
            .unwrap_or("");
        let data = match value.get("data").and_then(|d| d.as_array()) {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };

        let as_f64 = |v: &serde_json::Value, key: &str| {
            v.get(key)
                .and_then(|x| x.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let as_str = |v: &serde_json::Value, key: &str| {
            v.get(key).and_then(|x| x.as_str()).unwrap_or("").to_string()
        };

        let mut events = Vec::new();
        for item in data {
            match channel {
                "tickers" => {
                    events.push(StreamEvent::Ticker(Ticker {
                        symbol: as_str(item, "instId"),
                        high: as_f64(item, "high24h"),
                        low: as_f64(item, "low24h"),
                        bid: as_f64(item, "bidPx"),
                        ask: as_f64(item, "askPx"),
                        last: as_f64(item, "last"),
                        volume: as_f64(item, "vol24h"),
                        timestamp: parse_millis(&as_str(item, "ts")),
                    }));
                }
                "trades" => {
                    events.push(StreamEvent::Trade(Trade {
                        id: as_str(item, "tradeId"),
                        symbol: as_str(item, "instId"),
                        side: Self::parse_side(&as_str(item, "side")),
                        amount: as_f64(item, "sz"),
                        price: as_f64(item, "px"),
                        timestamp: parse_millis(&as_str(item, "ts")),
                    }));
                }
                "orders" => {
                    let raw: OkxOrder = match serde_json::from_value(item.clone()) {
                        Ok(o) => o,
                        Err(e) => {
                            log::warn!("[okx] 订单推送解析失败: {}", e);
                            continue;
                        }
                    };
                    let order = self.to_order(raw);
                    events.push(StreamEvent::OrderUpdate(order.clone()));

                    let fill_sz = as_f64(item, "fillSz");
                    if fill_sz > 0.0 {
                        events.push(StreamEvent::Fill(Fill {
                            id: as_str(item, "tradeId"),
                            order_id: order.id.clone(),
                            client_order_id: order.client_order_id.clone(),
                            symbol: order.symbol.clone(),
                            side: order.side,
                            price: as_f64(item, "fillPx"),
                            amount: fill_sz,
                            fee: as_f64(item, "fillFee").abs(),
                            timestamp: parse_millis(&as_str(item, "fillTime")),
                        }));
                    }
                }
                _ => {}
            }
        }

        Ok(events)
    }

    async fn health_check(&self) -> Result<()> {
        let _: Vec<serde_json::Value> = self
            .send_public_request("/api/v5/public/time", None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_exchange() -> OkxExchange {
        OkxExchange::new(MarketType::Futures, ApiKeys::anonymous(), 10).unwrap()
    }

    #[test]
    fn test_subscribe_message_includes_orders_channel() {
        let exchange = sample_exchange();
        let messages = exchange
            .build_subscribe_messages(&[
                Subscription::Ticker("BTC-USDT-SWAP".to_string()),
                Subscription::UserData,
            ])
            .unwrap();

        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("tickers"));
        assert!(messages[0].contains("\"channel\":\"orders\""));
        assert!(messages[0].contains("SWAP"));
    }

    #[test]
    fn test_parse_ticker_push() {
        let exchange = sample_exchange();
        let message = r#"{"arg":{"channel":"tickers","instId":"BTC-USDT-SWAP"},"data":[{"instId":"BTC-USDT-SWAP","last":"35000.5","bidPx":"35000.4","askPx":"35000.6","high24h":"36000","low24h":"34000","vol24h":"9999","ts":"1700000000000"}]}"#;
        let events = exchange.parse_stream_message(message).unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Ticker(t) => {
                assert_eq!(t.symbol, "BTC-USDT-SWAP");
                assert_eq!(t.last, 35000.5);
            }
            other => panic!("意外的事件类型: {:?}", other),
        }
    }

    #[test]
    fn test_parse_order_push_with_fill() {
        let exchange = sample_exchange();
        let message = r#"{"arg":{"channel":"orders","instType":"SWAP"},"data":[{"ordId":"998","clOrdId":"GRD2S","instId":"BTC-USDT-SWAP","side":"sell","ordType":"limit","px":"9600","sz":"0.01","accFillSz":"0.01","fillSz":"0.01","fillPx":"9600","fillTime":"1700000002000","fillFee":"-0.03","state":"filled","cTime":"1700000000000","uTime":"1700000002000"}]}"#;
        let events = exchange.parse_stream_message(message).unwrap();

        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (StreamEvent::OrderUpdate(order), StreamEvent::Fill(fill)) => {
                assert_eq!(order.status, OrderStatus::Filled);
                assert_eq!(fill.amount, 0.01);
                assert_eq!(fill.fee, 0.03);
            }
            other => panic!("意外的事件组合: {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_detection() {
        let exchange = sample_exchange();
        assert!(exchange.is_heartbeat_reply("pong"));
        assert!(exchange.is_subscribe_ack(r#"{"event":"subscribe","arg":{"channel":"tickers"}}"#));
    }
}
