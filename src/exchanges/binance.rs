use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
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

/// 币安交易所实现
///
/// 现货与U本位期货共用一套实现，按 market_type 选择端点。
pub struct BinanceExchange {
    api_keys: ApiKeys,
    client: reqwest::Client,
    market_type: MarketType,
    limiter: Arc<RateLimiter>,
    testnet: bool,
}

impl BinanceExchange {
    pub fn new(
        market_type: MarketType,
        api_keys: ApiKeys,
        requests_per_second: u32,
        testnet: bool,
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
            testnet,
        })
    }

    fn base_url(&self) -> &'static str {
        match (self.market_type, self.testnet) {
            (MarketType::Spot, false) => "https://api.binance.com",
            (MarketType::Spot, true) => "https://testnet.binance.vision",
            (MarketType::Futures, false) => "https://fapi.binance.com",
            (MarketType::Futures, true) => "https://testnet.binancefuture.com",
        }
    }

    fn ws_url(&self) -> &'static str {
        match self.market_type {
            MarketType::Spot => "wss://stream.binance.com:9443/ws",
            MarketType::Futures => "wss://fstream.binance.com/ws",
        }
    }

    /// REST路径前缀：现货 /api/v3，期货 /fapi/v1
    fn path(&self, spot: &str, futures: &str) -> String {
        match self.market_type {
            MarketType::Spot => format!("/api/v3/{}", spot),
            MarketType::Futures => format!("/fapi/v1/{}", futures),
        }
    }

    /// 统一处理响应状态码并分类错误
    async fn classify_response<T>(&self, response: reqwest::Response) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ExchangeError::ParseError(format!("JSON解析错误: {}", e)));
        }

        let code = status.as_u16() as i32;
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "未知错误".to_string());

        self.limiter.report_error().await;

        match code {
            429 | 418 => Err(ExchangeError::RateLimitError(error_text, None)),
            401 | 403 => Err(ExchangeError::AuthError(error_text)),
            _ => Err(ExchangeError::ApiError {
                code,
                message: error_text,
            }),
        }
    }

    /// 发送公共请求
    async fn send_public_request<T>(
        &self,
        endpoint: &str,
        params: Option<HashMap<String, String>>,
    ) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.limiter.acquire().await?;

        let mut url = format!("{}{}", self.base_url(), endpoint);
        if let Some(params) = params {
            if !params.is_empty() {
                url = format!("{}?{}", url, SignatureHelper::build_query_string(&params));
            }
        }

        let response = self.client.get(&url).send().await?;
        self.classify_response(response).await
    }

    /// 发送认证请求
    async fn send_signed_request<T>(
        &self,
        method: &str,
        endpoint: &str,
        mut params: HashMap<String, String>,
    ) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.limiter.acquire().await?;

        params.insert(
            "timestamp".to_string(),
            SignatureHelper::timestamp().to_string(),
        );
        params.insert("recvWindow".to_string(), "10000".to_string());

        // 按字母顺序排序参数以生成签名
        let mut sorted_params: Vec<(&String, &String)> = params.iter().collect();
        sorted_params.sort_by_key(|&(k, _)| k);
        let query_string = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let signature =
            SignatureHelper::binance_signature(&self.api_keys.api_secret, &query_string);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url(),
            endpoint,
            query_string,
            signature
        );

        let request = match method {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "DELETE" => self.client.delete(&url),
            "PUT" => self.client.put(&url),
            _ => return Err(ExchangeError::Other(format!("不支持的HTTP方法: {}", method))),
        };

        let response = request
            .header("X-MBX-APIKEY", &self.api_keys.api_key)
            .send()
            .await?;
        self.classify_response(response).await
    }

    /// 创建用户数据流 listenKey
    async fn create_listen_key(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct ListenKeyResponse {
            #[serde(rename = "listenKey")]
            listen_key: String,
        }

        self.limiter.acquire().await?;
        let endpoint = self.path("userDataStream", "listenKey");
        let response = self
            .client
            .post(format!("{}{}", self.base_url(), endpoint))
            .header("X-MBX-APIKEY", &self.api_keys.api_key)
            .send()
            .await?;
        let data: ListenKeyResponse = self.classify_response(response).await?;

        log::info!("✅ Binance ListenKey创建成功");
        Ok(data.listen_key)
    }

    fn parse_status(status: &str) -> OrderStatus {
        match status {
            "NEW" => OrderStatus::Open,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
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

    fn to_order(&self, raw: BinanceOrder) -> Order {
        let amount = raw.orig_qty.parse::<f64>().unwrap_or(0.0);
        let filled = raw.executed_qty.parse::<f64>().unwrap_or(0.0);
        let price = raw.price.parse::<f64>().ok().filter(|p| *p > 0.0);

        Order {
            id: raw.order_id.to_string(),
            client_order_id: Some(raw.client_order_id),
            symbol: raw.symbol,
            side: Self::parse_side(&raw.side),
            order_type: if raw.order_type == "MARKET" {
                OrderType::Market
            } else {
                OrderType::Limit
            },
            amount,
            price,
            filled,
            remaining: (amount - filled).max(0.0),
            status: Self::parse_status(&raw.status),
            market_type: self.market_type,
            timestamp: millis_to_datetime(raw.time.or(raw.update_time).unwrap_or(0)),
            last_update: raw.update_time.map(millis_to_datetime),
        }
    }
}

/// 币安订单响应(现货/期货公共字段)
#[derive(Deserialize)]
struct BinanceOrder {
    symbol: String,
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(rename = "clientOrderId", alias = "origClientOrderId")]
    client_order_id: String,
    price: String,
    #[serde(rename = "origQty")]
    orig_qty: String,
    #[serde(rename = "executedQty")]
    executed_qty: String,
    status: String,
    #[serde(rename = "type")]
    order_type: String,
    side: String,
    #[serde(default)]
    time: Option<i64>,
    #[serde(rename = "updateTime", default)]
    update_time: Option<i64>,
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl ExchangeClient for BinanceExchange {
    fn name(&self) -> &str {
        "binance"
    }

    async fn connect(&self) -> Result<()> {
        // REST无长连接，连通性通过ping确认
        self.health_check().await
    }

    async fn authenticate(&self) -> Result<()> {
        if self.api_keys.api_key.is_empty() {
            return Err(ExchangeError::AuthError("缺少API密钥".to_string()));
        }

        // 用账户端点验证密钥有效性
        let endpoint = match self.market_type {
            MarketType::Spot => "/api/v3/account".to_string(),
            MarketType::Futures => "/fapi/v2/balance".to_string(),
        };
        let _: serde_json::Value = self
            .send_signed_request("GET", &endpoint, HashMap::new())
            .await
            .map_err(|e| match e {
                ExchangeError::ApiError { code, message } if code == 400 || code == 401 => {
                    ExchangeError::AuthError(message)
                }
                other => other,
            })?;

        log::info!("✅ Binance 认证成功 ({:?})", self.market_type);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // HTTP连接池由reqwest管理，无需显式释放
        Ok(())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        #[derive(Deserialize)]
        struct Raw {
            symbol: String,
            #[serde(rename = "highPrice")]
            high: String,
            #[serde(rename = "lowPrice")]
            low: String,
            #[serde(rename = "lastPrice")]
            last: String,
            volume: String,
        }

        #[derive(Deserialize)]
        struct BookRaw {
            #[serde(rename = "bidPrice")]
            bid: String,
            #[serde(rename = "askPrice")]
            ask: String,
        }

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());

        let endpoint = self.path("ticker/24hr", "ticker/24hr");
        let raw: Raw = self
            .send_public_request(&endpoint, Some(params.clone()))
            .await?;

        let book_endpoint = self.path("ticker/bookTicker", "ticker/bookTicker");
        let book: BookRaw = self.send_public_request(&book_endpoint, Some(params)).await?;

        Ok(Ticker {
            symbol: raw.symbol,
            high: raw.high.parse().unwrap_or(0.0),
            low: raw.low.parse().unwrap_or(0.0),
            bid: book.bid.parse().unwrap_or(0.0),
            ask: book.ask.parse().unwrap_or(0.0),
            last: raw.last.parse().unwrap_or(0.0),
            volume: raw.volume.parse().unwrap_or(0.0),
            timestamp: Utc::now(),
        })
    }

    async fn get_order_book(&self, symbol: &str, limit: Option<u32>) -> Result<OrderBook> {
        #[derive(Deserialize)]
        struct Raw {
            bids: Vec<[String; 2]>,
            asks: Vec<[String; 2]>,
        }

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("limit".to_string(), limit.unwrap_or(20).to_string());

        let endpoint = self.path("depth", "depth");
        let raw: Raw = self.send_public_request(&endpoint, Some(params)).await?;

        let parse_levels = |levels: Vec<[String; 2]>| {
            levels
                .into_iter()
                .map(|[p, q]| [p.parse().unwrap_or(0.0), q.parse().unwrap_or(0.0)])
                .collect()
        };

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: parse_levels(raw.bids),
            asks: parse_levels(raw.asks),
            timestamp: Utc::now(),
        })
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Kline>> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("interval".to_string(), interval.to_string());
        params.insert("limit".to_string(), limit.unwrap_or(100).to_string());

        let endpoint = self.path("klines", "klines");
        let raw: Vec<Vec<serde_json::Value>> =
            self.send_public_request(&endpoint, Some(params)).await?;

        let klines = raw
            .into_iter()
            .filter_map(|row| {
                let open_time = row.first()?.as_i64()?;
                let close_time = row.get(6)?.as_i64()?;
                let as_f64 = |idx: usize| {
                    row.get(idx)
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse::<f64>().ok())
                        .unwrap_or(0.0)
                };
                Some(Kline {
                    symbol: symbol.to_string(),
                    interval: interval.to_string(),
                    open_time: millis_to_datetime(open_time),
                    close_time: millis_to_datetime(close_time),
                    open: as_f64(1),
                    high: as_f64(2),
                    low: as_f64(3),
                    close: as_f64(4),
                    volume: as_f64(5),
                })
            })
            .collect();

        Ok(klines)
    }

    async fn get_trades(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Trade>> {
        #[derive(Deserialize)]
        struct Raw {
            id: u64,
            price: String,
            qty: String,
            time: i64,
            #[serde(rename = "isBuyerMaker")]
            is_buyer_maker: bool,
        }

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("limit".to_string(), limit.unwrap_or(100).to_string());

        let endpoint = self.path("trades", "trades");
        let raw: Vec<Raw> = self.send_public_request(&endpoint, Some(params)).await?;

        Ok(raw
            .into_iter()
            .map(|t| Trade {
                id: t.id.to_string(),
                symbol: symbol.to_string(),
                side: if t.is_buyer_maker {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                },
                amount: t.qty.parse().unwrap_or(0.0),
                price: t.price.parse().unwrap_or(0.0),
                timestamp: millis_to_datetime(t.time),
            })
            .collect())
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        match self.market_type {
            MarketType::Futures => {
                #[derive(Deserialize)]
                struct Raw {
                    asset: String,
                    balance: String,
                    #[serde(rename = "availableBalance")]
                    available: String,
                }

                let raw: Vec<Raw> = self
                    .send_signed_request("GET", "/fapi/v2/balance", HashMap::new())
                    .await?;

                Ok(raw
                    .into_iter()
                    .map(|b| {
                        let total = b.balance.parse().unwrap_or(0.0);
                        let free = b.available.parse().unwrap_or(0.0);
                        Balance {
                            currency: b.asset,
                            total,
                            free,
                            used: (total - free).max(0.0),
                        }
                    })
                    .collect())
            }
            MarketType::Spot => {
                #[derive(Deserialize)]
                struct RawBalance {
                    asset: String,
                    free: String,
                    locked: String,
                }
                #[derive(Deserialize)]
                struct RawAccount {
                    balances: Vec<RawBalance>,
                }

                let raw: RawAccount = self
                    .send_signed_request("GET", "/api/v3/account", HashMap::new())
                    .await?;

                Ok(raw
                    .balances
                    .into_iter()
                    .map(|b| {
                        let free = b.free.parse().unwrap_or(0.0);
                        let used = b.locked.parse().unwrap_or(0.0);
                        Balance {
                            currency: b.asset,
                            total: free + used,
                            free,
                            used,
                        }
                    })
                    .collect())
            }
        }
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        if self.market_type == MarketType::Spot {
            return Ok(None);
        }

        #[derive(Deserialize)]
        struct Raw {
            symbol: String,
            #[serde(rename = "positionAmt")]
            position_amt: String,
            #[serde(rename = "entryPrice")]
            entry_price: String,
            #[serde(rename = "markPrice")]
            mark_price: String,
            #[serde(rename = "unRealizedProfit")]
            unrealized: String,
            leverage: String,
        }

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());

        let raw: Vec<Raw> = self
            .send_signed_request("GET", "/fapi/v2/positionRisk", params)
            .await?;

        let position = raw
            .into_iter()
            .find(|p| p.symbol == symbol)
            .map(|p| Position {
                symbol: p.symbol,
                amount: p.position_amt.parse().unwrap_or(0.0),
                entry_price: p.entry_price.parse().unwrap_or(0.0),
                mark_price: p.mark_price.parse().unwrap_or(0.0),
                unrealized_pnl: p.unrealized.parse().unwrap_or(0.0),
                leverage: p.leverage.parse().unwrap_or(1),
                timestamp: Utc::now(),
            })
            .filter(|p| p.amount.abs() > f64::EPSILON);

        Ok(position)
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());

        let endpoint = self.path("openOrders", "openOrders");
        let raw: Vec<BinanceOrder> = self.send_signed_request("GET", &endpoint, params).await?;
        Ok(raw.into_iter().map(|o| self.to_order(o)).collect())
    }

    async fn get_order_history(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Order>> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("limit".to_string(), limit.unwrap_or(100).to_string());

        let endpoint = self.path("allOrders", "allOrders");
        let raw: Vec<BinanceOrder> = self.send_signed_request("GET", &endpoint, params).await?;
        Ok(raw.into_iter().map(|o| self.to_order(o)).collect())
    }

    async fn get_recent_fills(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Fill>> {
        #[derive(Deserialize)]
        struct Raw {
            id: u64,
            #[serde(rename = "orderId")]
            order_id: u64,
            symbol: String,
            side: Option<String>,
            #[serde(rename = "isBuyer", default)]
            is_buyer: Option<bool>,
            price: String,
            qty: String,
            commission: String,
            time: i64,
        }

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("limit".to_string(), limit.unwrap_or(100).to_string());

        let endpoint = self.path("myTrades", "userTrades");
        let raw: Vec<Raw> = self.send_signed_request("GET", &endpoint, params).await?;

        Ok(raw
            .into_iter()
            .map(|t| Fill {
                id: t.id.to_string(),
                order_id: t.order_id.to_string(),
                client_order_id: None,
                symbol: t.symbol,
                side: match (&t.side, t.is_buyer) {
                    (Some(s), _) => Self::parse_side(s),
                    (None, Some(true)) => OrderSide::Buy,
                    _ => OrderSide::Sell,
                },
                price: t.price.parse().unwrap_or(0.0),
                amount: t.qty.parse().unwrap_or(0.0),
                fee: t.commission.parse().unwrap_or(0.0),
                timestamp: millis_to_datetime(t.time),
            })
            .collect())
    }

    async fn create_order(&self, request: OrderRequest) -> Result<Order> {
        // 提交前先落日志，崩溃后可凭关联ID人工对账
        log::info!(
            "📤 [binance] 提交订单 关联ID={} {} {} {:?} 数量={} 价格={:?}",
            request.client_order_id,
            request.symbol,
            request.side,
            request.order_type,
            request.amount,
            request.price
        );

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), request.symbol.clone());
        params.insert(
            "side".to_string(),
            match request.side {
                OrderSide::Buy => "BUY".to_string(),
                OrderSide::Sell => "SELL".to_string(),
            },
        );
        params.insert(
            "type".to_string(),
            match request.order_type {
                OrderType::Market => "MARKET".to_string(),
                OrderType::Limit => "LIMIT".to_string(),
            },
        );
        params.insert("quantity".to_string(), request.amount.to_string());
        params.insert(
            "newClientOrderId".to_string(),
            request.client_order_id.clone(),
        );

        if let Some(price) = request.price {
            params.insert("price".to_string(), price.to_string());
        }
        if request.order_type == OrderType::Limit {
            params.insert(
                "timeInForce".to_string(),
                request.time_in_force.clone().unwrap_or_else(|| "GTC".to_string()),
            );
        }
        if request.reduce_only == Some(true) && self.market_type == MarketType::Futures {
            params.insert("reduceOnly".to_string(), "true".to_string());
        }

        let endpoint = self.path("order", "order");
        let result: std::result::Result<BinanceOrder, ExchangeError> =
            self.send_signed_request("POST", &endpoint, params).await;

        match result {
            Ok(raw) => Ok(self.to_order(raw)),
            // 交易所侧校验失败(余额/保证金/精度)归类为订单拒绝
            Err(ExchangeError::ApiError { code, message }) if (400..500).contains(&code) => {
                Err(ExchangeError::OrderRejected {
                    client_order_id: request.client_order_id,
                    reason: message,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<Order> {
        log::info!("📤 [binance] 撤销订单 ID={} 交易对={}", order_id, symbol);

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("orderId".to_string(), order_id.to_string());

        let endpoint = self.path("order", "order");
        let result: std::result::Result<BinanceOrder, ExchangeError> =
            self.send_signed_request("DELETE", &endpoint, params).await;

        match result {
            Ok(raw) => Ok(self.to_order(raw)),
            Err(ExchangeError::ApiError { code, message })
                if code == 400 && message.contains("-2011") =>
            {
                // 订单已不存在，撤单视为幂等成功以外的已知状态
                Err(ExchangeError::OrderNotFound {
                    order_id: order_id.to_string(),
                    symbol: symbol.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        log::info!("📤 [binance] 撤销全部挂单 交易对={}", symbol);

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());

        match self.market_type {
            MarketType::Futures => {
                let _: serde_json::Value = self
                    .send_signed_request("DELETE", "/fapi/v1/allOpenOrders", params)
                    .await?;
                Ok(Vec::new())
            }
            MarketType::Spot => {
                let raw: Vec<BinanceOrder> = self
                    .send_signed_request("DELETE", "/api/v3/openOrders", params)
                    .await?;
                Ok(raw.into_iter().map(|o| self.to_order(o)).collect())
            }
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        if self.market_type == MarketType::Spot {
            return Ok(());
        }

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("leverage".to_string(), leverage.to_string());

        let _: serde_json::Value = self
            .send_signed_request("POST", "/fapi/v1/leverage", params)
            .await?;
        log::info!("✅ [binance] {} 杠杆已设置为 {}x", symbol, leverage);
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<()> {
        if self.market_type == MarketType::Spot {
            return Ok(());
        }

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert(
            "marginType".to_string(),
            match mode {
                MarginMode::Cross => "CROSSED".to_string(),
                MarginMode::Isolated => "ISOLATED".to_string(),
            },
        );

        let result: std::result::Result<serde_json::Value, ExchangeError> = self
            .send_signed_request("POST", "/fapi/v1/marginType", params)
            .await;

        match result {
            Ok(_) => {
                log::info!("✅ [binance] {} 保证金模式已设置为 {}", symbol, mode);
                Ok(())
            }
            // -4046: 已经是目标模式，幂等处理
            Err(ExchangeError::ApiError { message, .. }) if message.contains("-4046") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn stream_endpoint(&self, needs_auth: bool) -> Result<String> {
        if needs_auth {
            let listen_key = self.create_listen_key().await?;
            Ok(format!("{}/{}", self.ws_url(), listen_key))
        } else {
            Ok(self.ws_url().to_string())
        }
    }

    fn auth_message(&self) -> Result<Option<String>> {
        // Binance 私有流通过 listenKey URL 鉴权，无登录消息
        Ok(None)
    }

    fn build_subscribe_messages(&self, subscriptions: &[Subscription]) -> Result<Vec<String>> {
        let mut streams = Vec::new();
        for sub in subscriptions {
            match sub {
                Subscription::Ticker(symbol) => {
                    streams.push(format!("{}@ticker", symbol.to_lowercase()))
                }
                Subscription::OrderBook(symbol) => {
                    streams.push(format!("{}@depth20@100ms", symbol.to_lowercase()))
                }
                Subscription::Trades(symbol) => {
                    streams.push(format!("{}@aggTrade", symbol.to_lowercase()))
                }
                // 用户数据随 listenKey 连接自动推送，无需订阅消息
                Subscription::UserData => {}
            }
        }

        if streams.is_empty() {
            return Ok(Vec::new());
        }

        let params = streams
            .iter()
            .map(|s| format!("\"{}\"", s))
            .collect::<Vec<_>>()
            .join(",");
        Ok(vec![format!(
            r#"{{"method":"SUBSCRIBE","params":[{}],"id":1}}"#,
            params
        )])
    }

    fn heartbeat_message(&self) -> String {
        "ping".to_string()
    }

    fn is_heartbeat_reply(&self, message: &str) -> bool {
        message == "pong"
    }

    fn is_subscribe_ack(&self, message: &str) -> bool {
        message.contains("\"result\":null") && message.contains("\"id\"")
    }

    fn parse_stream_message(&self, message: &str) -> Result<Vec<StreamEvent>> {
        let value: serde_json::Value = match serde_json::from_str(message) {
            Ok(v) => v,
            Err(_) => return Ok(Vec::new()), // 纯文本心跳等
        };

        let event_type = value.get("e").and_then(|e| e.as_str()).unwrap_or("");
        let as_f64 = |v: &serde_json::Value, key: &str| {
            v.get(key)
                .and_then(|x| x.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0)
        };

        match event_type {
            "24hrTicker" => {
                let symbol = value.get("s").and_then(|s| s.as_str()).unwrap_or("");
                Ok(vec![StreamEvent::Ticker(Ticker {
                    symbol: symbol.to_string(),
                    high: as_f64(&value, "h"),
                    low: as_f64(&value, "l"),
                    bid: as_f64(&value, "b"),
                    ask: as_f64(&value, "a"),
                    last: as_f64(&value, "c"),
                    volume: as_f64(&value, "v"),
                    timestamp: millis_to_datetime(
                        value.get("E").and_then(|e| e.as_i64()).unwrap_or(0),
                    ),
                })])
            }
            "depthUpdate" => {
                let symbol = value.get("s").and_then(|s| s.as_str()).unwrap_or("");
                let parse_levels = |key: &str| -> Vec<[f64; 2]> {
                    value
                        .get(key)
                        .and_then(|v| v.as_array())
                        .map(|rows| {
                            rows.iter()
                                .filter_map(|row| {
                                    let p = row.get(0)?.as_str()?.parse().ok()?;
                                    let q = row.get(1)?.as_str()?.parse().ok()?;
                                    Some([p, q])
                                })
                                .collect()
                        })
                        .unwrap_or_default()
                };
                Ok(vec![StreamEvent::OrderBook(OrderBook {
                    symbol: symbol.to_string(),
                    bids: parse_levels("b"),
                    asks: parse_levels("a"),
                    timestamp: millis_to_datetime(
                        value.get("E").and_then(|e| e.as_i64()).unwrap_or(0),
                    ),
                })])
            }
            "aggTrade" => {
                let symbol = value.get("s").and_then(|s| s.as_str()).unwrap_or("");
                let is_buyer_maker = value.get("m").and_then(|m| m.as_bool()).unwrap_or(false);
                Ok(vec![StreamEvent::Trade(Trade {
                    id: value
                        .get("a")
                        .and_then(|a| a.as_i64())
                        .unwrap_or(0)
                        .to_string(),
                    symbol: symbol.to_string(),
                    side: if is_buyer_maker {
                        OrderSide::Sell
                    } else {
                        OrderSide::Buy
                    },
                    amount: as_f64(&value, "q"),
                    price: as_f64(&value, "p"),
                    timestamp: millis_to_datetime(
                        value.get("E").and_then(|e| e.as_i64()).unwrap_or(0),
                    ),
                })])
            }
            // 期货用户数据流的订单/成交推送
            "ORDER_TRADE_UPDATE" => {
                let o = match value.get("o") {
                    Some(o) => o,
                    None => return Ok(Vec::new()),
                };
                let symbol = o.get("s").and_then(|s| s.as_str()).unwrap_or("").to_string();
                let side = Self::parse_side(o.get("S").and_then(|s| s.as_str()).unwrap_or("BUY"));
                let amount = as_f64(o, "q");
                let filled = as_f64(o, "z");
                let event_time = value.get("E").and_then(|e| e.as_i64()).unwrap_or(0);

                let order = Order {
                    id: o
                        .get("i")
                        .and_then(|i| i.as_i64())
                        .unwrap_or(0)
                        .to_string(),
                    client_order_id: o
                        .get("c")
                        .and_then(|c| c.as_str())
                        .map(|c| c.to_string()),
                    symbol: symbol.clone(),
                    side,
                    order_type: if o.get("o").and_then(|t| t.as_str()) == Some("MARKET") {
                        OrderType::Market
                    } else {
                        OrderType::Limit
                    },
                    amount,
                    price: Some(as_f64(o, "p")).filter(|p| *p > 0.0),
                    filled,
                    remaining: (amount - filled).max(0.0),
                    status: Self::parse_status(o.get("X").and_then(|x| x.as_str()).unwrap_or("")),
                    market_type: self.market_type,
                    timestamp: millis_to_datetime(event_time),
                    last_update: Some(millis_to_datetime(event_time)),
                };

                let mut events = vec![StreamEvent::OrderUpdate(order.clone())];

                // 本次推送有实际成交量时额外产生 Fill 事件
                let last_fill_qty = as_f64(o, "l");
                if last_fill_qty > 0.0 {
                    events.push(StreamEvent::Fill(Fill {
                        id: o
                            .get("t")
                            .and_then(|t| t.as_i64())
                            .unwrap_or(0)
                            .to_string(),
                        order_id: order.id.clone(),
                        client_order_id: order.client_order_id.clone(),
                        symbol,
                        side,
                        price: as_f64(o, "L"),
                        amount: last_fill_qty,
                        fee: as_f64(o, "n"),
                        timestamp: millis_to_datetime(event_time),
                    }));
                }

                Ok(events)
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn health_check(&self) -> Result<()> {
        let endpoint = self.path("ping", "ping");
        let _: serde_json::Value = self.send_public_request(&endpoint, None).await?;
        Ok(())
    }
}
