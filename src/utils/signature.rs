use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// 统一的签名辅助工具，覆盖当前支持的中心化交易所
pub struct SignatureHelper;

impl SignatureHelper {
    /// Binance 签名: HMAC-SHA256(query_string)
    pub fn binance_signature(secret: &str, query_string: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC 支持任意长度密钥");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// OKX 签名: Base64(HMAC-SHA256(timestamp + method + path + body))
    pub fn okx_signature(
        secret: &str,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> String {
        let prehash = format!("{}{}{}{}", timestamp, method, request_path, body);
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC 支持任意长度密钥");
        mac.update(prehash.as_bytes());
        general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    /// URL 编码并保持键排序（签名依赖此顺序）
    pub fn build_query_string(params: &HashMap<String, String>) -> String {
        let mut pairs: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        pairs.sort();
        pairs.join("&")
    }

    /// 毫秒级时间戳
    pub fn timestamp() -> u64 {
        Utc::now().timestamp_millis() as u64
    }

    /// 秒级时间戳(OKX WebSocket登录用)
    pub fn timestamp_seconds() -> u64 {
        Utc::now().timestamp() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binance_signature_known_vector() {
        // Binance API 文档中的官方示例
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let sig = SignatureHelper::binance_signature(secret, query);
        assert_eq!(
            sig,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_query_string_sorted() {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), "BTCUSDT".to_string());
        params.insert("limit".to_string(), "5".to_string());
        let qs = SignatureHelper::build_query_string(&params);
        assert_eq!(qs, "limit=5&symbol=BTCUSDT");
    }
}
