/// 订单关联ID生成器
///
/// 为策略生成唯一且可识别的客户端订单ID，提交与重试沿用同一个ID
/// 保证幂等，崩溃后也能凭前缀在交易所侧认领订单。
/// 不同交易所对字符集和长度的要求不同。
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};

/// 交易所订单ID规则
#[derive(Debug, Clone)]
pub struct ExchangeOrderIdRules {
    pub max_length: usize,
    pub allow_underscore: bool,
    pub allow_dash: bool,
    pub case_sensitive: bool,
}

impl ExchangeOrderIdRules {
    /// Binance规则
    pub fn binance() -> Self {
        Self {
            max_length: 36,          // 最大36个字符
            allow_underscore: false, // 不允许下划线
            allow_dash: false,       // 不允许横线
            case_sensitive: true,
        }
    }

    /// OKX规则
    pub fn okx() -> Self {
        Self {
            max_length: 32,         // 最大32个字符
            allow_underscore: true, // 允许下划线
            allow_dash: true,
            case_sensitive: false, // 不区分大小写
        }
    }
}

/// 订单ID生成器
pub struct OrderIdGenerator {
    strategy_code: String,
    sequence: AtomicU32,
    rules: ExchangeOrderIdRules,
}

impl OrderIdGenerator {
    pub fn new(strategy_name: &str, exchange: &str) -> Self {
        let strategy_code = Self::generate_strategy_code(strategy_name);

        let rules = match exchange.to_lowercase().as_str() {
            "okx" => ExchangeOrderIdRules::okx(),
            // 默认使用最严格的规则
            _ => ExchangeOrderIdRules::binance(),
        };

        Self {
            strategy_code,
            sequence: AtomicU32::new(0),
            rules,
        }
    }

    /// 生成带标签的订单ID
    ///
    /// 格式: [策略代码][标签][DDHHMM][序列号]
    pub fn generate_with_tag(&self, tag: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let timestamp = Utc::now().format("%d%H%M").to_string();

        // 清理标签，只保留字母数字
        let clean_tag: String = tag
            .chars()
            .filter(|c| c.is_alphanumeric())
            .take(4)
            .collect();

        let mut order_id = format!(
            "{}{}{}{:04}",
            self.strategy_code,
            clean_tag,
            timestamp,
            seq % 10000
        );

        if !self.rules.allow_underscore {
            order_id = order_id.replace('_', "");
        }
        if !self.rules.allow_dash {
            order_id = order_id.replace('-', "");
        }
        if order_id.len() > self.rules.max_length {
            order_id.truncate(self.rules.max_length);
        }
        if !self.rules.case_sensitive {
            order_id = order_id.to_uppercase();
        }

        order_id
    }

    pub fn generate(&self) -> String {
        self.generate_with_tag("")
    }

    /// 生成策略代码（缩写）
    fn generate_strategy_code(strategy_name: &str) -> String {
        match strategy_name.to_lowercase().as_str() {
            "grid" | "grid_trading" => "GRD".to_string(),
            _ => strategy_name
                .split('_')
                .map(|w| w.chars().next().unwrap_or('X'))
                .collect::<String>()
                .to_uppercase()
                .chars()
                .take(3)
                .collect::<String>(),
        }
    }
}

/// 订单ID管理器（全局）
pub struct OrderIdManager {
    generators: std::collections::HashMap<String, OrderIdGenerator>,
}

impl OrderIdManager {
    pub fn new() -> Self {
        Self {
            generators: std::collections::HashMap::new(),
        }
    }

    pub fn get_or_create(&mut self, strategy_name: &str, exchange: &str) -> &OrderIdGenerator {
        let key = format!("{}_{}", strategy_name, exchange);
        self.generators
            .entry(key)
            .or_insert_with(|| OrderIdGenerator::new(strategy_name, exchange))
    }

    pub fn generate_with_tag(&mut self, strategy_name: &str, exchange: &str, tag: &str) -> String {
        self.get_or_create(strategy_name, exchange)
            .generate_with_tag(tag)
    }
}

impl Default for OrderIdManager {
    fn default() -> Self {
        Self::new()
    }
}

// 全局订单ID管理器
lazy_static::lazy_static! {
    pub static ref ORDER_ID_MANAGER: std::sync::Mutex<OrderIdManager> =
        std::sync::Mutex::new(OrderIdManager::new());
}

/// 便捷函数：生成带标签的订单ID
pub fn generate_order_id_with_tag(strategy_name: &str, exchange: &str, tag: &str) -> String {
    ORDER_ID_MANAGER
        .lock()
        .expect("Lock poisoned")
        .generate_with_tag(strategy_name, exchange, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_id_generation() {
        let gen = OrderIdGenerator::new("grid", "binance");
        let id1 = gen.generate_with_tag("B");
        let id2 = gen.generate_with_tag("B");

        assert_ne!(id1, id2);
        assert!(id1.len() <= 36);
        assert!(id1.starts_with("GRDB"));
    }

    #[test]
    fn test_exchange_rules() {
        // Binance: 不允许下划线
        let gen_binance = OrderIdGenerator::new("test_strategy", "binance");
        let id_binance = gen_binance.generate_with_tag("A_B");
        assert!(!id_binance.contains('_'));

        // OKX: 不区分大小写，全部转大写
        let gen_okx = OrderIdGenerator::new("grid", "okx");
        let id_okx = gen_okx.generate_with_tag("s");
        assert_eq!(id_okx, id_okx.to_uppercase());
        assert!(id_okx.len() <= 32);
    }
}
