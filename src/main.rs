use clap::{Arg, Command};
use rustgrid::core::config::ApiKeys;
use rustgrid::exchanges::create_exchange;
use rustgrid::strategies::common::application::strategy::{Strategy, StrategyInstance};
use rustgrid::strategies::common::application::StrategyDepsBuilder;
use rustgrid::strategies::grid::domain::config::GridConfig;
use rustgrid::strategies::grid::GridCoordinator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载环境变量
    dotenv::dotenv().ok();

    // 解析命令行参数
    let matches = Command::new("RustGrid")
        .version("0.1")
        .about("Rust网格交易系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("策略配置文件路径(YAML)")
                .required(true),
        )
        .get_matches();

    let config_file = matches.get_one::<String>("config").unwrap();

    // 读取策略配置
    let file_content = std::fs::read_to_string(config_file)?;
    let config: GridConfig = serde_yaml::from_str(&file_content)?;

    // 从配置中获取日志级别并初始化日志
    let log_level = config.strategy.log_level.clone();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    log::info!(
        "启动网格策略: {} @ {} ({})，日志级别: {}",
        config.symbol,
        config.exchange.id,
        config.strategy.name,
        log_level
    );

    // 配置在create里做一次性校验，精度错误直接拒绝启动
    let api_keys = ApiKeys::from_env(&config.exchange.id)?;
    let exchange = create_exchange(
        &config.exchange.id,
        config.exchange.market_type,
        api_keys,
        config.exchange.requests_per_second,
        config.exchange.testnet,
    )?;

    let deps = StrategyDepsBuilder::new().with_exchange(exchange).build()?;
    let coordinator = GridCoordinator::create(config, deps)?;

    log::info!("网格策略已创建，开始运行...");
    coordinator.start().await?;

    // 保持运行直到收到停止信号
    tokio::signal::ctrl_c().await?;
    log::info!("收到停止信号，正在关闭策略...");
    coordinator.stop().await?;
    log::info!("网格策略已退出");

    Ok(())
}
