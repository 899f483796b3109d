use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 应用配置
///
/// 从TOML文件加载，环境变量（前缀 `TASKMESH`，双下划线分隔层级）
/// 可覆盖任意字段，全部缺省时使用内置默认值。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
}

/// 本节点身份配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 本节点对外可达的URL，写入出站任务/消息的sender_url
    pub node_url: String,
    /// 本节点证书（PEM文本），local_only处理器据此校验发送方身份
    pub ssl_cert: String,
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 定时循环的tick间隔（毫秒）
    pub tick_interval_ms: u64,
    /// 保留队列内部轮询间隔（秒）
    pub internal_poll_interval_seconds: u64,
    /// 终态更新投递失败后的基础重发间隔（秒）
    pub update_retry_base_seconds: u64,
    /// 重发间隔上限（秒）
    pub update_retry_max_seconds: u64,
}

/// 传输层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// 单次投递的超时时间（秒），由运维按网络环境调整
    pub timeout_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                node_url: "https://127.0.0.1:5000/api/queues".to_string(),
                ssl_cert: String::new(),
            },
            scheduler: SchedulerConfig {
                tick_interval_ms: 500,
                internal_poll_interval_seconds: 10,
                update_retry_base_seconds: 30,
                update_retry_max_seconds: 600,
            },
            transport: TransportConfig {
                timeout_seconds: 30,
            },
        }
    }
}

impl AppConfig {
    /// 加载配置文件并套用环境变量覆盖
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/taskmesh.toml", "taskmesh.toml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKMESH")
                .separator("__")
                .try_parsing(true),
        );

        let defaults = AppConfig::default();
        let config = builder
            .set_default("node.node_url", defaults.node.node_url.clone())?
            .set_default("node.ssl_cert", defaults.node.ssl_cert.clone())?
            .set_default(
                "scheduler.tick_interval_ms",
                defaults.scheduler.tick_interval_ms as i64,
            )?
            .set_default(
                "scheduler.internal_poll_interval_seconds",
                defaults.scheduler.internal_poll_interval_seconds as i64,
            )?
            .set_default(
                "scheduler.update_retry_base_seconds",
                defaults.scheduler.update_retry_base_seconds as i64,
            )?
            .set_default(
                "scheduler.update_retry_max_seconds",
                defaults.scheduler.update_retry_max_seconds as i64,
            )?
            .set_default(
                "transport.timeout_seconds",
                defaults.transport.timeout_seconds as i64,
            )?
            .build()
            .context("构建配置失败")?;

        let app_config: AppConfig = config.try_deserialize().context("反序列化配置失败")?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// 启动期配置校验，失败即中止进程
    pub fn validate(&self) -> Result<()> {
        if self.node.node_url.is_empty() {
            return Err(anyhow::anyhow!("node.node_url 不能为空"));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("scheduler.tick_interval_ms 必须大于0"));
        }
        if self.scheduler.update_retry_base_seconds > self.scheduler.update_retry_max_seconds {
            return Err(anyhow::anyhow!(
                "scheduler.update_retry_base_seconds 不能大于 update_retry_max_seconds"
            ));
        }
        if self.transport.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("transport.timeout_seconds 必须大于0"));
        }
        Ok(())
    }
}
