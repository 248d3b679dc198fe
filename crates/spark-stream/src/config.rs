use serde::Deserialize;

use crate::error::ConfigError;

/// 每次读事件在未设读上限时单次向套接字请求的字节数。
pub const DEFAULT_READ_CHUNK_BYTES: usize = 16 * 1024;

/// 单条连接的构造期配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“每连接缓冲上限”“是否关闭 Nagle”“读取块大小”等旋钮集中声明，
///   使监听器或客户端工厂能从配置文件一次性加载后复用到每条连接；
///
/// ## 契约说明（What）
/// - `buffer_limit_bytes`：同时作为写缓冲上限（推导高/低水位）与单次读事件上限，0 表示不设限；
/// - `no_delay`：构造时透传给套接字的 `TCP_NODELAY`；
/// - `read_chunk_bytes`：不设读上限时单次 `read` 调用的请求量，必须大于 0；
/// - 未出现在 TOML 中的字段取默认值，未知字段视为错误。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - 读写共用一个上限，与 `set_buffer_limits` 的运行期语义保持一致；
///   若未来需要分离，可新增字段并保持旧字段含义不变。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub buffer_limit_bytes: u32,
    pub no_delay: bool,
    pub read_chunk_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_limit_bytes: 0,
            no_delay: false,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
        }
    }
}

impl ConnectionConfig {
    /// 从 TOML 文本加载并校验配置。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "read_chunk_bytes",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    pub fn with_buffer_limit(mut self, limit: u32) -> Self {
        self.buffer_limit_bytes = limit;
        self
    }

    pub fn with_no_delay(mut self, enable: bool) -> Self {
        self.no_delay = enable;
        self
    }

    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk_bytes = bytes;
        self
    }
}
