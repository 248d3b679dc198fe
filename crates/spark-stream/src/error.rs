//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 连接层只把网络类错误（连接失败、读写错误、对端重置）交给观察者，
//!   由外层决定重试与退避；这里为这些错误提供稳定错误码与分类；
//! - 配置加载的解析与校验错误同样集中定义，便于宿主统一上报。
//!
//! ## 设计要求（What）
//! - [`StreamError`] 携带稳定错误码、`io::ErrorKind` 与可选 errno，随 `RemoteClose` 事件下发；
//! - [`ConfigError`] 覆盖 TOML 解析与字段校验两类失败；
//! - 编程契约违例（在 `Closed` 上写入等）不在此建模，直接 panic。

use std::{fmt, io};

use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const CONNECT: OperationKind = OperationKind {
    code: "spark.stream.connect_failed",
    message: "stream connect",
};
pub const READ: OperationKind = OperationKind {
    code: "spark.stream.read_failed",
    message: "stream read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "spark.stream.write_failed",
    message: "stream write",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "spark.stream.configure_failed",
    message: "stream configure",
};

/// 错误的可恢复性分类，供外层重试策略参考。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 瞬时性失败，外层可以择机重试（例如连接被拒绝、被重置）。
    Retryable,
    /// 重试无意义的失败（权限、参数、不支持的操作）。
    NonRetryable,
    /// 对端已经离开，连接不可能继续。
    PeerClosed,
}

/// 随关闭事件下发的网络错误。
///
/// # 教案式说明
/// - **意图 (Why)**：将 `io::Error` 固化为可比较、可克隆的值，使多个观察者都能拿到同一份原因；
/// - **契约 (What)**：`code` 取自 [`OperationKind`]；`errno` 仅在底层错误来自操作系统时存在；
/// - **风险 (Trade-offs)**：`message` 在构造时格式化一次，丢失了原始错误链，
///   换取 `Clone + Eq` 以便事件在观察者间传递与断言。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct StreamError {
    code: &'static str,
    message: String,
    kind: io::ErrorKind,
    errno: Option<i32>,
    category: ErrorCategory,
}

impl StreamError {
    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }
}

/// 将 IO 错误映射为带稳定错误码的 [`StreamError`]。
pub fn map_io_error(kind: OperationKind, error: io::Error) -> StreamError {
    StreamError {
        code: kind.code,
        message: format!("{}: {}", kind.message, error),
        kind: error.kind(),
        errno: error.raw_os_error(),
        category: categorize_io_error(&error),
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => ErrorCategory::PeerClosed,
        ErrorKind::ConnectionRefused
        | ErrorKind::TimedOut
        | ErrorKind::Interrupted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}

/// 配置加载错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 文本无法解析为目标结构。
    #[error("failed to parse stream configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// 字段取值不满足约束。
    ///
    /// - **契约 (What)**：`field` 为字段名，`reason` 为违反的约束描述。
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Retryable => "retryable",
            ErrorCategory::NonRetryable => "non-retryable",
            ErrorCategory::PeerClosed => "peer-closed",
        };
        f.write_str(label)
    }
}
