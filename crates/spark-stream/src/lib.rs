#![deny(unsafe_code)]
#![doc = r#"
# spark-stream

## 设计动机（Why）
- 为代理数据面提供“一条连接 = 一条双工字节管道”的核心抽象：持有套接字、
  接收就绪通知、驱动过滤器链，并以水位线实施背压；
- 将读写过滤器链、连接状态机与字节记账统一收敛到一个
  单线程、无锁、可重入的实现中，避免每个协议插件各自处理部分读写与关闭协议。

## 核心契约（What）
- [`Connection`]：状态机 `Connecting → Open → Closing → Closed`，提供 `write`、
  `read_disable`、`close`、`set_buffer_limits`、`set_buffer_stats` 等操作；
- [`ClientConnection`]：主动连接的特化，唯一触发 `Connecting → Open` 的入口；
- [`filter`]：读/写过滤器及 `Continue`/`StopIteration` 短路语义；
- [`stats`] 与 [`watermark`]：字节记账纯函数与高/低水位滞回；
- [`dispatcher`] 与 [`socket`]：引擎消费的外部协作方契约；
- [`sim`]：确定性的内存网络与调度器，实现上述两个契约，供测试与演示使用。

## 实现策略（How）
- 连接句柄为 `Rc` 共享的内部结构，调度器只持有 `Weak` 引用；
- 调用过滤器与观察者之前总是释放内部 `RefCell` 借用，回调中可安全地再次调用
  `write`/`close`/`read_disable`；
- 读写路径每次缓冲变化后调用一次 [`stats::update_buffer_stats`]，再评估水位迁移。

## 风险与考量（Trade-offs）
- 单线程模型：`Connection` 既不是 `Send` 也不是 `Sync`，跨线程必须由外层调度器转交；
- 契约违例（在 `Closed` 上写入、`read_disable` 失衡、重复注册兴趣）直接 panic，
  不以 `Result` 形式返回，以免调用方忽略后破坏调度器状态。
"#]

pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod sim;
pub mod socket;
pub mod stats;
pub mod watermark;

pub use buffer::Buffer;
pub use client::ClientConnection;
pub use config::ConnectionConfig;
pub use connection::{
    CloseType, Connection, ConnectionCallbacks, ConnectionEvent, ConnectionId, ConnectionState,
    WeakConnection,
};
pub use dispatcher::{Dispatcher, Interest, ReadinessHandler, RunMode};
pub use error::{ConfigError, ErrorCategory, StreamError};
pub use filter::{FilterStatus, ReadFilter, WriteFilter};
pub use socket::{ConnectOutcome, ReadOutcome, Socket, SocketHandle, WriteOutcome};
pub use stats::{BufferStats, Counter, Gauge};
pub use watermark::{WatermarkState, WatermarkTransition, WriteBufferWatermarks};
