#![deny(unsafe_code)]
#![doc = r#"
# spark-stream-tcp

## 设计动机（Why）
- `spark-stream` 的连接只依赖抽象的 [`Socket`](spark_stream::Socket) 原语；
  本 crate 以 `socket2` 提供真实的非阻塞 TCP 实现，使同一状态机可直接运行在操作系统套接字上。

## 核心契约（What）
- [`TcpSocket`]：非阻塞连接、`SO_ERROR` 取回连接结果、向量化写出、按上限分块读取；
- [`TcpSocketConfig`]：构造期的套接字选项（`SO_LINGER`、`TCP_NODELAY`）。

## 风险与考量（Trade-offs）
- 本 crate 不提供多路复用器；就绪通知由外层调度器（epoll/kqueue 封装）负责，
  套接字自身只保证所有调用都不会阻塞线程。
"#]

mod socket;

pub use socket::{TcpSocket, TcpSocketConfig};
