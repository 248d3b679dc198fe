use std::{fmt, io, net::SocketAddr};

use crate::buffer::Buffer;

/// 调度器用于索引套接字的不透明句柄（真实实现中通常是文件描述符）。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(u64);

impl SocketHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketHandle({})", self.0)
    }
}

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 一次读取的结果；硬错误以 `io::Error` 表达。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// 读入了 `n > 0` 字节。
    Read(usize),
    /// 当前没有可读数据，本轮就绪结束。
    WouldBlock,
    /// 对端半关闭。
    Eof,
}

/// 一次写出的结果；硬错误以 `io::Error` 表达。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 从缓冲头部写出并排空了 `n` 字节。
    Written(usize),
    /// 发送缓冲已满，需要等待写就绪。
    WouldBlock,
}

/// 发起连接的即时结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// 连接仍在进行，写就绪后调用 [`Socket::finish_connect`] 取得最终结果。
    InProgress,
}

/// 连接消费的非阻塞字节流套接字原语。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 状态机只依赖“读入缓冲 / 从缓冲写出 / 关闭”三类动作与少量连接期操作，
///   真实 TCP 与仿真网络都可以实现它；
///
/// ## 契约 (What)
/// - `read`：至多读入 `max_bytes` 字节追加到 `buffer` 尾部；`max_bytes > 0`；
/// - `write`：尽可能多地写出 `buffer` 头部字节，并从 `buffer` 中排空已写部分；
/// - `connect`/`finish_connect`：仅客户端使用；`finish_connect` 在连接仍未完成时返回
///   `io::ErrorKind::WouldBlock`；
/// - `close` 之后除 `handle` 外的调用结果未定义，连接保证不会这样做。
///
/// ## 注意事项 (Trade-offs)
/// - 所有方法都不得阻塞线程；阻塞式套接字会让整个事件循环停摆。
pub trait Socket {
    fn handle(&self) -> SocketHandle;
    fn read(&mut self, buffer: &mut Buffer, max_bytes: usize) -> io::Result<ReadOutcome>;
    fn write(&mut self, buffer: &mut Buffer) -> io::Result<WriteOutcome>;
    fn close(&mut self);
    fn connect(&mut self, address: SocketAddr) -> io::Result<ConnectOutcome>;
    fn finish_connect(&mut self) -> io::Result<()>;
    fn set_nodelay(&mut self, enable: bool) -> io::Result<()>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// 协商得到的应用层协议；无协商能力的套接字返回 `None`。
    fn next_protocol(&self) -> Option<&str> {
        None
    }
}
