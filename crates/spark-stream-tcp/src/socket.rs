use std::{
    io::{self, IoSlice, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket as RawSocket, Type};
use spark_stream::{
    Buffer, ConnectOutcome, ReadOutcome, Socket, SocketHandle, WriteOutcome,
};
use tracing::{debug, trace};

/// 单次 `read` 系统调用最多申请的临时块大小。
const MAX_READ_CHUNK: usize = 64 * 1024;

/// 一次 `writev` 最多携带的分片数量。
const MAX_WRITE_SLICES: usize = 64;

/// TCP 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“关闭时是否等待发送缓冲排空”“是否关闭 Nagle”等内核行为显式配置化，
///   避免调用方直接操作 `socket2`；
///
/// ## 契约说明（What）
/// - `linger = Some(dur)`：通过 `SO_LINGER` 让关闭在 `dur` 后仍未完成时发送 RST；
///   `None` 沿用内核默认；
/// - `nodelay`：构造时写入 `TCP_NODELAY`；运行期仍可通过 [`Socket::set_nodelay`] 调整。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上按秒取整；过小的值可能丢弃仍在发送缓冲中的数据。
#[derive(Clone, Debug, Default)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: false,
        }
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        SockRef::from(stream).set_linger(self.linger)?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(())
    }
}

/// 基于操作系统 TCP 套接字的 [`Socket`] 实现。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让连接状态机不经修改地跑在真实网络上，测试中的仿真套接字与它共享同一契约；
///
/// ## 逻辑 (How)
/// - 构造即创建非阻塞套接字；`connect` 把 `EINPROGRESS`/`WouldBlock` 映射为 `InProgress`；
/// - `finish_connect` 先读取 `SO_ERROR`，再以 `peer_addr` 区分“已连接”与“仍在握手”；
/// - `write` 以 `writev` 一次写出缓冲头部的多个分片，`read` 分配至多 `max_bytes`
///   （且不超过 64 KiB）的临时块，读入后冻结为 `Bytes` 追加到缓冲尾部。
///
/// ## 契约 (What)
/// - 所有方法都不阻塞；`close` 先 `shutdown(Both)` 再释放描述符，之后的读写返回 `NotConnected`；
/// - 释放 `TcpSocket` 等价于 `close`。
///
/// ## 注意事项 (Trade-offs)
/// - 读路径每次调用都会分配临时块，换取零拷贝移交给读缓冲；小包密集的场景可调小读上限。
#[derive(Debug)]
pub struct TcpSocket {
    stream: Option<TcpStream>,
    handle: SocketHandle,
}

impl TcpSocket {
    /// 为连接 `address` 创建同地址族的非阻塞套接字。
    pub fn for_address(address: SocketAddr, config: &TcpSocketConfig) -> io::Result<Self> {
        let socket = RawSocket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let stream = TcpStream::from(socket);
        config.apply(&stream)?;
        Ok(Self::wrap(stream))
    }

    /// 接管监听器接受得到的流，切换为非阻塞模式。
    pub fn from_stream(stream: TcpStream, config: &TcpSocketConfig) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        config.apply(&stream)?;
        Ok(Self::wrap(stream))
    }

    fn wrap(stream: TcpStream) -> Self {
        let handle = raw_handle(&stream);
        Self {
            stream: Some(stream),
            handle,
        }
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

#[cfg(unix)]
fn raw_handle(stream: &TcpStream) -> SocketHandle {
    use std::os::fd::AsRawFd;
    SocketHandle::new(stream.as_raw_fd() as u64)
}

#[cfg(windows)]
fn raw_handle(stream: &TcpStream) -> SocketHandle {
    use std::os::windows::io::AsRawSocket;
    SocketHandle::new(stream.as_raw_socket())
}

fn connect_in_progress(error: &io::Error) -> bool {
    #[cfg(unix)]
    if error.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    error.kind() == io::ErrorKind::WouldBlock
}

impl Socket for TcpSocket {
    fn handle(&self) -> SocketHandle {
        self.handle
    }

    fn read(&mut self, buffer: &mut Buffer, max_bytes: usize) -> io::Result<ReadOutcome> {
        let mut stream = self.stream()?;
        let mut chunk = BytesMut::zeroed(max_bytes.clamp(1, MAX_READ_CHUNK));
        match stream.read(&mut chunk) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(read) => {
                chunk.truncate(read);
                buffer.add_bytes(chunk.freeze());
                Ok(ReadOutcome::Read(read))
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(error) => Err(error),
        }
    }

    fn write(&mut self, buffer: &mut Buffer) -> io::Result<WriteOutcome> {
        let mut stream = self.stream()?;
        let written = {
            let mut slices = [IoSlice::new(&[]); MAX_WRITE_SLICES];
            let count = buffer.chunks_vectored(&mut slices);
            match stream.write_vectored(&slices[..count]) {
                Ok(written) => written,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome::WouldBlock);
                }
                Err(error) => return Err(error),
            }
        };
        buffer.advance(written);
        Ok(WriteOutcome::Written(written))
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(error) = stream.shutdown(Shutdown::Both) {
                trace!(handle = %self.handle, %error, "shutdown before close failed");
            }
            debug!(handle = %self.handle, "tcp socket closed");
        }
    }

    fn connect(&mut self, address: SocketAddr) -> io::Result<ConnectOutcome> {
        let stream = self.stream()?;
        match SockRef::from(stream).connect(&SockAddr::from(address)) {
            Ok(()) => Ok(ConnectOutcome::Connected),
            Err(error) if connect_in_progress(&error) => Ok(ConnectOutcome::InProgress),
            Err(error) => Err(error),
        }
    }

    fn finish_connect(&mut self) -> io::Result<()> {
        let stream = self.stream()?;
        if let Some(error) = stream.take_error()? {
            return Err(error);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotConnected => {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
            Err(error) => Err(error),
        }
    }

    fn set_nodelay(&mut self, enable: bool) -> io::Result<()> {
        self.stream()?.set_nodelay(enable)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream()?.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream()?.peer_addr()
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}
