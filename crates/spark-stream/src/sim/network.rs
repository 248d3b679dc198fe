use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    io,
    net::{Ipv4Addr, SocketAddr},
    rc::Rc,
};

use serde::Deserialize;
use tracing::{debug, trace};

use crate::{
    buffer::Buffer,
    dispatcher::Interest,
    error::ConfigError,
    socket::{ConnectOutcome, ReadOutcome, SocketHandle, WriteOutcome},
};

use super::socket::SimSocket;

/// 仿真网络参数。
///
/// - `pipe_capacity`：单向管道（对端接收缓冲）最多容纳的字节数，必须大于 0；
/// - `max_read_per_call`：单次 `read` 最多交付的字节数，模拟内核一次拷贝的上限，必须大于 0。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimNetworkConfig {
    pub pipe_capacity: usize,
    pub max_read_per_call: usize,
}

impl Default for SimNetworkConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: 1024 * 1024,
            max_read_per_call: 64 * 1024,
        }
    }
}

impl SimNetworkConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipe_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "pipe_capacity",
                reason: "must be greater than zero",
            });
        }
        if self.max_read_per_call == 0 {
            return Err(ConfigError::Invalid {
                field: "max_read_per_call",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Phase {
    Fresh,
    ConnectPending(Result<(), io::ErrorKind>),
    Connected,
    Closed,
}

#[derive(Debug)]
struct Endpoint {
    local: SocketAddr,
    peer_address: Option<SocketAddr>,
    peer: Option<SocketHandle>,
    inbound: Buffer,
    phase: Phase,
    peer_closed: bool,
    nodelay: bool,
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
    write_calls: usize,
    bytes_written: u64,
}

impl Endpoint {
    fn new(local: SocketAddr, phase: Phase) -> Self {
        Self {
            local,
            peer_address: None,
            peer: None,
            inbound: Buffer::new(),
            phase,
            peer_closed: false,
            nodelay: false,
            read_error: None,
            write_error: None,
            write_calls: 0,
            bytes_written: 0,
        }
    }
}

#[derive(Debug)]
struct ListenerState {
    handle: SocketHandle,
    backlog: VecDeque<SocketHandle>,
}

#[derive(Debug)]
struct NetworkState {
    config: SimNetworkConfig,
    next_handle: u64,
    next_port: u16,
    endpoints: HashMap<SocketHandle, Endpoint>,
    listeners: HashMap<SocketAddr, ListenerState>,
    listener_addresses: HashMap<SocketHandle, SocketAddr>,
    unreachable: HashSet<SocketAddr>,
}

impl NetworkState {
    fn allocate_handle(&mut self) -> SocketHandle {
        let handle = SocketHandle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn allocate_local_address(&mut self) -> SocketAddr {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(40000);
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    fn endpoint(&self, handle: SocketHandle) -> io::Result<&Endpoint> {
        self.endpoints
            .get(&handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn endpoint_mut(&mut self, handle: SocketHandle) -> io::Result<&mut Endpoint> {
        self.endpoints
            .get_mut(&handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn peer_buffered(&self, endpoint: &Endpoint) -> Option<usize> {
        endpoint
            .peer
            .and_then(|peer| self.endpoints.get(&peer))
            .map(|peer| peer.inbound.len())
    }
}

/// 单线程内存网络。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为连接引擎提供可控的“内核”：管道容量、单次读取上限、连接失败与写错误都能按需构造；
///
/// ## 逻辑 (How)
/// - 每个端点持有自己的接收缓冲 `inbound`；写入直接移动到对端的 `inbound`，不做复制；
/// - 监听地址映射到积压队列，`connect` 成功时立即创建服务端端点并入队；
/// - [`SimNetwork::readiness`] 根据端点状态给出电平触发的读写就绪。
///
/// ## 契约 (What)
/// - 句柄在网络生命周期内唯一，不会复用；
/// - 关闭端点会标记对端 `peer_closed`，对端读完积压后得到 `Eof`，写入得到 `BrokenPipe`。
///
/// ## 注意事项 (Trade-offs)
/// - 不模拟延迟与乱序：同一轮调度内写入的数据对端立即可读。
#[derive(Clone, Debug)]
pub struct SimNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new(SimNetworkConfig::default())
    }
}

impl SimNetwork {
    pub fn new(config: SimNetworkConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(NetworkState {
                config,
                next_handle: 1,
                next_port: 40000,
                endpoints: HashMap::new(),
                listeners: HashMap::new(),
                listener_addresses: HashMap::new(),
                unreachable: HashSet::new(),
            })),
        }
    }

    /// 创建尚未连接的客户端套接字。
    pub fn socket(&self) -> SimSocket {
        let mut state = self.state.borrow_mut();
        let handle = state.allocate_handle();
        let local = state.allocate_local_address();
        state.endpoints.insert(handle, Endpoint::new(local, Phase::Fresh));
        trace!(%handle, %local, "sim socket created");
        SimSocket::new(self.clone(), handle)
    }

    /// 让发往 `address` 的连接在 `connect` 调用时立即失败。
    pub fn mark_unreachable(&self, address: SocketAddr) {
        self.state.borrow_mut().unreachable.insert(address);
    }

    /// 为端点注入一次写错误，下一次 `write` 返回该错误。
    pub fn inject_write_error(&self, handle: SocketHandle, kind: io::ErrorKind) {
        if let Some(endpoint) = self.state.borrow_mut().endpoints.get_mut(&handle) {
            endpoint.write_error = Some(kind);
        }
    }

    /// 为端点注入一次读错误，端点随即变为可读。
    pub fn inject_read_error(&self, handle: SocketHandle, kind: io::ErrorKind) {
        if let Some(endpoint) = self.state.borrow_mut().endpoints.get_mut(&handle) {
            endpoint.read_error = Some(kind);
        }
    }

    /// 仍被网络跟踪的端点数；两端都关闭的连接不再计入。
    pub fn endpoint_count(&self) -> usize {
        self.state.borrow().endpoints.len()
    }

    /// 端点成功写出数据的 `write` 调用次数。
    pub fn write_calls(&self, handle: SocketHandle) -> usize {
        self.state
            .borrow()
            .endpoints
            .get(&handle)
            .map_or(0, |endpoint| endpoint.write_calls)
    }

    /// 端点累计写出的字节数。
    pub fn bytes_written(&self, handle: SocketHandle) -> u64 {
        self.state
            .borrow()
            .endpoints
            .get(&handle)
            .map_or(0, |endpoint| endpoint.bytes_written)
    }

    /// 已到达端点、尚未被读取的字节数。
    pub fn pending_inbound(&self, handle: SocketHandle) -> usize {
        self.state
            .borrow()
            .endpoints
            .get(&handle)
            .map_or(0, |endpoint| endpoint.inbound.len())
    }

    pub fn nodelay(&self, handle: SocketHandle) -> bool {
        self.state
            .borrow()
            .endpoints
            .get(&handle)
            .is_some_and(|endpoint| endpoint.nodelay)
    }

    pub(crate) fn bind_listener(&self, address: SocketAddr) -> io::Result<SocketHandle> {
        let mut state = self.state.borrow_mut();
        if state.listeners.contains_key(&address) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        let handle = state.allocate_handle();
        state.listeners.insert(
            address,
            ListenerState {
                handle,
                backlog: VecDeque::new(),
            },
        );
        state.listener_addresses.insert(handle, address);
        debug!(%handle, %address, "sim listener bound");
        Ok(handle)
    }

    pub(crate) fn unbind_listener(&self, handle: SocketHandle) {
        let mut state = self.state.borrow_mut();
        let Some(address) = state.listener_addresses.remove(&handle) else {
            return;
        };
        if let Some(listener) = state.listeners.remove(&address) {
            for pending in listener.backlog {
                let Some(client) = state.endpoints.remove(&pending).and_then(|endpoint| endpoint.peer)
                else {
                    continue;
                };
                let closed = match state.endpoints.get_mut(&client) {
                    Some(endpoint) if matches!(endpoint.phase, Phase::Closed) => true,
                    Some(endpoint) => {
                        endpoint.peer_closed = true;
                        false
                    }
                    None => false,
                };
                if closed {
                    state.endpoints.remove(&client);
                }
            }
        }
    }

    pub(crate) fn accept(&self, handle: SocketHandle) -> Option<SimSocket> {
        let accepted = {
            let mut state = self.state.borrow_mut();
            let address = *state.listener_addresses.get(&handle)?;
            state.listeners.get_mut(&address)?.backlog.pop_front()?
        };
        Some(SimSocket::new(self.clone(), accepted))
    }

    /// 计算句柄当前的电平就绪状态。
    pub fn readiness(&self, handle: SocketHandle) -> Interest {
        let state = self.state.borrow();
        if let Some(address) = state.listener_addresses.get(&handle) {
            let pending = state
                .listeners
                .get(address)
                .is_some_and(|listener| !listener.backlog.is_empty());
            return if pending { Interest::READABLE } else { Interest::NONE };
        }
        let Some(endpoint) = state.endpoints.get(&handle) else {
            return Interest::NONE;
        };
        match endpoint.phase {
            Phase::ConnectPending(_) => Interest::WRITABLE,
            Phase::Connected => {
                let readable = !endpoint.inbound.is_empty()
                    || endpoint.peer_closed
                    || endpoint.read_error.is_some();
                let writable = endpoint.peer_closed
                    || endpoint.write_error.is_some()
                    || state
                        .peer_buffered(endpoint)
                        .is_none_or(|buffered| buffered < state.config.pipe_capacity);
                let mut ready = Interest::NONE;
                if readable {
                    ready = ready | Interest::READABLE;
                }
                if writable {
                    ready = ready | Interest::WRITABLE;
                }
                ready
            }
            Phase::Fresh | Phase::Closed => Interest::NONE,
        }
    }

    pub(crate) fn connect(
        &self,
        handle: SocketHandle,
        address: SocketAddr,
    ) -> io::Result<ConnectOutcome> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let local = {
            let endpoint = state.endpoint(handle)?;
            if !matches!(endpoint.phase, Phase::Fresh) {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            endpoint.local
        };
        if state.unreachable.contains(&address) {
            return Err(io::Error::from(io::ErrorKind::AddrNotAvailable));
        }
        let Some(listener_handle) = state.listeners.get(&address).map(|listener| listener.handle)
        else {
            trace!(%handle, %address, "sim connect refused");
            state.endpoint_mut(handle)?.phase =
                Phase::ConnectPending(Err(io::ErrorKind::ConnectionRefused));
            return Ok(ConnectOutcome::InProgress);
        };
        let server = state.allocate_handle();
        let mut accepted = Endpoint::new(address, Phase::Connected);
        accepted.peer = Some(handle);
        accepted.peer_address = Some(local);
        state.endpoints.insert(server, accepted);
        if let Some(listener) = state.listeners.get_mut(&address) {
            listener.backlog.push_back(server);
        }
        let client = state.endpoint_mut(handle)?;
        client.peer = Some(server);
        client.peer_address = Some(address);
        client.phase = Phase::ConnectPending(Ok(()));
        trace!(%handle, %server, listener = %listener_handle, %address, "sim connect queued");
        Ok(ConnectOutcome::InProgress)
    }

    pub(crate) fn finish_connect(&self, handle: SocketHandle) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let endpoint = state.endpoint_mut(handle)?;
        match endpoint.phase {
            Phase::ConnectPending(Ok(())) => {
                endpoint.phase = Phase::Connected;
                Ok(())
            }
            Phase::ConnectPending(Err(kind)) => {
                endpoint.phase = Phase::Closed;
                Err(io::Error::from(kind))
            }
            Phase::Connected => Ok(()),
            Phase::Fresh => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Phase::Closed => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    pub(crate) fn read(
        &self,
        handle: SocketHandle,
        buffer: &mut Buffer,
        max_bytes: usize,
    ) -> io::Result<ReadOutcome> {
        let mut state = self.state.borrow_mut();
        let cap = state.config.max_read_per_call;
        let endpoint = state.endpoint_mut(handle)?;
        if let Some(kind) = endpoint.read_error.take() {
            return Err(io::Error::from(kind));
        }
        if !matches!(endpoint.phase, Phase::Connected) {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if !endpoint.inbound.is_empty() {
            let moved = buffer.move_prefix_from(&mut endpoint.inbound, max_bytes.min(cap));
            if moved > 0 {
                return Ok(ReadOutcome::Read(moved));
            }
            return Ok(ReadOutcome::WouldBlock);
        }
        if endpoint.peer_closed {
            return Ok(ReadOutcome::Eof);
        }
        Ok(ReadOutcome::WouldBlock)
    }

    pub(crate) fn write(
        &self,
        handle: SocketHandle,
        buffer: &mut Buffer,
    ) -> io::Result<WriteOutcome> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let capacity = state.config.pipe_capacity;
        let peer = {
            let endpoint = state.endpoint_mut(handle)?;
            if let Some(kind) = endpoint.write_error.take() {
                return Err(io::Error::from(kind));
            }
            if !matches!(endpoint.phase, Phase::Connected) {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            if endpoint.peer_closed {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            endpoint.peer
        };
        let Some(peer) = peer.and_then(|peer| state.endpoints.get_mut(&peer)) else {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        };
        let room = capacity.saturating_sub(peer.inbound.len());
        if room == 0 {
            return Ok(WriteOutcome::WouldBlock);
        }
        let moved = peer.inbound.move_prefix_from(buffer, room);
        let endpoint = state.endpoint_mut(handle)?;
        endpoint.write_calls += 1;
        endpoint.bytes_written += moved as u64;
        trace!(%handle, bytes = moved, "sim write");
        Ok(WriteOutcome::Written(moved))
    }

    pub(crate) fn close(&self, handle: SocketHandle) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let Some(endpoint) = state.endpoints.get_mut(&handle) else {
            return;
        };
        if matches!(endpoint.phase, Phase::Closed) {
            return;
        }
        endpoint.phase = Phase::Closed;
        endpoint.inbound.clear();
        let peer = endpoint.peer;
        trace!(%handle, "sim socket closed");
        match peer.and_then(|peer| state.endpoints.get_mut(&peer)) {
            Some(peer) if !matches!(peer.phase, Phase::Closed) => {
                peer.peer_closed = true;
                return;
            }
            _ => {}
        }
        state.endpoints.remove(&handle);
        if let Some(peer) = peer {
            state.endpoints.remove(&peer);
        }
    }

    pub(crate) fn set_nodelay(&self, handle: SocketHandle, enable: bool) -> io::Result<()> {
        self.state.borrow_mut().endpoint_mut(handle)?.nodelay = enable;
        Ok(())
    }

    pub(crate) fn local_addr(&self, handle: SocketHandle) -> io::Result<SocketAddr> {
        Ok(self.state.borrow().endpoint(handle)?.local)
    }

    pub(crate) fn peer_addr(&self, handle: SocketHandle) -> io::Result<SocketAddr> {
        self.state
            .borrow()
            .endpoint(handle)?
            .peer_address
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}
