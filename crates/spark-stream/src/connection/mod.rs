//! # connection 模块说明
//!
//! ## 角色定位（Why）
//! - 一条连接独占一个双工字节流套接字：从调度器接收读写就绪，把读到的字节推过读过滤器链，
//!   把本端写入的字节经写过滤器链提交到写缓冲再冲刷到套接字；
//! - 关闭协议、读暂停计数、写缓冲水位与字节记账全部收敛在这里，外层只需观察事件。
//!
//! ## 状态机（What）
//! ```text
//! Connecting ──connect 成功──▶ Open ──close(FlushWrite) 且有积压──▶ Closing
//!      │                         │                                    │
//!      └──失败 / close──▶ Closed ◀┴──close(NoFlush) / EOF / 错误────────┘
//! ```
//! - `Closed` 为终态；`Closed` 之后调用 `write`、`read_disable`、注册过滤器均为契约违例并 panic；
//! - 再次 `close` 是允许的空操作。
//!
//! ## 重入约定（How）
//! - 任何对外回调（过滤器、观察者）发生前都释放内部借用，回调内可以再次操作连接；
//! - 每次回调返回后重新读取状态，若连接已关闭则立即停止后续步骤。

mod io;

use std::{
    cell::{Cell, RefCell},
    fmt,
    net::{Ipv4Addr, SocketAddr},
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::{debug, warn};

use crate::{
    buffer::Buffer,
    config::ConnectionConfig,
    dispatcher::{Dispatcher, Interest, ReadinessHandler},
    error::{CONFIGURE, StreamError, map_io_error},
    filter::{FilterManager, ReadFilter, WriteFilter},
    socket::{Socket, SocketHandle},
    stats::{BufferStats, DirectionAccounting},
    watermark::{WatermarkTransition, WriteBufferWatermarks},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const UNSPECIFIED_ADDRESS: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// 进程内唯一、连接生命周期内稳定的标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseType {
    /// 丢弃写缓冲并立即关闭。
    NoFlush,
    /// 先冲刷写缓冲，排空后再关闭。
    FlushWrite,
}

/// 向观察者广播的生命周期事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// 对端关闭或任何非本端发起的失败；`None` 表示对端正常半关闭。
    RemoteClose(Option<StreamError>),
    LocalClose,
}

impl ConnectionEvent {
    pub fn is_close(&self) -> bool {
        !matches!(self, ConnectionEvent::Connected)
    }

    pub fn reason(&self) -> Option<&StreamError> {
        match self {
            ConnectionEvent::RemoteClose(reason) => reason.as_ref(),
            _ => None,
        }
    }
}

/// 连接观察者。
///
/// # 契约说明（What）
/// - `on_event`：`Connected` 至多一次且先于任何数据事件；关闭事件恰好一次；
/// - 水位回调严格交替出现，默认实现为空操作，背压策略由观察者自行决定；
/// - 所有回调都可以重入连接（例如在 `Connected` 中直接 `close`）。
pub trait ConnectionCallbacks {
    fn on_event(&self, event: &ConnectionEvent, conn: &Connection);

    fn on_above_write_buffer_high_watermark(&self, conn: &Connection) {
        let _ = conn;
    }

    fn on_below_write_buffer_low_watermark(&self, conn: &Connection) {
        let _ = conn;
    }
}

/// 单条双工字节流连接的句柄。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 句柄可廉价克隆，过滤器与观察者在回调里拿到的是同一条连接；
/// - 调度器只持有弱引用，连接的寿命完全由使用方决定。
///
/// ## 逻辑 (How)
/// - `ConnectionInner` 以 `Rc::new_cyclic` 构造并保存指向自身的 `Weak`，
///   调度器回调时借此重建句柄；
/// - 可变状态集中在 `ConnectionCore`，过滤器序列与观察者列表各自独立借用，
///   使“遍历过滤器时追加过滤器”成为可能。
///
/// ## 契约 (What)
/// - 所有方法只能在驱动调度器的线程上调用；
/// - 最后一个句柄被释放时，若连接尚未关闭，会静默释放套接字并撤销调度器登记，
///   不再广播事件。
///
/// ## 注意事项 (Trade-offs)
/// - 观察者或过滤器若持有强句柄，会与连接形成引用环；需要长期保存时请使用 [`Connection::downgrade`]。
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnectionInner>,
}

/// [`Connection`] 的弱引用。
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    handle: SocketHandle,
    dispatcher: Rc<dyn Dispatcher>,
    local_address: Cell<SocketAddr>,
    remote_address: SocketAddr,
    self_ref: Weak<ConnectionInner>,
    core: RefCell<ConnectionCore>,
    filters: RefCell<FilterManager>,
    callbacks: RefCell<Vec<Rc<dyn ConnectionCallbacks>>>,
}

struct ConnectionCore {
    state: ConnectionState,
    socket: Option<Box<dyn Socket>>,
    read_buffer: Buffer,
    write_buffer: Buffer,
    read_disable_count: u32,
    registered: Interest,
    watermarks: WriteBufferWatermarks,
    read_buffer_limit: u32,
    read_chunk_bytes: usize,
    stats: Option<BufferStats>,
    rx: DirectionAccounting,
    tx: DirectionAccounting,
    connect_started: bool,
}

impl ConnectionCore {
    fn record_rx(&mut self, transferred: u64) {
        let size = self.read_buffer.len() as u64;
        self.rx
            .record(transferred, size, self.stats.as_ref().map(BufferStats::rx_sinks));
    }

    fn record_tx(&mut self, transferred: u64) {
        let size = self.write_buffer.len() as u64;
        self.tx
            .record(transferred, size, self.stats.as_ref().map(BufferStats::tx_sinks));
    }
}

impl ConnectionInner {
    fn enable_interest(&self, core: &mut ConnectionCore, interest: Interest) {
        let missing = interest.difference(core.registered);
        if missing.is_empty() || core.socket.is_none() {
            return;
        }
        self.dispatcher.register(self.handle, missing);
        core.registered = core.registered | missing;
    }

    fn disable_interest(&self, core: &mut ConnectionCore, interest: Interest) {
        let present = interest.intersection(core.registered);
        if present.is_empty() {
            return;
        }
        self.dispatcher.deregister(self.handle, present);
        core.registered = core.registered.difference(present);
    }
}

impl ReadinessHandler for ConnectionInner {
    fn on_ready(&self, ready: Interest) {
        if let Some(inner) = self.self_ref.upgrade() {
            Connection { inner }.on_ready(ready);
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(mut socket) = self.core.get_mut().socket.take() {
            self.dispatcher.detach(self.handle);
            socket.close();
            debug!(connection_id = %self.id, "connection dropped while open; socket released");
        }
    }
}

impl Connection {
    /// 以已建立的套接字构造服务端连接：直接处于 `Open` 并登记读兴趣。
    pub fn accepted(
        dispatcher: Rc<dyn Dispatcher>,
        socket: Box<dyn Socket>,
        config: &ConnectionConfig,
    ) -> Connection {
        let remote = socket.peer_addr().unwrap_or(UNSPECIFIED_ADDRESS);
        let conn = Self::build(dispatcher, socket, remote, ConnectionState::Open, config);
        conn.inner.filters.borrow_mut().mark_initialized();
        {
            let mut core = conn.inner.core.borrow_mut();
            conn.inner.enable_interest(&mut core, Interest::READABLE);
        }
        debug!(
            connection_id = %conn.inner.id,
            local = %conn.local_address(),
            remote = %remote,
            "accepted connection"
        );
        conn
    }

    pub(crate) fn build(
        dispatcher: Rc<dyn Dispatcher>,
        mut socket: Box<dyn Socket>,
        remote_address: SocketAddr,
        state: ConnectionState,
        config: &ConnectionConfig,
    ) -> Connection {
        let id = ConnectionId::next();
        if config.no_delay
            && let Err(error) = socket.set_nodelay(true)
        {
            let reason = map_io_error(CONFIGURE, error);
            warn!(connection_id = %id, %reason, "failed to enable TCP_NODELAY");
        }
        let handle = socket.handle();
        let local_address = socket.local_addr().unwrap_or(UNSPECIFIED_ADDRESS);
        let core = ConnectionCore {
            state,
            socket: Some(socket),
            read_buffer: Buffer::new(),
            write_buffer: Buffer::new(),
            read_disable_count: 0,
            registered: Interest::NONE,
            watermarks: WriteBufferWatermarks::default(),
            read_buffer_limit: 0,
            read_chunk_bytes: config.read_chunk_bytes.max(1),
            stats: None,
            rx: DirectionAccounting::default(),
            tx: DirectionAccounting::default(),
            connect_started: false,
        };
        let inner = Rc::new_cyclic(|self_ref| ConnectionInner {
            id,
            handle,
            dispatcher,
            local_address: Cell::new(local_address),
            remote_address,
            self_ref: self_ref.clone(),
            core: RefCell::new(core),
            filters: RefCell::new(FilterManager::default()),
            callbacks: RefCell::new(Vec::new()),
        });
        let handler = Rc::downgrade(&inner);
        let handler: Weak<dyn ReadinessHandler> = handler;
        inner.dispatcher.attach(handle, handler);
        let conn = Connection { inner };
        conn.set_buffer_limits(config.buffer_limit_bytes);
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn local_address(&self) -> SocketAddr {
        self.inner.local_address.get()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.borrow().state
    }

    pub fn dispatcher(&self) -> &Rc<dyn Dispatcher> {
        &self.inner.dispatcher
    }

    /// 读暂停计数为 0 时返回 `true`。
    pub fn read_enabled(&self) -> bool {
        self.inner.core.borrow().read_disable_count == 0
    }

    pub fn buffer_limit(&self) -> u32 {
        self.inner.core.borrow().read_buffer_limit
    }

    pub fn above_high_watermark(&self) -> bool {
        self.inner.core.borrow().watermarks.is_above()
    }

    /// 写缓冲中尚未冲刷的字节数。
    pub fn pending_write_bytes(&self) -> usize {
        self.inner.core.borrow().write_buffer.len()
    }

    /// 协商得到的应用层协议，未协商时为空字符串。
    pub fn next_protocol(&self) -> String {
        self.inner
            .core
            .borrow()
            .socket
            .as_ref()
            .and_then(|socket| socket.next_protocol())
            .map(str::to_owned)
            .unwrap_or_default()
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn add_connection_callbacks(&self, callbacks: Rc<dyn ConnectionCallbacks>) {
        self.inner.callbacks.borrow_mut().push(callbacks);
    }

    /// 追加读过滤器；连接已 `Open` 时立即补发 `on_new_connection`。
    pub fn add_read_filter(&self, filter: Rc<dyn ReadFilter>) {
        self.assert_not_closed("add_read_filter");
        let notify = {
            let mut filters = self.inner.filters.borrow_mut();
            filters.add_read_filter(filter.clone());
            filters.initialized()
        };
        if notify {
            filter.on_new_connection(self);
        }
    }

    pub fn add_write_filter(&self, filter: Rc<dyn WriteFilter>) {
        self.assert_not_closed("add_write_filter");
        self.inner.filters.borrow_mut().add_write_filter(filter);
    }

    /// 同时注册为读、写过滤器，在两条序列中各占一个位置。
    pub fn add_filter<F>(&self, filter: Rc<F>)
    where
        F: ReadFilter + WriteFilter + 'static,
    {
        self.add_write_filter(filter.clone());
        self.add_read_filter(filter);
    }

    /// 调整写缓冲上限与单次读事件上限，并立即基于当前积压重新评估水位。
    pub fn set_buffer_limits(&self, limit: u32) {
        let transition = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            core.read_buffer_limit = limit;
            core.watermarks.set_limit(limit);
            let buffered = core.write_buffer.len() as u64;
            core.watermarks.evaluate(buffered)
        };
        self.notify_watermark(transition);
    }

    /// 挂载四个记账槽位；此前发生的字节变化不会补发。
    pub fn set_buffer_stats(&self, stats: BufferStats) {
        self.inner.core.borrow_mut().stats = Some(stats);
    }

    /// 读暂停计数：`true` 加一，`false` 减一；只在 0/1 边界上改动调度器登记。
    pub fn read_disable(&self, disable: bool) {
        let mut guard = self.inner.core.borrow_mut();
        let core = &mut *guard;
        assert!(
            core.state != ConnectionState::Closed,
            "read_disable() called on closed connection {}",
            self.inner.id
        );
        if disable {
            core.read_disable_count += 1;
            if core.read_disable_count == 1 {
                self.inner.disable_interest(core, Interest::READABLE);
            }
        } else {
            assert!(
                core.read_disable_count > 0,
                "unbalanced read_disable(false) on connection {}",
                self.inner.id
            );
            core.read_disable_count -= 1;
            if core.read_disable_count == 0 && core.state == ConnectionState::Open {
                self.inner.enable_interest(core, Interest::READABLE);
            }
        }
    }

    fn assert_not_closed(&self, operation: &str) {
        assert!(
            self.state() != ConnectionState::Closed,
            "{operation}() called on closed connection {}",
            self.inner.id
        );
    }

    fn raise_event(&self, event: &ConnectionEvent) {
        let mut index = 0;
        loop {
            let callbacks = self.inner.callbacks.borrow().get(index).cloned();
            let Some(callbacks) = callbacks else { break };
            index += 1;
            callbacks.on_event(event, self);
        }
    }

    fn notify_watermark(&self, transition: Option<WatermarkTransition>) {
        let Some(transition) = transition else { return };
        debug!(connection_id = %self.inner.id, ?transition, "write buffer watermark crossed");
        let mut index = 0;
        loop {
            let callbacks = self.inner.callbacks.borrow().get(index).cloned();
            let Some(callbacks) = callbacks else { break };
            index += 1;
            match transition {
                WatermarkTransition::AboveHigh => callbacks.on_above_write_buffer_high_watermark(self),
                WatermarkTransition::BelowLow => callbacks.on_below_write_buffer_low_watermark(self),
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Connection");
        out.field("id", &self.inner.id).field("handle", &self.inner.handle);
        if let Ok(core) = self.inner.core.try_borrow() {
            out.field("state", &core.state)
                .field("read_buffer", &core.read_buffer.len())
                .field("write_buffer", &core.write_buffer.len());
        }
        out.finish()
    }
}
