//! 集成测试共用的仿真拓扑与探针。
//!
//! - `Harness`：一张仿真网络、一个调度器与一个监听器，接受到的端点暂存在队列里，
//!   由测试决定何时包装为服务端连接；
//! - `EventLog`：按到达顺序记录生命周期事件与水位回调；
//! - `Sink`：排空并收集读数据的读过滤器，记录每次 `on_data` 看到的字节数。

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    net::SocketAddr,
    rc::Rc,
};

use spark_stream::{
    Buffer, ClientConnection, Connection, ConnectionCallbacks, ConnectionConfig, ConnectionEvent,
    Dispatcher, FilterStatus, Interest, ReadFilter, RunMode, Socket, SocketHandle,
    sim::{SimDispatcher, SimListener, SimNetwork, SimNetworkConfig, SimSocket},
};

pub const SERVER_ADDRESS: &str = "10.0.0.1:8080";

/// 安装测试期日志订阅者；`RUST_LOG` 未设置时默认只输出告警。
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub network: SimNetwork,
    pub dispatcher: Rc<SimDispatcher>,
    pub address: SocketAddr,
    accepted: Rc<RefCell<VecDeque<SimSocket>>>,
    _listener: SimListener,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_network(SimNetworkConfig::default())
    }

    pub fn with_network(config: SimNetworkConfig) -> Self {
        init_tracing();
        let network = SimNetwork::new(config);
        let dispatcher = Rc::new(SimDispatcher::new(network.clone()));
        let address: SocketAddr = SERVER_ADDRESS.parse().expect("合法的监听地址");
        let accepted = Rc::new(RefCell::new(VecDeque::new()));
        let queue = accepted.clone();
        let listener = SimListener::bind(&network, dispatcher.clone(), address, move |socket| {
            queue.borrow_mut().push_back(socket);
        })
        .expect("监听地址未被占用");
        Self {
            network,
            dispatcher,
            address,
            accepted,
            _listener: listener,
        }
    }

    /// 创建指向监听地址、尚未发起连接的客户端。
    pub fn client(&self, config: &ConnectionConfig) -> (ClientConnection, SocketHandle) {
        self.client_to(self.address, config)
    }

    pub fn client_to(
        &self,
        address: SocketAddr,
        config: &ConnectionConfig,
    ) -> (ClientConnection, SocketHandle) {
        let socket = self.network.socket();
        let handle = socket.handle();
        let client = ClientConnection::new(self.dispatcher.clone(), Box::new(socket), address, config);
        (client, handle)
    }

    /// 把最早接受的端点包装为服务端连接。
    pub fn accept(&self, config: &ConnectionConfig) -> (Connection, SocketHandle) {
        let socket = self
            .accepted
            .borrow_mut()
            .pop_front()
            .expect("监听器应已接受一条连接");
        let handle = socket.handle();
        (
            Connection::accepted(self.dispatcher.clone(), Box::new(socket), config),
            handle,
        )
    }

    pub fn pending_accepts(&self) -> usize {
        self.accepted.borrow().len()
    }

    pub fn run(&self) {
        self.dispatcher.run(RunMode::NonBlock);
    }

    /// 建立一对已连接的客户端/服务端连接，服务端挂上 `Sink` 与 `EventLog`。
    pub fn connected_pair(&self, client_config: &ConnectionConfig, server_config: &ConnectionConfig) -> Pair {
        let (client, client_handle) = self.client(client_config);
        let client_log = EventLog::attach(&client);
        client.connect();
        self.run();
        let (server, server_handle) = self.accept(server_config);
        let server_log = EventLog::attach(&server);
        let sink = Rc::new(Sink::default());
        server.add_read_filter(sink.clone());
        Pair {
            client,
            client_handle,
            client_log,
            server,
            server_handle,
            server_log,
            sink,
        }
    }
}

pub struct Pair {
    pub client: ClientConnection,
    pub client_handle: SocketHandle,
    pub client_log: Rc<EventLog>,
    pub server: Connection,
    pub server_handle: SocketHandle,
    pub server_log: Rc<EventLog>,
    pub sink: Rc<Sink>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observed {
    Event(ConnectionEvent),
    AboveHigh,
    BelowLow,
}

#[derive(Default)]
pub struct EventLog {
    entries: RefCell<Vec<Observed>>,
}

impl EventLog {
    pub fn attach(conn: &Connection) -> Rc<EventLog> {
        let log = Rc::new(EventLog::default());
        conn.add_connection_callbacks(log.clone());
        log
    }

    pub fn entries(&self) -> Vec<Observed> {
        self.entries.borrow().clone()
    }

    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.entries
            .borrow()
            .iter()
            .filter_map(|entry| match entry {
                Observed::Event(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn watermarks(&self) -> Vec<Observed> {
        self.entries
            .borrow()
            .iter()
            .filter(|entry| !matches!(entry, Observed::Event(_)))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

impl ConnectionCallbacks for EventLog {
    fn on_event(&self, event: &ConnectionEvent, _conn: &Connection) {
        self.entries.borrow_mut().push(Observed::Event(event.clone()));
    }

    fn on_above_write_buffer_high_watermark(&self, _conn: &Connection) {
        self.entries.borrow_mut().push(Observed::AboveHigh);
    }

    fn on_below_write_buffer_low_watermark(&self, _conn: &Connection) {
        self.entries.borrow_mut().push(Observed::BelowLow);
    }
}

#[derive(Default)]
pub struct Sink {
    pub data: RefCell<Vec<u8>>,
    pub chunks: RefCell<Vec<usize>>,
    pub new_connections: Cell<usize>,
}

impl Sink {
    pub fn received(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }

    pub fn chunks(&self) -> Vec<usize> {
        self.chunks.borrow().clone()
    }
}

impl ReadFilter for Sink {
    fn on_new_connection(&self, _conn: &Connection) {
        self.new_connections.set(self.new_connections.get() + 1);
    }

    fn on_data(&self, data: &mut Buffer, _conn: &Connection) -> FilterStatus {
        self.chunks.borrow_mut().push(data.len());
        self.data.borrow_mut().extend(data.to_vec());
        data.clear();
        FilterStatus::Continue
    }
}

/// 句柄当前在调度器中登记的兴趣。
pub fn registered(harness: &Harness, handle: SocketHandle) -> Option<Interest> {
    harness.dispatcher.interest(handle)
}
