use std::{net::SocketAddr, ops::Deref, rc::Rc};

use tracing::warn;

use crate::{
    config::ConnectionConfig,
    connection::{Connection, ConnectionState},
    dispatcher::Dispatcher,
    error::{CONFIGURE, map_io_error},
    socket::Socket,
};

/// 主动发起连接的客户端连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - `Connecting → Open` 只能由主动连接触发；把这一入口与目标地址收拢到独立类型，
///   服务端连接就不会误用 `connect`；
///
/// ## 逻辑 (How)
/// - 构造时连接处于 `Connecting`；`connect` 发起非阻塞连接并登记写兴趣，
///   写就绪时由连接内部调用 `Socket::finish_connect` 得到结果；
/// - 其余能力通过 `Deref` 委托给 [`Connection`]。
///
/// ## 契约 (What)
/// - `connect` 只能调用一次且必须处于 `Connecting`；
/// - 成功：广播 `Connected`，补发读过滤器的 `on_new_connection`，冲刷连接前写入的字节；
/// - 失败：直接进入 `Closed` 并广播 `RemoteClose`，本层不重试。
///
/// ## 注意事项 (Trade-offs)
/// - 连接前写入的数据在 `write` 时已经过写过滤器与水位评估，连接建立后只做冲刷。
pub struct ClientConnection {
    connection: Connection,
    remote_address: SocketAddr,
}

impl ClientConnection {
    pub fn new(
        dispatcher: Rc<dyn Dispatcher>,
        socket: Box<dyn Socket>,
        remote_address: SocketAddr,
        config: &ConnectionConfig,
    ) -> Self {
        let connection = Connection::build(
            dispatcher,
            socket,
            remote_address,
            ConnectionState::Connecting,
            config,
        );
        Self {
            connection,
            remote_address,
        }
    }

    /// 发起到构造时地址的非阻塞连接。
    pub fn connect(&self) {
        self.connection.start_connect(self.remote_address);
    }

    /// 透传 `TCP_NODELAY`；失败只记录日志，不影响连接状态。
    pub fn no_delay(&self, enable: bool) {
        if let Err(error) = self.connection.set_socket_nodelay(enable) {
            let reason = map_io_error(CONFIGURE, error);
            warn!(connection_id = %self.connection.id(), enable, %reason, "failed to set TCP_NODELAY");
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn into_connection(self) -> Connection {
        self.connection
    }
}

impl Deref for ClientConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}
