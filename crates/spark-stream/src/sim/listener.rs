use std::{
    cell::RefCell,
    io,
    net::SocketAddr,
    rc::{Rc, Weak},
};

use tracing::trace;

use crate::{
    dispatcher::{Dispatcher, Interest, ReadinessHandler},
    socket::SocketHandle,
};

use super::{network::SimNetwork, socket::SimSocket};

type AcceptCallback = Box<dyn FnMut(SimSocket)>;

/// 仿真网络上的监听器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 连接引擎本身不负责接受连接；测试需要一个最小的“接受编排者”，
///   把积压队列中的服务端端点交给使用方构造 [`Connection::accepted`](crate::Connection::accepted)。
///
/// ## 契约 (What)
/// - 绑定成功后在调度器中登记读兴趣，积压非空时按到达顺序逐个调用接受回调；
/// - 释放监听器会撤销调度器登记并丢弃尚未接受的端点，对应客户端随后读到 EOF。
pub struct SimListener {
    inner: Rc<ListenerInner>,
}

struct ListenerInner {
    network: SimNetwork,
    dispatcher: Rc<dyn Dispatcher>,
    handle: SocketHandle,
    address: SocketAddr,
    on_accept: RefCell<AcceptCallback>,
}

impl SimListener {
    pub fn bind(
        network: &SimNetwork,
        dispatcher: Rc<dyn Dispatcher>,
        address: SocketAddr,
        on_accept: impl FnMut(SimSocket) + 'static,
    ) -> io::Result<SimListener> {
        let handle = network.bind_listener(address)?;
        let inner = Rc::new(ListenerInner {
            network: network.clone(),
            dispatcher,
            handle,
            address,
            on_accept: RefCell::new(Box::new(on_accept)),
        });
        let handler = Rc::downgrade(&inner);
        let handler: Weak<dyn ReadinessHandler> = handler;
        inner.dispatcher.attach(handle, handler);
        inner.dispatcher.register(handle, Interest::READABLE);
        Ok(SimListener { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.address
    }

    pub fn handle(&self) -> SocketHandle {
        self.inner.handle
    }
}

impl ReadinessHandler for ListenerInner {
    fn on_ready(&self, ready: Interest) {
        if !ready.is_readable() {
            return;
        }
        while let Some(socket) = self.network.accept(self.handle) {
            trace!(listener = %self.handle, accepted = %crate::socket::Socket::handle(&socket), "sim accept");
            (self.on_accept.borrow_mut())(socket);
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.dispatcher.detach(self.handle);
        self.network.unbind_listener(self.handle);
    }
}
