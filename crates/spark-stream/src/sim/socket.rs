use std::{io, net::SocketAddr};

use crate::{
    buffer::Buffer,
    socket::{ConnectOutcome, ReadOutcome, Socket, SocketHandle, WriteOutcome},
};

use super::network::SimNetwork;

/// 仿真网络中的一个端点。
///
/// 释放时自动关闭，对端随后读到 EOF。
#[derive(Debug)]
pub struct SimSocket {
    network: SimNetwork,
    handle: SocketHandle,
    protocol: Option<String>,
}

impl SimSocket {
    pub(crate) fn new(network: SimNetwork, handle: SocketHandle) -> Self {
        Self {
            network,
            handle,
            protocol: None,
        }
    }

    /// 模拟握手阶段协商出的应用层协议。
    pub fn with_next_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }
}

impl Socket for SimSocket {
    fn handle(&self) -> SocketHandle {
        self.handle
    }

    fn read(&mut self, buffer: &mut Buffer, max_bytes: usize) -> io::Result<ReadOutcome> {
        self.network.read(self.handle, buffer, max_bytes)
    }

    fn write(&mut self, buffer: &mut Buffer) -> io::Result<WriteOutcome> {
        self.network.write(self.handle, buffer)
    }

    fn close(&mut self) {
        self.network.close(self.handle);
    }

    fn connect(&mut self, address: SocketAddr) -> io::Result<ConnectOutcome> {
        self.network.connect(self.handle, address)
    }

    fn finish_connect(&mut self) -> io::Result<()> {
        self.network.finish_connect(self.handle)
    }

    fn set_nodelay(&mut self, enable: bool) -> io::Result<()> {
        self.network.set_nodelay(self.handle, enable)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.network.local_addr(self.handle)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.network.peer_addr(self.handle)
    }

    fn next_protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.network.close(self.handle);
    }
}
