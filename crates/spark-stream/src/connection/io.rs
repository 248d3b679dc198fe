//! 连接的读写路径、连接完成与关闭序列。

use std::{io, mem, net::SocketAddr};

use tracing::{debug, trace};

use super::{CloseType, Connection, ConnectionEvent, ConnectionState};
use crate::{
    buffer::Buffer,
    dispatcher::Interest,
    error::{CONNECT, READ, StreamError, WRITE, map_io_error},
    filter::FilterStatus,
    socket::{ConnectOutcome, ReadOutcome, WriteOutcome},
};

/// 一轮读循环结束的原因。
enum ReadEnd {
    /// 套接字暂无数据，或已达到本事件的读上限。
    Paused,
    Eof,
    Failed(StreamError),
}

/// 一次冲刷结束的原因。
enum FlushEnd {
    Drained,
    Blocked,
    Failed(StreamError),
}

impl Connection {
    pub(super) fn on_ready(&self, ready: Interest) {
        if ready.is_writable() {
            self.on_write_ready();
        }
        if ready.is_readable() {
            self.on_read_ready();
        }
    }

    /// 将 `data` 经写过滤器链后整体移入写缓冲，并尝试立即冲刷。
    ///
    /// - 任一写过滤器返回 `StopIteration` 时，本次写入不提交，字节留在 `data` 中；
    /// - 提交后 `data` 为空，先记账再评估高水位，连接 `Connecting` 时只缓冲不冲刷。
    pub fn write(&self, data: &mut Buffer) {
        self.assert_not_closed("write");
        if data.is_empty() {
            return;
        }
        let mut index = 0;
        loop {
            let filter = self.inner.filters.borrow().write_filter(index);
            let Some(filter) = filter else { break };
            index += 1;
            if filter.on_write(data, self) == FilterStatus::StopIteration {
                trace!(connection_id = %self.inner.id, filter = index - 1, "write filter stopped iteration");
                return;
            }
            if self.state() == ConnectionState::Closed {
                return;
            }
        }
        if data.is_empty() {
            return;
        }

        let (transition, state) = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            let bytes = data.len();
            core.write_buffer.move_from(data);
            core.record_tx(0);
            let buffered = core.write_buffer.len() as u64;
            trace!(connection_id = %self.inner.id, bytes, buffered, "bytes committed to write buffer");
            (core.watermarks.evaluate(buffered), core.state)
        };
        self.notify_watermark(transition);
        if matches!(state, ConnectionState::Open | ConnectionState::Closing)
            && self.state() != ConnectionState::Closed
        {
            self.flush_write_buffer();
        }
    }

    /// 关闭连接。
    ///
    /// - `NoFlush`：丢弃写缓冲，立即关闭并广播 `LocalClose`；
    /// - `FlushWrite`：写缓冲为空时等同于 `NoFlush`；否则进入 `Closing`，停止读取，
    ///   在写缓冲排空（或写出错）后完成关闭；`Connecting` 阶段没有可冲刷的通道，按 `NoFlush` 处理；
    /// - 已 `Closed` 时为空操作，`Closing` 期间重复的 `FlushWrite` 同样被忽略。
    pub fn close(&self, close_type: CloseType) {
        let (state, pending) = {
            let core = self.inner.core.borrow();
            (core.state, core.write_buffer.len())
        };
        match state {
            ConnectionState::Closed => {
                trace!(connection_id = %self.inner.id, "close() on closed connection ignored");
                return;
            }
            ConnectionState::Closing if close_type == CloseType::FlushWrite => return,
            _ => {}
        }
        debug!(connection_id = %self.inner.id, ?close_type, pending, ?state, "closing connection");

        if close_type == CloseType::FlushWrite && pending > 0 && state != ConnectionState::Connecting {
            {
                let mut core = self.inner.core.borrow_mut();
                core.state = ConnectionState::Closing;
                self.inner.disable_interest(&mut core, Interest::READABLE);
            }
            self.flush_write_buffer();
            return;
        }

        self.discard_write_buffer();
        self.close_socket(ConnectionEvent::LocalClose);
    }

    pub(crate) fn start_connect(&self, address: SocketAddr) {
        let result = {
            let mut core = self.inner.core.borrow_mut();
            assert!(
                core.state == ConnectionState::Connecting && !core.connect_started,
                "connect() is only valid once on a connecting client connection {}",
                self.inner.id
            );
            core.connect_started = true;
            match core.socket.as_mut() {
                Some(socket) => socket.connect(address),
                None => return,
            }
        };
        match result {
            Ok(ConnectOutcome::Connected) => self.on_connected(),
            Ok(ConnectOutcome::InProgress) => {
                trace!(connection_id = %self.inner.id, %address, "connect in progress");
                let mut core = self.inner.core.borrow_mut();
                self.inner.enable_interest(&mut core, Interest::WRITABLE);
            }
            Err(error) => {
                let reason = map_io_error(CONNECT, error);
                debug!(connection_id = %self.inner.id, %address, %reason, "connect failed immediately");
                self.close_socket(ConnectionEvent::RemoteClose(Some(reason)));
            }
        }
    }

    pub(crate) fn set_socket_nodelay(&self, enable: bool) -> io::Result<()> {
        match self.inner.core.borrow_mut().socket.as_mut() {
            Some(socket) => socket.set_nodelay(enable),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn on_write_ready(&self) {
        match self.state() {
            ConnectionState::Connecting => self.complete_connect(),
            ConnectionState::Open | ConnectionState::Closing => self.flush_write_buffer(),
            ConnectionState::Closed => {}
        }
    }

    fn complete_connect(&self) {
        let result = {
            let mut core = self.inner.core.borrow_mut();
            match core.socket.as_mut() {
                Some(socket) => socket.finish_connect(),
                None => return,
            }
        };
        match result {
            Ok(()) => self.on_connected(),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                trace!(connection_id = %self.inner.id, "connect still in progress");
            }
            Err(error) => {
                let reason = map_io_error(CONNECT, error);
                debug!(connection_id = %self.inner.id, %reason, "connect failed");
                self.close_socket(ConnectionEvent::RemoteClose(Some(reason)));
            }
        }
    }

    fn on_connected(&self) {
        {
            let mut core = self.inner.core.borrow_mut();
            core.state = ConnectionState::Open;
            if let Some(address) = core.socket.as_ref().and_then(|socket| socket.local_addr().ok()) {
                self.inner.local_address.set(address);
            }
        }
        debug!(
            connection_id = %self.inner.id,
            local = %self.local_address(),
            remote = %self.inner.remote_address,
            "connection established"
        );
        self.raise_event(&ConnectionEvent::Connected);
        if self.state() != ConnectionState::Open {
            return;
        }
        self.initialize_read_filters();
        if self.state() != ConnectionState::Open {
            return;
        }
        {
            let mut core = self.inner.core.borrow_mut();
            if core.read_disable_count == 0 {
                self.inner.enable_interest(&mut core, Interest::READABLE);
            }
        }
        self.flush_write_buffer();
    }

    fn initialize_read_filters(&self) {
        let count = self.inner.filters.borrow_mut().mark_initialized();
        for index in 0..count {
            if self.state() == ConnectionState::Closed {
                return;
            }
            let filter = self.inner.filters.borrow().read_filter(index);
            if let Some(filter) = filter {
                filter.on_new_connection(self);
            }
        }
    }

    /// 读就绪：按读上限从套接字读入，记账后交给读过滤器链，最后处理 EOF 或错误。
    fn on_read_ready(&self) {
        let (total, end) = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            if core.state != ConnectionState::Open || core.read_disable_count > 0 {
                return;
            }
            let Some(socket) = core.socket.as_mut() else {
                return;
            };
            let limit = core.read_buffer_limit as usize;
            let mut total = 0usize;
            let end = loop {
                let max = if limit > 0 {
                    limit - total
                } else {
                    core.read_chunk_bytes
                };
                match socket.read(&mut core.read_buffer, max) {
                    Ok(ReadOutcome::Read(0)) | Ok(ReadOutcome::Eof) => break ReadEnd::Eof,
                    Ok(ReadOutcome::Read(n)) => {
                        total += n;
                        if limit > 0 && total >= limit {
                            break ReadEnd::Paused;
                        }
                    }
                    Ok(ReadOutcome::WouldBlock) => break ReadEnd::Paused,
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => break ReadEnd::Failed(map_io_error(READ, error)),
                }
            };
            core.record_rx(total as u64);
            (total, end)
        };
        if total > 0 {
            trace!(connection_id = %self.inner.id, bytes = total, "read from socket");
            self.dispatch_read_buffer();
        }
        match end {
            ReadEnd::Paused => {}
            ReadEnd::Eof => {
                debug!(connection_id = %self.inner.id, "remote closed");
                self.close_socket(ConnectionEvent::RemoteClose(None));
            }
            ReadEnd::Failed(reason) => {
                debug!(connection_id = %self.inner.id, %reason, "read failed");
                self.close_socket(ConnectionEvent::RemoteClose(Some(reason)));
            }
        }
    }

    /// 读缓冲在遍历期间被整体取出，过滤器拿到的是独占的 `&mut Buffer`。
    fn dispatch_read_buffer(&self) {
        let mut data = mem::take(&mut self.inner.core.borrow_mut().read_buffer);
        let mut index = 0;
        while self.state() == ConnectionState::Open {
            let filter = self.inner.filters.borrow().read_filter(index);
            let Some(filter) = filter else { break };
            index += 1;
            if filter.on_data(&mut data, self) == FilterStatus::StopIteration {
                break;
            }
        }
        let mut guard = self.inner.core.borrow_mut();
        let core = &mut *guard;
        if core.state == ConnectionState::Closed {
            return;
        }
        data.move_from(&mut core.read_buffer);
        core.read_buffer = data;
        core.record_rx(0);
    }

    /// 尽可能多地把写缓冲写入套接字；被阻塞时登记写兴趣，排空时撤销。
    fn flush_write_buffer(&self) {
        let (end, transition) = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            let Some(socket) = core.socket.as_mut() else {
                return;
            };
            let mut written = 0u64;
            let end = loop {
                if core.write_buffer.is_empty() {
                    break FlushEnd::Drained;
                }
                match socket.write(&mut core.write_buffer) {
                    Ok(WriteOutcome::Written(0)) | Ok(WriteOutcome::WouldBlock) => {
                        break FlushEnd::Blocked;
                    }
                    Ok(WriteOutcome::Written(n)) => written += n as u64,
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => break FlushEnd::Failed(map_io_error(WRITE, error)),
                }
            };
            core.record_tx(written);
            let buffered = core.write_buffer.len() as u64;
            if written > 0 {
                trace!(connection_id = %self.inner.id, bytes = written, buffered, "flushed to socket");
            }
            (end, core.watermarks.evaluate(buffered))
        };
        self.notify_watermark(transition);
        if self.state() == ConnectionState::Closed {
            return;
        }
        if let FlushEnd::Failed(reason) = end {
            debug!(connection_id = %self.inner.id, %reason, "write failed");
            self.close_socket(ConnectionEvent::RemoteClose(Some(reason)));
            return;
        }
        // 水位回调可能重入 `write`，以回调之后的写缓冲为准。
        let closing = {
            let mut core = self.inner.core.borrow_mut();
            if core.write_buffer.is_empty() {
                self.inner.disable_interest(&mut core, Interest::WRITABLE);
                core.state == ConnectionState::Closing
            } else {
                self.inner.enable_interest(&mut core, Interest::WRITABLE);
                false
            }
        };
        if closing {
            self.close_socket(ConnectionEvent::LocalClose);
        }
    }

    fn discard_write_buffer(&self) {
        let transition = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            let discarded = core.write_buffer.clear();
            if discarded == 0 {
                return;
            }
            trace!(connection_id = %self.inner.id, bytes = discarded, "write buffer discarded");
            core.record_tx(0);
            core.watermarks.evaluate(0)
        };
        self.notify_watermark(transition);
    }

    /// 释放套接字、撤销全部调度器登记、清空缓冲并广播关闭事件；对已关闭的连接为空操作。
    fn close_socket(&self, event: ConnectionEvent) {
        let socket = {
            let mut guard = self.inner.core.borrow_mut();
            let core = &mut *guard;
            if core.state == ConnectionState::Closed {
                return;
            }
            core.state = ConnectionState::Closed;
            core.registered = Interest::NONE;
            self.inner.dispatcher.detach(self.inner.handle);
            core.read_buffer.clear();
            core.write_buffer.clear();
            core.watermarks.reset();
            core.record_rx(0);
            core.record_tx(0);
            core.socket.take()
        };
        if let Some(mut socket) = socket {
            socket.close();
        }
        debug!(connection_id = %self.inner.id, ?event, "connection closed");
        self.raise_event(&event);
    }
}
