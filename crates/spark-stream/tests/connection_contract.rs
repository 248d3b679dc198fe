//! `connection_contract` 集成测试：在仿真网络上验证连接状态机的生命周期与过滤器语义。
//!
//! # 测试目标（Why）
//! - 覆盖写入、冲刷、关闭协议（`NoFlush`/`FlushWrite`）、对端 EOF 与套接字错误的事件序列；
//! - 校验读写过滤器链的顺序、短路与迟到注册语义；
//! - 校验读暂停计数与调度器登记之间的对应关系，以及契约违例的 panic。
//!
//! # 结构安排（How）
//! - 每个用例通过 `support::Harness` 构造独立的网络、调度器与监听器；
//! - 调度器以 `NonBlock` 运行到空闲，断言在运行之间进行，避免时序不确定。

mod support;

use std::{
    cell::{Cell, RefCell},
    io,
    rc::Rc,
};

use proptest::prelude::*;
use spark_stream::{
    Buffer, CloseType, Connection, ConnectionCallbacks, ConnectionConfig, ConnectionEvent,
    ConnectionState, ErrorCategory, FilterStatus, Interest, ReadFilter, WriteFilter,
    sim::SimNetworkConfig,
};
use support::{EventLog, Harness, Observed, Sink, registered};

fn small_pipe(capacity: usize) -> SimNetworkConfig {
    SimNetworkConfig {
        pipe_capacity: capacity,
        ..SimNetworkConfig::default()
    }
}

/// 连接建立后写入的字节应完整送达服务端读过滤器，客户端写缓冲随即排空。
#[test]
fn basic_write_reaches_server() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    assert_eq!(pair.client.state(), ConnectionState::Open);
    assert_eq!(pair.server.state(), ConnectionState::Open);
    assert_eq!(pair.client_log.events(), vec![ConnectionEvent::Connected]);

    pair.client.write(&mut Buffer::from("hello world"));
    assert_eq!(pair.client.pending_write_bytes(), 0);
    harness.run();

    assert_eq!(pair.sink.received(), b"hello world");
    assert_eq!(pair.sink.new_connections.get(), 1);
    assert!(pair.server_log.events().is_empty(), "服务端连接不广播 Connected");
}

/// 客户端地址与服务端看到的对端地址一致。
#[test]
fn addresses_are_reported_on_both_ends() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    assert_eq!(pair.client.remote_address(), harness.address);
    assert_eq!(pair.server.local_address(), harness.address);
    assert_eq!(pair.server.remote_address(), pair.client.local_address());
    assert_ne!(pair.client.id(), pair.server.id());
}

/// `NoFlush` 丢弃尚未冲刷的字节：对端只能读到关闭前已经写出的部分，随后读到 EOF。
#[test]
fn close_no_flush_discards_pending_bytes() {
    let harness = Harness::with_network(small_pipe(4));
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());

    pair.client.write(&mut Buffer::from("0123456789abcdefghij"));
    assert_eq!(pair.client.pending_write_bytes(), 16);

    pair.client.close(CloseType::NoFlush);
    assert_eq!(pair.client.state(), ConnectionState::Closed);
    assert_eq!(
        pair.client_log.events(),
        vec![ConnectionEvent::Connected, ConnectionEvent::LocalClose]
    );

    harness.run();
    assert_eq!(pair.sink.received(), b"0123");
    assert_eq!(pair.server_log.events(), vec![ConnectionEvent::RemoteClose(None)]);
    assert_eq!(pair.server.state(), ConnectionState::Closed);
}

/// `FlushWrite` 先进入 `Closing` 并停止读取，写缓冲排空后才广播 `LocalClose`。
#[test]
fn close_flush_write_delivers_everything_first() {
    let harness = Harness::with_network(small_pipe(4));
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());

    pair.client.write(&mut Buffer::from("0123456789abcdefghij"));
    pair.client.close(CloseType::FlushWrite);
    assert_eq!(pair.client.state(), ConnectionState::Closing);
    assert_eq!(
        registered(&harness, pair.client_handle),
        Some(Interest::WRITABLE),
        "Closing 期间只保留写兴趣"
    );

    pair.client.close(CloseType::FlushWrite);
    assert_eq!(pair.client.state(), ConnectionState::Closing, "重复 FlushWrite 被忽略");

    harness.run();
    assert_eq!(pair.sink.received(), b"0123456789abcdefghij");
    assert_eq!(pair.client.state(), ConnectionState::Closed);
    assert_eq!(
        pair.client_log.events(),
        vec![ConnectionEvent::Connected, ConnectionEvent::LocalClose]
    );
    assert_eq!(pair.server_log.events(), vec![ConnectionEvent::RemoteClose(None)]);
}

/// 写缓冲为空时 `FlushWrite` 等同于立即关闭。
#[test]
fn close_flush_write_with_empty_buffer_is_immediate() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    pair.server.close(CloseType::FlushWrite);
    assert_eq!(pair.server.state(), ConnectionState::Closed);
    assert_eq!(pair.server_log.events(), vec![ConnectionEvent::LocalClose]);
}

/// `Closing` 期间的 `NoFlush` 立即完成关闭，丢弃剩余字节。
#[test]
fn no_flush_overrides_pending_flush_write() {
    let harness = Harness::with_network(small_pipe(4));
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    pair.client.write(&mut Buffer::from("0123456789"));
    pair.client.close(CloseType::FlushWrite);
    pair.client.close(CloseType::NoFlush);
    assert_eq!(pair.client.state(), ConnectionState::Closed);
    assert_eq!(pair.client.pending_write_bytes(), 0);

    harness.run();
    assert_eq!(pair.sink.received(), b"0123");
}

/// 关闭后再次 `close` 为空操作，关闭事件恰好一次。
#[test]
fn close_is_idempotent() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    pair.client.close(CloseType::NoFlush);
    pair.client.close(CloseType::NoFlush);
    pair.client.close(CloseType::FlushWrite);
    assert_eq!(
        pair.client_log.events(),
        vec![ConnectionEvent::Connected, ConnectionEvent::LocalClose]
    );
}

/// 对端先写数据再关闭：读过滤器先收到全部数据，然后才观察到 `RemoteClose`。
#[test]
fn remote_close_after_data() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());

    let observed_at_close = Rc::new(Cell::new(None));
    struct SnapshotOnClose {
        sink: Rc<Sink>,
        seen: Rc<Cell<Option<usize>>>,
    }
    impl ConnectionCallbacks for SnapshotOnClose {
        fn on_event(&self, event: &ConnectionEvent, _conn: &Connection) {
            if event.is_close() {
                self.seen.set(Some(self.sink.data.borrow().len()));
            }
        }
    }
    pair.server.add_connection_callbacks(Rc::new(SnapshotOnClose {
        sink: pair.sink.clone(),
        seen: observed_at_close.clone(),
    }));

    pair.client.write(&mut Buffer::from("tail"));
    pair.client.close(CloseType::NoFlush);
    harness.run();

    assert_eq!(pair.sink.received(), b"tail");
    assert_eq!(observed_at_close.get(), Some(4));
    assert_eq!(pair.server_log.events(), vec![ConnectionEvent::RemoteClose(None)]);
}

/// 写出错误以带 `write_failed` 错误码的 `RemoteClose` 呈现，连接不重试。
#[test]
fn write_error_surfaces_as_remote_close() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    harness
        .network
        .inject_write_error(pair.client_handle, io::ErrorKind::ConnectionReset);

    pair.client.write(&mut Buffer::from("doomed"));
    assert_eq!(pair.client.state(), ConnectionState::Closed);
    let events = pair.client_log.events();
    let reason = events[1].reason().expect("写错误应携带原因");
    assert_eq!(reason.code(), "spark.stream.write_failed");
    assert_eq!(reason.kind(), io::ErrorKind::ConnectionReset);
    assert_eq!(reason.category(), ErrorCategory::PeerClosed);

    harness.run();
    assert_eq!(pair.server_log.events(), vec![ConnectionEvent::RemoteClose(None)]);
}

/// 读错误以带 `read_failed` 错误码的 `RemoteClose` 呈现。
#[test]
fn read_error_surfaces_as_remote_close() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    harness
        .network
        .inject_read_error(pair.server_handle, io::ErrorKind::ConnectionAborted);
    harness.run();

    let events = pair.server_log.events();
    assert_eq!(events.len(), 1);
    let reason = events[0].reason().expect("读错误应携带原因");
    assert_eq!(reason.code(), "spark.stream.read_failed");
    assert_eq!(pair.server.state(), ConnectionState::Closed);
}

/// 释放最后一个句柄会静默释放套接字：本端不广播事件，对端读到 EOF。
#[test]
fn dropping_open_connection_releases_socket() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    let client_log = pair.client_log.clone();
    drop(pair.client);

    assert_eq!(registered(&harness, pair.client_handle), None);
    harness.run();
    assert_eq!(client_log.events(), vec![ConnectionEvent::Connected]);
    assert_eq!(pair.server_log.events(), vec![ConnectionEvent::RemoteClose(None)]);
}

#[derive(Default)]
struct Journal {
    entries: RefCell<Vec<String>>,
}

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        self.entries.borrow_mut().push(entry.into());
    }

    fn take(&self) -> Vec<String> {
        self.entries.borrow_mut().drain(..).collect()
    }
}

struct NamedReadFilter {
    name: &'static str,
    status: FilterStatus,
    journal: Rc<Journal>,
}

impl ReadFilter for NamedReadFilter {
    fn on_new_connection(&self, _conn: &Connection) {
        self.journal.push(format!("{}:new", self.name));
    }

    fn on_data(&self, data: &mut Buffer, _conn: &Connection) -> FilterStatus {
        self.journal.push(format!("{}:data:{}", self.name, data.len()));
        self.status
    }
}

/// 读过滤器按注册顺序执行；`StopIteration` 阻止后续过滤器看到本批数据，未排空的字节与下一批合并。
#[test]
fn read_stop_iteration_short_circuits_and_retains_bytes() {
    let harness = Harness::new();
    let (client, _) = harness.client(&ConnectionConfig::default());
    client.connect();
    harness.run();
    let (server, _) = harness.accept(&ConnectionConfig::default());

    let journal = Rc::new(Journal::default());
    server.add_read_filter(Rc::new(NamedReadFilter {
        name: "first",
        status: FilterStatus::StopIteration,
        journal: journal.clone(),
    }));
    server.add_read_filter(Rc::new(NamedReadFilter {
        name: "second",
        status: FilterStatus::Continue,
        journal: journal.clone(),
    }));
    assert_eq!(journal.take(), vec!["first:new", "second:new"]);

    client.write(&mut Buffer::from("abc"));
    harness.run();
    assert_eq!(journal.take(), vec!["first:data:3"]);

    client.write(&mut Buffer::from("de"));
    harness.run();
    assert_eq!(journal.take(), vec!["first:data:5"], "未排空的字节与新数据合并");
}

/// 客户端连接在 `Open` 之前注册的读过滤器，在 `Connected` 之后统一收到 `on_new_connection`；
/// 之后注册的过滤器在注册时立即收到，且早于任何 `on_data`。
#[test]
fn read_filters_initialize_once_open() {
    let harness = Harness::new();
    let (client, _) = harness.client(&ConnectionConfig::default());
    let journal = Rc::new(Journal::default());

    struct ConnectedProbe(Rc<Journal>);
    impl ConnectionCallbacks for ConnectedProbe {
        fn on_event(&self, event: &ConnectionEvent, _conn: &Connection) {
            self.0.push(format!("event:{event:?}"));
        }
    }
    client.add_connection_callbacks(Rc::new(ConnectedProbe(journal.clone())));
    client.add_read_filter(Rc::new(NamedReadFilter {
        name: "early",
        status: FilterStatus::Continue,
        journal: journal.clone(),
    }));
    assert!(journal.take().is_empty(), "Connecting 阶段不应初始化读过滤器");

    client.connect();
    harness.run();
    assert_eq!(journal.take(), vec!["event:Connected", "early:new"]);

    client.add_read_filter(Rc::new(NamedReadFilter {
        name: "late",
        status: FilterStatus::Continue,
        journal: journal.clone(),
    }));
    assert_eq!(journal.take(), vec!["late:new"]);

    let (server, _) = harness.accept(&ConnectionConfig::default());
    server.write(&mut Buffer::from("ping"));
    harness.run();
    assert_eq!(journal.take(), vec!["early:data:4", "late:data:4"]);
}

/// 读过滤器可以在回调中写回数据（回显），写入经写路径送达对端。
#[test]
fn read_filter_can_write_back() {
    struct Echo;
    impl ReadFilter for Echo {
        fn on_data(&self, data: &mut Buffer, conn: &Connection) -> FilterStatus {
            conn.write(data);
            FilterStatus::StopIteration
        }
    }

    let harness = Harness::new();
    let (client, _) = harness.client(&ConnectionConfig::default());
    let client_sink = Rc::new(Sink::default());
    client.add_read_filter(client_sink.clone());
    client.connect();
    harness.run();
    let (server, _) = harness.accept(&ConnectionConfig::default());
    server.add_read_filter(Rc::new(Echo));

    client.write(&mut Buffer::from("marco"));
    harness.run();
    assert_eq!(client_sink.received(), b"marco");
}

/// 读过滤器在 `on_data` 中关闭连接后，后续过滤器不再被调用，读缓冲随之清空。
#[test]
fn closing_from_read_filter_stops_the_chain() {
    struct Closer;
    impl ReadFilter for Closer {
        fn on_data(&self, _data: &mut Buffer, conn: &Connection) -> FilterStatus {
            conn.close(CloseType::NoFlush);
            FilterStatus::Continue
        }
    }

    let harness = Harness::new();
    let (client, _) = harness.client(&ConnectionConfig::default());
    client.connect();
    harness.run();
    let (server, _) = harness.accept(&ConnectionConfig::default());
    let log = EventLog::attach(&server);
    server.add_read_filter(Rc::new(Closer));
    let sink = Rc::new(Sink::default());
    server.add_read_filter(sink.clone());

    client.write(&mut Buffer::from("bye"));
    harness.run();
    assert!(sink.chunks().is_empty());
    assert_eq!(log.events(), vec![ConnectionEvent::LocalClose]);
}

struct TaggingWriteFilter {
    tag: &'static [u8],
}

impl WriteFilter for TaggingWriteFilter {
    fn on_write(&self, data: &mut Buffer, _conn: &Connection) -> FilterStatus {
        data.add(self.tag);
        FilterStatus::Continue
    }
}

/// 写过滤器按注册顺序改写数据；任一过滤器返回 `StopIteration` 时本次写入不提交，字节留在调用方缓冲中。
#[test]
fn write_filters_transform_and_short_circuit() {
    struct Gate {
        open: Cell<bool>,
    }
    impl WriteFilter for Gate {
        fn on_write(&self, _data: &mut Buffer, _conn: &Connection) -> FilterStatus {
            if self.open.get() {
                FilterStatus::Continue
            } else {
                FilterStatus::StopIteration
            }
        }
    }

    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    let gate = Rc::new(Gate { open: Cell::new(false) });
    pair.client.add_write_filter(Rc::new(TaggingWriteFilter { tag: b"-a" }));
    pair.client.add_write_filter(gate.clone());
    pair.client.add_write_filter(Rc::new(TaggingWriteFilter { tag: b"-b" }));

    let mut data = Buffer::from("x");
    pair.client.write(&mut data);
    assert_eq!(data.to_vec(), b"x-a", "被拦截的写入保留在调用方缓冲中");
    assert_eq!(pair.client.pending_write_bytes(), 0);

    gate.open.set(true);
    pair.client.write(&mut data);
    assert!(data.is_empty());
    harness.run();
    assert_eq!(pair.sink.received(), b"x-a-a-b");
}

/// 空写入不经过写过滤器，也不改变任何状态。
#[test]
fn empty_write_is_a_no_op() {
    struct Counting(Cell<usize>);
    impl WriteFilter for Counting {
        fn on_write(&self, _data: &mut Buffer, _conn: &Connection) -> FilterStatus {
            self.0.set(self.0.get() + 1);
            FilterStatus::Continue
        }
    }
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    let counting = Rc::new(Counting(Cell::new(0)));
    pair.client.add_write_filter(counting.clone());
    pair.client.write(&mut Buffer::new());
    assert_eq!(counting.0.get(), 0);
}

/// 同时实现读写的过滤器通过 `add_filter` 在两条序列中各注册一次。
#[test]
fn add_filter_registers_both_directions() {
    #[derive(Default)]
    struct Both {
        reads: Cell<usize>,
        writes: Cell<usize>,
    }
    impl ReadFilter for Both {
        fn on_data(&self, data: &mut Buffer, _conn: &Connection) -> FilterStatus {
            self.reads.set(self.reads.get() + data.clear());
            FilterStatus::Continue
        }
    }
    impl WriteFilter for Both {
        fn on_write(&self, data: &mut Buffer, _conn: &Connection) -> FilterStatus {
            self.writes.set(self.writes.get() + data.len());
            FilterStatus::Continue
        }
    }

    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    let both = Rc::new(Both::default());
    pair.client.add_filter(both.clone());
    pair.client.write(&mut Buffer::from("out"));
    pair.server.write(&mut Buffer::from("back!"));
    harness.run();
    assert_eq!(both.writes.get(), 3);
    assert_eq!(both.reads.get(), 5);
}

/// 读暂停计数可以嵌套：只有 0/1 边界改变调度器登记，计数归零后重新登记读兴趣并继续读取。
#[test]
fn read_disable_nests() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    assert_eq!(registered(&harness, pair.server_handle), Some(Interest::READABLE));

    pair.server.read_disable(true);
    pair.server.read_disable(true);
    assert!(!pair.server.read_enabled());
    assert_eq!(registered(&harness, pair.server_handle), Some(Interest::NONE));

    pair.client.write(&mut Buffer::from("held"));
    harness.run();
    assert!(pair.sink.received().is_empty(), "读暂停期间不应读取");

    pair.server.read_disable(false);
    assert!(!pair.server.read_enabled());
    harness.run();
    assert!(pair.sink.received().is_empty());

    pair.server.read_disable(false);
    assert!(pair.server.read_enabled());
    assert_eq!(registered(&harness, pair.server_handle), Some(Interest::READABLE));
    harness.run();
    assert_eq!(pair.sink.received(), b"held");
}

/// `Connecting` 期间暂停读取：连接建立后不登记读兴趣，恢复后才开始读取。
#[test]
fn read_disable_while_connecting_defers_reads() {
    let harness = Harness::new();
    let (client, handle) = harness.client(&ConnectionConfig::default());
    let sink = Rc::new(Sink::default());
    client.add_read_filter(sink.clone());
    client.read_disable(true);
    client.connect();
    harness.run();
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(registered(&harness, handle), Some(Interest::NONE));

    let (server, _) = harness.accept(&ConnectionConfig::default());
    server.write(&mut Buffer::from("later"));
    harness.run();
    assert!(sink.received().is_empty());

    client.read_disable(false);
    harness.run();
    assert_eq!(sink.received(), b"later");
}

proptest! {
    /// 任意平衡的暂停/恢复序列中，读兴趣登记恰好在计数为 0 时存在。
    #[test]
    fn read_disable_tracks_counter(ops in proptest::collection::vec(any::<bool>(), 1..48)) {
        let harness = Harness::new();
        let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
        let mut depth = 0u32;
        for disable in ops.into_iter().chain(std::iter::repeat(false)) {
            if !disable && depth == 0 {
                break;
            }
            pair.server.read_disable(disable);
            if disable { depth += 1 } else { depth -= 1 }
            let interest = registered(&harness, pair.server_handle).expect("句柄仍挂载");
            prop_assert_eq!(interest.is_readable(), depth == 0);
            prop_assert_eq!(pair.server.read_enabled(), depth == 0);
        }
        prop_assert!(pair.server.read_enabled());
    }
}

/// 关闭后写入是契约违例。
#[test]
#[should_panic(expected = "write() called on closed connection")]
fn write_after_close_panics() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    pair.client.close(CloseType::NoFlush);
    pair.client.write(&mut Buffer::from("late"));
}

/// 未配对的 `read_disable(false)` 是契约违例。
#[test]
#[should_panic(expected = "unbalanced read_disable(false)")]
fn unbalanced_read_enable_panics() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    pair.server.read_disable(false);
}

/// 关闭后调整读暂停计数是契约违例。
#[test]
#[should_panic(expected = "read_disable() called on closed connection")]
fn read_disable_after_close_panics() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    pair.server.close(CloseType::NoFlush);
    pair.server.read_disable(true);
}

/// 关闭后注册过滤器是契约违例。
#[test]
#[should_panic(expected = "add_read_filter() called on closed connection")]
fn add_filter_after_close_panics() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    pair.server.close(CloseType::NoFlush);
    pair.server.add_read_filter(Rc::new(Sink::default()));
}

/// 没有协商能力的套接字返回空协议名；握手协商出的协议原样透出。
#[test]
fn next_protocol_reflects_socket() {
    let harness = Harness::new();
    let pair = harness.connected_pair(&ConnectionConfig::default(), &ConnectionConfig::default());
    assert_eq!(pair.server.next_protocol(), "");

    let socket = harness.network.socket().with_next_protocol("h2");
    let conn = spark_stream::ClientConnection::new(
        harness.dispatcher.clone(),
        Box::new(socket),
        harness.address,
        &ConnectionConfig::default(),
    );
    assert_eq!(conn.next_protocol(), "h2");
}

/// 观察者可以在回调中追加新的观察者，新观察者从下一次事件开始生效。
#[test]
fn callbacks_added_during_dispatch_see_later_events() {
    struct Recruiter {
        recruit: RefCell<Option<Rc<EventLog>>>,
    }
    impl ConnectionCallbacks for Recruiter {
        fn on_event(&self, _event: &ConnectionEvent, conn: &Connection) {
            if let Some(log) = self.recruit.borrow_mut().take() {
                conn.add_connection_callbacks(log);
            }
        }
    }

    let harness = Harness::new();
    let (client, _) = harness.client(&ConnectionConfig::default());
    let late = Rc::new(EventLog::default());
    client.add_connection_callbacks(Rc::new(Recruiter {
        recruit: RefCell::new(Some(late.clone())),
    }));
    client.connect();
    harness.run();
    client.close(CloseType::NoFlush);
    assert_eq!(
        late.entries(),
        vec![
            Observed::Event(ConnectionEvent::Connected),
            Observed::Event(ConnectionEvent::LocalClose)
        ],
        "同一次广播中追加的观察者在遍历末尾被看到"
    );
}
