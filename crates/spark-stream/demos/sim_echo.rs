//! 仿真网络上的回显演示：一个监听器、一条客户端连接，打印往返的字节与生命周期事件。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=spark_stream=debug cargo run -p spark-stream --example sim_echo
//! ```
//!
//! # 设计要点（Why）
//! - 服务端只挂一个回显读过滤器，客户端挂一个收集过滤器，演示读写过滤器与
//!   调度器回调如何在单线程内交织；
//! - 连接配置从 TOML 文本加载，与生产部署使用同一套校验。

use std::{cell::RefCell, net::SocketAddr, rc::Rc};

use spark_stream::{
    Buffer, ClientConnection, CloseType, Connection, ConnectionCallbacks, ConnectionConfig,
    ConnectionEvent, Dispatcher, FilterStatus, ReadFilter, RunMode,
    sim::{SimDispatcher, SimListener, SimNetwork},
};
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
buffer_limit_bytes = 4096
no_delay = true
"#;

struct Echo;

impl ReadFilter for Echo {
    fn on_data(&self, data: &mut Buffer, conn: &Connection) -> FilterStatus {
        conn.write(data);
        FilterStatus::Continue
    }
}

#[derive(Default)]
struct Collect(RefCell<Vec<u8>>);

impl ReadFilter for Collect {
    fn on_data(&self, data: &mut Buffer, conn: &Connection) -> FilterStatus {
        self.0.borrow_mut().extend(data.to_vec());
        data.drain(data.len());
        if self.0.borrow().ends_with(b"\n") {
            conn.close(CloseType::FlushWrite);
        }
        FilterStatus::Continue
    }
}

struct PrintEvents(&'static str);

impl ConnectionCallbacks for PrintEvents {
    fn on_event(&self, event: &ConnectionEvent, conn: &Connection) {
        println!("[{}] {} {:?}", self.0, conn.id(), event);
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(error) = run() {
        eprintln!("sim_echo failed: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConnectionConfig::from_toml_str(CONFIG)?;
    let network = SimNetwork::default();
    let dispatcher = Rc::new(SimDispatcher::new(network.clone()));
    let address: SocketAddr = "10.0.0.1:7".parse()?;

    let servers: Rc<RefCell<Vec<Connection>>> = Rc::default();
    let accept_dispatcher = dispatcher.clone();
    let accepted = servers.clone();
    let server_config = config.clone();
    let _listener = SimListener::bind(&network, dispatcher.clone(), address, move |socket| {
        let conn = Connection::accepted(accept_dispatcher.clone(), Box::new(socket), &server_config);
        conn.add_connection_callbacks(Rc::new(PrintEvents("server")));
        conn.add_read_filter(Rc::new(Echo));
        accepted.borrow_mut().push(conn);
    })?;

    let client = ClientConnection::new(dispatcher.clone(), Box::new(network.socket()), address, &config);
    let collected = Rc::new(Collect::default());
    client.add_connection_callbacks(Rc::new(PrintEvents("client")));
    client.add_read_filter(collected.clone());
    client.write(&mut Buffer::from("hello over the simulated wire\n"));
    client.connect();

    dispatcher.run(RunMode::NonBlock);

    println!("echoed: {:?}", String::from_utf8_lossy(&collected.0.borrow()));
    println!("client state: {:?}", client.state());
    for server in servers.borrow().iter() {
        println!("server {} state: {:?}", server.id(), server.state());
    }
    Ok(())
}
