//! # sim 模块说明
//!
//! ## 角色定位（Why）
//! - 连接引擎消费两个外部协作方：就绪调度器与套接字原语。为了让状态机的每条路径
//!   （部分写、写阻塞后恢复、连接被拒、对端 EOF、写错误）都能确定性地复现，
//!   这里提供一套单线程内存网络实现这两个契约；
//! - 测试无需真实端口与时序，`run` 在网络空闲时返回，不会挂起。
//!
//! ## 组成（What）
//! - [`SimNetwork`]：端点、管道与监听器的共享状态，支持故障注入；
//! - [`SimSocket`]：实现 [`Socket`](crate::socket::Socket) 的端点句柄；
//! - [`SimListener`]：在调度器中登记读兴趣，积压队列非空时调用接受回调；
//! - [`SimDispatcher`]：依据网络状态计算电平触发的就绪并投递。
//!
//! ## 时序模型（How）
//! - 管道容量有限：写入超出对端接收缓冲剩余容量的部分返回 `WouldBlock`；
//! - 关闭一端后，对端先读完已到达的数据再读到 EOF；
//! - 连接在 `connect` 调用时即确定结果，写就绪后由 `finish_connect` 取回。

mod dispatcher;
mod listener;
mod network;
mod socket;

pub use dispatcher::SimDispatcher;
pub use listener::SimListener;
pub use network::{SimNetwork, SimNetworkConfig};
pub use socket::SimSocket;
