//! 连接消费的就绪调度器契约。
//!
//! # 模块定位（Why）
//! - 连接从不阻塞线程：任何无法立即完成的操作都“登记兴趣、返回、等待通知”；
//! - 本模块只描述连接需要的最小能力：按套接字句柄登记/撤销读写兴趣、投递就绪回调、
//!   驱动与退出事件循环。定时器与跨连接的任务调度不在连接的职责之内。
//!
//! # 契约（What）
//! - 对已登记的方向重复 `register`、对未登记的方向 `deregister`，都属于调用方的编程错误，
//!   实现必须以 panic 报告；
//! - `detach` 之后，该句柄不会再收到任何回调，包括同一轮循环中已经计算出的就绪事件。

use std::{fmt, ops::BitOr, rc::Weak};

use crate::socket::SocketHandle;

/// 读写就绪兴趣集合。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    pub const fn is_readable(self) -> bool {
        self.readable
    }

    pub const fn is_writable(self) -> bool {
        self.writable
    }

    pub const fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    /// `self` 是否覆盖 `other` 的全部方向。
    pub const fn contains(self, other: Interest) -> bool {
        (self.readable || !other.readable) && (self.writable || !other.writable)
    }

    pub const fn intersection(self, other: Interest) -> Interest {
        Interest {
            readable: self.readable && other.readable,
            writable: self.writable && other.writable,
        }
    }

    pub const fn difference(self, other: Interest) -> Interest {
        Interest {
            readable: self.readable && !other.readable,
            writable: self.writable && !other.writable,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest {
            readable: self.readable || rhs.readable,
            writable: self.writable || rhs.writable,
        }
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.readable, self.writable) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("READABLE"),
            (false, true) => f.write_str("WRITABLE"),
            (true, true) => f.write_str("READABLE | WRITABLE"),
        }
    }
}

/// 事件循环的运行方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// 持续处理事件，直到 [`Dispatcher::exit`] 被调用。
    Block,
    /// 处理当前已就绪的事件后立即返回，不等待新的就绪。
    NonBlock,
}

/// 接收就绪通知的一方（连接、监听器）。
pub trait ReadinessHandler {
    /// `ready` 只包含当前已登记且确实就绪的方向。
    fn on_ready(&self, ready: Interest);
}

/// 单线程就绪调度器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 解耦连接状态机与具体的多路复用实现（epoll、kqueue、仿真网络）；
///
/// ## 逻辑 (How)
/// - `attach` 以弱引用挂载处理者，调度器不延长连接寿命；
/// - `register`/`deregister` 以方向为粒度增删兴趣；
/// - `run` 按观察到的顺序投递就绪，同一句柄的读、写方向各自保序。
///
/// ## 契约 (What)
/// - 同一句柄只能 `attach` 一次，`detach` 幂等；
/// - 重复登记或撤销未登记的方向必须 panic；
/// - 所有方法都只能在驱动该调度器的线程上调用。
pub trait Dispatcher {
    fn attach(&self, handle: SocketHandle, handler: Weak<dyn ReadinessHandler>);
    fn register(&self, handle: SocketHandle, interest: Interest);
    fn deregister(&self, handle: SocketHandle, interest: Interest);
    fn detach(&self, handle: SocketHandle);
    fn run(&self, mode: RunMode);
    fn exit(&self);
}
