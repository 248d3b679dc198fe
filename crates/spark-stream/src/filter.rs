use std::rc::Rc;

use crate::{buffer::Buffer, connection::Connection};

/// 过滤器对一次数据事件的处理结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterStatus {
    /// 继续交给链上的下一个过滤器。
    Continue,
    /// 终止本次事件的遍历；数据留在共享缓冲中，由当前过滤器或后续事件处理。
    StopIteration,
}

/// 读方向过滤器合约。
///
/// # 设计背景（Why）
/// - 读过滤器按注册顺序检查、消费或改写从对端收到的字节；
///
/// # 契约说明（What）
/// - `on_new_connection` 在连接进入 `Open` 时恰好调用一次；连接已处于 `Open` 时注册的过滤器
///   会在注册时立即收到这次调用，保证它先于任何 `on_data`；
/// - `on_data` 收到的是连接的读缓冲本身，过滤器排空多少由自己决定，未排空的字节会与下一批数据合并；
/// - 方法以 `&self` 调用，实现者通过 `Cell`/`RefCell` 维护自身状态。
///
/// # 风险提示（Trade-offs）
/// - 回调中可以调用 `conn.write`/`conn.close`；若同一对象同时注册为写过滤器，
///   其内部状态在 `on_write` 重入时必须已释放借用。
pub trait ReadFilter {
    fn on_new_connection(&self, conn: &Connection) {
        let _ = conn;
    }

    fn on_data(&self, data: &mut Buffer, conn: &Connection) -> FilterStatus;
}

/// 写方向过滤器合约：在字节进入写缓冲之前按注册顺序执行。
///
/// - 返回 `StopIteration` 时，本次写入不会提交到写缓冲，字节保留在调用方传入的缓冲中。
pub trait WriteFilter {
    fn on_write(&self, data: &mut Buffer, conn: &Connection) -> FilterStatus;
}

/// 连接内部的两条过滤器序列。
///
/// 只追加不删除；遍历按下标逐个取出句柄，避免在回调期间持有借用，
/// 回调中追加的过滤器会在同一次遍历的末尾被看到。
#[derive(Default)]
pub(crate) struct FilterManager {
    read_filters: Vec<Rc<dyn ReadFilter>>,
    write_filters: Vec<Rc<dyn WriteFilter>>,
    initialized: bool,
}

impl FilterManager {
    pub(crate) fn initialized(&self) -> bool {
        self.initialized
    }

    /// 标记读过滤器已进入初始化阶段，返回此刻需要补发 `on_new_connection` 的数量。
    pub(crate) fn mark_initialized(&mut self) -> usize {
        self.initialized = true;
        self.read_filters.len()
    }

    pub(crate) fn add_read_filter(&mut self, filter: Rc<dyn ReadFilter>) {
        self.read_filters.push(filter);
    }

    pub(crate) fn add_write_filter(&mut self, filter: Rc<dyn WriteFilter>) {
        self.write_filters.push(filter);
    }

    pub(crate) fn read_filter(&self, index: usize) -> Option<Rc<dyn ReadFilter>> {
        self.read_filters.get(index).cloned()
    }

    pub(crate) fn write_filter(&self, index: usize) -> Option<Rc<dyn WriteFilter>> {
        self.write_filters.get(index).cloned()
    }
}
