//! 缓冲字节记账：计数器/仪表契约与增量计算纯函数。
//!
//! # 模块定位（Why）
//! - 连接的读写缓冲在一次事件中可能经历多次追加与排空，观测侧只关心“累计搬运字节”
//!   与“当前积压字节”两个量；
//! - 将增量计算收敛为 [`update_buffer_stats`]，保证每次缓冲变化只产生一次计数器增量
//!   与至多一次仪表增量，避免各调用点各自拼算导致漂移。
//!
//! # 契约（What）
//! - [`Counter`] 只增不减；[`Gauge`] 通过 `add`/`sub` 表达有符号变化；
//! - 仪表累计值恒等于“最新 `new_size` − 初始 `previous_size`”（伸缩求和）。

use std::{cell::Cell, fmt, rc::Rc};

/// 单调递增计数器。
pub trait Counter {
    fn add(&self, amount: u64);
}

/// 可增可减的瞬时值仪表。
pub trait Gauge {
    fn add(&self, amount: u64);
    fn sub(&self, amount: u64);
}

/// 计算并下发一次缓冲变化的记账增量。
///
/// - `transferred > 0` 时向计数器累加本次搬运的字节；
/// - `new_size` 与 `*previous_size` 的差值非零时，正向调用 `gauge.add`，负向调用 `gauge.sub`；
/// - 无论是否产生增量，`*previous_size` 都被更新为 `new_size`。
pub fn update_buffer_stats(
    transferred: u64,
    new_size: u64,
    previous_size: &mut u64,
    counter: &dyn Counter,
    gauge: &dyn Gauge,
) {
    if transferred > 0 {
        counter.add(transferred);
    }
    if new_size > *previous_size {
        gauge.add(new_size - *previous_size);
    } else if new_size < *previous_size {
        gauge.sub(*previous_size - new_size);
    }
    *previous_size = new_size;
}

/// 外部拥有的四个记账槽位：接收累计/当前、发送累计/当前。
#[derive(Clone)]
pub struct BufferStats {
    pub rx_total: Rc<dyn Counter>,
    pub rx_current: Rc<dyn Gauge>,
    pub tx_total: Rc<dyn Counter>,
    pub tx_current: Rc<dyn Gauge>,
}

impl fmt::Debug for BufferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferStats").finish_non_exhaustive()
    }
}

/// 单个方向上的记账游标。
///
/// 即便尚未挂载 [`BufferStats`]，游标也会跟随缓冲大小前进，
/// 因此后挂载的槽位只会看到挂载之后发生的变化。
#[derive(Debug, Default)]
pub(crate) struct DirectionAccounting {
    last_size: u64,
}

impl DirectionAccounting {
    pub(crate) fn record(
        &mut self,
        transferred: u64,
        new_size: u64,
        sinks: Option<(&dyn Counter, &dyn Gauge)>,
    ) {
        match sinks {
            Some((counter, gauge)) => {
                update_buffer_stats(transferred, new_size, &mut self.last_size, counter, gauge)
            }
            None => self.last_size = new_size,
        }
    }
}

impl BufferStats {
    pub(crate) fn rx_sinks(&self) -> (&dyn Counter, &dyn Gauge) {
        (&*self.rx_total, &*self.rx_current)
    }

    pub(crate) fn tx_sinks(&self) -> (&dyn Counter, &dyn Gauge) {
        (&*self.tx_total, &*self.tx_current)
    }
}

/// 基于 `Cell` 的进程内计数器，适合单线程连接直接挂载。
#[derive(Debug, Default)]
pub struct LocalCounter {
    value: Cell<u64>,
}

impl LocalCounter {
    pub fn value(&self) -> u64 {
        self.value.get()
    }
}

impl Counter for LocalCounter {
    fn add(&self, amount: u64) {
        self.value.set(self.value.get().saturating_add(amount));
    }
}

/// 基于 `Cell` 的进程内仪表，允许短暂为负以暴露记账错误。
#[derive(Debug, Default)]
pub struct LocalGauge {
    value: Cell<i64>,
}

impl LocalGauge {
    pub fn value(&self) -> i64 {
        self.value.get()
    }
}

impl Gauge for LocalGauge {
    fn add(&self, amount: u64) {
        self.value.set(self.value.get().saturating_add_unsigned(amount));
    }

    fn sub(&self, amount: u64) {
        self.value.set(self.value.get().saturating_sub_unsigned(amount));
    }
}

/// 一组本地槽位，可同时作为 [`BufferStats`] 挂载并读取快照。
#[derive(Debug, Default, Clone)]
pub struct LocalBufferStats {
    pub rx_total: Rc<LocalCounter>,
    pub rx_current: Rc<LocalGauge>,
    pub tx_total: Rc<LocalCounter>,
    pub tx_current: Rc<LocalGauge>,
}

/// [`LocalBufferStats`] 的只读快照。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStatsSnapshot {
    pub rx_total: u64,
    pub rx_current: i64,
    pub tx_total: u64,
    pub tx_current: i64,
}

impl LocalBufferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 生成可交给连接的槽位句柄，与自身共享底层计数。
    pub fn bundle(&self) -> BufferStats {
        BufferStats {
            rx_total: self.rx_total.clone(),
            rx_current: self.rx_current.clone(),
            tx_total: self.tx_total.clone(),
            tx_current: self.tx_current.clone(),
        }
    }

    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            rx_total: self.rx_total.value(),
            rx_current: self.rx_current.value(),
            tx_total: self.tx_total.value(),
            tx_current: self.tx_current.value(),
        }
    }
}
