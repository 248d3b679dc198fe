/// 写缓冲水位所处的区间。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatermarkState {
    Below,
    Above,
}

/// 一次评估产生的水位迁移。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatermarkTransition {
    /// 积压严格超过高水位，提示上游暂停生产。
    AboveHigh,
    /// 积压回落到低水位及以下，提示上游可以恢复。
    BelowLow,
}

/// 管理连接写缓冲的高/低水位滞回。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 写缓冲持续膨胀意味着对端消费跟不上本端生产；在越过高水位时通知观察者，
///   由其决定是否暂停自己的上游读取；
/// - 低水位取高水位的一半，形成滞回带，避免积压在阈值附近抖动时反复通知。
///
/// ## 逻辑 (How)
/// - `set_limit(limit)`：`high = limit`，`low = limit / 2`；
/// - `evaluate(size)`：处于 `Below` 且 `size > high` 时迁移到 `Above`；
///   处于 `Above` 且 `size <= low` 时迁移到 `Below`；其余情况保持不变。
///
/// ## 契约 (What)
/// - `limit == 0` 表示不设限：`evaluate` 永远返回 `None`，状态冻结；
/// - 同一方向的迁移不会连续出现两次，中间必然夹着一次反向迁移；
/// - **前置条件**：调用方在每次写缓冲大小变化或阈值调整后调用一次 `evaluate`。
///
/// ## 注意事项 (Trade-offs)
/// - 高水位采用严格大于判定：恰好等于上限的积压不会触发暂停；
/// - 上限为 1 时低水位为 0，只有完全排空才会触发恢复通知。
#[derive(Clone, Debug)]
pub struct WriteBufferWatermarks {
    limit: u32,
    high: u64,
    low: u64,
    state: WatermarkState,
}

impl WriteBufferWatermarks {
    pub fn new(limit: u32) -> Self {
        let mut watermarks = Self {
            limit: 0,
            high: 0,
            low: 0,
            state: WatermarkState::Below,
        };
        watermarks.set_limit(limit);
        watermarks
    }

    /// 调整上限并重新推导高低水位；不会自行评估，调用方需紧接着调用 [`Self::evaluate`]。
    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
        self.high = u64::from(limit);
        self.low = u64::from(limit / 2);
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn state(&self) -> WatermarkState {
        self.state
    }

    pub fn is_above(&self) -> bool {
        self.state == WatermarkState::Above
    }

    /// 不经通知直接回到 `Below`；用于连接关闭时丢弃积压。
    pub fn reset(&mut self) {
        self.state = WatermarkState::Below;
    }

    /// 依据当前积压评估是否发生迁移。
    pub fn evaluate(&mut self, buffered: u64) -> Option<WatermarkTransition> {
        if self.limit == 0 {
            return None;
        }
        match self.state {
            WatermarkState::Below if buffered > self.high => {
                self.state = WatermarkState::Above;
                Some(WatermarkTransition::AboveHigh)
            }
            WatermarkState::Above if buffered <= self.low => {
                self.state = WatermarkState::Below;
                Some(WatermarkTransition::BelowLow)
            }
            _ => None,
        }
    }
}

impl Default for WriteBufferWatermarks {
    fn default() -> Self {
        Self::new(0)
    }
}
