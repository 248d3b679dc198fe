use bytes::{Buf, Bytes};
use std::{collections::VecDeque, fmt, io::IoSlice};

/// 由 `Bytes` 切片链组成的追加/排空字节容器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 连接在读缓冲、写缓冲、过滤器与套接字之间频繁转移字节；
///   若每次转移都复制，代理的吞吐会被 memcpy 吃掉；
/// - 以引用计数切片链表达缓冲，`move_from` 只移动切片句柄，不触碰字节本身。
///
/// ## 逻辑 (How)
/// - `slices` 按到达顺序保存非空切片，`len` 缓存总长度；
/// - `move_prefix_from` 在切片边界之内使用 `Bytes::split_to` 拆分，只增加引用计数；
/// - 实现 [`Buf`]，套接字可以直接通过 `chunks_vectored` 做分散写入，再以 `advance` 排空。
///
/// ## 契约 (What)
/// - 所有操作都维持 `len == Σ slice.len()`，且链中不存在空切片；
/// - `move_from` 之后源缓冲为空；
/// - `drain(n)` 在 `n > len` 时排空全部内容而非 panic。
///
/// ## 注意事项 (Trade-offs)
/// - 大量极小切片会放大 `VecDeque` 的元数据开销；读路径按块读入可缓解该问题；
/// - `to_vec` 需要线性化复制，仅建议在测试或诊断路径中使用。
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    slices: VecDeque<Bytes>,
    len: usize,
}

impl Buffer {
    /// 创建空缓冲。
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前缓冲的总字节数。
    pub fn len(&self) -> usize {
        self.len
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 复制一段字节追加到尾部。
    pub fn add(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.add_bytes(Bytes::copy_from_slice(data));
    }

    /// 以零拷贝方式追加一个 `Bytes` 切片。
    pub fn add_bytes(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.slices.push_back(bytes);
    }

    /// 将 `source` 的全部内容移动到尾部，源缓冲随之清空。
    pub fn move_from(&mut self, source: &mut Buffer) {
        self.len += source.len;
        source.len = 0;
        self.slices.append(&mut source.slices);
    }

    /// 从 `source` 头部移动至多 `max` 字节，返回实际移动的字节数。
    pub fn move_prefix_from(&mut self, source: &mut Buffer, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            let want = max - moved;
            let front_len = match source.slices.front() {
                Some(front) => front.len(),
                None => break,
            };
            let piece = if front_len <= want {
                source.slices.pop_front()
            } else {
                source.slices.front_mut().map(|front| front.split_to(want))
            };
            let Some(piece) = piece else { break };
            moved += piece.len();
            source.len -= piece.len();
            self.add_bytes(piece);
        }
        moved
    }

    /// 从头部丢弃至多 `count` 字节。
    pub fn drain(&mut self, count: usize) {
        let mut remaining = count.min(self.len);
        self.len -= remaining;
        while remaining > 0 {
            let Some(front) = self.slices.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.slices.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
    }

    /// 清空缓冲，返回被丢弃的字节数。
    pub fn clear(&mut self) -> usize {
        let discarded = self.len;
        self.slices.clear();
        self.len = 0;
        discarded
    }

    /// 将内容线性化复制为 `Vec<u8>`。
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for slice in &self.slices {
            out.extend_from_slice(slice);
        }
        out
    }

    /// 当前切片数量，主要用于诊断零拷贝路径。
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }
}

impl Buf for Buffer {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        self.slices.front().map(|slice| slice.as_ref()).unwrap_or(&[])
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.len,
            "cannot advance past the end of buffer: {cnt} > {}",
            self.len
        );
        self.drain(cnt);
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut filled = 0;
        for (slot, slice) in dst.iter_mut().zip(self.slices.iter()) {
            *slot = IoSlice::new(slice);
            filled += 1;
        }
        filled
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        let mut buffer = Buffer::new();
        buffer.add(data);
        buffer
    }
}

impl From<&str> for Buffer {
    fn from(data: &str) -> Self {
        Buffer::from(data.as_bytes())
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer::from(Bytes::from(data))
    }
}

impl From<Bytes> for Buffer {
    fn from(bytes: Bytes) -> Self {
        let mut buffer = Buffer::new();
        buffer.add_bytes(bytes);
        buffer
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("slices", &self.slices.len())
            .finish()
    }
}
