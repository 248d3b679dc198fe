use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Weak,
};

use tracing::{trace, warn};

use crate::{
    dispatcher::{Dispatcher, Interest, ReadinessHandler, RunMode},
    socket::SocketHandle,
};

use super::network::SimNetwork;

struct Registration {
    handler: Weak<dyn ReadinessHandler>,
    interest: Interest,
}

/// 基于 [`SimNetwork`] 的电平触发调度器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让连接在测试中经历与真实事件循环一致的“登记兴趣、等待、回调”节奏，
///   同时保证运行结束条件确定：没有任何已登记兴趣就绪时返回。
///
/// ## 逻辑 (How)
/// - 每一轮按句柄顺序计算 `readiness ∩ interest`，得到本轮候选；
/// - 投递前重新检查登记与就绪，回调中途被 `detach` 或撤销兴趣的句柄不会收到通知；
/// - 处理者已被释放的登记在投递时顺带清理。
///
/// ## 契约 (What)
/// - `register` 已登记的方向、`deregister` 未登记的方向、重复 `attach` 都会 panic；
/// - `Block` 与 `NonBlock` 都运行到空闲或 `exit()`；`Block` 在空闲返回时记录告警，
///   因为真实事件循环此时会一直等待。
pub struct SimDispatcher {
    network: SimNetwork,
    registrations: RefCell<BTreeMap<SocketHandle, Registration>>,
    exit_requested: Cell<bool>,
    deliveries: Cell<u64>,
}

impl SimDispatcher {
    pub fn new(network: SimNetwork) -> Self {
        Self {
            network,
            registrations: RefCell::new(BTreeMap::new()),
            exit_requested: Cell::new(false),
            deliveries: Cell::new(0),
        }
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// 句柄当前登记的兴趣；未挂载时返回 `None`。
    pub fn interest(&self, handle: SocketHandle) -> Option<Interest> {
        self.registrations
            .borrow()
            .get(&handle)
            .map(|registration| registration.interest)
    }

    /// 自创建以来投递的就绪回调次数。
    pub fn deliveries(&self) -> u64 {
        self.deliveries.get()
    }

    fn ready_handles(&self) -> Vec<SocketHandle> {
        self.registrations
            .borrow()
            .iter()
            .filter(|(handle, registration)| {
                !self
                    .network
                    .readiness(**handle)
                    .intersection(registration.interest)
                    .is_empty()
            })
            .map(|(handle, _)| *handle)
            .collect()
    }

    fn deliver(&self, handle: SocketHandle) {
        let (handler, ready) = {
            let registrations = self.registrations.borrow();
            let Some(registration) = registrations.get(&handle) else {
                return;
            };
            let ready = self.network.readiness(handle).intersection(registration.interest);
            (registration.handler.clone(), ready)
        };
        if ready.is_empty() {
            return;
        }
        match handler.upgrade() {
            Some(handler) => {
                trace!(%handle, ?ready, "sim dispatch");
                self.deliveries.set(self.deliveries.get() + 1);
                handler.on_ready(ready);
            }
            None => {
                self.registrations.borrow_mut().remove(&handle);
            }
        }
    }
}

impl Dispatcher for SimDispatcher {
    fn attach(&self, handle: SocketHandle, handler: Weak<dyn ReadinessHandler>) {
        let previous = self.registrations.borrow_mut().insert(
            handle,
            Registration {
                handler,
                interest: Interest::NONE,
            },
        );
        assert!(previous.is_none(), "handle {handle} attached twice");
    }

    fn register(&self, handle: SocketHandle, interest: Interest) {
        let mut registrations = self.registrations.borrow_mut();
        let registration = registrations
            .get_mut(&handle)
            .unwrap_or_else(|| panic!("register() on unattached handle {handle}"));
        assert!(
            registration.interest.intersection(interest).is_empty(),
            "handle {handle} already registered for {:?}",
            registration.interest.intersection(interest)
        );
        registration.interest = registration.interest | interest;
    }

    fn deregister(&self, handle: SocketHandle, interest: Interest) {
        let mut registrations = self.registrations.borrow_mut();
        let registration = registrations
            .get_mut(&handle)
            .unwrap_or_else(|| panic!("deregister() on unattached handle {handle}"));
        assert!(
            registration.interest.contains(interest),
            "handle {handle} not registered for {:?}",
            interest.difference(registration.interest)
        );
        registration.interest = registration.interest.difference(interest);
    }

    fn detach(&self, handle: SocketHandle) {
        self.registrations.borrow_mut().remove(&handle);
    }

    fn run(&self, mode: RunMode) {
        loop {
            if self.exit_requested.replace(false) {
                return;
            }
            let ready = self.ready_handles();
            if ready.is_empty() {
                if mode == RunMode::Block {
                    warn!("sim dispatcher idle in blocking run; returning");
                }
                return;
            }
            for handle in ready {
                if self.exit_requested.get() {
                    break;
                }
                self.deliver(handle);
            }
        }
    }

    fn exit(&self) {
        self.exit_requested.set(true);
    }
}
