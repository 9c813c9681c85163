//! The slot pool proper.
//!
//! All accounting and state transitions happen under one mutex; per-slot
//! I/O is lock-free once a holder owns the slot. Warm slots are handed
//! to waiters directly through their wakeup channel, so an idle slot and
//! a matching waiter can never coexist long enough for a fresh launch to
//! jump the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use funcd_core::metrics;
use funcd_core::{Error, Result, SlotKey};

use crate::driver::{ContainerDriver, ContainerHandle, ContainerRequest, ContainerResponse, ContainerSpec};
use crate::resource::ResourceTracker;

/// Node-level pool tuning.
#[derive(Debug, Clone)]
pub struct SlotPoolConfig {
    /// Total allocatable memory, MB.
    pub memory_mb: u64,
    /// Total allocatable CPU shares, milli-CPUs; 0 = unconstrained.
    pub cpus_milli: u64,
    /// Retire a slot after this many sequential invocations.
    pub max_slot_uses: u64,
    /// Grace window between the polite stop signal and the kill.
    pub terminate_grace: Duration,
}

impl Default for SlotPoolConfig {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpus_milli: 0,
            max_slot_uses: 1024,
            terminate_grace: Duration::from_secs(10),
        }
    }
}

/// What a parked waiter receives.
enum Wake {
    /// A warm slot, already transitioned to busy on the waiter's behalf.
    Slot(ReadySlot),
    /// Capacity may now fit a fresh launch; re-attempt the allocation.
    Capacity,
}

struct ReadySlot {
    container: Box<dyn ContainerHandle>,
    spec: Arc<ContainerSpec>,
    uses: u64,
}

struct IdleSlot {
    container: Box<dyn ContainerHandle>,
    spec: Arc<ContainerSpec>,
    uses: u64,
    idle_deadline: Instant,
}

struct Waiter {
    id: u64,
    memory_mb: u64,
    cpus_milli: u64,
    tx: oneshot::Sender<Wake>,
}

struct PoolInner {
    idle: HashMap<SlotKey, VecDeque<IdleSlot>>,
    waiters: HashMap<SlotKey, VecDeque<Waiter>>,
    /// Rotation order for capacity wakeups, one entry per key with waiters.
    key_rotation: VecDeque<SlotKey>,
    tracker: ResourceTracker,
    draining: bool,
    busy: usize,
    starting: usize,
    next_waiter_id: u64,
}

struct Shared {
    driver: Arc<dyn ContainerDriver>,
    config: SlotPoolConfig,
    inner: Mutex<PoolInner>,
    idle_changed: Notify,
    cancel: CancellationToken,
}

/// The per-node container slot pool.
#[derive(Clone)]
pub struct SlotPool {
    shared: Arc<Shared>,
}

impl SlotPool {
    pub fn new(driver: Arc<dyn ContainerDriver>, config: SlotPoolConfig) -> Self {
        let shared = Arc::new(Shared {
            driver,
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                waiters: HashMap::new(),
                key_rotation: VecDeque::new(),
                tracker: ResourceTracker::new(config.memory_mb, config.cpus_milli),
                draining: false,
                busy: 0,
                starting: 0,
                next_waiter_id: 0,
            }),
            config,
            idle_changed: Notify::new(),
            cancel: CancellationToken::new(),
        });
        Shared::spawn_evictor(shared.clone());
        SlotPool { shared }
    }

    /// Acquire an exclusive slot for `spec` before `deadline`.
    ///
    /// Order of preference: a warm slot of the same key, then a fresh
    /// launch if capacity permits, else park FIFO behind the key.
    pub async fn acquire(&self, spec: Arc<ContainerSpec>, deadline: Instant) -> Result<SlotHandle> {
        // A capacity wakeup re-enters the allocation race; when it loses,
        // the waiter goes back to the front of its queue.
        let mut requeue_front = false;
        loop {
            enum Decision {
                Ready(ReadySlot),
                Launch,
                Wait(SlotKey, u64, oneshot::Receiver<Wake>, Vec<IdleSlot>),
            }

            let decision = {
                let mut inner = self.shared.inner.lock().unwrap();
                if inner.draining {
                    return Err(Error::NodeDraining);
                }
                if let Some(queue) = inner.idle.get_mut(&spec.slot_key) {
                    if let Some(slot) = queue.pop_front() {
                        if queue.is_empty() {
                            inner.idle.remove(&spec.slot_key);
                        }
                        inner.busy += 1;
                        Decision::Ready(ReadySlot {
                            container: slot.container,
                            spec: slot.spec,
                            uses: slot.uses,
                        })
                    } else {
                        unreachable!("empty idle queues are removed eagerly")
                    }
                } else if inner.tracker.try_alloc(spec.memory_mb, spec.cpus_milli) {
                    inner.starting += 1;
                    Decision::Launch
                } else {
                    // Reclaim idle slots of other keys, oldest first, so
                    // the waiter is not stuck behind their idle timers.
                    // Their capacity returns once termination confirms,
                    // which fires the capacity wakeup below.
                    let victims = Shared::claim_idle_victims(&mut inner, &spec);
                    let (tx, rx) = oneshot::channel();
                    let id = inner.next_waiter_id;
                    inner.next_waiter_id += 1;
                    let waiter = Waiter {
                        id,
                        memory_mb: spec.memory_mb,
                        cpus_milli: spec.cpus_milli,
                        tx,
                    };
                    let queue = inner.waiters.entry(spec.slot_key.clone()).or_default();
                    if requeue_front {
                        queue.push_front(waiter);
                    } else {
                        queue.push_back(waiter);
                    }
                    if !inner.key_rotation.contains(&spec.slot_key) {
                        inner.key_rotation.push_back(spec.slot_key.clone());
                    }
                    Decision::Wait(spec.slot_key.clone(), id, rx, victims)
                }
            };

            match decision {
                Decision::Ready(slot) => return Ok(SlotHandle::new(self.shared.clone(), slot)),
                Decision::Launch => return self.launch(spec, deadline).await,
                Decision::Wait(key, id, rx, victims) => {
                    for victim in victims {
                        metrics::container_evictions()
                            .with_label_values(&[victim.spec.metric_label.as_str()])
                            .inc();
                        self.shared.retire(victim.container, victim.spec);
                    }
                    match self.wait(&key, id, rx, deadline).await? {
                        Wake::Slot(slot) => return Ok(SlotHandle::new(self.shared.clone(), slot)),
                        Wake::Capacity => {
                            requeue_front = true;
                            continue;
                        }
                    }
                }
            }
        }
    }

    async fn launch(&self, spec: Arc<ContainerSpec>, deadline: Instant) -> Result<SlotHandle> {
        let launched = tokio::time::timeout_at(deadline, self.shared.driver.launch(&spec)).await;
        let mut inner = self.shared.inner.lock().unwrap();
        inner.starting -= 1;
        match launched {
            Ok(Ok(container)) => {
                inner.busy += 1;
                drop(inner);
                metrics::container_launches()
                    .with_label_values(&[spec.metric_label.as_str()])
                    .inc();
                Ok(SlotHandle::new(
                    self.shared.clone(),
                    ReadySlot {
                        container,
                        spec,
                        uses: 0,
                    },
                ))
            }
            Ok(Err(e)) => {
                inner.tracker.release(spec.memory_mb, spec.cpus_milli);
                Shared::wake_capacity(&mut inner);
                drop(inner);
                tracing::warn!(slot_key = %spec.slot_key, error = %e, "container launch failed");
                Err(match e {
                    Error::ContainerError(_) => e,
                    other => Error::ContainerError(other.to_string()),
                })
            }
            Err(_) => {
                inner.tracker.release(spec.memory_mb, spec.cpus_milli);
                Shared::wake_capacity(&mut inner);
                Err(Error::SlotTimeout)
            }
        }
    }

    async fn wait(
        &self,
        key: &SlotKey,
        id: u64,
        mut rx: oneshot::Receiver<Wake>,
        deadline: Instant,
    ) -> Result<Wake> {
        tokio::select! {
            wake = &mut rx => wake.map_err(|_| Error::NodeDraining),
            _ = tokio::time::sleep_until(deadline) => {
                self.abandon(key, id, &mut rx, Error::SlotTimeout).await
            }
            _ = self.shared.cancel.cancelled() => {
                self.abandon(key, id, &mut rx, Error::NodeDraining).await
            }
        }
    }

    /// Leave the waiter queue on timeout or drain. When the deregistration
    /// loses the race against a wakeup, the in-flight wake is consumed:
    /// a handed-over slot is still used, a capacity grant is passed on.
    async fn abandon(
        &self,
        key: &SlotKey,
        id: u64,
        rx: &mut oneshot::Receiver<Wake>,
        reason: Error,
    ) -> Result<Wake> {
        let removed = {
            let mut inner = self.shared.inner.lock().unwrap();
            let mut removed = false;
            if let Some(queue) = inner.waiters.get_mut(key) {
                let before = queue.len();
                queue.retain(|w| w.id != id);
                removed = queue.len() != before;
                if queue.is_empty() {
                    inner.waiters.remove(key);
                    inner.key_rotation.retain(|k| k != key);
                }
            }
            removed
        };
        if removed {
            return Err(reason);
        }
        // A wakeup was already sent under the pool lock; collect it.
        match rx.await {
            Ok(Wake::Slot(slot)) => Ok(Wake::Slot(slot)),
            Ok(Wake::Capacity) => {
                // The grant cannot be used any more; forward it.
                let mut inner = self.shared.inner.lock().unwrap();
                Shared::wake_capacity(&mut inner);
                Err(reason)
            }
            Err(_) => Err(reason),
        }
    }

    /// Drain: refuse new acquires, fail parked waiters, retire idle slots
    /// and wait (bounded by `timeout` if given) for busy slots to finish.
    pub async fn close(&self, timeout: Option<Duration>) {
        let idles = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.draining = true;
            // Dropping the senders fails every parked waiter with drain.
            inner.waiters.clear();
            inner.key_rotation.clear();
            std::mem::take(&mut inner.idle)
        };
        self.shared.cancel.cancel();
        for (_, queue) in idles {
            for slot in queue {
                self.shared.retire(slot.container, slot.spec);
            }
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let inner = self.shared.inner.lock().unwrap();
                if inner.busy == 0 && inner.starting == 0 && inner.tracker.memory_used_mb() == 0 {
                    return;
                }
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    tracing::warn!("pool drain timed out with slots still terminating");
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Allocated memory, for introspection and tests.
    pub fn memory_used_mb(&self) -> u64 {
        self.shared.inner.lock().unwrap().tracker.memory_used_mb()
    }

    /// Configured memory capacity.
    pub fn memory_total_mb(&self) -> u64 {
        self.shared.config.memory_mb
    }
}

impl Shared {
    /// Busy holder is done with the slot: hand it to the next FIFO waiter
    /// of the key, park it idle, or retire it at end-of-life.
    fn release_slot(
        self: &Arc<Self>,
        container: Box<dyn ContainerHandle>,
        spec: Arc<ContainerSpec>,
        uses: u64,
        poisoned: bool,
    ) {
        let healthy = !poisoned && container.healthy();
        let uses = uses + 1;
        let mut inner = self.inner.lock().unwrap();
        inner.busy -= 1;

        if !healthy || uses >= self.config.max_slot_uses || inner.draining {
            drop(inner);
            self.retire(container, spec);
            return;
        }

        // Hand over directly: the waiter becomes the busy holder without
        // the slot ever being observable as idle.
        let mut container = container;
        if let Some(queue) = inner.waiters.get_mut(&spec.slot_key) {
            while let Some(waiter) = queue.pop_front() {
                match waiter.tx.send(Wake::Slot(ReadySlot {
                    container,
                    spec: spec.clone(),
                    uses,
                })) {
                    Ok(()) => {
                        if queue.is_empty() {
                            inner.waiters.remove(&spec.slot_key);
                            let key = spec.slot_key.clone();
                            inner.key_rotation.retain(|k| k != &key);
                        }
                        inner.busy += 1;
                        return;
                    }
                    // That waiter timed out meanwhile; reclaim and try the next.
                    Err(Wake::Slot(slot)) => container = slot.container,
                    Err(Wake::Capacity) => unreachable!("slot handoffs only send Wake::Slot"),
                }
            }
            inner.waiters.remove(&spec.slot_key);
            let key = spec.slot_key.clone();
            inner.key_rotation.retain(|k| k != &key);
        }

        let idle_deadline = Instant::now() + spec.idle_timeout;
        inner
            .idle
            .entry(spec.slot_key.clone())
            .or_default()
            .push_back(IdleSlot {
                container,
                spec,
                uses,
                idle_deadline,
            });
        drop(inner);
        self.idle_changed.notify_one();
    }

    /// Terminate a container off the lock and return its capacity once
    /// the exit is confirmed.
    fn retire(self: &Arc<Self>, container: Box<dyn ContainerHandle>, spec: Arc<ContainerSpec>) {
        let shared = self.clone();
        let grace = self.config.terminate_grace;
        let spawn = tokio::runtime::Handle::try_current();
        match spawn {
            Ok(handle) => {
                handle.spawn(async move {
                    container.terminate(grace).await;
                    let mut inner = shared.inner.lock().unwrap();
                    inner.tracker.release(spec.memory_mb, spec.cpus_milli);
                    Shared::wake_capacity(&mut inner);
                });
            }
            Err(_) => {
                // No runtime left (process teardown); the container exits
                // with the supervisor.
                let mut inner = shared.inner.lock().unwrap();
                inner.tracker.release(spec.memory_mb, spec.cpus_milli);
            }
        }
    }

    /// Pop idle slots, oldest first across keys, until the requirement
    /// would fit once their capacity returns. The caller retires them
    /// outside the lock.
    fn claim_idle_victims(inner: &mut PoolInner, spec: &ContainerSpec) -> Vec<IdleSlot> {
        let mut victims: Vec<IdleSlot> = Vec::new();
        loop {
            let reclaimed_mem: u64 = victims.iter().map(|v| v.spec.memory_mb).sum();
            let reclaimed_cpu: u64 = victims.iter().map(|v| v.spec.cpus_milli).sum();
            if inner.tracker.fits_after_release(
                reclaimed_mem,
                reclaimed_cpu,
                spec.memory_mb,
                spec.cpus_milli,
            ) {
                break;
            }
            let oldest_key = inner
                .idle
                .iter()
                .filter_map(|(k, q)| q.front().map(|s| (s.idle_deadline, k)))
                .min_by_key(|(deadline, _)| *deadline)
                .map(|(_, k)| k.clone());
            let Some(key) = oldest_key else {
                break;
            };
            if let Some(queue) = inner.idle.get_mut(&key) {
                if let Some(slot) = queue.pop_front() {
                    victims.push(slot);
                }
                if queue.is_empty() {
                    inner.idle.remove(&key);
                }
            }
        }
        victims
    }

    /// Wake waiters that could start a fresh slot now. One full rotation
    /// over the keys, FIFO within each key, head-of-line respected.
    fn wake_capacity(inner: &mut PoolInner) {
        let PoolInner {
            waiters,
            key_rotation,
            tracker,
            ..
        } = inner;
        for _ in 0..key_rotation.len() {
            let Some(key) = key_rotation.pop_front() else {
                break;
            };
            let mut keep = false;
            if let Some(queue) = waiters.get_mut(&key) {
                while let Some(front) = queue.front() {
                    if !tracker.fits(front.memory_mb, front.cpus_milli) {
                        break;
                    }
                    let waiter = queue.pop_front().expect("front exists");
                    if waiter.tx.send(Wake::Capacity).is_ok() {
                        break;
                    }
                    // Receiver abandoned; try the next in line.
                }
                keep = !queue.is_empty();
                if queue.is_empty() {
                    waiters.remove(&key);
                }
            }
            if keep {
                key_rotation.push_back(key);
            }
        }
    }

    /// Background evictor: sleeps until the nearest idle deadline and
    /// retires everything expired.
    fn spawn_evictor(shared: Arc<Shared>) {
        tokio::spawn(async move {
            loop {
                let nearest = {
                    let inner = shared.inner.lock().unwrap();
                    inner
                        .idle
                        .values()
                        .filter_map(|q| q.front().map(|s| s.idle_deadline))
                        .min()
                };

                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = shared.idle_changed.notified() => continue,
                    _ = async {
                        match nearest {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending().await,
                        }
                    } => {}
                }

                let now = Instant::now();
                let mut expired = Vec::new();
                {
                    let mut inner = shared.inner.lock().unwrap();
                    inner.idle.retain(|_, queue| {
                        while let Some(front) = queue.front() {
                            if front.idle_deadline <= now {
                                expired.push(queue.pop_front().expect("front exists"));
                            } else {
                                break;
                            }
                        }
                        !queue.is_empty()
                    });
                }
                for slot in expired {
                    metrics::container_evictions()
                        .with_label_values(&[slot.spec.metric_label.as_str()])
                        .inc();
                    tracing::debug!(slot_key = %slot.spec.slot_key, "evicting idle slot");
                    shared.retire(slot.container, slot.spec);
                }
            }
        });
    }
}

/// Exclusive hold on one busy slot. Dropping the handle releases it; the
/// release decision (reuse vs retire) keys off container health and the
/// hot-reuse budget.
pub struct SlotHandle {
    shared: Arc<Shared>,
    container: Option<Box<dyn ContainerHandle>>,
    spec: Arc<ContainerSpec>,
    uses: u64,
    poisoned: bool,
}

impl std::fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHandle")
            .field("uses", &self.uses)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl SlotHandle {
    fn new(shared: Arc<Shared>, slot: ReadySlot) -> Self {
        Self {
            shared,
            container: Some(slot.container),
            spec: slot.spec,
            uses: slot.uses,
            poisoned: false,
        }
    }

    pub async fn invoke(&mut self, req: ContainerRequest) -> Result<ContainerResponse> {
        self.container
            .as_mut()
            .expect("slot already released")
            .invoke(req)
            .await
    }

    pub fn take_logs(&mut self) -> Bytes {
        self.container
            .as_mut()
            .expect("slot already released")
            .take_logs()
    }

    /// Whether this hold reused a warm container.
    pub fn warm(&self) -> bool {
        self.uses > 0
    }

    /// Force retirement on release. Used when an invocation is abandoned
    /// mid-exchange and the container's streams can no longer be trusted.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        if let Some(container) = self.container.take() {
            self.shared
                .release_slot(container, self.spec.clone(), self.uses, self.poisoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use funcd_core::models::Format;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(key: &str, memory: u64) -> Arc<ContainerSpec> {
        Arc::new(ContainerSpec {
            slot_key: SlotKey::from_raw(key),
            image: "img".into(),
            memory_mb: memory,
            cpus_milli: 0,
            format: Format::Default,
            env: Vec::new(),
            idle_timeout: Duration::from_secs(30),
            metric_label: format!("/{key}"),
        })
    }

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    fn request(deadline: Instant) -> ContainerRequest {
        ContainerRequest {
            call_id: "c".into(),
            method: "POST".into(),
            url: "/".into(),
            headers: Vec::new(),
            body: Bytes::from_static(b"ping"),
            deadline,
        }
    }

    #[tokio::test]
    async fn warm_slot_is_reused_without_a_second_launch() {
        let driver = Arc::new(MockDriver::new());
        let pool = SlotPool::new(driver.clone(), SlotPoolConfig::default());

        let s = spec("k", 128);
        let mut h = pool.acquire(s.clone(), deadline_in(1000)).await.unwrap();
        assert!(!h.warm());
        h.invoke(request(deadline_in(1000))).await.unwrap();
        h.release();

        let h2 = pool.acquire(s, deadline_in(1000)).await.unwrap();
        assert!(h2.warm());
        assert_eq!(driver.launches(), 1);
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded() {
        let driver = Arc::new(MockDriver::new().with_invoke_delay(Duration::from_millis(30)));
        let pool = SlotPool::new(
            driver.clone(),
            SlotPoolConfig {
                memory_mb: 256,
                ..Default::default()
            },
        );

        let max_seen = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = pool.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            // Distinct keys so every acquire needs its own container.
            let s = spec(&format!("k{i}"), 100);
            handles.push(tokio::spawn(async move {
                let mut h = pool.acquire(s, deadline_in(5000)).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                h.invoke(request(deadline_in(5000))).await.unwrap();
                active.fetch_sub(1, Ordering::SeqCst);
                // Handles drop here; the parked idle slots are reclaimed
                // on demand by the waiting keys.
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // 256 MB / 100 MB per slot = at most 2 concurrent busy slots.
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        pool.close(Some(Duration::from_secs(1))).await;
        assert_eq!(pool.memory_used_mb(), 0);
    }

    #[tokio::test]
    async fn waiter_gets_the_released_slot_before_any_new_launch() {
        let driver = Arc::new(MockDriver::new());
        let pool = SlotPool::new(
            driver.clone(),
            SlotPoolConfig {
                memory_mb: 128,
                ..Default::default()
            },
        );

        let s = spec("k", 128);
        let h = pool.acquire(s.clone(), deadline_in(1000)).await.unwrap();

        let pool2 = pool.clone();
        let s2 = s.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(s2, deadline_in(2000)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.release();

        let got = waiter.await.unwrap().unwrap();
        assert!(got.warm());
        assert_eq!(driver.launches(), 1);
    }

    #[tokio::test]
    async fn waiters_for_a_key_are_served_fifo() {
        let driver = Arc::new(MockDriver::new());
        let pool = SlotPool::new(
            driver.clone(),
            SlotPoolConfig {
                memory_mb: 128,
                ..Default::default()
            },
        );

        let s = spec("k", 128);
        let first = pool.acquire(s.clone(), deadline_in(1000)).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let s = s.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let h = pool.acquire(s, deadline_in(5000)).await.unwrap();
                order.lock().unwrap().push(i);
                h.release();
            }));
            // Serialize registration so queue order is deterministic.
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        first.release();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn acquire_times_out_at_capacity() {
        let driver = Arc::new(MockDriver::new());
        let pool = SlotPool::new(
            driver,
            SlotPoolConfig {
                memory_mb: 128,
                ..Default::default()
            },
        );

        let holder = pool.acquire(spec("a", 128), deadline_in(1000)).await.unwrap();
        let err = pool
            .acquire(spec("b", 128), deadline_in(50))
            .await
            .expect_err("no capacity");
        assert_eq!(err, Error::SlotTimeout);
        drop(holder);
    }

    #[tokio::test]
    async fn idle_slot_of_another_key_is_reclaimed_on_demand() {
        let driver = Arc::new(MockDriver::new());
        let pool = SlotPool::new(
            driver.clone(),
            SlotPoolConfig {
                memory_mb: 128,
                ..Default::default()
            },
        );

        // The idle slot for `a` holds all capacity with a long idle
        // timer; acquiring `b` must not wait for that timer.
        pool.acquire(spec("a", 128), deadline_in(1000))
            .await
            .unwrap()
            .release();
        let got = pool.acquire(spec("b", 128), deadline_in(2000)).await;
        assert!(got.is_ok());
        assert_eq!(driver.launches(), 2);
    }

    #[tokio::test]
    async fn expired_idle_slots_are_evicted_by_the_timer() {
        let driver = Arc::new(MockDriver::new());
        let pool = SlotPool::new(
            driver.clone(),
            SlotPoolConfig {
                memory_mb: 256,
                ..Default::default()
            },
        );

        let mut s = spec("a", 128).as_ref().clone();
        s.idle_timeout = Duration::from_millis(50);
        let s = Arc::new(s);

        pool.acquire(s, deadline_in(1000)).await.unwrap().release();
        assert_eq!(pool.memory_used_mb(), 128);

        // No demand; the background evictor alone returns the capacity.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.memory_used_mb(), 0);
    }

    #[tokio::test]
    async fn drain_fails_waiters_and_completes_in_flight_work() {
        let driver = Arc::new(MockDriver::new().with_invoke_delay(Duration::from_millis(50)));
        let pool = SlotPool::new(
            driver,
            SlotPoolConfig {
                memory_mb: 128,
                ..Default::default()
            },
        );

        let mut holder = pool.acquire(spec("a", 128), deadline_in(1000)).await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(spec("b", 128), deadline_in(5000)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pool3 = pool.clone();
        let closer = tokio::spawn(async move { pool3.close(Some(Duration::from_secs(2))).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(waiter.await.unwrap().expect_err("draining"), Error::NodeDraining);

        // In-flight work still completes, then releases into the drain.
        holder.invoke(request(deadline_in(1000))).await.unwrap();
        holder.release();
        closer.await.unwrap();
        assert_eq!(pool.memory_used_mb(), 0);

        let err = pool
            .acquire(spec("c", 64), deadline_in(100))
            .await
            .expect_err("drained pool refuses work");
        assert_eq!(err, Error::NodeDraining);
    }

    #[tokio::test]
    async fn slot_retires_at_end_of_reuse_budget() {
        let driver = Arc::new(MockDriver::new());
        let pool = SlotPool::new(
            driver.clone(),
            SlotPoolConfig {
                memory_mb: 256,
                max_slot_uses: 2,
                ..Default::default()
            },
        );

        let s = spec("k", 128);
        for _ in 0..2 {
            let h = pool.acquire(s.clone(), deadline_in(1000)).await.unwrap();
            h.release();
        }
        // Budget exhausted: the third acquire needs a fresh container.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let h = pool.acquire(s.clone(), deadline_in(1000)).await.unwrap();
        assert!(!h.warm());
        assert_eq!(driver.launches(), 2);
    }

    #[tokio::test]
    async fn unhealthy_container_is_not_reused() {
        let driver = Arc::new(MockDriver::new());
        let pool = SlotPool::new(driver.clone(), SlotPoolConfig::default());

        let s = spec("k", 64);
        let mut h = pool.acquire(s.clone(), deadline_in(1000)).await.unwrap();
        // A deadline hit mid-invoke marks the container unhealthy.
        driver.set_invoke_delay(Duration::from_millis(200));
        let err = h.invoke(request(deadline_in(20))).await.expect_err("deadline");
        assert_eq!(err, Error::DeadlineExceeded);
        h.release();

        driver.set_invoke_delay(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let h2 = pool.acquire(s, deadline_in(1000)).await.unwrap();
        assert!(!h2.warm());
        assert_eq!(driver.launches(), 2);
    }
}
