//! Consistent-hash placer: the slot key picks a primary runner on a
//! hash ring, so warm slots for a key concentrate on the same runner;
//! probes continue through ring successors. A runner that reports
//! capacity pressure is marked loaded and skipped for a decay window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use funcd_agent::Invocation;
use funcd_core::{Error, Result};
use funcd_pool::ContainerResponse;

use crate::placer::{attempt, check_deadline, Attempt, Placer};
use crate::pool::Runner;

/// Tuning knobs for the consistent-hash placer.
#[derive(Debug, Clone, Copy)]
pub struct ChPlacerConfig {
    /// How long a runner that reported capacity pressure is skipped.
    pub loaded_decay: Duration,
}

impl Default for ChPlacerConfig {
    fn default() -> Self {
        Self {
            loaded_decay: Duration::from_secs(1),
        }
    }
}

pub struct ChPlacer {
    config: ChPlacerConfig,
    /// Runner address -> skip-until instant. Updated by explicit events,
    /// never by back-reference from the pool.
    loaded: DashMap<String, Instant>,
}

impl ChPlacer {
    pub fn new(config: ChPlacerConfig) -> Self {
        Self {
            config,
            loaded: DashMap::new(),
        }
    }

    fn is_loaded(&self, address: &str) -> bool {
        match self.loaded.get(address) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                drop(self.loaded.remove(address));
                false
            }
            None => false,
        }
    }

    fn mark_loaded(&self, address: &str) {
        self.loaded
            .insert(address.to_string(), Instant::now() + self.config.loaded_decay);
    }
}

impl Default for ChPlacer {
    fn default() -> Self {
        Self::new(ChPlacerConfig::default())
    }
}

fn hash64(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Ring order for a snapshot: runner indices sorted by address hash,
/// rotated so the first entry is the slot key's primary. Deterministic
/// for an unchanged snapshot.
fn ring_order(runners: &[Arc<dyn Runner>], key_hash: u64) -> Vec<usize> {
    let mut ring: Vec<(u64, usize)> = runners
        .iter()
        .enumerate()
        .map(|(i, r)| (hash64(r.address()), i))
        .collect();
    ring.sort_unstable();
    let start = ring
        .iter()
        .position(|(h, _)| *h >= key_hash)
        .unwrap_or(0);
    (0..ring.len())
        .map(|i| ring[(start + i) % ring.len()].1)
        .collect()
}

#[async_trait]
impl Placer for ChPlacer {
    async fn place(
        &self,
        inv: &mut Invocation,
        runners: &[Arc<dyn Runner>],
    ) -> Result<ContainerResponse> {
        if runners.is_empty() {
            return Err(Error::ResourceUnavailable);
        }
        let key_hash = hash64(inv.call.slot_key().as_str());
        let order = ring_order(runners, key_hash);

        // One pass over the ring, skipping runners inside their decay
        // window; a second pass retries the skipped ones rather than
        // failing a placeable call.
        for ignore_load in [false, true] {
            for &i in &order {
                let runner = &runners[i];
                if !ignore_load && self.is_loaded(runner.address()) {
                    continue;
                }
                check_deadline(inv)?;
                match attempt(runner, inv).await {
                    Attempt::Placed(resp) => return Ok(resp),
                    Attempt::Rejected => {
                        self.mark_loaded(runner.address());
                    }
                    Attempt::Failed(e) => return Err(e),
                }
            }
        }
        Err(Error::ResourceUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use funcd_core::models::Call;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeRunner {
        addr: String,
        reject: AtomicBool,
        attempts: AtomicUsize,
        order_log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeRunner {
        fn new(addr: &str, order_log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                addr: addr.into(),
                reject: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
                order_log,
            })
        }
    }

    #[async_trait]
    impl Runner for FakeRunner {
        fn address(&self) -> &str {
            &self.addr
        }

        async fn try_exec(
            &self,
            _call: &Call,
            _body: Bytes,
        ) -> funcd_core::Result<Option<ContainerResponse>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.order_log.lock().unwrap().push(self.addr.clone());
            if self.reject.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(ContainerResponse {
                status: 200,
                headers: Vec::new(),
                body: Bytes::from_static(b"ok"),
            }))
        }
    }

    fn invocation(image: &str) -> Invocation {
        let mut call = Call::new("app1", "myapp");
        call.image = image.into();
        call.timeout = 30;
        Invocation::new(call, Bytes::new())
    }

    fn fleet(log: &Arc<Mutex<Vec<String>>>) -> (Vec<Arc<FakeRunner>>, Vec<Arc<dyn Runner>>) {
        let fakes: Vec<Arc<FakeRunner>> = ["r1:9190", "r2:9190", "r3:9190"]
            .iter()
            .map(|a| FakeRunner::new(a, log.clone()))
            .collect();
        let runners = fakes.iter().map(|r| r.clone() as _).collect();
        (fakes, runners)
    }

    #[tokio::test]
    async fn same_slot_key_always_probes_the_same_primary() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (_fakes, runners) = fleet(&log);
        let placer = ChPlacer::default();

        for _ in 0..5 {
            placer
                .place(&mut invocation("img:v1"), &runners)
                .await
                .unwrap();
        }
        let observed = log.lock().unwrap().clone();
        assert_eq!(observed.len(), 5);
        assert!(observed.iter().all(|a| a == &observed[0]));
    }

    #[tokio::test]
    async fn loaded_runner_is_skipped_until_decay() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (fakes, runners) = fleet(&log);
        let placer = ChPlacer::new(ChPlacerConfig {
            loaded_decay: Duration::from_millis(100),
        });

        // Find the primary for this key and make it reject once.
        placer
            .place(&mut invocation("img:v1"), &runners)
            .await
            .unwrap();
        let primary = log.lock().unwrap()[0].clone();
        let primary_fake = fakes.iter().find(|f| f.addr == primary).unwrap();
        primary_fake.reject.store(true, Ordering::SeqCst);

        // The rejection marks the primary loaded; the call lands on a
        // successor.
        placer
            .place(&mut invocation("img:v1"), &runners)
            .await
            .unwrap();
        primary_fake.reject.store(false, Ordering::SeqCst);

        // Within the decay window the primary is not probed at all.
        log.lock().unwrap().clear();
        placer
            .place(&mut invocation("img:v1"), &runners)
            .await
            .unwrap();
        assert!(log.lock().unwrap().iter().all(|a| a != &primary));

        // After decay it is the primary again.
        tokio::time::sleep(Duration::from_millis(120)).await;
        log.lock().unwrap().clear();
        placer
            .place(&mut invocation("img:v1"), &runners)
            .await
            .unwrap();
        assert_eq!(log.lock().unwrap()[0], primary);
    }

    #[tokio::test]
    async fn all_loaded_runners_are_retried_before_failing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (fakes, runners) = fleet(&log);
        let placer = ChPlacer::new(ChPlacerConfig {
            loaded_decay: Duration::from_secs(60),
        });
        for f in &fakes {
            f.reject.store(true, Ordering::SeqCst);
        }
        // Everyone rejects: first pass marks all loaded, second pass
        // retries them, then the placement fails as unavailable.
        let err = placer
            .place(&mut invocation("img:v1"), &runners)
            .await
            .expect_err("no capacity anywhere");
        assert_eq!(err, Error::ResourceUnavailable);

        // A placeable call still lands even though every runner is
        // inside its decay window.
        fakes[0].reject.store(false, Ordering::SeqCst);
        fakes[1].reject.store(false, Ordering::SeqCst);
        fakes[2].reject.store(false, Ordering::SeqCst);
        placer
            .place(&mut invocation("img:v1"), &runners)
            .await
            .expect("second pass ignores load marks");
    }
}
