//! The caching lock manager: the application replicated by the RSM.
//!
//! A lock is granted to exactly one client at a time, and the grant is sticky: the client caches
//! ownership and serves its local threads for free until the manager revokes it.  Contended
//! acquires return Retry immediately and the waiter is nudged with a retry callback once the lock
//! frees up, because a replicated handler must never block.
//!
//! acquire and release arrive through the RSM on every replica, so every replica's lock table
//! marches in lockstep.  The revoker and retryer run everywhere but act only on the primary;
//! callback subscriptions are per-replica soft state that clients re-establish when they retarget.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable};
use indicio::{clue, DEBUG, INFO, WARNING};
use rpc_pb::{ClientID, Context};
use sync42::background::BackgroundThread;
use tatl::{HeyListen, Stationary};

use hasp_pb::{
    AcquireRequest, AcquireResponse, AcquireStatus, CallbackClient, CallbackService, Error, Holder,
    LockEntry, LockService, LockState, LockTable, ReleaseRequest, ReleaseResponse, RetryRequest,
    RevokeRequest, SubscribeRequest, SubscribeResponse,
};
use lazyrpc::{Connector, DEFAULT_CALL_TIMEOUT};

use super::rsm::{Application, Rsm};
use super::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ACQUIRES: Counter = Counter::new("hasp.lockmgr.acquires");
static ACQUIRES_GRANTED: Counter = Counter::new("hasp.lockmgr.acquires.granted");
static ACQUIRES_RETRY: Counter = Counter::new("hasp.lockmgr.acquires.retry");
static RELEASES: Counter = Counter::new("hasp.lockmgr.releases");
static SUBSCRIBES: Counter = Counter::new("hasp.lockmgr.subscribes");
static REVOKES_SENT: Counter = Counter::new("hasp.lockmgr.revokes.sent");
static RETRIES_SENT: Counter = Counter::new("hasp.lockmgr.retries.sent");
static SNAPSHOTS: Counter = Counter::new("hasp.lockmgr.snapshots");
static RESTORES: Counter = Counter::new("hasp.lockmgr.restores");

static CALLBACK_FAILURES: Counter = Counter::new("hasp.lockmgr.callback_failures");
static CALLBACK_FAILURES_MONITOR: Stationary =
    Stationary::new("hasp.lockmgr.callback_failures", &CALLBACK_FAILURES);

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&ACQUIRES);
    collector.register_counter(&ACQUIRES_GRANTED);
    collector.register_counter(&ACQUIRES_RETRY);
    collector.register_counter(&RELEASES);
    collector.register_counter(&SUBSCRIBES);
    collector.register_counter(&REVOKES_SENT);
    collector.register_counter(&RETRIES_SENT);
    collector.register_counter(&SNAPSHOTS);
    collector.register_counter(&RESTORES);
    collector.register_counter(&CALLBACK_FAILURES);
}

pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&CALLBACK_FAILURES_MONITOR);
}

/////////////////////////////////////////////// state //////////////////////////////////////////////

#[derive(Clone, Debug, Default)]
struct LockRecord {
    state: LockState,
    owner: Option<Holder>,
    waiters: VecDeque<Holder>,
}

struct MgrState {
    locks: BTreeMap<u64, LockRecord>,
    subscriptions: HashMap<ClientID, Arc<CallbackClient>>,
    revoke_tx: Sender<u64>,
    retry_tx: Sender<u64>,
}

/////////////////////////////////////////// LockManager ////////////////////////////////////////////

/// One replica's lock manager.
pub struct LockManager {
    rsm: Arc<Rsm>,
    connector: Arc<dyn Connector>,
    state: Mutex<MgrState>,
    revoke_rx: Mutex<Option<Receiver<u64>>>,
    retry_rx: Mutex<Option<Receiver<u64>>>,
}

impl LockManager {
    /// Create a lock manager that defers primary checks to `rsm` and mints callback clients
    /// through `connector`.
    pub fn new(rsm: Arc<Rsm>, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (revoke_tx, revoke_rx) = std::sync::mpsc::channel();
        let (retry_tx, retry_rx) = std::sync::mpsc::channel();
        Arc::new(Self {
            rsm,
            connector,
            state: Mutex::new(MgrState {
                locks: BTreeMap::new(),
                subscriptions: HashMap::new(),
                revoke_tx,
                retry_tx,
            }),
            revoke_rx: Mutex::new(Some(revoke_rx)),
            retry_rx: Mutex::new(Some(retry_rx)),
        })
    }

    /// Spawn the revoker and retryer.  The caller owns the handles; dropping them stops the
    /// threads.
    pub fn start(self: &Arc<Self>) -> Vec<BackgroundThread> {
        let revoke_rx = self.revoke_rx.lock().unwrap().take().expect("start() may only run once");
        let retry_rx = self.retry_rx.lock().unwrap().take().expect("start() may only run once");
        let revoker = {
            let mgr = Arc::clone(self);
            BackgroundThread::spawn(move |done| mgr.revoker(revoke_rx, done))
        };
        let retryer = {
            let mgr = Arc::clone(self);
            BackgroundThread::spawn(move |done| mgr.retryer(retry_rx, done))
        };
        vec![revoker, retryer]
    }

    /// The replicated lock table, as state-transfer bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        SNAPSHOTS.click();
        let state = self.state.lock().unwrap();
        let locks = state
            .locks
            .iter()
            .map(|(lockid, record)| LockEntry {
                lockid: *lockid,
                state: record.state,
                owner: record.owner,
                waiters: record.waiters.iter().copied().collect(),
            })
            .collect();
        stack_pack(LockTable { locks }).to_vec()
    }

    /// Replace the replicated lock table.  Subscriptions are per-replica soft state and survive.
    pub fn restore(&self, bytes: &[u8]) -> Result<(), Error> {
        RESTORES.click();
        let table = LockTable::unpack(bytes)?.0;
        let mut locks = BTreeMap::new();
        for entry in table.locks {
            locks.insert(
                entry.lockid,
                LockRecord {
                    state: entry.state,
                    owner: entry.owner,
                    waiters: entry.waiters.into_iter().collect(),
                },
            );
        }
        let mut state = self.state.lock().unwrap();
        state.locks = locks;
        Ok(())
    }

    ////////////////////////////////////////// revoker /////////////////////////////////////////

    fn revoker(&self, rx: Receiver<u64>, done: Arc<std::sync::atomic::AtomicBool>) {
        while !done.load(std::sync::atomic::Ordering::Relaxed) {
            let lockid = match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(lockid) => lockid,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    continue;
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    return;
                }
            };
            if !self.rsm.amiprimary() {
                continue;
            }
            let (owner, callback) = {
                let state = self.state.lock().unwrap();
                let Some(record) = state.locks.get(&lockid) else {
                    continue;
                };
                let Some(owner) = record.owner else {
                    continue;
                };
                let Some(callback) = state.subscriptions.get(&owner.client) else {
                    CALLBACK_FAILURES.click();
                    clue!(COLLECTOR, WARNING, {
                        revoke_unsubscribed: {
                            lockid: lockid,
                            client: owner.client.prefix_free_readable(),
                        },
                    });
                    continue;
                };
                (owner, Arc::clone(callback))
            };
            REVOKES_SENT.click();
            clue!(COLLECTOR, DEBUG, {
                revoke: {
                    lockid: lockid,
                    seqno: owner.seqno,
                },
            });
            let ctx = Context::default();
            if let Err(err) = callback.revoke(
                &ctx,
                RevokeRequest {
                    lockid,
                    seqno: owner.seqno,
                },
            ) {
                CALLBACK_FAILURES.click();
                clue!(COLLECTOR, WARNING, {
                    revoke_failed: {
                        lockid: lockid,
                        err: format!("{}", err),
                    },
                });
            }
        }
    }

    ////////////////////////////////////////// retryer /////////////////////////////////////////

    fn retryer(&self, rx: Receiver<u64>, done: Arc<std::sync::atomic::AtomicBool>) {
        while !done.load(std::sync::atomic::Ordering::Relaxed) {
            let lockid = match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(lockid) => lockid,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    continue;
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    return;
                }
            };
            if !self.rsm.amiprimary() {
                continue;
            }
            let (waiter, callback) = {
                let mut state = self.state.lock().unwrap();
                let Some(record) = state.locks.get_mut(&lockid) else {
                    continue;
                };
                let Some(waiter) = record.waiters.pop_front() else {
                    continue;
                };
                let Some(callback) = state.subscriptions.get(&waiter.client) else {
                    CALLBACK_FAILURES.click();
                    clue!(COLLECTOR, WARNING, {
                        retry_unsubscribed: {
                            lockid: lockid,
                            client: waiter.client.prefix_free_readable(),
                        },
                    });
                    continue;
                };
                (waiter, Arc::clone(callback))
            };
            RETRIES_SENT.click();
            clue!(COLLECTOR, DEBUG, {
                retry: {
                    lockid: lockid,
                    seqno: waiter.seqno,
                },
            });
            let ctx = Context::default();
            if let Err(err) = callback.retry(
                &ctx,
                RetryRequest {
                    lockid,
                    seqno: waiter.seqno,
                },
            ) {
                CALLBACK_FAILURES.click();
                clue!(COLLECTOR, WARNING, {
                    retry_failed: {
                        lockid: lockid,
                        err: format!("{}", err),
                    },
                });
            }
        }
    }
}

impl LockService for LockManager {
    fn acquire(&self, _: &Context, req: AcquireRequest) -> Result<AcquireResponse, Error> {
        ACQUIRES.click();
        let holder = Holder {
            client: req.client,
            seqno: req.seqno,
        };
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let record = state.locks.entry(req.lockid).or_default();
        let status = match record.state {
            LockState::Held => {
                record.waiters.push_back(holder);
                record.state = LockState::Revoking;
                let _ = state.revoke_tx.send(req.lockid);
                AcquireStatus::Retry
            }
            LockState::Revoking => {
                record.waiters.push_back(holder);
                AcquireStatus::Retry
            }
            LockState::Free => {
                record.owner = Some(holder);
                if record.waiters.is_empty() {
                    record.state = LockState::Held;
                } else {
                    // The new owner inherits the contention: it gets revoked before it has even
                    // heard its grant, and the sequence numbers on the client side make that
                    // ordering safe.
                    record.state = LockState::Revoking;
                    let _ = state.revoke_tx.send(req.lockid);
                }
                AcquireStatus::Granted
            }
        };
        match status {
            AcquireStatus::Granted => ACQUIRES_GRANTED.click(),
            AcquireStatus::Retry => ACQUIRES_RETRY.click(),
        }
        clue!(COLLECTOR, DEBUG, {
            acquire: {
                lockid: req.lockid,
                seqno: req.seqno,
                granted: status == AcquireStatus::Granted,
            },
        });
        Ok(AcquireResponse { status })
    }

    fn release(&self, _: &Context, req: ReleaseRequest) -> Result<ReleaseResponse, Error> {
        RELEASES.click();
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let record = state.locks.entry(req.lockid).or_default();
        record.state = LockState::Free;
        record.owner = None;
        let _ = state.retry_tx.send(req.lockid);
        clue!(COLLECTOR, DEBUG, {
            release: {
                lockid: req.lockid,
                seqno: req.seqno,
            },
        });
        Ok(ReleaseResponse {})
    }

    fn subscribe(&self, _: &Context, req: SubscribeRequest) -> Result<SubscribeResponse, Error> {
        SUBSCRIBES.click();
        let client = self.connector.connect(&req.callback, DEFAULT_CALL_TIMEOUT)?;
        let callback = Arc::new(CallbackClient::new(client));
        let mut state = self.state.lock().unwrap();
        state.subscriptions.insert(req.client, callback);
        clue!(COLLECTOR, INFO, {
            subscribe: {
                client: req.client.prefix_free_readable(),
                callback: indicio::Value::from(req.callback),
            },
        });
        Ok(SubscribeResponse {})
    }
}

/////////////////////////////////////////// the RSM app ////////////////////////////////////////////

/// The lock manager, shaped the way the RSM wants its application: an rpc_pb server for
/// replicated execution plus whole-state snapshot and restore.
pub struct ReplicatedLocks {
    server: hasp_pb::LockServer<Arc<LockManager>>,
    mgr: Arc<LockManager>,
}

impl ReplicatedLocks {
    /// Wrap the manager.
    pub fn new(mgr: Arc<LockManager>) -> Self {
        Self {
            server: hasp_pb::LockServer::bind(Arc::clone(&mgr)),
            mgr,
        }
    }
}

impl rpc_pb::Server for ReplicatedLocks {
    fn call(&self, ctx: &Context, method: &str, req: &[u8]) -> rpc_pb::Status {
        self.server.call(ctx, method, req)
    }
}

impl Application for ReplicatedLocks {
    fn snapshot(&self) -> Vec<u8> {
        self.mgr.snapshot()
    }

    fn restore(&self, state: &[u8]) -> Result<(), Error> {
        self.mgr.restore(state)
    }
}

//////////////////////////////////////// the direct surface ///////////////////////////////////////

/// The transport-facing lock service.  Only subscribe is served here; acquire and release must
/// ride through client_invoke so they replicate.
pub struct DirectLockService {
    mgr: Arc<LockManager>,
}

impl DirectLockService {
    /// Wrap the manager.
    pub fn new(mgr: Arc<LockManager>) -> Self {
        Self { mgr }
    }
}

impl LockService for DirectLockService {
    fn acquire(&self, _: &Context, _: AcquireRequest) -> Result<AcquireResponse, Error> {
        Err(Error::misdirected("acquire must arrive through client_invoke"))
    }

    fn release(&self, _: &Context, _: ReleaseRequest) -> Result<ReleaseResponse, Error> {
        Err(Error::misdirected("release must arrive through client_invoke"))
    }

    fn subscribe(&self, ctx: &Context, req: SubscribeRequest) -> Result<SubscribeResponse, Error> {
        self.mgr.subscribe(ctx, req)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rpc_pb::{Host, HostID};

    use hasp_pb::LockService as _;
    use lazyrpc::loopback::Switchboard;
    use lazyrpc::HandleCache;

    use crate::config::Config;
    use crate::rsm::{Rsm, RsmOptions};
    use synod::Acceptor;

    use super::*;

    fn host(idx: u8) -> Host {
        let mut id = [0u8; 16];
        id[15] = idx;
        Host::new(HostID::new(id), format!("127.0.0.1:{}", 8000 + idx as u16))
    }

    fn client(idx: u8) -> ClientID {
        let mut id = [0u8; 16];
        id[15] = idx;
        ClientID::new(id)
    }

    fn tmpdir(name: &str) -> std::path::PathBuf {
        let path =
            std::env::temp_dir().join(format!("hasp-lockmgr-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    // A manager with a real (single-node) rsm behind it, never started, no threads.
    fn mgr(name: &str) -> Arc<LockManager> {
        let board = Switchboard::new();
        let me = host(1);
        let connector: Arc<dyn Connector> = Arc::new(board);
        let handles = Arc::new(HandleCache::new(Arc::clone(&connector), DEFAULT_CALL_TIMEOUT));
        let acceptor = Acceptor::open(
            me.host_id(),
            tmpdir(name),
            Some(hasp_pb::View {
                vid: 1,
                members: vec![me.clone()],
            }),
        )
        .unwrap();
        let cfg = Config::new(me.clone(), acceptor, handles);
        let rsm = Rsm::new(
            RsmOptions::default(),
            me.clone(),
            me,
            cfg,
            Arc::clone(&connector),
        );
        LockManager::new(rsm, connector)
    }

    fn acquire(mgr: &Arc<LockManager>, c: u8, lockid: u64, seqno: u32) -> AcquireStatus {
        mgr.acquire(
            &Context::default(),
            AcquireRequest {
                client: client(c),
                lockid,
                seqno,
            },
        )
        .unwrap()
        .status
    }

    fn release(mgr: &Arc<LockManager>, c: u8, lockid: u64, seqno: u32) {
        mgr.release(
            &Context::default(),
            ReleaseRequest {
                client: client(c),
                lockid,
                seqno,
            },
        )
        .unwrap();
    }

    #[test]
    fn uncontended_acquire_grants_and_holds() {
        let mgr = mgr("grant");
        assert_eq!(AcquireStatus::Granted, acquire(&mgr, 1, 7, 1));
        let state = mgr.state.lock().unwrap();
        let record = &state.locks[&7];
        assert_eq!(LockState::Held, record.state);
        assert_eq!(
            Some(Holder {
                client: client(1),
                seqno: 1
            }),
            record.owner
        );
    }

    #[test]
    fn contended_acquire_queues_and_revokes() {
        let mgr = mgr("contend");
        assert_eq!(AcquireStatus::Granted, acquire(&mgr, 1, 7, 1));
        assert_eq!(AcquireStatus::Retry, acquire(&mgr, 2, 7, 1));
        // A third waiter lands on an already-revoking lock and queues behind the second.
        assert_eq!(AcquireStatus::Retry, acquire(&mgr, 3, 7, 1));
        let state = mgr.state.lock().unwrap();
        let record = &state.locks[&7];
        assert_eq!(LockState::Revoking, record.state);
        assert_eq!(2, record.waiters.len());
    }

    #[test]
    fn free_lock_with_waiters_grants_and_marks_revoking() {
        let mgr = mgr("handoff");
        assert_eq!(AcquireStatus::Granted, acquire(&mgr, 1, 7, 1));
        assert_eq!(AcquireStatus::Retry, acquire(&mgr, 2, 7, 1));
        assert_eq!(AcquireStatus::Retry, acquire(&mgr, 3, 7, 1));
        release(&mgr, 1, 7, 1);
        {
            let mut state = mgr.state.lock().unwrap();
            // Stand in for the retryer, which pops the waiter it nudges.
            state.locks.get_mut(&7).unwrap().waiters.pop_front();
        }
        // Client 2's re-acquire wins the free lock but faces an immediate revoke because client
        // 3 is still waiting.
        assert_eq!(AcquireStatus::Granted, acquire(&mgr, 2, 7, 2));
        let state = mgr.state.lock().unwrap();
        let record = &state.locks[&7];
        assert_eq!(LockState::Revoking, record.state);
        assert_eq!(
            Some(Holder {
                client: client(2),
                seqno: 2
            }),
            record.owner
        );
    }

    #[test]
    fn release_frees_and_clears_the_owner() {
        let mgr = mgr("release");
        assert_eq!(AcquireStatus::Granted, acquire(&mgr, 1, 7, 1));
        release(&mgr, 1, 7, 1);
        let state = mgr.state.lock().unwrap();
        let record = &state.locks[&7];
        assert_eq!(LockState::Free, record.state);
        assert_eq!(None, record.owner);
    }

    #[test]
    fn snapshot_restore_round_trips_bit_identically() {
        let mgr = mgr("snapshot");
        assert_eq!(AcquireStatus::Granted, acquire(&mgr, 1, 7, 1));
        assert_eq!(AcquireStatus::Retry, acquire(&mgr, 2, 7, 1));
        assert_eq!(AcquireStatus::Granted, acquire(&mgr, 2, 8, 2));
        release(&mgr, 2, 8, 2);
        let snapshot = mgr.snapshot();
        let other = mgr("snapshot2");
        other.restore(&snapshot).unwrap();
        assert_eq!(snapshot, other.snapshot());
    }
}
