#![doc = include_str!("../README.md")]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable};
use indicio::{clue, DEBUG, INFO, WARNING};
use rpc_pb::{ClientID, Context, Host, HostID};
use sync42::background::BackgroundThread;
use zerror_core::ErrorCore;

use hasp_pb::{
    AcquireRequest, AcquireResponse, AcquireStatus, CallbackServer, CallbackService,
    ClientInvokeRequest, Error, LockClient, LockService, MembersRequest, ReleaseRequest,
    ReleaseResponse, ReplicaClient, ReplicaService, RetryRequest, RetryResponse, RevokeRequest,
    RevokeResponse, SubscribeRequest, ACQUIRE, RELEASE,
};
use lazyrpc::{Connector, HandleCache, ServiceRegistry};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// How long to wait on the retry signal before reissuing an acquire anyway.  A reissue is always
/// safe; this only bounds the damage of a retry callback lost to a dying primary.
pub const RETRY_TICK: Duration = Duration::from_millis(1_000);

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static INVOKES: Counter = Counter::new("hasp_client.cluster.invokes");
static RETARGETS: Counter = Counter::new("hasp_client.cluster.retargets");
static REFRESHES: Counter = Counter::new("hasp_client.cluster.refreshes");
static BUSY_SPINS: Counter = Counter::new("hasp_client.cluster.busy_spins");

static ACQUIRES: Counter = Counter::new("hasp_client.cache.acquires");
static LOCAL_GRANTS: Counter = Counter::new("hasp_client.cache.local_grants");
static REMOTE_ACQUIRES: Counter = Counter::new("hasp_client.cache.remote_acquires");
static RELEASES_CACHED: Counter = Counter::new("hasp_client.cache.releases.cached");
static RELEASES_REMOTE: Counter = Counter::new("hasp_client.cache.releases.remote");
static REVOKES_HEARD: Counter = Counter::new("hasp_client.cache.revokes");
static RETRIES_HEARD: Counter = Counter::new("hasp_client.cache.retries");
static SUBSCRIBES: Counter = Counter::new("hasp_client.cache.subscribes");

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&INVOKES);
    collector.register_counter(&RETARGETS);
    collector.register_counter(&REFRESHES);
    collector.register_counter(&BUSY_SPINS);
    collector.register_counter(&ACQUIRES);
    collector.register_counter(&LOCAL_GRANTS);
    collector.register_counter(&REMOTE_ACQUIRES);
    collector.register_counter(&RELEASES_CACHED);
    collector.register_counter(&RELEASES_REMOTE);
    collector.register_counter(&REVOKES_HEARD);
    collector.register_counter(&RETRIES_HEARD);
    collector.register_counter(&SUBSCRIBES);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

////////////////////////////////////////// callback ports //////////////////////////////////////////

static LAST_PORT: AtomicU16 = AtomicU16::new(40_000);

/// A fresh callback endpoint on `hostname`.  Ports count up from a process-wide atomic so every
/// cache in the process gets its own.
pub fn fresh_callback_host(hostname: &str) -> Result<Host, Error> {
    let host_id = HostID::generate().ok_or_else(|| Error::SystemError {
        core: ErrorCore::default(),
        what: "urandom would not produce a host id".to_owned(),
    })?;
    let port = LAST_PORT.fetch_add(1, Ordering::Relaxed);
    Ok(Host::new(host_id, format!("{}:{}", hostname, port)))
}

/////////////////////////////////////////// ClusterOptions /////////////////////////////////////////

/// Replica-set client options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterOptions {
    /// How many times to retry an invoke before giving up.
    pub attempts: usize,
    /// Pause between retries, milliseconds.
    pub backoff_ms: u64,
    /// Per-call deadline, milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            attempts: 64,
            backoff_ms: 50,
            call_timeout_ms: 1_000,
        }
    }
}

impl ClusterOptions {
    /// Set the retry budget.
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the retry backoff.
    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }
}

/////////////////////////////////////////// ClusterClient //////////////////////////////////////////

#[derive(Default)]
struct ClusterState {
    members: Vec<Host>,
    primary: Option<Host>,
}

/// A client for the replica set as a whole.  Tracks the member list and the primary, retargets
/// when the primary moves or dies, and spins politely on busy replicas.
pub struct ClusterClient {
    options: ClusterOptions,
    connector: Arc<dyn Connector>,
    handles: HandleCache,
    seeds: Vec<Host>,
    state: Mutex<ClusterState>,
}

impl ClusterClient {
    /// Create a cluster client that will find the service through `seeds`.
    pub fn new(
        connector: Arc<dyn Connector>,
        seeds: Vec<Host>,
        options: ClusterOptions,
    ) -> Arc<Self> {
        let handles = HandleCache::new(
            Arc::clone(&connector),
            Duration::from_millis(options.call_timeout_ms),
        );
        Arc::new(Self {
            options,
            connector,
            handles,
            seeds,
            state: Mutex::new(ClusterState::default()),
        })
    }

    /// The connector this client binds through.
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// The primary this client currently believes in.
    pub fn primary(&self) -> Option<Host> {
        self.state.lock().unwrap().primary.clone()
    }

    /// The member list this client last heard.
    pub fn members(&self) -> Vec<Host> {
        self.state.lock().unwrap().members.clone()
    }

    fn candidates(&self) -> Vec<Host> {
        let state = self.state.lock().unwrap();
        let mut candidates = Vec::new();
        let mut seen: Vec<HostID> = Vec::new();
        let primary = state.primary.iter().cloned();
        for host in primary.chain(state.members.iter().cloned()).chain(self.seeds.iter().cloned()) {
            if !seen.contains(&host.host_id()) {
                seen.push(host.host_id());
                candidates.push(host);
            }
        }
        candidates
    }

    /// Ask around for the current view and primary.  Returns the primary, if anyone answered.
    pub fn refresh(&self) -> Option<Host> {
        REFRESHES.click();
        let ctx = Context::default();
        for candidate in self.candidates() {
            let Ok(client) = self.handles.lookup(&candidate) else {
                continue;
            };
            let client = ReplicaClient::new(client);
            match client.members(&ctx, MembersRequest {}) {
                Ok(resp) => {
                    let mut state = self.state.lock().unwrap();
                    state.members = resp.view.members;
                    state.primary = resp.primary;
                    return state.primary.clone();
                }
                Err(_) => {
                    self.handles.banish(candidate.host_id());
                }
            }
        }
        None
    }

    /// Invoke a replicated method on the primary, retargeting and retrying as needed.
    pub fn invoke(&self, method: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
        INVOKES.click();
        let ctx = Context::default();
        let mut target = self.primary();
        for _ in 0..self.options.attempts {
            let Some(host) = target.take() else {
                target = self.refresh();
                if target.is_none() {
                    std::thread::sleep(Duration::from_millis(self.options.backoff_ms));
                }
                continue;
            };
            let outcome = self.handles.lookup(&host).map_err(Error::from).and_then(|client| {
                let client = ReplicaClient::new(client);
                client.client_invoke(
                    &ctx,
                    ClientInvokeRequest {
                        method: method.to_owned(),
                        body: body.to_vec(),
                    },
                )
            });
            match outcome {
                Ok(resp) => {
                    return Ok(resp.body);
                }
                Err(Error::NotPrimary { .. }) => {
                    RETARGETS.click();
                    clue!(COLLECTOR, DEBUG, {
                        not_primary: indicio::Value::from(host),
                    });
                    self.state.lock().unwrap().primary = None;
                    target = self.refresh();
                }
                Err(Error::Busy { .. }) => {
                    BUSY_SPINS.click();
                    std::thread::sleep(Duration::from_millis(self.options.backoff_ms));
                    target = Some(host);
                }
                Err(Error::TransportFailure { .. }) => {
                    RETARGETS.click();
                    clue!(COLLECTOR, INFO, {
                        unreachable: indicio::Value::from(host.clone()),
                    });
                    self.handles.banish(host.host_id());
                    self.state.lock().unwrap().primary = None;
                    std::thread::sleep(Duration::from_millis(self.options.backoff_ms));
                    target = self.refresh();
                }
                Err(err) => {
                    return Err(err);
                }
            }
        }
        Err(Error::busy())
    }

}

///////////////////////////////////////////// LockCache ////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Residency {
    /// This client knows nothing of the lock.
    #[default]
    None,
    /// This client owns the lock; no local thread holds it.
    Free,
    /// This client owns the lock and a local thread holds it.
    Locked,
    /// An acquire is in flight.
    Acquiring,
    /// A release is in flight.
    Releasing,
}

#[derive(Clone, Copy, Debug, Default)]
struct Entry {
    status: Residency,
    seqnum: u32,
    seqnum_at_retry: u32,
    seqnum_at_revoke: u32,
}

struct CacheState {
    locks: HashMap<u64, Entry>,
    subscribed_to: Option<HostID>,
    release_tx: Sender<(u64, u32)>,
}

/// The client-side lock cache.  One per process; threads share it.
pub struct LockCache {
    client_id: ClientID,
    callback: Host,
    cluster: Arc<ClusterClient>,
    state: Mutex<CacheState>,
    release_rx: Mutex<Option<Receiver<(u64, u32)>>>,
    acquire_signal: Condvar,
    retry_signal: Condvar,
}

impl LockCache {
    /// Create a cache that reaches the service through `cluster` and answers callbacks at
    /// `callback`.  The caller registers the callback service and starts the releaser.
    pub fn new(cluster: Arc<ClusterClient>, callback: Host) -> Result<Arc<Self>, Error> {
        let client_id = ClientID::generate().ok_or_else(|| Error::SystemError {
            core: ErrorCore::default(),
            what: "urandom would not produce a client id".to_owned(),
        })?;
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        Ok(Arc::new(Self {
            client_id,
            callback,
            cluster,
            state: Mutex::new(CacheState {
                locks: HashMap::new(),
                subscribed_to: None,
                release_tx,
            }),
            release_rx: Mutex::new(Some(release_rx)),
            acquire_signal: Condvar::new(),
            retry_signal: Condvar::new(),
        }))
    }

    /// This cache's client identity.
    pub fn client_id(&self) -> ClientID {
        self.client_id
    }

    /// The callback endpoint this cache answers at.
    pub fn callback(&self) -> &Host {
        &self.callback
    }

    /// Register the revoke/retry service with the registry serving this cache's callback host.
    pub fn register(self: &Arc<Self>, registry: &mut ServiceRegistry) {
        registry.register(
            "CallbackService",
            CallbackServer::bind(Callbacks(Arc::clone(self))),
        );
    }

    /// Spawn the releaser.  The caller owns the handle; dropping it stops the thread.
    pub fn start(self: &Arc<Self>) -> BackgroundThread {
        let rx = self
            .release_rx
            .lock()
            .unwrap()
            .take()
            .expect("start() may only run once");
        let cache = Arc::clone(self);
        BackgroundThread::spawn(move |done| cache.releaser(rx, done))
    }

    /// Acquire the lock for the calling thread, blocking until it is ours.  A lock this client
    /// already owns is handed over without any network traffic.
    pub fn acquire(&self, lockid: u64) {
        ACQUIRES.click();
        let mut state = self.state.lock().unwrap();
        loop {
            let entry = state.locks.entry(lockid).or_default();
            match entry.status {
                Residency::Locked | Residency::Acquiring | Residency::Releasing => {
                    state = self.acquire_signal.wait(state).unwrap();
                    continue;
                }
                Residency::Free => {
                    LOCAL_GRANTS.click();
                    entry.status = Residency::Locked;
                    return;
                }
                Residency::None => {}
            }
            entry.status = Residency::Acquiring;
            entry.seqnum += 1;
            let seqno = entry.seqnum;
            loop {
                drop(state);
                REMOTE_ACQUIRES.click();
                let outcome = self.remote_acquire(lockid, seqno);
                state = self.state.lock().unwrap();
                if matches!(outcome, Ok(AcquireStatus::Granted)) {
                    break;
                }
                // A Retry answer and a failed call take the same path: wait for the server's
                // nudge, skipping any retry that predates this attempt, then reissue.  The
                // decrement re-arms the wait if the reissue fails too.
                while state.locks.get(&lockid).map_or(0, |e| e.seqnum_at_retry) < seqno {
                    let (guard, timeout) =
                        self.retry_signal.wait_timeout(state, RETRY_TICK).unwrap();
                    state = guard;
                    if timeout.timed_out() {
                        break;
                    }
                }
                let entry = state.locks.get_mut(&lockid).unwrap();
                entry.seqnum_at_retry = entry.seqnum_at_retry.saturating_sub(1);
            }
            let entry = state.locks.get_mut(&lockid).unwrap();
            entry.status = Residency::Locked;
            entry.seqnum_at_retry = entry.seqnum;
            clue!(COLLECTOR, DEBUG, {
                acquired: {
                    lockid: lockid,
                    seqno: seqno,
                },
            });
            return;
        }
    }

    /// Release the calling thread's hold.  Ownership stays cached unless the server has asked
    /// for the lock back.
    pub fn release(&self, lockid: u64) {
        let mut state = self.state.lock().unwrap();
        let entry = state.locks.entry(lockid).or_default();
        if entry.seqnum_at_revoke < entry.seqnum {
            RELEASES_CACHED.click();
            entry.status = Residency::Free;
            drop(state);
            self.acquire_signal.notify_all();
            return;
        }
        RELEASES_REMOTE.click();
        entry.status = Residency::Releasing;
        let seqno = entry.seqnum;
        let _ = state.release_tx.send((lockid, seqno));
    }

    ///////////////////////////////////////// releaser /////////////////////////////////////////

    fn releaser(&self, rx: Receiver<(u64, u32)>, done: Arc<std::sync::atomic::AtomicBool>) {
        while !done.load(Ordering::Relaxed) {
            let (lockid, seqno) = match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(req) => req,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    continue;
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    return;
                }
            };
            {
                let mut state = self.state.lock().unwrap();
                state.locks.entry(lockid).or_default().status = Residency::Releasing;
            }
            // Releases retry until the server takes the lock back; the lock is unusable locally
            // until then anyway.
            while !done.load(Ordering::Relaxed) {
                match self.remote_release(lockid, seqno) {
                    Ok(()) => {
                        break;
                    }
                    Err(err) => {
                        clue!(COLLECTOR, WARNING, {
                            release_failed: {
                                lockid: lockid,
                                err: format!("{}", err),
                            },
                        });
                        std::thread::sleep(Duration::from_millis(
                            self.cluster.options.backoff_ms,
                        ));
                    }
                }
            }
            {
                let mut state = self.state.lock().unwrap();
                if let Some(entry) = state.locks.get_mut(&lockid) {
                    entry.status = Residency::None;
                }
            }
            self.acquire_signal.notify_all();
            clue!(COLLECTOR, DEBUG, {
                released: {
                    lockid: lockid,
                    seqno: seqno,
                },
            });
        }
    }

    //////////////////////////////////////// server calls //////////////////////////////////////

    fn ensure_subscribed(&self) -> Result<(), Error> {
        let primary = match self.cluster.primary() {
            Some(primary) => primary,
            None => self.cluster.refresh().ok_or_else(Error::busy)?,
        };
        {
            let state = self.state.lock().unwrap();
            if state.subscribed_to == Some(primary.host_id()) {
                return Ok(());
            }
        }
        SUBSCRIBES.click();
        let client = self.cluster.connector().connect(
            &primary,
            Duration::from_millis(self.cluster.options.call_timeout_ms),
        )?;
        let client = LockClient::new(client);
        let ctx = Context::default();
        client.subscribe(
            &ctx,
            SubscribeRequest {
                client: self.client_id,
                callback: self.callback.clone(),
            },
        )?;
        clue!(COLLECTOR, INFO, {
            subscribed: indicio::Value::from(primary.clone()),
        });
        self.state.lock().unwrap().subscribed_to = Some(primary.host_id());
        Ok(())
    }

    fn remote_acquire(&self, lockid: u64, seqno: u32) -> Result<AcquireStatus, Error> {
        self.ensure_subscribed()?;
        let req = stack_pack(AcquireRequest {
            client: self.client_id,
            lockid,
            seqno,
        })
        .to_vec();
        let resp = self.cluster.invoke(ACQUIRE, &req)?;
        Ok(AcquireResponse::unpack(&resp)?.0.status)
    }

    fn remote_release(&self, lockid: u64, seqno: u32) -> Result<(), Error> {
        self.ensure_subscribed()?;
        let req = stack_pack(ReleaseRequest {
            client: self.client_id,
            lockid,
            seqno,
        })
        .to_vec();
        let resp = self.cluster.invoke(RELEASE, &req)?;
        ReleaseResponse::unpack(&resp)?;
        Ok(())
    }

    ///////////////////////////////////////// callbacks ////////////////////////////////////////

    fn revoked(&self, lockid: u64, seqno: u32) {
        REVOKES_HEARD.click();
        let mut state = self.state.lock().unwrap();
        let entry = state.locks.entry(lockid).or_default();
        entry.seqnum_at_revoke = seqno;
        clue!(COLLECTOR, DEBUG, {
            revoke: {
                lockid: lockid,
                seqno: seqno,
            },
        });
        if entry.status != Residency::Free {
            // Someone local holds it (or it's mid-flight); the recorded revoke steers the
            // eventual release to the server.
            return;
        }
        entry.status = Residency::Releasing;
        let _ = state.release_tx.send((lockid, seqno));
    }

    fn retried(&self, lockid: u64, seqno: u32) {
        RETRIES_HEARD.click();
        {
            let mut state = self.state.lock().unwrap();
            state.locks.entry(lockid).or_default().seqnum_at_retry = seqno;
        }
        clue!(COLLECTOR, DEBUG, {
            retry: {
                lockid: lockid,
                seqno: seqno,
            },
        });
        self.retry_signal.notify_all();
    }
}

///////////////////////////////////////////// Callbacks ////////////////////////////////////////////

/// The cache's callback surface, served at its callback host.
pub struct Callbacks(Arc<LockCache>);

impl CallbackService for Callbacks {
    fn revoke(&self, _: &Context, req: RevokeRequest) -> Result<RevokeResponse, Error> {
        self.0.revoked(req.lockid, req.seqno);
        Ok(RevokeResponse {})
    }

    fn retry(&self, _: &Context, req: RetryRequest) -> Result<RetryResponse, Error> {
        self.0.retried(req.lockid, req.seqno);
        Ok(RetryResponse {})
    }
}
