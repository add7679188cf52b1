//! The replicated state machine: primary-backup replication of application requests over the
//! views the config layer installs.
//!
//! The primary stamps each client request with its view stamp, pushes it to every backup under
//! one invoke mutex, executes it, and answers.  A backup executes requests strictly in view-stamp
//! order and refuses anything else.  When a view commits, every member enters a view change:
//! the primary waits for every backup to pull its state, backups pull state from the primary,
//! and only then does anyone take client traffic again.  A node that is not a member joins by
//! asking the primary to propose it into the next view and restoring the decided-view log the
//! primary hands back.
//!
//! Locking here follows the layering rule: a thread may call down (config, then synod) while
//! holding nothing, and every upcall arrives with the lower layer's locks released.  The state
//! mutex is never held across an outbound RPC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use biometrics::{Collector, Counter};
use buffertk::Unpackable;
use indicio::{clue, ALWAYS, DEBUG, INFO, WARNING};
use rpc_pb::{Context, Host};
use sync42::background::BackgroundThread;

use hasp_pb::{
    ClientInvokeRequest, ClientInvokeResponse, Error, InvokeRequest, InvokeResponse, JoinRequest,
    JoinResponse, MembersRequest, MembersResponse, ReplicaClient, ReplicaService,
    TransferDoneRequest, TransferDoneResponse, TransferRequest, TransferResponse, ViewStamp,
};
use lazyrpc::builtins::{Builtin, BuiltinClient, Empty};
use lazyrpc::{Connector, HandleCache};

use super::config::{Config, ViewChange};
use super::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CLIENT_INVOKES: Counter = Counter::new("hasp.rsm.client_invokes");
static REPLICA_INVOKES: Counter = Counter::new("hasp.rsm.invokes");
static INVOKE_BUSY: Counter = Counter::new("hasp.rsm.invoke.busy");
static INVOKE_STALE: Counter = Counter::new("hasp.rsm.invoke.stale");
static REPLICATION_FAILURES: Counter = Counter::new("hasp.rsm.replication_failures");
static VIEW_CHANGES: Counter = Counter::new("hasp.rsm.view_changes");
static SYNCS_LED: Counter = Counter::new("hasp.rsm.syncs.led");
static SYNCS_FOLLOWED: Counter = Counter::new("hasp.rsm.syncs.followed");
static SYNCS_ABORTED: Counter = Counter::new("hasp.rsm.syncs.aborted");
static JOINS_SERVED: Counter = Counter::new("hasp.rsm.joins.served");
static JOINS_ATTEMPTED: Counter = Counter::new("hasp.rsm.joins.attempted");
static HEARTBEAT_FAILURES: Counter = Counter::new("hasp.rsm.heartbeat_failures");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CLIENT_INVOKES);
    collector.register_counter(&REPLICA_INVOKES);
    collector.register_counter(&INVOKE_BUSY);
    collector.register_counter(&INVOKE_STALE);
    collector.register_counter(&REPLICATION_FAILURES);
    collector.register_counter(&VIEW_CHANGES);
    collector.register_counter(&SYNCS_LED);
    collector.register_counter(&SYNCS_FOLLOWED);
    collector.register_counter(&SYNCS_ABORTED);
    collector.register_counter(&JOINS_SERVED);
    collector.register_counter(&JOINS_ATTEMPTED);
    collector.register_counter(&HEARTBEAT_FAILURES);
}

//////////////////////////////////////////// Application ///////////////////////////////////////////

/// The state machine plugged into the RSM.  Handlers dispatch through the rpc_pb server contract
/// and must run to completion without blocking on further network I/O: backups execute the same
/// requests and must land in the same state, so a handler that blocks or observes a response
/// breaks replication.
pub trait Application: rpc_pb::Server + Send + Sync + 'static {
    /// The whole application state, as bytes a peer can restore.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the application state with a snapshot.
    fn restore(&self, state: &[u8]) -> Result<(), Error>;
}

//////////////////////////////////////////// Breakpoint ////////////////////////////////////////////

/// Process-exit points for failure-injection harnesses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Breakpoint {
    /// The primary exits after replicating to exactly one backup.
    PostFirstReplica,
    /// A backup exits after executing a replicated request.
    PostExecute,
}

///////////////////////////////////////////// RsmOptions ///////////////////////////////////////////

/// Replicated-state-machine options.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct RsmOptions {
    /// Per-backup replication deadline, milliseconds.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Per-backup replication deadline in milliseconds.")
    )]
    pub replication_timeout_ms: u64,
    /// Join deadline, milliseconds.  Joins ride out a whole Paxos round plus a sync.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Join deadline in milliseconds."))]
    pub join_timeout_ms: u64,
    /// Pause between join attempts, milliseconds.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Pause between join attempts in milliseconds.")
    )]
    pub join_retry_ms: u64,
    /// Heartbeat interval, milliseconds.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Heartbeat interval in milliseconds.")
    )]
    pub heartbeat_interval_ms: u64,
    /// How often the recovery thread re-checks for work, milliseconds.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Recovery re-check interval in milliseconds.")
    )]
    pub recovery_tick_ms: u64,
}

impl Default for RsmOptions {
    fn default() -> Self {
        Self {
            replication_timeout_ms: 1_000,
            join_timeout_ms: 120_000,
            join_retry_ms: 1_000,
            heartbeat_interval_ms: 1_000,
            recovery_tick_ms: 100,
        }
    }
}

/////////////////////////////////////////////// state //////////////////////////////////////////////

#[derive(Debug)]
struct RsmState {
    primary: Host,
    myvs: ViewStamp,
    last_myvs: ViewStamp,
    inviewchange: bool,
    insync: bool,
    nbackup: usize,
    // Bumps on every commit_change so stalled syncs notice the world moved.
    epoch: u64,
}

//////////////////////////////////////////////// Rsm ///////////////////////////////////////////////

/// One node's replicated state machine.
pub struct Rsm {
    options: RsmOptions,
    me: Host,
    cfg: Arc<Config>,
    connector: Arc<dyn Connector>,
    handles: Arc<HandleCache>,
    app: OnceLock<Arc<dyn Application>>,
    state: Mutex<RsmState>,
    // Serializes replicated invocations on the primary.
    invoke_mutex: Mutex<()>,
    recovery_cond: Condvar,
    sync_cond: Condvar,
    join_cond: Condvar,
    break_post_first_replica: AtomicBool,
    break_post_execute: AtomicBool,
}

impl Rsm {
    /// Create the state machine.  `seed` is the node believed to be primary until the first view
    /// change says otherwise; the first node of a cluster seeds with itself.
    pub fn new(
        options: RsmOptions,
        me: Host,
        seed: Host,
        cfg: Arc<Config>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        // Replication, state transfer, and heartbeats all ride these handles, under the
        // replication deadline.  Joins mint their own patient client instead.
        let handles = Arc::new(HandleCache::new(
            Arc::clone(&connector),
            Duration::from_millis(options.replication_timeout_ms),
        ));
        let state = RsmState {
            primary: seed,
            myvs: ViewStamp { vid: 0, seqno: 1 },
            last_myvs: ViewStamp { vid: 0, seqno: 0 },
            inviewchange: false,
            insync: false,
            nbackup: 0,
            epoch: 0,
        };
        Arc::new(Self {
            options,
            me,
            cfg,
            connector,
            handles,
            app: OnceLock::new(),
            state: Mutex::new(state),
            invoke_mutex: Mutex::new(()),
            recovery_cond: Condvar::new(),
            sync_cond: Condvar::new(),
            join_cond: Condvar::new(),
            break_post_first_replica: AtomicBool::new(false),
            break_post_execute: AtomicBool::new(false),
        })
    }

    /// Plug in the application.  Must happen before any RPC surface is served.
    pub fn register_app(&self, app: Arc<dyn Application>) {
        if self.app.set(app).is_err() {
            panic!("rsm application may only be set once");
        }
    }

    /// Spawn the recovery and heartbeat threads.  The caller owns the handles; dropping them
    /// stops the threads.
    pub fn start(self: &Arc<Self>) -> Vec<BackgroundThread> {
        let recovery = {
            let rsm = Arc::clone(self);
            BackgroundThread::spawn(move |done| rsm.recovery(done))
        };
        let heartbeat = {
            let rsm = Arc::clone(self);
            BackgroundThread::spawn(move |done| rsm.heartbeat(done))
        };
        vec![recovery, heartbeat]
    }

    /// Arm a breakpoint.  The next request through it exits the process.
    pub fn set_breakpoint(&self, breakpoint: Breakpoint) {
        match breakpoint {
            Breakpoint::PostFirstReplica => {
                self.break_post_first_replica.store(true, Ordering::Relaxed)
            }
            Breakpoint::PostExecute => self.break_post_execute.store(true, Ordering::Relaxed),
        }
    }

    /// Is this node the primary of a settled view.
    pub fn amiprimary(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.primary.host_id() == self.me.host_id() && !state.inviewchange
    }

    /// The primary this node currently believes in.
    pub fn primary(&self) -> Host {
        self.state.lock().unwrap().primary.clone()
    }

    /// Is this node mid-view-change.
    pub fn inviewchange(&self) -> bool {
        self.state.lock().unwrap().inviewchange
    }

    fn execute(&self, method: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
        let app = self
            .app
            .get()
            .ok_or_else(|| Error::misdirected("no application registered"))?;
        let ctx = Context::default();
        match app.call(&ctx, method, body) {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => Err(Error::unpack(&err)?.0),
            Err(err) => Err(err.into()),
        }
    }

    ////////////////////////////////////// recovery thread /////////////////////////////////////

    fn recovery(self: &Arc<Self>, done: Arc<std::sync::atomic::AtomicBool>) {
        while !done.load(Ordering::Relaxed) {
            if !self.cfg.is_member(self.me.host_id()) {
                let target = self.primary();
                JOINS_ATTEMPTED.click();
                match self.join(&target) {
                    Ok(true) => {
                        clue!(COLLECTOR, INFO, {
                            joined: indicio::Value::from(target),
                        });
                    }
                    Ok(false) | Err(_) => {
                        std::thread::sleep(Duration::from_millis(self.options.join_retry_ms));
                    }
                }
                continue;
            }
            let mut state = self.state.lock().unwrap();
            if state.inviewchange {
                VIEW_CHANGES.click();
                let synced;
                if state.primary.host_id() == self.me.host_id() {
                    (state, synced) = self.sync_with_backups(state, &done);
                } else {
                    (state, synced) = self.sync_with_primary(state);
                }
                if synced {
                    state.inviewchange = false;
                    clue!(COLLECTOR, INFO, {
                        view_change_complete: {
                            vid: state.myvs.vid,
                        },
                    });
                } else {
                    SYNCS_ABORTED.click();
                }
            }
            let tick = Duration::from_millis(self.options.recovery_tick_ms);
            let (guard, _) = self.recovery_cond.wait_timeout(state, tick).unwrap();
            drop(guard);
        }
    }

    fn sync_with_backups<'a>(
        &self,
        mut state: MutexGuard<'a, RsmState>,
        done: &std::sync::atomic::AtomicBool,
    ) -> (MutexGuard<'a, RsmState>, bool) {
        SYNCS_LED.click();
        let Some(view) = self.cfg.current_view() else {
            return (state, false);
        };
        state.insync = true;
        state.nbackup = view.members.len() - 1;
        let epoch = state.epoch;
        let mut synced = true;
        if state.nbackup > 0 {
            state.last_myvs = state.myvs;
            state.myvs.vid += 1;
            state.myvs.seqno = 1;
            let tick = Duration::from_millis(self.options.recovery_tick_ms);
            while state.nbackup > 0 && state.epoch == epoch && !done.load(Ordering::Relaxed) {
                let (guard, _) = self.sync_cond.wait_timeout(state, tick).unwrap();
                state = guard;
            }
            synced = state.nbackup == 0;
        }
        state.insync = false;
        (state, synced)
    }

    fn sync_with_primary<'a>(
        &self,
        mut state: MutexGuard<'a, RsmState>,
    ) -> (MutexGuard<'a, RsmState>, bool) {
        SYNCS_FOLLOWED.click();
        state.insync = true;
        state.last_myvs = state.myvs;
        let primary = state.primary.clone();
        let last = state.last_myvs;
        drop(state);
        let transferred = self.transfer_from(&primary, last);
        state = self.state.lock().unwrap();
        let last = match transferred {
            Ok(last) => last,
            Err(_) => {
                let tick = Duration::from_millis(self.options.recovery_tick_ms);
                let (guard, _) = self.join_cond.wait_timeout(state, tick).unwrap();
                state = guard;
                state.insync = false;
                return (state, false);
            }
        };
        state.last_myvs = last;
        drop(state);
        let done = self.transfer_done_to(&primary);
        state = self.state.lock().unwrap();
        if done.is_err() {
            let tick = Duration::from_millis(self.options.recovery_tick_ms);
            let (guard, _) = self.join_cond.wait_timeout(state, tick).unwrap();
            state = guard;
            state.insync = false;
            return (state, false);
        }
        state.myvs = state.last_myvs;
        state.myvs.vid += 1;
        state.myvs.seqno = 1;
        state.insync = false;
        (state, true)
    }

    fn transfer_from(&self, primary: &Host, last: ViewStamp) -> Result<ViewStamp, Error> {
        let client = self.handles.lookup(primary).map_err(|err| {
            self.handles.banish(primary.host_id());
            Error::from(err)
        })?;
        let client = ReplicaClient::new(client);
        let ctx = Context::default();
        let resp = client
            .transfer(
                &ctx,
                TransferRequest {
                    src: self.me.host_id(),
                    last,
                },
            )
            .map_err(|err| {
                if matches!(err, Error::TransportFailure { .. }) {
                    self.handles.banish(primary.host_id());
                }
                err
            })?;
        if last != resp.last {
            let app = self
                .app
                .get()
                .ok_or_else(|| Error::misdirected("no application registered"))?;
            app.restore(&resp.state)?;
        }
        clue!(COLLECTOR, INFO, {
            transferred: {
                last: indicio::Value::from(resp.last),
            },
        });
        Ok(resp.last)
    }

    fn transfer_done_to(&self, primary: &Host) -> Result<(), Error> {
        let client = self.handles.lookup(primary).map_err(|err| {
            self.handles.banish(primary.host_id());
            Error::from(err)
        })?;
        let client = ReplicaClient::new(client);
        let ctx = Context::default();
        client
            .transfer_done(
                &ctx,
                TransferDoneRequest {
                    src: self.me.host_id(),
                },
            )
            .map_err(|err| {
                if matches!(err, Error::TransportFailure { .. }) {
                    self.handles.banish(primary.host_id());
                }
                err
            })?;
        Ok(())
    }

    fn join(&self, target: &Host) -> Result<bool, Error> {
        let last = self.state.lock().unwrap().last_myvs;
        clue!(COLLECTOR, INFO, {
            join: {
                target: indicio::Value::from(target.clone()),
                last: indicio::Value::from(last),
            },
        });
        // Joins wait out a Paxos round and a sync on the far side; use a patient client.
        let timeout = Duration::from_millis(self.options.join_timeout_ms);
        let client = self.connector.connect(target, timeout)?;
        let client = ReplicaClient::new(client);
        let ctx = Context::default();
        let resp = match client.join(
            &ctx,
            JoinRequest {
                src: self.me.clone(),
                last,
            },
        ) {
            Ok(resp) => resp,
            Err(err) => {
                clue!(COLLECTOR, DEBUG, {
                    join_refused: format!("{}", err),
                });
                return Ok(false);
            }
        };
        self.cfg.restore(&resp.log)?;
        let mut state = self.state.lock().unwrap();
        state.inviewchange = true;
        Ok(true)
    }

    ////////////////////////////////////// heartbeat thread ////////////////////////////////////

    fn heartbeat(self: &Arc<Self>, done: Arc<std::sync::atomic::AtomicBool>) {
        while !done.load(Ordering::Relaxed) {
            let deadline =
                Instant::now() + Duration::from_millis(self.options.heartbeat_interval_ms);
            while Instant::now() < deadline && !done.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(10));
            }
            if done.load(Ordering::Relaxed) {
                return;
            }
            if !self.cfg.is_member(self.me.host_id()) {
                continue;
            }
            let Some(view) = self.cfg.current_view() else {
                continue;
            };
            let primary = self.primary();
            let mut dead: Option<Host> = None;
            if primary.host_id() == self.me.host_id() {
                for member in &view.members {
                    if member.host_id() == self.me.host_id() {
                        continue;
                    }
                    if !self.ping(member) {
                        dead = Some(member.clone());
                        break;
                    }
                }
            } else if view.is_member(primary.host_id()) && !self.ping(&primary) {
                dead = Some(primary.clone());
            }
            let Some(dead) = dead else {
                continue;
            };
            HEARTBEAT_FAILURES.click();
            clue!(COLLECTOR, WARNING, {
                heartbeat_failure: indicio::Value::from(dead.clone()),
            });
            self.handles.banish(dead.host_id());
            if let Err(err) = self.cfg.remove(dead.host_id()) {
                clue!(COLLECTOR, WARNING, {
                    remove_failed: format!("{}", err),
                });
            }
        }
    }

    fn ping(&self, host: &Host) -> bool {
        let client = match self.handles.lookup(host) {
            Ok(client) => client,
            Err(_) => {
                return false;
            }
        };
        let client = BuiltinClient::new(client);
        let ctx = Context::default();
        if client.nop(&ctx, Empty {}).is_err() {
            self.handles.banish(host.host_id());
            false
        } else {
            true
        }
    }

    ///////////////////////////////////////// primary path /////////////////////////////////////

    fn set_primary(&self, state: &mut RsmState, vid: u64) {
        let Some(cur) = self.cfg.view(vid) else {
            return;
        };
        if cur.is_member(state.primary.host_id()) {
            return;
        }
        let Some(prev) = self.cfg.view(vid.saturating_sub(1)) else {
            return;
        };
        let mut candidates = prev.members.clone();
        candidates.sort_by_key(|m| m.host_id());
        for candidate in candidates {
            if cur.is_member(candidate.host_id()) {
                clue!(COLLECTOR, INFO, {
                    new_primary: indicio::Value::from(candidate.clone()),
                });
                state.primary = candidate;
                return;
            }
        }
        // Every primary must come from the previous view; a view with no survivor of its
        // predecessor cannot happen while a majority rule holds.
        clue!(COLLECTOR, ALWAYS, {
            no_primary_candidate: vid,
        });
    }

    fn breakpoint(&self, armed: &AtomicBool) {
        if armed.load(Ordering::Relaxed) {
            clue!(COLLECTOR, ALWAYS, {
                breakpoint: true,
            });
            COLLECTOR.flush();
            std::process::exit(0);
        }
    }
}

impl ViewChange for Rsm {
    fn commit_change(&self, vid: u64) {
        {
            let mut state = self.state.lock().unwrap();
            state.inviewchange = true;
            state.epoch += 1;
            self.set_primary(&mut state, vid);
        }
        self.join_cond.notify_all();
        self.recovery_cond.notify_all();
        self.sync_cond.notify_all();
    }
}

impl ReplicaService for Rsm {
    fn invoke(&self, _: &Context, req: InvokeRequest) -> Result<InvokeResponse, Error> {
        REPLICA_INVOKES.click();
        let mut state = self.state.lock().unwrap();
        if state.inviewchange {
            INVOKE_BUSY.click();
            return Err(Error::busy());
        }
        if state.primary.host_id() == self.me.host_id() {
            return Err(Error::misdirected("replicated invoke reached the primary"));
        }
        if req.vs != state.myvs {
            INVOKE_STALE.click();
            return Err(Error::StaleViewStamp {
                core: zerror_core::ErrorCore::default(),
                want: state.myvs,
                got: req.vs,
            });
        }
        state.last_myvs = state.myvs;
        state.myvs.seqno += 1;
        // Execute while still holding the state mutex, so a concurrent state transfer cannot
        // observe the view stamp advanced without the request applied.
        self.execute(&req.method, &req.body)?;
        drop(state);
        self.breakpoint(&self.break_post_execute);
        Ok(InvokeResponse {})
    }

    fn transfer(&self, _: &Context, req: TransferRequest) -> Result<TransferResponse, Error> {
        let state = self.state.lock().unwrap();
        let app = self
            .app
            .get()
            .ok_or_else(|| Error::misdirected("no application registered"))?;
        let snapshot = if req.last != state.last_myvs {
            app.snapshot()
        } else {
            Vec::new()
        };
        clue!(COLLECTOR, DEBUG, {
            transfer: {
                src: req.src.prefix_free_readable(),
                last: indicio::Value::from(state.last_myvs),
            },
        });
        Ok(TransferResponse {
            state: snapshot,
            last: state.last_myvs,
        })
    }

    fn transfer_done(
        &self,
        _: &Context,
        req: TransferDoneRequest,
    ) -> Result<TransferDoneResponse, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.insync {
            return Err(Error::busy());
        }
        clue!(COLLECTOR, DEBUG, {
            transfer_done: {
                src: req.src.prefix_free_readable(),
            },
        });
        if state.nbackup > 0 {
            state.nbackup -= 1;
        }
        if state.nbackup == 0 {
            self.sync_cond.notify_all();
        }
        Ok(TransferDoneResponse {})
    }

    fn join(&self, _: &Context, req: JoinRequest) -> Result<JoinResponse, Error> {
        clue!(COLLECTOR, INFO, {
            joinreq: {
                src: indicio::Value::from(req.src.clone()),
                last: indicio::Value::from(req.last),
            },
        });
        {
            let state = self.state.lock().unwrap();
            if self.cfg.is_member(req.src.host_id()) {
                JOINS_SERVED.click();
                return Ok(JoinResponse {
                    log: self.cfg.dump(),
                });
            }
            if state.primary.host_id() != self.me.host_id() {
                drop(state);
                self.join_cond.notify_all();
                return Err(Error::busy());
            }
        }
        // Drive the new member into the next view.  The state mutex stays released: the Paxos
        // round upcalls commit_change, which takes it.
        self.cfg.add(req.src.clone())?;
        if self.cfg.is_member(req.src.host_id()) {
            JOINS_SERVED.click();
            Ok(JoinResponse {
                log: self.cfg.dump(),
            })
        } else {
            Err(Error::busy())
        }
    }

    fn client_invoke(
        &self,
        _: &Context,
        req: ClientInvokeRequest,
    ) -> Result<ClientInvokeResponse, Error> {
        CLIENT_INVOKES.click();
        {
            let state = self.state.lock().unwrap();
            if state.inviewchange {
                INVOKE_BUSY.click();
                return Err(Error::busy());
            }
            if state.primary.host_id() != self.me.host_id() {
                return Err(Error::not_primary());
            }
        }
        let _invoke = self.invoke_mutex.lock().unwrap();
        let Some(view) = self.cfg.current_view() else {
            return Err(Error::busy());
        };
        let myvs = self.state.lock().unwrap().myvs;
        let mut first = true;
        for member in &view.members {
            if member.host_id() == self.me.host_id() {
                continue;
            }
            let outcome = self.handles.lookup(member).map_err(Error::from).and_then(|client| {
                let client = ReplicaClient::new(client);
                let ctx = Context::default();
                client.invoke(
                    &ctx,
                    InvokeRequest {
                        vs: myvs,
                        method: req.method.clone(),
                        body: req.body.clone(),
                    },
                )
            });
            if let Err(err) = outcome {
                REPLICATION_FAILURES.click();
                clue!(COLLECTOR, WARNING, {
                    replication_failure: {
                        backup: indicio::Value::from(member.clone()),
                        err: format!("{}", err),
                    },
                });
                if matches!(err, Error::TransportFailure { .. }) {
                    self.handles.banish(member.host_id());
                }
                let mut state = self.state.lock().unwrap();
                state.inviewchange = true;
                drop(state);
                self.recovery_cond.notify_all();
                return Err(Error::busy());
            }
            if first {
                first = false;
                self.breakpoint(&self.break_post_first_replica);
            }
        }
        {
            let mut state = self.state.lock().unwrap();
            state.last_myvs = myvs;
            state.myvs.seqno += 1;
        }
        let reply = self.execute(&req.method, &req.body)?;
        Ok(ClientInvokeResponse { body: reply })
    }

    fn members(&self, _: &Context, _: MembersRequest) -> Result<MembersResponse, Error> {
        let state = self.state.lock().unwrap();
        let view = self.cfg.current_view().unwrap_or_default();
        Ok(MembersResponse {
            view,
            primary: Some(state.primary.clone()),
        })
    }
}
