//! Protocol tests for the lock cache against a scripted, single-node stand-in for the service.
//! The stand-in answers client_invoke directly and pushes revoke/retry callbacks synchronously,
//! which lets the tests force the orderings the real cluster only produces under contention.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use buffertk::{stack_pack, Unpackable};
use rpc_pb::{ClientID, Context, Host, HostID};

use hasp_pb::{
    AcquireRequest, AcquireResponse, AcquireStatus, CallbackClient, CallbackService,
    ClientInvokeRequest, ClientInvokeResponse, Error, Holder, InvokeRequest, InvokeResponse,
    JoinRequest, JoinResponse, LockServer, LockService, MembersRequest, MembersResponse,
    ReleaseRequest, ReleaseResponse, ReplicaServer, ReplicaService, RetryRequest, RevokeRequest,
    SubscribeRequest, SubscribeResponse, TransferDoneRequest, TransferDoneResponse,
    TransferRequest, TransferResponse, View, ACQUIRE, RELEASE,
};
use lazyrpc::loopback::Switchboard;
use lazyrpc::{Connector, ServiceRegistry, DEFAULT_CALL_TIMEOUT};

use hasp_client::{fresh_callback_host, ClusterClient, ClusterOptions, LockCache};

fn server_host() -> Host {
    let mut id = [0u8; 16];
    id[15] = 1;
    Host::new(HostID::new(id), "127.0.0.1:8001".to_owned())
}

//////////////////////////////////////////// the fake //////////////////////////////////////////////

#[derive(Default)]
struct FakeState {
    owner: HashMap<u64, Holder>,
    waiters: HashMap<u64, Vec<Holder>>,
    subscriptions: HashMap<ClientID, Arc<CallbackClient>>,
    acquire_log: Vec<(ClientID, u64, u32)>,
    release_log: Vec<(ClientID, u64, u32)>,
    // Locks whose grant is preceded by a revoke of that very grant, as happens when the server
    // revokes before the client has heard its acquire answered.
    revoke_before_grant: Vec<u64>,
}

struct FakeLockService {
    me: Host,
    board: Switchboard,
    state: Mutex<FakeState>,
}

impl FakeLockService {
    fn new(board: Switchboard) -> Arc<Self> {
        Arc::new(Self {
            me: server_host(),
            board,
            state: Mutex::new(FakeState::default()),
        })
    }

    fn revoke_before_grant(&self, lockid: u64) {
        self.state.lock().unwrap().revoke_before_grant.push(lockid);
    }

    fn acquire_log(&self) -> Vec<(ClientID, u64, u32)> {
        self.state.lock().unwrap().acquire_log.clone()
    }

    fn release_log(&self) -> Vec<(ClientID, u64, u32)> {
        self.state.lock().unwrap().release_log.clone()
    }

    fn callback(&self, client: ClientID) -> Arc<CallbackClient> {
        Arc::clone(self.state.lock().unwrap().subscriptions.get(&client).unwrap())
    }

    fn do_acquire(&self, req: AcquireRequest) -> AcquireResponse {
        let holder = Holder {
            client: req.client,
            seqno: req.seqno,
        };
        let (status, revoke) = {
            let mut state = self.state.lock().unwrap();
            state.acquire_log.push((req.client, req.lockid, req.seqno));
            match state.owner.get(&req.lockid).copied() {
                Some(owner) if owner.client != req.client => {
                    state.waiters.entry(req.lockid).or_default().push(holder);
                    (AcquireStatus::Retry, Some(owner))
                }
                _ => {
                    state.owner.insert(req.lockid, holder);
                    let revoke = if state.revoke_before_grant.contains(&req.lockid) {
                        state.revoke_before_grant.retain(|l| *l != req.lockid);
                        Some(holder)
                    } else {
                        None
                    };
                    (AcquireStatus::Granted, revoke)
                }
            }
        };
        if let Some(revoked) = revoke {
            let cb = self.callback(revoked.client);
            cb.revoke(
                &Context::default(),
                RevokeRequest {
                    lockid: req.lockid,
                    seqno: revoked.seqno,
                },
            )
            .unwrap();
        }
        AcquireResponse { status }
    }

    fn do_release(&self, req: ReleaseRequest) -> ReleaseResponse {
        let nudge = {
            let mut state = self.state.lock().unwrap();
            state.release_log.push((req.client, req.lockid, req.seqno));
            state.owner.remove(&req.lockid);
            let waiters = state.waiters.entry(req.lockid).or_default();
            if waiters.is_empty() {
                None
            } else {
                Some(waiters.remove(0))
            }
        };
        if let Some(waiter) = nudge {
            let cb = self.callback(waiter.client);
            cb.retry(
                &Context::default(),
                RetryRequest {
                    lockid: req.lockid,
                    seqno: waiter.seqno,
                },
            )
            .unwrap();
        }
        ReleaseResponse {}
    }
}

impl ReplicaService for Arc<FakeLockService> {
    fn invoke(&self, _: &Context, _: InvokeRequest) -> Result<InvokeResponse, Error> {
        Err(Error::misdirected("fake is not a backup"))
    }

    fn transfer(&self, _: &Context, _: TransferRequest) -> Result<TransferResponse, Error> {
        Err(Error::misdirected("fake does not transfer"))
    }

    fn transfer_done(
        &self,
        _: &Context,
        _: TransferDoneRequest,
    ) -> Result<TransferDoneResponse, Error> {
        Err(Error::misdirected("fake does not transfer"))
    }

    fn join(&self, _: &Context, _: JoinRequest) -> Result<JoinResponse, Error> {
        Err(Error::misdirected("fake does not grow"))
    }

    fn client_invoke(
        &self,
        _: &Context,
        req: ClientInvokeRequest,
    ) -> Result<ClientInvokeResponse, Error> {
        let body = match req.method.as_str() {
            ACQUIRE => {
                let acquire = AcquireRequest::unpack(&req.body)?.0;
                stack_pack(self.do_acquire(acquire)).to_vec()
            }
            RELEASE => {
                let release = ReleaseRequest::unpack(&req.body)?.0;
                stack_pack(self.do_release(release)).to_vec()
            }
            _ => {
                return Err(Error::misdirected("unknown replicated method"));
            }
        };
        Ok(ClientInvokeResponse { body })
    }

    fn members(&self, _: &Context, _: MembersRequest) -> Result<MembersResponse, Error> {
        Ok(MembersResponse {
            view: View {
                vid: 1,
                members: vec![self.me.clone()],
            },
            primary: Some(self.me.clone()),
        })
    }
}

impl LockService for Arc<FakeLockService> {
    fn acquire(&self, _: &Context, _: AcquireRequest) -> Result<AcquireResponse, Error> {
        Err(Error::misdirected("acquire must arrive through client_invoke"))
    }

    fn release(&self, _: &Context, _: ReleaseRequest) -> Result<ReleaseResponse, Error> {
        Err(Error::misdirected("release must arrive through client_invoke"))
    }

    fn subscribe(&self, _: &Context, req: SubscribeRequest) -> Result<SubscribeResponse, Error> {
        let client = self.board.connect(&req.callback, DEFAULT_CALL_TIMEOUT)?;
        let callback = Arc::new(CallbackClient::new(client));
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .insert(req.client, callback);
        Ok(SubscribeResponse {})
    }
}

//////////////////////////////////////////// harness ///////////////////////////////////////////////

struct Harness {
    board: Switchboard,
    fake: Arc<FakeLockService>,
    cache: Arc<LockCache>,
    _releaser: sync42::background::BackgroundThread,
}

impl Harness {
    fn new() -> Self {
        let board = Switchboard::new();
        let fake = FakeLockService::new(board.clone());
        let mut registry = ServiceRegistry::new();
        registry.register("ReplicaService", ReplicaServer::bind(Arc::clone(&fake)));
        registry.register("LockService", LockServer::bind(Arc::clone(&fake)));
        board.plug(&server_host(), Arc::new(registry));
        let cluster = ClusterClient::new(
            Arc::new(board.clone()) as Arc<dyn Connector>,
            vec![server_host()],
            ClusterOptions::default().with_attempts(8).with_backoff_ms(5),
        );
        let callback = fresh_callback_host("127.0.0.1").unwrap();
        let cache = LockCache::new(cluster, callback.clone()).unwrap();
        let mut client_registry = ServiceRegistry::new();
        cache.register(&mut client_registry);
        board.plug(&callback, Arc::new(client_registry));
        let _releaser = cache.start();
        Self {
            board,
            fake,
            cache,
            _releaser,
        }
    }
}

////////////////////////////////////////////// tests ///////////////////////////////////////////////

#[test]
fn cached_ownership_costs_one_rpc() {
    let h = Harness::new();
    h.cache.acquire(7);
    h.cache.release(7);
    // Ownership is cached; the server can be dark and local handoff still works.
    h.board.kill(server_host().host_id());
    h.cache.acquire(7);
    h.cache.release(7);
    h.board.revive(server_host().host_id());
    assert_eq!(1, h.fake.acquire_log().len());
    assert!(h.fake.release_log().is_empty());
}

#[test]
fn contention_travels_through_revoke_and_retry() {
    let a = Harness::new();
    // A second cache against the same fake, same switchboard.
    let cluster = ClusterClient::new(
        Arc::new(a.board.clone()) as Arc<dyn Connector>,
        vec![server_host()],
        ClusterOptions::default().with_attempts(8).with_backoff_ms(5),
    );
    let callback = fresh_callback_host("127.0.0.1").unwrap();
    let b_cache = LockCache::new(cluster, callback.clone()).unwrap();
    let mut registry = ServiceRegistry::new();
    b_cache.register(&mut registry);
    a.board.plug(&callback, Arc::new(registry));
    let _b_releaser = b_cache.start();

    a.cache.acquire(7);
    let b_id = b_cache.client_id();
    let b_thread = {
        let b_cache = Arc::clone(&b_cache);
        std::thread::spawn(move || {
            b_cache.acquire(7);
            b_cache.release(7);
        })
    };
    // B is queued behind A; A's release must go to the server because of the revoke, and B's
    // retry must carry the seqno B first minted.
    std::thread::sleep(std::time::Duration::from_millis(100));
    a.cache.release(7);
    b_thread.join().unwrap();
    let releases = a.fake.release_log();
    assert!(releases.iter().any(|(c, l, _)| *c == a.cache.client_id() && *l == 7));
    let b_acquires: Vec<u32> = a
        .fake
        .acquire_log()
        .into_iter()
        .filter(|(c, l, _)| *c == b_id && *l == 7)
        .map(|(_, _, s)| s)
        .collect();
    assert!(!b_acquires.is_empty());
    assert!(b_acquires.iter().all(|s| *s == b_acquires[0]));
}

#[test]
fn revoke_ahead_of_the_grant_steers_release_to_the_server() {
    let h = Harness::new();
    // Subscribe first so the fake can deliver the early revoke.
    h.cache.acquire(1);
    h.cache.release(1);
    h.fake.revoke_before_grant(7);
    h.cache.acquire(7);
    // The revoke landed before the grant; release must travel rather than cache.
    h.cache.release(7);
    for _ in 0..200 {
        if h.fake.release_log().iter().any(|(_, l, _)| *l == 7) {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert!(h.fake.release_log().iter().any(|(_, l, _)| *l == 7));
    // Ownership is gone; the next acquire goes back to the server.
    h.cache.acquire(7);
    let sevens: Vec<u32> = h
        .fake
        .acquire_log()
        .into_iter()
        .filter(|(_, l, _)| *l == 7)
        .map(|(_, _, s)| s)
        .collect();
    assert_eq!(2, sevens.len());
    assert!(sevens[1] > sevens[0]);
}

#[test]
fn stale_retries_do_not_wake_a_newer_attempt() {
    let h = Harness::new();
    h.cache.acquire(3);
    h.cache.release(3);
    // A retry for a sequence long past must be a no-op.
    let cb = h.fake.callback(h.cache.client_id());
    cb.retry(
        &Context::default(),
        RetryRequest {
            lockid: 3,
            seqno: 0,
        },
    )
    .unwrap();
    // The lock is still cached and still usable.
    h.board.kill(server_host().host_id());
    h.cache.acquire(3);
    h.cache.release(3);
    h.board.revive(server_host().host_id());
    assert_eq!(1, h.fake.acquire_log().len());
}
