//! The acceptor: the durable memory of the synod protocol.  It promises, accepts, and learns
//! decisions, logging each step before answering, and upcalls every newly-learned decision to the
//! configuration layer without holding its own lock.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use biometrics::{Collector, Counter};
use indicio::{clue, DEBUG, INFO};
use rpc_pb::{Context, HostID};

use hasp_pb::{
    AcceptRequest, AcceptResponse, AcceptorService, Ballot, DecideRequest, DecideResponse, Error,
    PrepareRequest, PrepareResponse, View, ViewLog,
};

use super::log::{DurableLog, LogRecord};
use super::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PREPARES: Counter = Counter::new("synod.acceptor.prepares");
static PROMISES: Counter = Counter::new("synod.acceptor.promises");
static ACCEPTS: Counter = Counter::new("synod.acceptor.accepts");
static ACCEPTED: Counter = Counter::new("synod.acceptor.accepted");
static COMMITS: Counter = Counter::new("synod.acceptor.commits");
static OLD_INSTANCE: Counter = Counter::new("synod.acceptor.old_instance");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PREPARES);
    collector.register_counter(&PROMISES);
    collector.register_counter(&ACCEPTS);
    collector.register_counter(&ACCEPTED);
    collector.register_counter(&COMMITS);
    collector.register_counter(&OLD_INSTANCE);
}

////////////////////////////////////////////// Learner /////////////////////////////////////////////

/// Whoever wants to hear about decided instances.  Called with no acceptor locks held.
pub trait Learner: Send + Sync + 'static {
    /// `instance` decided `view`.  Decisions arrive in instance order from a single acceptor.
    fn learned(&self, instance: u64, view: &View);
}

////////////////////////////////////////////// Acceptor ////////////////////////////////////////////

#[derive(Debug, Default)]
struct AcceptorState {
    n_h: Ballot,
    n_a: Ballot,
    v_a: Option<View>,
    instance_h: u64,
    values: BTreeMap<u64, View>,
}

impl AcceptorState {
    fn replay(records: Vec<LogRecord>, me: HostID) -> Self {
        let mut state = AcceptorState::default();
        for record in records {
            match record {
                LogRecord::Promised { n } => {
                    state.n_h = n;
                }
                LogRecord::Accepted { instance: _, n, value } => {
                    state.n_a = n;
                    state.v_a = Some(value);
                }
                LogRecord::Decided { instance, value } => {
                    state.values.insert(instance, value);
                    if instance > state.instance_h {
                        state.instance_h = instance;
                    }
                    state.reset_ballots(me);
                }
            }
        }
        state
    }

    fn reset_ballots(&mut self, me: HostID) {
        self.n_h = Ballot { number: 0, leader: me };
        self.n_a = Ballot { number: 0, leader: me };
        self.v_a = None;
    }
}

/// One node's acceptor.
pub struct Acceptor {
    me: HostID,
    state: Mutex<(AcceptorState, DurableLog)>,
    learner: OnceLock<Arc<dyn Learner>>,
}

impl Acceptor {
    /// Open the acceptor, replaying its log from `root`.  `bootstrap` is the very first node's
    /// initial view; it is logged as instance 1 before anything is served, and only when the log
    /// is empty.
    pub fn open<P: AsRef<Path>>(
        me: HostID,
        root: P,
        bootstrap: Option<View>,
    ) -> Result<Arc<Self>, Error> {
        let (mut log, records) = DurableLog::open(root)?;
        let fresh = records.is_empty();
        let mut state = AcceptorState::replay(records, me);
        if fresh && state.instance_h == 0 {
            if let Some(view) = bootstrap {
                log.append(&LogRecord::Decided {
                    instance: 1,
                    value: view.clone(),
                })?;
                state.values.insert(1, view);
                state.instance_h = 1;
            }
        }
        clue!(COLLECTOR, INFO, {
            acceptor_open: {
                instance_h: state.instance_h,
            },
        });
        Ok(Arc::new(Self {
            me,
            state: Mutex::new((state, log)),
            learner: OnceLock::new(),
        }))
    }

    /// Wire up the learner.  Must happen before any RPC surface is served.
    pub fn set_learner(&self, learner: Arc<dyn Learner>) {
        if self.learner.set(learner).is_err() {
            panic!("acceptor learner may only be set once");
        }
    }

    /// The highest ballot this acceptor has promised.
    pub fn highest_promised(&self) -> Ballot {
        let guard = self.state.lock().unwrap();
        guard.0.n_h.clone()
    }

    /// The highest decided instance.
    pub fn instance_high(&self) -> u64 {
        let guard = self.state.lock().unwrap();
        guard.0.instance_h
    }

    /// The decided value for an instance, if this acceptor knows it.
    pub fn value(&self, instance: u64) -> Option<View> {
        let guard = self.state.lock().unwrap();
        guard.0.values.get(&instance).cloned()
    }

    /// Every decided instance, in order.
    pub fn dump(&self) -> ViewLog {
        let guard = self.state.lock().unwrap();
        ViewLog {
            views: guard.0.values.values().cloned().collect(),
        }
    }

    /// Load a decided-view log wholesale, as a joining node does.  No upcalls are made; the
    /// caller reads the views back out once this returns.
    pub fn restore(&self, log: &ViewLog) -> Result<(), Error> {
        let mut guard = self.state.lock().unwrap();
        let (state, wal) = &mut *guard;
        for view in &log.views {
            if state.values.contains_key(&view.vid) {
                continue;
            }
            wal.append(&LogRecord::Decided {
                instance: view.vid,
                value: view.clone(),
            })?;
            state.values.insert(view.vid, view.clone());
            if view.vid > state.instance_h {
                state.instance_h = view.vid;
                state.reset_ballots(self.me);
            }
        }
        Ok(())
    }

    /// Record that `instance` decided `value` and upcall the learner.  Idempotent: an instance at
    /// or below the high-water mark is a no-op.
    pub fn commit(&self, instance: u64, value: View) -> Result<(), Error> {
        let committed = {
            let mut guard = self.state.lock().unwrap();
            let (state, wal) = &mut *guard;
            if instance <= state.instance_h {
                false
            } else {
                COMMITS.click();
                wal.append(&LogRecord::Decided {
                    instance,
                    value: value.clone(),
                })?;
                state.values.insert(instance, value.clone());
                state.instance_h = instance;
                state.reset_ballots(self.me);
                true
            }
        };
        if committed {
            clue!(COLLECTOR, INFO, {
                commit: {
                    instance: instance,
                    view: indicio::Value::from(value.clone()),
                },
            });
            if let Some(learner) = self.learner.get() {
                learner.learned(instance, &value);
            }
        }
        Ok(())
    }
}

impl AcceptorService for Acceptor {
    fn prepare(&self, _: &Context, req: PrepareRequest) -> Result<PrepareResponse, Error> {
        PREPARES.click();
        let mut guard = self.state.lock().unwrap();
        let (state, wal) = &mut *guard;
        if req.instance <= state.instance_h {
            OLD_INSTANCE.click();
            return Ok(PrepareResponse {
                oldinstance: true,
                accept: false,
                n_a: state.n_a.clone(),
                v_a: state.values.get(&req.instance).cloned(),
            });
        }
        if req.n > state.n_h {
            PROMISES.click();
            state.n_h = req.n.clone();
            wal.append(&LogRecord::Promised { n: req.n })?;
            Ok(PrepareResponse {
                oldinstance: false,
                accept: true,
                n_a: state.n_a.clone(),
                v_a: state.v_a.clone(),
            })
        } else {
            Ok(PrepareResponse {
                oldinstance: false,
                accept: false,
                n_a: state.n_a.clone(),
                v_a: state.v_a.clone(),
            })
        }
    }

    fn accept(&self, _: &Context, req: AcceptRequest) -> Result<AcceptResponse, Error> {
        ACCEPTS.click();
        let mut guard = self.state.lock().unwrap();
        let (state, wal) = &mut *guard;
        if req.instance <= state.instance_h {
            return Ok(AcceptResponse { accepted: false });
        }
        if req.n >= state.n_h {
            ACCEPTED.click();
            state.n_a = req.n.clone();
            state.v_a = Some(req.v.clone());
            wal.append(&LogRecord::Accepted {
                instance: req.instance,
                n: req.n,
                value: req.v,
            })?;
            Ok(AcceptResponse { accepted: true })
        } else {
            Ok(AcceptResponse { accepted: false })
        }
    }

    fn decide(&self, _: &Context, req: DecideRequest) -> Result<DecideResponse, Error> {
        clue!(COLLECTOR, DEBUG, {
            decide: {
                instance: req.instance,
            },
        });
        self.commit(req.instance, req.v)?;
        Ok(DecideResponse {})
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rpc_pb::Host;

    use super::*;

    fn host_id(idx: u8) -> HostID {
        let mut id = [0u8; 16];
        id[15] = idx;
        HostID::new(id)
    }

    fn view(vid: u64, idxs: &[u8]) -> View {
        View {
            vid,
            members: idxs
                .iter()
                .map(|idx| Host::new(host_id(*idx), format!("127.0.0.1:{}", 8000 + *idx as u16)))
                .collect(),
        }
    }

    fn ballot(number: u64, idx: u8) -> Ballot {
        Ballot {
            number,
            leader: host_id(idx),
        }
    }

    fn tmpdir(name: &str) -> std::path::PathBuf {
        let path =
            std::env::temp_dir().join(format!("synod-acc-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    fn open(name: &str) -> Arc<Acceptor> {
        Acceptor::open(host_id(1), tmpdir(name), None).unwrap()
    }

    #[test]
    fn prepare_promises_higher_ballots_only() {
        let acc = open("promise");
        let ctx = Context::default();
        let resp = acc
            .prepare(
                &ctx,
                PrepareRequest {
                    instance: 1,
                    n: ballot(5, 2),
                },
            )
            .unwrap();
        assert!(resp.accept);
        // An equal ballot must be refused; only strictly higher ballots displace a promise.
        let resp = acc
            .prepare(
                &ctx,
                PrepareRequest {
                    instance: 1,
                    n: ballot(5, 2),
                },
            )
            .unwrap();
        assert!(!resp.oldinstance);
        assert!(!resp.accept);
        let resp = acc
            .prepare(
                &ctx,
                PrepareRequest {
                    instance: 1,
                    n: ballot(6, 2),
                },
            )
            .unwrap();
        assert!(resp.accept);
    }

    #[test]
    fn accept_requires_the_promised_ballot_or_better() {
        let acc = open("accept");
        let ctx = Context::default();
        acc.prepare(
            &ctx,
            PrepareRequest {
                instance: 1,
                n: ballot(5, 2),
            },
        )
        .unwrap();
        let resp = acc
            .accept(
                &ctx,
                AcceptRequest {
                    instance: 1,
                    n: ballot(4, 2),
                    v: view(1, &[1]),
                },
            )
            .unwrap();
        assert!(!resp.accepted);
        let resp = acc
            .accept(
                &ctx,
                AcceptRequest {
                    instance: 1,
                    n: ballot(5, 2),
                    v: view(1, &[1]),
                },
            )
            .unwrap();
        assert!(resp.accepted);
    }

    #[test]
    fn decided_instances_answer_oldinstance() {
        let acc = open("oldinstance");
        let ctx = Context::default();
        acc.commit(1, view(1, &[1])).unwrap();
        let resp = acc
            .prepare(
                &ctx,
                PrepareRequest {
                    instance: 1,
                    n: ballot(9, 2),
                },
            )
            .unwrap();
        assert!(resp.oldinstance);
        assert_eq!(Some(view(1, &[1])), resp.v_a);
    }

    #[test]
    fn commit_resets_ballots_and_survives_restart() {
        let root = tmpdir("restart");
        {
            let acc = Acceptor::open(host_id(1), &root, None).unwrap();
            let ctx = Context::default();
            acc.prepare(
                &ctx,
                PrepareRequest {
                    instance: 1,
                    n: ballot(7, 2),
                },
            )
            .unwrap();
            acc.commit(1, view(1, &[1, 2])).unwrap();
            assert_eq!(0, acc.highest_promised().number);
        }
        let acc = Acceptor::open(host_id(1), &root, None).unwrap();
        assert_eq!(1, acc.instance_high());
        assert_eq!(Some(view(1, &[1, 2])), acc.value(1));
        assert_eq!(0, acc.highest_promised().number);
    }

    #[test]
    fn bootstrap_logs_instance_one_exactly_once() {
        let root = tmpdir("bootstrap");
        {
            let acc = Acceptor::open(host_id(1), &root, Some(view(1, &[1]))).unwrap();
            assert_eq!(1, acc.instance_high());
        }
        let acc = Acceptor::open(host_id(1), &root, Some(view(1, &[1, 2]))).unwrap();
        assert_eq!(Some(view(1, &[1])), acc.value(1));
    }

    #[test]
    fn learner_hears_each_decision_once() {
        struct Tape {
            learned: Mutex<Vec<u64>>,
        }
        impl Learner for Tape {
            fn learned(&self, instance: u64, _: &View) {
                self.learned.lock().unwrap().push(instance);
            }
        }
        let acc = open("learner");
        let tape = Arc::new(Tape {
            learned: Mutex::new(Vec::new()),
        });
        acc.set_learner(Arc::clone(&tape) as Arc<dyn Learner>);
        acc.commit(1, view(1, &[1])).unwrap();
        acc.commit(1, view(1, &[1])).unwrap();
        acc.commit(2, view(2, &[1, 2])).unwrap();
        assert_eq!(vec![1, 2], *tape.learned.lock().unwrap());
    }
}
