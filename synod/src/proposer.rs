//! The proposer: drives one synod round over a node list.  One round in flight per node; a second
//! caller fails fast rather than queueing.  Any single RPC timeout is a negative vote; only the
//! lack of a majority fails the round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use biometrics::{Collector, Counter};
use guacamole::combinators::any;
use guacamole::Guacamole;
use indicio::{clue, ALWAYS, DEBUG, INFO};
use rpc_pb::{Context, Host};

use hasp_pb::{
    AcceptRequest, AcceptorService, Ballot, DecideRequest, Error, PrepareRequest, View,
};
use lazyrpc::HandleCache;

use super::acceptor::Acceptor;
use super::{COLLECTOR, MAX_JITTER_MS, MIN_JITTER_MS, PHASE_TIMEOUT};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ROUNDS: Counter = Counter::new("synod.proposer.rounds");
static ROUNDS_WON: Counter = Counter::new("synod.proposer.rounds.won");
static ROUNDS_BUSY: Counter = Counter::new("synod.proposer.rounds.busy");
static OLD_INSTANCE: Counter = Counter::new("synod.proposer.old_instance");
static NO_QUORUM: Counter = Counter::new("synod.proposer.no_quorum");
static PEER_FAILURES: Counter = Counter::new("synod.proposer.peer_failures");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&ROUNDS);
    collector.register_counter(&ROUNDS_WON);
    collector.register_counter(&ROUNDS_BUSY);
    collector.register_counter(&OLD_INSTANCE);
    collector.register_counter(&NO_QUORUM);
    collector.register_counter(&PEER_FAILURES);
}

//////////////////////////////////////////// Breakpoint ////////////////////////////////////////////

/// Process-exit points for failure-injection harnesses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Breakpoint {
    /// Exit between the prepare and accept phases.
    PostPrepare,
    /// Exit between the accept and decide phases.
    PostAccept,
}

////////////////////////////////////////////// Proposer ////////////////////////////////////////////

/// One node's proposer.
pub struct Proposer {
    me: Host,
    acceptor: Arc<Acceptor>,
    handles: Arc<HandleCache>,
    my_n: Mutex<Ballot>,
    running: Mutex<()>,
    break_post_prepare: AtomicBool,
    break_post_accept: AtomicBool,
}

impl Proposer {
    /// Create a proposer that proposes as `me` and adopts decisions into `acceptor`.
    pub fn new(me: Host, acceptor: Arc<Acceptor>, handles: Arc<HandleCache>) -> Self {
        let my_n = Ballot {
            number: 0,
            leader: me.host_id(),
        };
        Self {
            me,
            acceptor,
            handles,
            my_n: Mutex::new(my_n),
            running: Mutex::new(()),
            break_post_prepare: AtomicBool::new(false),
            break_post_accept: AtomicBool::new(false),
        }
    }

    /// Arm a breakpoint.  The next round through it exits the process.
    pub fn set_breakpoint(&self, breakpoint: Breakpoint) {
        match breakpoint {
            Breakpoint::PostPrepare => self.break_post_prepare.store(true, Ordering::Relaxed),
            Breakpoint::PostAccept => self.break_post_accept.store(true, Ordering::Relaxed),
        }
    }

    /// Run one synod round trying to decide `value` for `instance` among `nodes`.  Returns true
    /// if this round drove the decision; false if the round lost, stalled, or discovered the
    /// instance already decided (in which case the decision was adopted locally).
    pub fn run(&self, instance: u64, nodes: &[Host], value: View) -> Result<bool, Error> {
        ROUNDS.click();
        let _running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                ROUNDS_BUSY.click();
                clue!(COLLECTOR, DEBUG, {
                    already_running: instance,
                });
                return Ok(false);
            }
        };
        // Duelling proposers starve each other; a randomized delay keeps the duel short.
        let seed = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut guac = Guacamole::new(seed);
        let jitter = MIN_JITTER_MS + any::<u64>(&mut guac) % (MAX_JITTER_MS - MIN_JITTER_MS + 1);
        std::thread::sleep(Duration::from_millis(jitter));
        let n = {
            let mut my_n = self.my_n.lock().unwrap();
            let floor = std::cmp::max(self.acceptor.highest_promised().number, my_n.number);
            *my_n = Ballot {
                number: floor + 1,
                leader: self.me.host_id(),
            };
            my_n.clone()
        };
        clue!(COLLECTOR, INFO, {
            round: {
                instance: instance,
                n: indicio::Value::from(n.clone()),
                value: indicio::Value::from(value.clone()),
            },
        });

        // Prepare phase.
        let mut accepts: Vec<Host> = Vec::new();
        let mut max_n = Ballot::BOTTOM;
        let mut value = value;
        let prepare = {
            let n = n.clone();
            move |client: &hasp_pb::AcceptorClient, ctx: &Context| {
                client.prepare(
                    ctx,
                    PrepareRequest {
                        instance,
                        n: n.clone(),
                    },
                )
            }
        };
        for (node, resp) in self.fan_out(nodes, prepare) {
            let resp = match resp {
                Ok(resp) => resp,
                Err(_) => {
                    PEER_FAILURES.click();
                    self.handles.banish(node.host_id());
                    continue;
                }
            };
            if resp.oldinstance {
                OLD_INSTANCE.click();
                if let Some(v_a) = resp.v_a {
                    self.acceptor.commit(instance, v_a)?;
                }
                return Ok(false);
            }
            if resp.accept {
                accepts.push(node);
                if resp.n_a > max_n {
                    if let Some(v_a) = resp.v_a {
                        value = v_a;
                        max_n = resp.n_a;
                    }
                }
            }
        }
        if accepts.len() < quorum(nodes.len()) {
            NO_QUORUM.click();
            clue!(COLLECTOR, INFO, {
                no_quorum: {
                    phase: "prepare",
                    instance: instance,
                    accepts: accepts.len(),
                },
            });
            return Ok(false);
        }

        self.breakpoint(&self.break_post_prepare);

        // Accept phase, restricted to the acceptors that promised.
        let mut accepted: Vec<Host> = Vec::new();
        let accept = {
            let n = n.clone();
            let value = value.clone();
            move |client: &hasp_pb::AcceptorClient, ctx: &Context| {
                client.accept(
                    ctx,
                    AcceptRequest {
                        instance,
                        n: n.clone(),
                        v: value.clone(),
                    },
                )
            }
        };
        for (node, resp) in self.fan_out(&accepts, accept) {
            match resp {
                Ok(resp) if resp.accepted => accepted.push(node),
                Ok(_) => {}
                Err(_) => {
                    PEER_FAILURES.click();
                    self.handles.banish(node.host_id());
                }
            }
        }
        if accepted.len() < quorum(nodes.len()) {
            NO_QUORUM.click();
            clue!(COLLECTOR, INFO, {
                no_quorum: {
                    phase: "accept",
                    instance: instance,
                    accepts: accepted.len(),
                },
            });
            return Ok(false);
        }

        self.breakpoint(&self.break_post_accept);

        // Decide phase: commit locally, then teach the acceptors that voted.
        self.acceptor.commit(instance, value.clone())?;
        for node in accepted {
            if node.host_id() == self.me.host_id() {
                continue;
            }
            let handles = Arc::clone(&self.handles);
            let value = value.clone();
            std::thread::spawn(move || {
                let ctx = Context::default();
                if let Ok(client) = handles.lookup(&node) {
                    let client = hasp_pb::AcceptorClient::new(client);
                    let _ = client.decide(&ctx, DecideRequest { instance, v: value });
                }
            });
        }
        ROUNDS_WON.click();
        Ok(true)
    }

    /// Call `f` against every node concurrently and collect what answers within the phase
    /// timeout.  A node that misses the deadline simply doesn't appear in the result.
    fn fan_out<T, F>(&self, nodes: &[Host], f: F) -> Vec<(Host, Result<T, Error>)>
    where
        T: Send + 'static,
        F: Fn(&hasp_pb::AcceptorClient, &Context) -> Result<T, Error> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let f = Arc::new(f);
        for node in nodes {
            let node = node.clone();
            let handles = Arc::clone(&self.handles);
            let f = Arc::clone(&f);
            let tx = tx.clone();
            std::thread::spawn(move || {
                let ctx = Context::default();
                let resp = match handles.lookup(&node) {
                    Ok(client) => (*f)(&hasp_pb::AcceptorClient::new(client), &ctx),
                    Err(err) => Err(err.into()),
                };
                let _ = tx.send((node, resp));
            });
        }
        drop(tx);
        let deadline = Instant::now() + PHASE_TIMEOUT;
        let mut results = Vec::with_capacity(nodes.len());
        while results.len() < nodes.len() {
            let remain = match deadline.checked_duration_since(Instant::now()) {
                Some(remain) => remain,
                None => break,
            };
            match rx.recv_timeout(remain) {
                Ok(result) => results.push(result),
                Err(_) => break,
            }
        }
        results
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

fn quorum(nodes: usize) -> usize {
    nodes / 2 + 1
}
