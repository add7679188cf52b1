//! The view manager: the ordered history of membership views, each decided by one Paxos
//! instance.  The decided-instance log lives in the acceptor; this layer proposes new views,
//! answers membership queries, and relays committed views upward to the replicated state machine.

use std::sync::{Arc, OnceLock};

use biometrics::{Collector, Counter};
use indicio::{clue, INFO};
use rpc_pb::{Host, HostID};

use hasp_pb::{Error, View, ViewLog};
use lazyrpc::HandleCache;
use synod::{Acceptor, Learner, Proposer};

use super::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ADDS: Counter = Counter::new("hasp.config.adds");
static REMOVES: Counter = Counter::new("hasp.config.removes");
static VIEWS_COMMITTED: Counter = Counter::new("hasp.config.views_committed");
static RESTORES: Counter = Counter::new("hasp.config.restores");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&ADDS);
    collector.register_counter(&REMOVES);
    collector.register_counter(&VIEWS_COMMITTED);
    collector.register_counter(&RESTORES);
}

///////////////////////////////////////////// ViewChange ///////////////////////////////////////////

/// Whoever wants to hear that a new view committed.  Called with no config locks held.
pub trait ViewChange: Send + Sync + 'static {
    /// The view at `vid` is now the current view.
    fn commit_change(&self, vid: u64);
}

////////////////////////////////////////////// Config //////////////////////////////////////////////

/// One node's view manager.
pub struct Config {
    me: Host,
    acceptor: Arc<Acceptor>,
    proposer: Proposer,
    subscriber: OnceLock<Arc<dyn ViewChange>>,
}

impl Config {
    /// Create a config over the acceptor.  The caller must follow up with
    /// `acceptor.set_learner(config)` so committed instances flow back here.
    pub fn new(me: Host, acceptor: Arc<Acceptor>, handles: Arc<HandleCache>) -> Arc<Self> {
        let proposer = Proposer::new(me.clone(), Arc::clone(&acceptor), handles);
        Arc::new(Self {
            me,
            acceptor,
            proposer,
            subscriber: OnceLock::new(),
        })
    }

    /// Wire up the layer above.  Must happen before any RPC surface is served.
    pub fn subscribe(&self, subscriber: Arc<dyn ViewChange>) {
        if self.subscriber.set(subscriber).is_err() {
            panic!("config subscriber may only be set once");
        }
    }

    /// This node's identity.
    pub fn me(&self) -> &Host {
        &self.me
    }

    /// The proposer, for arming breakpoints.
    pub fn proposer(&self) -> &Proposer {
        &self.proposer
    }

    /// The current view's id.
    pub fn current_vid(&self) -> u64 {
        self.acceptor.instance_high()
    }

    /// The view decided at `vid`.
    pub fn view(&self, vid: u64) -> Option<View> {
        self.acceptor.value(vid)
    }

    /// The current view.
    pub fn current_view(&self) -> Option<View> {
        self.view(self.current_vid())
    }

    /// The view before the current one.
    pub fn previous_view(&self) -> Option<View> {
        let vid = self.current_vid();
        if vid <= 1 {
            None
        } else {
            self.view(vid - 1)
        }
    }

    /// Is the host a member of the current view.
    pub fn is_member(&self, host: HostID) -> bool {
        self.current_view().map_or(false, |v| v.is_member(host))
    }

    /// Propose the current view plus `host` at the next instance.  Returns true if this node's
    /// round drove the decision; the caller must re-check membership either way, because a
    /// competing proposer may have decided the instance differently.
    pub fn add(&self, host: Host) -> Result<bool, Error> {
        ADDS.click();
        let Some(cur) = self.current_view() else {
            return Ok(false);
        };
        if cur.is_member(host.host_id()) {
            return Ok(true);
        }
        let mut members = cur.members.clone();
        members.push(host.clone());
        let candidate = View {
            vid: cur.vid + 1,
            members,
        };
        clue!(COLLECTOR, INFO, {
            add: {
                host: indicio::Value::from(host),
                candidate: indicio::Value::from(candidate.clone()),
            },
        });
        self.proposer.run(cur.vid + 1, &cur.members, candidate)
    }

    /// Propose the current view minus `host` at the next instance.  Same caveats as [Config::add].
    pub fn remove(&self, host: HostID) -> Result<bool, Error> {
        REMOVES.click();
        let Some(cur) = self.current_view() else {
            return Ok(false);
        };
        if !cur.is_member(host) {
            return Ok(true);
        }
        let members: Vec<Host> = cur
            .members
            .iter()
            .filter(|m| m.host_id() != host)
            .cloned()
            .collect();
        let candidate = View {
            vid: cur.vid + 1,
            members,
        };
        clue!(COLLECTOR, INFO, {
            remove: {
                host: host.prefix_free_readable(),
                candidate: indicio::Value::from(candidate.clone()),
            },
        });
        self.proposer.run(cur.vid + 1, &cur.members, candidate)
    }

    /// The decided-view log, for shipping to a joiner.
    pub fn dump(&self) -> ViewLog {
        self.acceptor.dump()
    }

    /// Load a decided-view log wholesale, then tell the layer above where we landed.
    pub fn restore(&self, log: &ViewLog) -> Result<(), Error> {
        RESTORES.click();
        self.acceptor.restore(log)?;
        if let Some(subscriber) = self.subscriber.get() {
            subscriber.commit_change(self.current_vid());
        }
        Ok(())
    }
}

impl Learner for Config {
    fn learned(&self, instance: u64, view: &View) {
        VIEWS_COMMITTED.click();
        clue!(COLLECTOR, INFO, {
            view_committed: {
                vid: instance,
                view: indicio::Value::from(view.clone()),
            },
        });
        if let Some(subscriber) = self.subscriber.get() {
            subscriber.commit_change(instance);
        }
    }
}
