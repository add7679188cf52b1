//! Whole-protocol tests: acceptors behind a loopback switchboard, proposers driving rounds.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rpc_pb::{Context, Host, HostID};

use hasp_pb::{AcceptRequest, AcceptorServer, AcceptorService, Ballot, PrepareRequest, View};
use lazyrpc::loopback::Switchboard;
use lazyrpc::{HandleCache, ServiceRegistry, DEFAULT_CALL_TIMEOUT};
use synod::{Acceptor, Learner, Proposer};

fn host(idx: u8) -> Host {
    let mut id = [0u8; 16];
    id[15] = idx;
    Host::new(HostID::new(id), format!("127.0.0.1:{}", 8000 + idx as u16))
}

fn view(vid: u64, idxs: &[u8]) -> View {
    View {
        vid,
        members: idxs.iter().map(|idx| host(*idx)).collect(),
    }
}

fn tmpdir(name: &str, idx: u8) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "synod-consensus-{}-{}-{}",
        name,
        idx,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&path);
    path
}

#[derive(Default)]
struct Tape {
    learned: Mutex<Vec<(u64, View)>>,
}

impl Learner for Tape {
    fn learned(&self, instance: u64, view: &View) {
        self.learned.lock().unwrap().push((instance, view.clone()));
    }
}

struct Cluster {
    board: Switchboard,
    hosts: Vec<Host>,
    acceptors: Vec<Arc<Acceptor>>,
    tapes: Vec<Arc<Tape>>,
}

impl Cluster {
    fn new(name: &str, count: u8) -> Self {
        let board = Switchboard::new();
        let mut hosts = Vec::new();
        let mut acceptors = Vec::new();
        let mut tapes = Vec::new();
        for idx in 1..=count {
            let h = host(idx);
            let acc = Acceptor::open(h.host_id(), tmpdir(name, idx), None).unwrap();
            let tape = Arc::new(Tape::default());
            acc.set_learner(Arc::clone(&tape) as Arc<dyn Learner>);
            let mut registry = ServiceRegistry::new();
            registry.register("AcceptorService", AcceptorServer::bind(Arc::clone(&acc)));
            board.plug(&h, Arc::new(registry));
            hosts.push(h);
            acceptors.push(acc);
            tapes.push(tape);
        }
        Self {
            board,
            hosts,
            acceptors,
            tapes,
        }
    }

    fn proposer(&self, idx: usize) -> Proposer {
        let handles = Arc::new(HandleCache::new(
            Arc::new(self.board.clone()),
            DEFAULT_CALL_TIMEOUT,
        ));
        Proposer::new(
            self.hosts[idx].clone(),
            Arc::clone(&self.acceptors[idx]),
            handles,
        )
    }
}

#[test]
fn one_round_reaches_every_acceptor() {
    let cluster = Cluster::new("basic", 3);
    let proposer = cluster.proposer(0);
    let v = view(1, &[1, 2, 3]);
    assert!(proposer.run(1, &cluster.hosts, v.clone()).unwrap());
    // The proposer committed locally and fire-and-forgot the decide; wait for it to land.
    for _ in 0..100 {
        if cluster.acceptors.iter().all(|acc| acc.value(1).is_some()) {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    for acc in &cluster.acceptors {
        assert_eq!(Some(v.clone()), acc.value(1));
    }
    assert_eq!(vec![(1, v)], *cluster.tapes[0].learned.lock().unwrap());
}

#[test]
fn decided_instance_is_adopted_not_overwritten() {
    let cluster = Cluster::new("adopt", 3);
    let first = cluster.proposer(0);
    let v1 = view(1, &[1, 2, 3]);
    assert!(first.run(1, &cluster.hosts, v1.clone()).unwrap());
    let second = cluster.proposer(1);
    let v2 = view(1, &[2]);
    // The instance is already decided; the round reports failure and adopts the decision.
    assert!(!second.run(1, &cluster.hosts, v2).unwrap());
    assert_eq!(Some(v1), cluster.acceptors[1].value(1));
}

#[test]
fn previously_accepted_value_wins_over_the_proposed_one() {
    let cluster = Cluster::new("accepted", 3);
    let ctx = Context::default();
    // Seed acceptor 2 with an accepted-but-undecided value under a live ballot.  The ballot's
    // leader is BOTTOM so that the real proposer's first ballot supersedes it and the acceptor
    // stays in the prepare quorum.
    let n = Ballot {
        number: 1,
        leader: HostID::BOTTOM,
    };
    let seeded = view(1, &[1, 2]);
    cluster.acceptors[1]
        .prepare(&ctx, PrepareRequest { instance: 1, n: n.clone() })
        .unwrap();
    let resp = cluster.acceptors[1]
        .accept(
            &ctx,
            AcceptRequest {
                instance: 1,
                n,
                v: seeded.clone(),
            },
        )
        .unwrap();
    assert!(resp.accepted);
    let proposer = cluster.proposer(0);
    assert!(proposer.run(1, &cluster.hosts, view(1, &[1, 2, 3])).unwrap());
    assert_eq!(Some(seeded), cluster.acceptors[0].value(1));
}

#[test]
fn rounds_survive_a_minority_of_dead_acceptors() {
    let cluster = Cluster::new("minority", 3);
    cluster.board.kill(cluster.hosts[2].host_id());
    let proposer = cluster.proposer(0);
    let v = view(1, &[1, 2, 3]);
    assert!(proposer.run(1, &cluster.hosts, v.clone()).unwrap());
    assert_eq!(Some(v), cluster.acceptors[1].value(1));
}

#[test]
fn rounds_fail_without_a_quorum() {
    let cluster = Cluster::new("quorum", 3);
    cluster.board.kill(cluster.hosts[1].host_id());
    cluster.board.kill(cluster.hosts[2].host_id());
    let proposer = cluster.proposer(0);
    assert!(!proposer.run(1, &cluster.hosts, view(1, &[1, 2, 3])).unwrap());
    assert_eq!(None, cluster.acceptors[0].value(1));
}

#[test]
fn duelling_proposers_agree() {
    let cluster = Cluster::new("duel", 3);
    let v1 = view(1, &[1, 2, 3]);
    let v2 = view(1, &[1, 2]);
    let p1 = cluster.proposer(0);
    let p2 = cluster.proposer(1);
    let hosts1 = cluster.hosts.clone();
    let hosts2 = cluster.hosts.clone();
    let t1 = {
        let v1 = v1.clone();
        std::thread::spawn(move || p1.run(1, &hosts1, v1).unwrap())
    };
    let t2 = {
        let v2 = v2.clone();
        std::thread::spawn(move || p2.run(1, &hosts2, v2).unwrap())
    };
    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();
    // Between jitter, ballot ordering, and oldinstance adoption, at least one round drives a
    // decision; retry if the duel left the instance undecided this time around.
    let mut decided_somewhere = r1 || r2;
    for _ in 0..10 {
        if decided_somewhere {
            break;
        }
        decided_somewhere = cluster.proposer(0).run(1, &cluster.hosts, v1.clone()).unwrap();
    }
    assert!(decided_somewhere);
    for _ in 0..100 {
        if cluster.acceptors.iter().all(|acc| acc.value(1).is_some()) {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    let decided = cluster.acceptors[0].value(1).unwrap();
    for acc in &cluster.acceptors {
        assert_eq!(Some(decided.clone()), acc.value(1));
    }
}

#[test]
fn consecutive_instances_decide_independently() {
    let cluster = Cluster::new("instances", 3);
    let proposer = cluster.proposer(0);
    let v1 = view(1, &[1]);
    let v2 = view(2, &[1, 2]);
    assert!(proposer.run(1, &cluster.hosts, v1.clone()).unwrap());
    assert!(proposer.run(2, &cluster.hosts, v2.clone()).unwrap());
    assert_eq!(Some(v1), cluster.acceptors[0].value(1));
    assert_eq!(Some(v2), cluster.acceptors[0].value(2));
    assert_eq!(2, cluster.acceptors[0].instance_high());
}
