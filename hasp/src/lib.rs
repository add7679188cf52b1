#![doc = include_str!("../README.md")]

use std::sync::Arc;

use biometrics::Collector;
use rpc_pb::Host;
use sync42::background::BackgroundThread;
use tatl::HeyListen;

use hasp_pb::{AcceptorServer, Error, LockServer, ReplicaServer, View};
use lazyrpc::{Connector, HandleCache, ServiceRegistry, DEFAULT_CALL_TIMEOUT};
use synod::Acceptor;

pub mod config;
pub mod lockmgr;
pub mod rsm;

pub use config::Config;
pub use lockmgr::{DirectLockService, LockManager, ReplicatedLocks};
pub use rsm::{Application, Rsm, RsmOptions};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    config::register_biometrics(collector);
    rsm::register_biometrics(collector);
    lockmgr::register_biometrics(collector);
}

/// Register the monitors for this crate.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    lockmgr::register_monitors(hey_listen);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

//////////////////////////////////////////// NodeOptions ///////////////////////////////////////////

/// Options for one hasp node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct NodeOptions {
    /// Where the acceptor log lives.
    #[cfg_attr(feature = "command_line", arrrg(required, "Data directory."))]
    pub data_dir: String,
    /// This node's identity and bind address.
    #[cfg_attr(
        feature = "command_line",
        arrrg(required, "This node, in host:ID=host:port format.")
    )]
    pub bind: Host,
    /// The cluster to join, or this node again to bootstrap a new cluster.
    #[cfg_attr(
        feature = "command_line",
        arrrg(required, "Seed node, in host:ID=host:port format.  Seed with --bind's value to bootstrap.")
    )]
    pub seed: Host,
    /// Replication knobs.
    #[cfg_attr(feature = "command_line", arrrg(nested))]
    pub rsm: RsmOptions,
}

impl NodeOptions {
    /// Set the data directory.
    pub fn with_data_dir(mut self, data_dir: &str) -> Self {
        data_dir.clone_into(&mut self.data_dir);
        self
    }

    /// Set the bind host.
    pub fn with_bind(mut self, bind: Host) -> Self {
        self.bind = bind;
        self
    }

    /// Set the seed host.
    pub fn with_seed(mut self, seed: Host) -> Self {
        self.seed = seed;
        self
    }

    /// Set the rsm options.
    pub fn with_rsm(mut self, rsm: RsmOptions) -> Self {
        self.rsm = rsm;
        self
    }
}

/////////////////////////////////////////////// Node ///////////////////////////////////////////////

/// One assembled hasp node: acceptor, view manager, state machine, lock manager, and their
/// background threads.  Dropping the node stops the threads.
pub struct Node {
    cfg: Arc<Config>,
    rsm: Arc<Rsm>,
    mgr: Arc<LockManager>,
    _threads: Vec<BackgroundThread>,
}

impl Node {
    /// Assemble a node and the service registry that serves it.  The caller plugs the registry
    /// into a transport (lazyrpc's server, or a loopback switchboard under test).
    pub fn new(
        options: NodeOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, ServiceRegistry), Error> {
        let me = options.bind.clone();
        // These handles carry the Paxos rounds; the rsm builds its own under the replication
        // deadline.
        let handles = Arc::new(HandleCache::new(Arc::clone(&connector), DEFAULT_CALL_TIMEOUT));
        // The very first node is its own seed and bootstraps view 1 = {me}; everyone else
        // arrives empty and joins through the seed.
        let bootstrap = if options.seed.host_id() == me.host_id() {
            Some(View {
                vid: 1,
                members: vec![me.clone()],
            })
        } else {
            None
        };
        let acceptor = Acceptor::open(me.host_id(), &options.data_dir, bootstrap)?;
        let cfg = Config::new(me.clone(), Arc::clone(&acceptor), handles);
        acceptor.set_learner(Arc::clone(&cfg) as Arc<dyn synod::Learner>);
        let rsm = Rsm::new(
            options.rsm.clone(),
            me,
            options.seed.clone(),
            Arc::clone(&cfg),
            Arc::clone(&connector),
        );
        cfg.subscribe(Arc::clone(&rsm) as Arc<dyn config::ViewChange>);
        let mgr = LockManager::new(Arc::clone(&rsm), connector);
        rsm.register_app(Arc::new(ReplicatedLocks::new(Arc::clone(&mgr))));
        let mut registry = ServiceRegistry::new();
        registry.register("AcceptorService", AcceptorServer::bind(acceptor));
        registry.register("ReplicaService", ReplicaServer::bind(Arc::clone(&rsm)));
        registry.register(
            "LockService",
            LockServer::bind(DirectLockService::new(Arc::clone(&mgr))),
        );
        let mut threads = rsm.start();
        threads.extend(mgr.start());
        Ok((
            Self {
                cfg,
                rsm,
                mgr,
                _threads: threads,
            },
            registry,
        ))
    }

    /// The view manager.
    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    /// The replicated state machine.
    pub fn rsm(&self) -> &Arc<Rsm> {
        &self.rsm
    }

    /// The lock manager.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.mgr
    }
}
