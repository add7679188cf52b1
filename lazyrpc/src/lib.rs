#![doc = include_str!("../README.md")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biometrics::{Collector, Counter};
use rpc_pb::{Host, HostID};

mod client;
mod server;
mod wire;

pub mod builtins;
pub mod loopback;

pub use client::{ClientOptions, TcpClient, TcpConnector};
pub use server::{Server, ServerOptions, ServiceRegistry};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The deadline applied to a call when the caller doesn't say otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(1_000);

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static HANDLE_BOUND: Counter = Counter::new("lazyrpc.handle.bound");
static HANDLE_BANISHED: Counter = Counter::new("lazyrpc.handle.banished");

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&HANDLE_BOUND);
    collector.register_counter(&HANDLE_BANISHED);
    client::register_biometrics(collector);
    server::register_biometrics(collector);
    loopback::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// Connector ////////////////////////////////////////////

/// A Connector mints rpc_pb clients for hosts.  The transport owns connection establishment and
/// per-call deadlines; everything above it deals in `Arc<dyn Client>`.
pub trait Connector: Send + Sync + 'static {
    /// Create a client for the host whose calls observe the provided deadline.
    fn connect(
        &self,
        host: &Host,
        timeout: Duration,
    ) -> Result<Arc<dyn rpc_pb::Client + Send + Sync + 'static>, rpc_pb::Error>;
}

//////////////////////////////////////////// HandleCache ///////////////////////////////////////////

/// A HandleCache lazily binds one client per host and caches it.  A caller that sees a transport
/// failure banishes the handle; the next lookup rebinds.  An unbindable or banished host is how
/// the layers above notice a dead member.
pub struct HandleCache {
    connector: Arc<dyn Connector>,
    timeout: Duration,
    handles: Mutex<HashMap<HostID, Arc<dyn rpc_pb::Client + Send + Sync + 'static>>>,
}

impl HandleCache {
    /// Create a new cache whose handles observe `timeout` on every call.
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self {
            connector,
            timeout,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// The connector this cache binds through.
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// The cached client for the host, binding it first if need be.
    pub fn lookup(
        &self,
        host: &Host,
    ) -> Result<Arc<dyn rpc_pb::Client + Send + Sync + 'static>, rpc_pb::Error> {
        {
            let handles = self.handles.lock().unwrap();
            if let Some(client) = handles.get(&host.host_id()) {
                return Ok(Arc::clone(client));
            }
        }
        let client = self.connector.connect(host, self.timeout)?;
        HANDLE_BOUND.click();
        let mut handles = self.handles.lock().unwrap();
        Ok(Arc::clone(
            handles.entry(host.host_id()).or_insert(client),
        ))
    }

    /// Drop the cached client for the host.  Call this after a transport failure.
    pub fn banish(&self, host: HostID) {
        let mut handles = self.handles.lock().unwrap();
        if handles.remove(&host).is_some() {
            HANDLE_BANISHED.click();
        }
    }
}
