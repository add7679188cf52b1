//! An in-process transport for tests: every host is a [ServiceRegistry] plugged into a shared
//! switchboard, and calls dispatch on the caller's thread.  Killing a host makes every call to it
//! fail the way a timed-out socket would, which is all the failure detection above this layer
//! ever sees.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biometrics::{Collector, Counter};
use rpc_pb::{Context, Host, HostID, Status};
use zerror_core::ErrorCore;

use super::{Connector, ServiceRegistry};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CALLS: Counter = Counter::new("lazyrpc.loopback.calls");
static UNREACHABLE: Counter = Counter::new("lazyrpc.loopback.unreachable");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CALLS);
    collector.register_counter(&UNREACHABLE);
}

//////////////////////////////////////////// Switchboard ///////////////////////////////////////////

struct Port {
    registry: Arc<ServiceRegistry>,
    up: bool,
}

/// The switchboard itself.  Clones share one set of ports.
#[derive(Clone, Default)]
pub struct Switchboard {
    ports: Arc<Mutex<HashMap<HostID, Port>>>,
    caller: Option<HostID>,
}

impl Switchboard {
    /// Create an empty switchboard.
    pub fn new() -> Self {
        Self::default()
    }

    /// A view of the switchboard whose outgoing calls come from `caller`.  Killing a host then
    /// cuts it off in both directions: nothing reaches it, and nothing it says reaches anyone.
    pub fn bound(&self, caller: HostID) -> Self {
        Self {
            ports: Arc::clone(&self.ports),
            caller: Some(caller),
        }
    }

    /// Plug a host into the switchboard.  Replaces any previous registry for the host.
    pub fn plug(&self, host: &Host, registry: Arc<ServiceRegistry>) {
        let mut ports = self.ports.lock().unwrap();
        ports.insert(host.host_id(), Port { registry, up: true });
    }

    /// Make every call to the host fail until it is revived.
    pub fn kill(&self, host: HostID) {
        let mut ports = self.ports.lock().unwrap();
        if let Some(port) = ports.get_mut(&host) {
            port.up = false;
        }
    }

    /// Undo a kill.
    pub fn revive(&self, host: HostID) {
        let mut ports = self.ports.lock().unwrap();
        if let Some(port) = ports.get_mut(&host) {
            port.up = true;
        }
    }

    fn registry(&self, host: HostID) -> Option<Arc<ServiceRegistry>> {
        let ports = self.ports.lock().unwrap();
        if let Some(caller) = self.caller {
            match ports.get(&caller) {
                Some(port) if port.up => {}
                _ => {
                    return None;
                }
            }
        }
        match ports.get(&host) {
            Some(port) if port.up => Some(Arc::clone(&port.registry)),
            _ => None,
        }
    }
}

impl Connector for Switchboard {
    fn connect(
        &self,
        host: &Host,
        _: Duration,
    ) -> Result<Arc<dyn rpc_pb::Client + Send + Sync + 'static>, rpc_pb::Error> {
        Ok(Arc::new(LoopbackClient {
            board: self.clone(),
            target: host.host_id(),
        }))
    }
}

////////////////////////////////////////// LoopbackClient //////////////////////////////////////////

/// A client for one host on the switchboard.
pub struct LoopbackClient {
    board: Switchboard,
    target: HostID,
}

impl rpc_pb::Client for LoopbackClient {
    fn call(&self, ctx: &Context, server: &str, method: &str, req: &[u8]) -> Status {
        CALLS.click();
        let registry = match self.board.registry(self.target) {
            Some(registry) => registry,
            None => {
                UNREACHABLE.click();
                return Err(rpc_pb::Error::TransportFailure {
                    core: ErrorCore::default(),
                    what: "host unreachable".to_owned(),
                });
            }
        };
        match registry.get_server(server) {
            Some(s) => s.call(ctx, method, req),
            None => Err(rpc_pb::Error::UnknownServerName {
                core: ErrorCore::default(),
                name: server.to_string(),
            }),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
