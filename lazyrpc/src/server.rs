//! The server half: a TcpListener, one thread per accepted connection, requests dispatched
//! through a [ServiceRegistry].

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable};
use indicio::{clue, DEBUG, WARNING};
use rpc_pb::{Context, Host, Request, Response, Status};
use sync42::background::BackgroundThread;
use zerror_core::ErrorCore;

use super::wire::{recv_msg, send_msg};
use super::{builtins, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CONNECTIONS: Counter = Counter::new("lazyrpc.server.connections");
static REQUESTS: Counter = Counter::new("lazyrpc.server.requests");
static REQUEST_ERRORS: Counter = Counter::new("lazyrpc.server.request.errors");
static UNKNOWN_SERVER_NAME: Counter = Counter::new("lazyrpc.server.unknown_server_name");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CONNECTIONS);
    collector.register_counter(&REQUESTS);
    collector.register_counter(&REQUEST_ERRORS);
    collector.register_counter(&UNKNOWN_SERVER_NAME);
}

////////////////////////////////////////// ServiceRegistry /////////////////////////////////////////

/// ServiceRegistry maps servers by name.  A new registry always carries the builtins.
pub struct ServiceRegistry {
    services: HashMap<&'static str, Box<dyn rpc_pb::Server + Send + Sync + 'static>>,
}

impl ServiceRegistry {
    /// Create a new ServiceRegistry.
    pub fn new() -> Self {
        let mut services = Self {
            services: HashMap::new(),
        };
        // Once under the name the generated client dials, once under the traditional one.
        services.register(
            "Builtin",
            builtins::BuiltinServer::bind(builtins::BuiltinService::new()),
        );
        services.register(
            "__builtins__",
            builtins::BuiltinServer::bind(builtins::BuiltinService::new()),
        );
        services
    }

    /// Register the server with this ServiceRegistry.
    pub fn register<S: rpc_pb::Server + Send + Sync + 'static>(
        &mut self,
        service: &'static str,
        server: S,
    ) {
        if self.services.contains_key(service) {
            panic!("cannot add the same service twice");
        }
        self.services.insert(service, Box::new(server));
    }

    /// Get the server registered under `service`.
    pub fn get_server(&self, service: &str) -> Option<&(dyn rpc_pb::Server + Send + Sync)> {
        self.services.get(service).map(|s| s.as_ref())
    }

    /// Dispatch one request and construct the response bytes for it.
    pub fn dispatch(&self, req_buf: &[u8]) -> Result<Vec<u8>, rpc_pb::Error> {
        REQUESTS.click();
        let req = Request::unpack(req_buf)?.0;
        let ctx = Context::from(&req);
        let status: Status = match self.get_server(req.service) {
            Some(server) => server.call(&ctx, req.method, req.body),
            None => {
                UNKNOWN_SERVER_NAME.click();
                Err(rpc_pb::Error::UnknownServerName {
                    core: ErrorCore::default(),
                    name: req.service.to_string(),
                })
            }
        };
        if status.is_err() {
            REQUEST_ERRORS.click();
        }
        let err_buf: Vec<u8>;
        let (body, service_error, rpc_error) = match &status {
            Ok(Ok(body)) => {
                let body: &[u8] = body;
                (Some(body), None, None)
            }
            Ok(Err(err)) => {
                let err: &[u8] = err;
                (None, Some(err), None)
            }
            Err(err) => {
                err_buf = stack_pack(err).to_vec();
                let err_buf: &[u8] = &err_buf;
                (None, None, Some(err_buf))
            }
        };
        let resp = Response {
            seq_no: req.seq_no,
            trace: req.trace,
            body,
            service_error,
            rpc_error,
        };
        Ok(stack_pack(resp).to_vec())
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/////////////////////////////////////////// ServerOptions //////////////////////////////////////////

/// lazyrpc server options.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct ServerOptions {
    /// Bind-to this host.
    #[cfg_attr(
        feature = "command_line",
        arrrg(required, "Host to bind to in host:ID=host:port format.")
    )]
    pub bind_to: Host,
}

impl ServerOptions {
    /// Set the bind-to host.
    pub fn with_bind_to(mut self, bind_to: Host) -> Self {
        self.bind_to = bind_to;
        self
    }
}

////////////////////////////////////////////// Server //////////////////////////////////////////////

/// A listening lazyrpc server.  Binds at construction; serves on demand.
pub struct Server {
    listener: TcpListener,
    registry: Arc<ServiceRegistry>,
}

impl Server {
    /// Bind the server.
    pub fn new(options: ServerOptions, registry: ServiceRegistry) -> Result<Self, rpc_pb::Error> {
        let addr = options
            .bind_to
            .connect()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| rpc_pb::Error::resolve_failure("bind address resolved to nothing"))?;
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            registry: Arc::new(registry),
        })
    }

    /// The address the server actually bound, for bind-to-port-zero callers.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, rpc_pb::Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve forever on the calling thread.
    pub fn serve(&self) -> Result<(), rpc_pb::Error> {
        loop {
            let (stream, _) = self.listener.accept()?;
            CONNECTIONS.click();
            let registry = Arc::clone(&self.registry);
            std::thread::spawn(move || serve_connection(registry, stream));
        }
    }

    /// Serve on a background thread until the thread is dropped.
    pub fn spawn(self) -> Result<BackgroundThread, rpc_pb::Error> {
        self.listener.set_nonblocking(true)?;
        Ok(BackgroundThread::spawn(move |done| {
            while !done.load(Ordering::Relaxed) {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        CONNECTIONS.click();
                        if stream.set_nonblocking(false).is_err() {
                            continue;
                        }
                        let registry = Arc::clone(&self.registry);
                        std::thread::spawn(move || serve_connection(registry, stream));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(err) => {
                        clue!(COLLECTOR, WARNING, {
                            accept_error: err.to_string(),
                        });
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        }))
    }
}

fn serve_connection(registry: Arc<ServiceRegistry>, mut stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    loop {
        let req_buf = match recv_msg(&mut stream) {
            Ok(Some(req_buf)) => req_buf,
            Ok(None) => {
                clue!(COLLECTOR, DEBUG, {
                    disconnect: true,
                });
                return;
            }
            Err(err) => {
                clue!(COLLECTOR, WARNING, {
                    recv_error: format!("{:?}", err),
                });
                return;
            }
        };
        let resp_buf = match registry.dispatch(&req_buf) {
            Ok(resp_buf) => resp_buf,
            Err(err) => {
                clue!(COLLECTOR, WARNING, {
                    dispatch_error: format!("{:?}", err),
                });
                return;
            }
        };
        if let Err(err) = send_msg(&mut stream, &resp_buf) {
            clue!(COLLECTOR, WARNING, {
                send_error: format!("{:?}", err),
            });
            return;
        }
    }
}
