//! The client half: one TCP connection per handle, bound lazily, one outstanding call at a time.
//! A failed call tears the connection down so the next call rebinds.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable, Unpacker};
use rpc_pb::{Context, Host, Request, Response, Status};
use zerror_core::ErrorCore;

use super::wire::{recv_msg, send_msg};
use super::Connector;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CONNECT: Counter = Counter::new("lazyrpc.client.connect");
static CALLS: Counter = Counter::new("lazyrpc.client.calls");
static CALL_ERRORS: Counter = Counter::new("lazyrpc.client.call.errors");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CONNECT);
    collector.register_counter(&CALLS);
    collector.register_counter(&CALL_ERRORS);
}

/////////////////////////////////////////// ClientOptions //////////////////////////////////////////

/// lazyrpc client options.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct ClientOptions {
    /// Connection-establishment deadline, milliseconds.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Connection-establishment deadline in milliseconds.")
    )]
    pub connect_timeout_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1_000,
        }
    }
}

impl ClientOptions {
    /// Set the connect timeout.
    pub fn with_connect_timeout_ms(mut self, connect_timeout_ms: u64) -> Self {
        self.connect_timeout_ms = connect_timeout_ms;
        self
    }
}

///////////////////////////////////////////// TcpClient ////////////////////////////////////////////

/// One host's client.  The connection binds on first call and sticks around until a call fails.
pub struct TcpClient {
    target: Host,
    options: ClientOptions,
    call_timeout: Duration,
    sequencer: AtomicU64,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpClient {
    /// Create a client for `target`; calls observe `call_timeout`.
    pub fn new(target: Host, options: ClientOptions, call_timeout: Duration) -> Self {
        Self {
            target,
            options,
            call_timeout,
            sequencer: AtomicU64::new(1),
            stream: Mutex::new(None),
        }
    }

    fn bind(&self) -> Result<TcpStream, rpc_pb::Error> {
        CONNECT.click();
        let addr = self
            .target
            .connect()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| rpc_pb::Error::resolve_failure("connect address resolved to nothing"))?;
        let stream = TcpStream::connect_timeout(&addr, Duration::from_millis(
            self.options.connect_timeout_ms,
        ))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.call_timeout))?;
        stream.set_write_timeout(Some(self.call_timeout))?;
        Ok(stream)
    }

    fn call_on_stream(
        &self,
        stream: &mut TcpStream,
        req_buf: &[u8],
    ) -> Result<Vec<u8>, rpc_pb::Error> {
        send_msg(stream, req_buf)?;
        recv_msg(stream)?.ok_or_else(|| rpc_pb::Error::TransportFailure {
            core: ErrorCore::default(),
            what: "connection closed mid-call".to_owned(),
        })
    }
}

impl rpc_pb::Client for TcpClient {
    fn call(&self, ctx: &Context, server: &str, method: &str, req: &[u8]) -> Status {
        CALLS.click();
        let seq_no = self.sequencer.fetch_add(1, Ordering::Relaxed);
        let req = Request {
            service: server,
            method,
            seq_no,
            body: req,
            caller: ctx.clients(),
            trace: ctx.trace_id(),
        };
        let req_buf = stack_pack(req).to_vec();
        let mut guard = self.stream.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.bind()?);
        }
        let stream = guard.as_mut().unwrap();
        let resp_buf = match self.call_on_stream(stream, &req_buf) {
            Ok(resp_buf) => resp_buf,
            Err(err) => {
                CALL_ERRORS.click();
                // The connection may have a stale response in flight; never reuse it.
                *guard = None;
                return Err(err);
            }
        };
        let resp = match Response::unpack(&resp_buf) {
            Ok((resp, _)) => resp,
            Err(err) => {
                CALL_ERRORS.click();
                *guard = None;
                return Err(err.into());
            }
        };
        if resp.seq_no != seq_no {
            CALL_ERRORS.click();
            *guard = None;
            return Err(rpc_pb::Error::LogicError {
                core: ErrorCore::default(),
                what: "response sequence number does not match request".to_owned(),
            });
        }
        if let Some(rpc_error) = resp.rpc_error {
            let mut up = Unpacker::new(rpc_error);
            let rpc_error: rpc_pb::Error = match up.unpack() {
                Ok(rpc_error) => rpc_error,
                Err(unpack_error) => unpack_error.into(),
            };
            Err(rpc_error)
        } else if let Some(service_error) = resp.service_error {
            Ok(Err(service_error.to_vec()))
        } else if let Some(body) = resp.body {
            Ok(Ok(body.to_vec()))
        } else {
            Err(rpc_pb::Error::LogicError {
                core: ErrorCore::default(),
                what: "missing rpc_error, service_error, and body; at least one should be set"
                    .to_owned(),
            })
        }
    }
}

/////////////////////////////////////////// TcpConnector ///////////////////////////////////////////

/// Mints [TcpClient]s.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    options: ClientOptions,
}

impl TcpConnector {
    /// Create a connector that passes `options` to every client it mints.
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        host: &Host,
        timeout: Duration,
    ) -> Result<Arc<dyn rpc_pb::Client + Send + Sync + 'static>, rpc_pb::Error> {
        Ok(Arc::new(TcpClient::new(
            host.clone(),
            self.options.clone(),
            timeout,
        )))
    }
}
