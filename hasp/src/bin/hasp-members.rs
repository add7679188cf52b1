use std::sync::Arc;
use std::time::Duration;

use arrrg::CommandLine;
use rpc_pb::{Context, Host};

use hasp_pb::IoToZ;
use hasp_pb::{MembersRequest, ReplicaClient, ReplicaService};
use lazyrpc::{ClientOptions, Connector, TcpConnector};

#[derive(Clone, Debug, Default, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(required, "A cluster member, in host:ID=host:port format.")]
    target: Host,
    #[arrrg(nested)]
    client: ClientOptions,
}

fn main() {
    let (options, free) = Options::from_command_line("Usage: hasp-members --target <host>");
    if !free.is_empty() {
        eprintln!("command takes no arguments");
        std::process::exit(1);
    }
    let connector = TcpConnector::new(options.client);
    let client: Arc<dyn rpc_pb::Client + Send + Sync> = connector
        .connect(&options.target, Duration::from_millis(1_000))
        .as_z()
        .pretty_unwrap();
    let client = ReplicaClient::new(client);
    let resp = client
        .members(&Context::default(), MembersRequest {})
        .pretty_unwrap();
    println!("vid: {}", resp.view.vid);
    for member in &resp.view.members {
        println!("member: {}", member);
    }
    match resp.primary {
        Some(primary) => println!("primary: {}", primary),
        None => println!("primary: unknown"),
    }
}
