use std::sync::Arc;

use arrrg::CommandLine;
use indicio::{clue, stdio::StdioEmitter, ALWAYS, INFO};

use hasp_pb::IoToZ;

use hasp::{Node, NodeOptions};
use lazyrpc::{ClientOptions, Server, ServerOptions, TcpConnector};

#[derive(Clone, Debug, Default, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(flag, "Emit clues to stderr.")]
    verbose: bool,
    #[arrrg(nested)]
    node: NodeOptions,
    #[arrrg(nested)]
    client: ClientOptions,
}

fn main() {
    let (options, free) = Options::from_command_line(
        "Usage: haspd --data-dir <dir> --bind <host> --seed <host> [OPTIONS]",
    );
    if !free.is_empty() {
        eprintln!("command takes no arguments");
        std::process::exit(1);
    }
    // indicio
    if options.verbose {
        for collector in [
            &hasp::COLLECTOR,
            &synod::COLLECTOR,
            &lazyrpc::COLLECTOR,
        ] {
            collector.register(Arc::new(StdioEmitter));
            collector.set_verbosity(INFO);
        }
    }
    clue!(hasp::COLLECTOR, ALWAYS, {
        new_process: std::env::args().map(String::from).collect::<Vec<_>>(),
    });
    // node
    let connector = Arc::new(TcpConnector::new(options.client));
    let bind = options.node.bind.clone();
    let (_node, registry) = Node::new(options.node, connector).pretty_unwrap();
    // server
    let server = Server::new(ServerOptions::default().with_bind_to(bind), registry)
        .as_z()
        .pretty_unwrap();
    server.serve().as_z().pretty_unwrap();
}
