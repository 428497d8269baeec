//! Binary state solver
//!
//! Publishes on/off solutions for objects carrying switch sensors. Object
//! classes and their solution names come from a type file; transmitters are
//! discovered from the world model.

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use wmlink::config::USAGE;
use wmlink::pattern::MATCH_ALL;
use wmlink::solver::SolverConfig;
use wmlink::{
    inbound_channel, CliArgs, ClientConfig, ClientConnection, ConfigError, DispatchError, PatternSet, SolverConnection,
    StreamBuffer, SwitchSolver, TcpTransport, TransmitterDirectory, TransmitterDiscovery, TypeConfig,
    UpdateDispatcher, WorldState,
};

fn print_state(state: &WorldState) {
    for (uri, attributes) in state {
        if attributes.is_empty() {
            println!("Found uri '{uri}' with no attributes");
            continue;
        }
        println!("Found uri '{uri}' with attributes:");
        for attr in attributes {
            println!("\t{} is {} bytes long", attr.name, attr.data.len());
            println!("\t{} was created by {} at time {}", attr.name, attr.origin, attr.creation_date);
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wmlink=info,binary_state_solver=info".into()),
        )
        .init();

    let args = match CliArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(ConfigError::Usage { usage }) => {
            eprintln!("Usage: {usage}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Usage: {USAGE}");
            return ExitCode::SUCCESS;
        }
    };

    let types = match TypeConfig::load(&args.config_path) {
        Ok(types) => types,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    let cfg = SolverConfig::default();

    info!(addr = %args.solver_addr(), "Trying to connect to world model as a solver");
    let (solver_tx, solver_rx) = inbound_channel(wmlink::transport::DEFAULT_INBOUND_CAPACITY);
    let solver_transport = match TcpTransport::connect(args.solver_addr(), solver_tx, None) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            eprintln!("Could not connect to the world model as a solver - aborting: {e}");
            return ExitCode::SUCCESS;
        }
    };
    let solver_conn = match SolverConnection::new(solver_transport, solver_rx, &cfg, types.registrations()) {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            eprintln!("Could not connect to the world model as a solver - aborting: {e}");
            return ExitCode::SUCCESS;
        }
    };

    let directory = Arc::new(TransmitterDirectory::new());
    let solver = SwitchSolver::new(types, Arc::clone(&directory), UpdateDispatcher::new(Arc::clone(&solver_conn)));
    let uri_filter = match solver.uri_filter() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };
    let discovery = match PatternSet::new([cfg.transmitter_attribute.as_str()]) {
        Ok(patterns) => TransmitterDiscovery::new(patterns),
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    info!(addr = %args.client_addr(), "Trying to connect to world model as a client");
    let (client_tx, client_rx) = inbound_channel(wmlink::transport::DEFAULT_INBOUND_CAPACITY);
    let client_transport = match TcpTransport::connect(args.client_addr(), client_tx, None) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            eprintln!("Problem connecting to world model. Exiting: {e}");
            return ExitCode::SUCCESS;
        }
    };
    let client = ClientConnection::new(client_transport, client_rx, ClientConfig::default());

    println!("Searching for all URIs and attributes");
    match client.current_snapshot_request(MATCH_ALL, [MATCH_ALL]).get() {
        Ok(state) => print_state(&state),
        Err(e) => warn!(error = %e, "Snapshot request failed"),
    }

    // A lost delivery would leave a transmitter unbound for good.
    let stream = match client.stream_request_with(
        uri_filter.as_str(),
        discovery.attributes().sources(),
        cfg.stream_interval,
        StreamBuffer::Unbounded,
    ) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Problem requesting transmitters from the world model. Exiting: {e}");
            return ExitCode::SUCCESS;
        }
    };

    let rule_conn = Arc::clone(&solver_conn);
    let discovery_thread = thread::Builder::new()
        .name("transmitter-discovery".to_string())
        .spawn(move || {
            for state in stream {
                let report = discovery.apply(&directory, &state);
                if report.rules_changed {
                    if let Err(e) = rule_conn.request_rules(directory.rules()) {
                        warn!(error = %e, "Failed to update sensor rules");
                    }
                }
            }
            info!("Transmitter stream ended");
        })
        .expect("failed to spawn discovery thread");

    let result = solver_conn.run_samples(|sample| {
        for report in solver.on_sample(sample)? {
            println!("{report}");
        }
        Ok::<(), DispatchError>(())
    });

    client.close();
    solver_conn.close();
    let _ = discovery_thread.join();

    match result {
        Ok(samples) => {
            info!(samples, "Solver finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Could not publish solution");
            ExitCode::from(1)
        }
    }
}
