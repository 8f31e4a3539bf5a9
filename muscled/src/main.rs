mod config;

use clap::Parser;
use config::ServerConfig;
use fiber::logging;
use muscle::gateway::GatewayPolicy;
use muscle::path::SegmentPattern;
use muscle::server::ReflectServer;
use muscle::session::SessionParams;
use muscle::storage::StorageFactory;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

/// MUSCLE message-reflection server.
#[derive(Parser)]
#[clap(name = "muscled", version)]
struct Args {
    /// TOML configuration file; flags override its values.
    #[clap(long, env = "MUSCLE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on.
    #[clap(long, env = "MUSCLE_PORT")]
    port: Option<u16>,

    /// Address to bind the listener to.
    #[clap(long, env = "MUSCLE_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Byte cap on each session's outgoing queue.
    #[clap(long, env = "MUSCLE_MAX_BYTES_PER_SESSION")]
    max_bytes_per_session: Option<usize>,

    /// Ceiling on tree nodes one session may create.
    #[clap(long, env = "MUSCLE_MAX_NODES_PER_SESSION")]
    max_nodes_per_session: Option<usize>,

    /// Largest accepted incoming message body.
    #[clap(long, env = "MUSCLE_MAX_MESSAGE_SIZE")]
    max_message_size: Option<u32>,

    /// Hostmask granted kick privilege; repeatable.
    #[clap(long = "kick-mask", env = "MUSCLE_KICK_MASKS", multiple_occurrences(true))]
    kick_masks: Vec<String>,

    /// Hostmask refused at accept time; repeatable.
    #[clap(long = "ban-mask", env = "MUSCLE_BAN_MASKS", multiple_occurrences(true))]
    ban_masks: Vec<String>,

    /// Logging verbosity: critical, error, warning, info, debug or trace.
    #[clap(long, env = "MUSCLE_LOG_LEVEL")]
    log_level: Option<String>,
}

const EXIT_BIND_FAILURE: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let mut config = match args.config {
        Some(ref path) => match ServerConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("muscled: cannot load {}: {}", path.display(), err);
                return EXIT_CONFIG_ERROR;
            }
        },
        None => ServerConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind_address) = args.bind_address {
        config.bind_address = Some(bind_address);
    }
    if let Some(max_bytes) = args.max_bytes_per_session {
        config.limits.max_bytes_per_session = max_bytes;
    }
    if let Some(max_nodes) = args.max_nodes_per_session {
        config.limits.max_nodes_per_session = max_nodes;
    }
    if let Some(max_message) = args.max_message_size {
        config.limits.max_message_size = max_message;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.privileges.kick.extend(args.kick_masks);
    config.privileges.ban.extend(args.ban_masks);

    let log = logging::init(&config.log_level);

    let addr: SocketAddr = match config.listen_address().parse() {
        Ok(addr) => addr,
        Err(err) => {
            logging::crit!(log, "invalid listen address";
                           "address" => config.listen_address(), "error" => %err);
            return EXIT_CONFIG_ERROR;
        }
    };

    let kick_masks = match compile_masks(&config.privileges.kick) {
        Ok(masks) => masks,
        Err(mask) => {
            logging::crit!(log, "invalid kick hostmask"; "mask" => mask);
            return EXIT_CONFIG_ERROR;
        }
    };
    let ban_masks = match compile_masks(&config.privileges.ban) {
        Ok(masks) => masks,
        Err(mask) => {
            logging::crit!(log, "invalid ban hostmask"; "mask" => mask);
            return EXIT_CONFIG_ERROR;
        }
    };

    let mut server = match ReflectServer::new(log.clone()) {
        Ok(server) => server,
        Err(err) => {
            logging::crit!(log, "cannot create server"; "error" => %err);
            return EXIT_BIND_FAILURE;
        }
    };

    server.default_policy = GatewayPolicy {
        max_incoming_size: config.limits.max_message_size,
        max_outgoing_bytes: config.limits.max_bytes_per_session,
        drop_oldest: false,
    };

    let params = SessionParams {
        max_nodes: config.limits.max_nodes_per_session,
        ..SessionParams::default()
    };

    let mut factory = StorageFactory::new(params);
    factory.kick_masks = kick_masks;
    factory.ban_masks = ban_masks;

    if let Err(err) = server.put_accept_factory(addr, Box::new(factory)) {
        logging::crit!(log, "cannot bind listener"; "address" => %addr, "error" => %err);
        return EXIT_BIND_FAILURE;
    }

    logging::info!(log, "muscled running"; "address" => %addr);

    match server.serve() {
        Ok(()) => 0,
        Err(err) => {
            logging::crit!(log, "event loop failed"; "error" => %err);
            EXIT_BIND_FAILURE
        }
    }
}

fn compile_masks(masks: &[String]) -> Result<Vec<SegmentPattern>, String> {
    masks
        .iter()
        .map(|mask| SegmentPattern::compile(mask).map_err(|_| mask.clone()))
        .collect()
}
