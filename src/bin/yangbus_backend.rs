use std::{
    error::Error,
    fs,
    net::SocketAddrV4,
    path::PathBuf,
    process,
    sync::Arc,
};

use clap::Parser;
use log::info;
use yangbus::{
    Nacm, NacmMode, XmlNode,
    datastore::FileDatastore,
    protocol::{BackendConfig, BackendServer, DEFAULT_MAX_SESSIONS, Endpoint},
};

const DEFAULT_SOCKET: &str = "/tmp/yangbus.sock";

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen on this unix socket
    #[arg(long, default_value = DEFAULT_SOCKET, conflicts_with = "addr")]
    socket: PathBuf,
    /// Listen on this IPv4 address and port instead of a unix socket
    #[arg(long)]
    addr: Option<SocketAddrV4>,
    /// Directory holding the `<db>_db` datastore files
    #[arg(long)]
    datastore: PathBuf,
    /// Where NACM rules are read from: internal or external
    #[arg(long, default_value_t = NacmMode::Internal)]
    nacm_mode: NacmMode,
    /// Rule tree used in external mode
    #[arg(long)]
    nacm_file: Option<PathBuf>,
    /// Sessions open at once; further connections are refused
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    if !cli.datastore.is_dir() {
        return Err(format!("'{}' is not a directory", cli.datastore.display()).into());
    }

    let datastore = Arc::new(FileDatastore::new(cli.datastore));
    let external = match &cli.nacm_file {
        Some(path) => Some(XmlNode::parse(&fs::read_to_string(path)?)?),
        None => None,
    };
    let nacm = Nacm::from_mode(cli.nacm_mode, datastore.clone(), external)?;

    let endpoint = match cli.addr {
        Some(addr) => Endpoint::Inet(addr),
        None => Endpoint::Unix(cli.socket),
    };
    let mut config = BackendConfig::new(endpoint);
    config.max_sessions = cli.max_sessions;
    let server = BackendServer::bind(config, datastore, nacm)?;

    if let Endpoint::Unix(path) = server.local_endpoint()? {
        ctrlc::set_handler(move || {
            info!("interrupted, removing {}", path.display());
            let _ = fs::remove_file(&path);
            process::exit(0);
        })?;
    }

    server.listen()?;
    Ok(())
}
