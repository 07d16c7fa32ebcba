use std::{
    env,
    error::Error,
    io::{self, Read, Write},
    net::SocketAddrV4,
    path::PathBuf,
    process,
    sync::{Arc, Mutex},
};

use clap::Parser;
use log::{debug, warn};
use yangbus::{
    Command, XmlNode,
    cli::PromptError,
    netconf::{FrameAccumulator, Framing, RpcError},
    prompt,
    protocol::{
        CancelToken, Channel, Endpoint, Message, RpcClient, TransportError, one_shot, rpc,
    },
};

const DEFAULT_SOCKET: &str = "/tmp/yangbus.sock";

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Backend unix socket
    #[arg(long, default_value = DEFAULT_SOCKET, conflicts_with = "addr")]
    socket: PathBuf,
    /// Backend IPv4 address and port instead of a unix socket
    #[arg(long)]
    addr: Option<SocketAddrV4>,
    /// User the requests are made for (defaults to $USER)
    #[arg(long)]
    user: Option<String>,
    /// Subscribe and print notifications until interrupted
    #[arg(long, conflicts_with_all = ["operation", "netconf"])]
    subscribe: bool,
    /// Relay SSH-framed NETCONF between stdin/stdout and the backend
    #[arg(long, conflicts_with = "operation")]
    netconf: bool,
    /// Operation element to send once, e.g. '<get-config><source><running/></source></get-config>'
    operation: Option<String>,
}

/// Channel the interrupt handler shuts down to wake a blocked read.
type Active = Arc<Mutex<Option<Channel>>>;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let endpoint = match cli.addr {
        Some(addr) => Endpoint::Inet(addr),
        None => Endpoint::Unix(cli.socket.clone()),
    };
    let user = cli.user.clone().or_else(|| env::var("USER").ok());

    let cancel = CancelToken::new();
    let active: Active = Arc::new(Mutex::new(None));
    {
        let cancel = cancel.clone();
        let active = Arc::clone(&active);
        ctrlc::set_handler(move || {
            cancel.cancel();
            match active.lock().ok().and_then(|a| a.as_ref().map(Channel::shutdown)) {
                Some(Ok(())) => {}
                Some(Err(e)) => warn!("failed to shut down channel: {e}"),
                None => process::exit(130),
            }
        })?;
    }

    if let Some(operation) = &cli.operation {
        let reply = one_shot(&endpoint, &rpc(user.as_deref(), operation)?)?;
        print_reply(&reply);
        return Ok(());
    }

    let mut client = connect(&endpoint, &cancel, &active)?;
    if cli.subscribe {
        subscribe(&mut client, user.as_deref())
    } else if cli.netconf {
        relay(&mut client, user.as_deref())
    } else {
        interactive(&mut client, user.as_deref())
    }
}

fn connect(
    endpoint: &Endpoint,
    cancel: &CancelToken,
    active: &Active,
) -> Result<RpcClient<Channel>, Box<dyn Error>> {
    let channel = endpoint.connect()?;
    if let Ok(mut slot) = active.lock() {
        *slot = Some(channel.try_clone()?);
    }
    Ok(RpcClient::with_cancel(channel, cancel.clone()))
}

fn subscribe(client: &mut RpcClient<Channel>, user: Option<&str>) -> Result<(), Box<dyn Error>> {
    let reply = client.request_reply(&rpc(user, "<create-subscription/>")?)?;
    if let Some(err) = RpcError::from_reply(&reply) {
        return Err(err.to_string().into());
    }

    loop {
        match client.transport_mut().recv_message() {
            Ok(Some(msg)) => match msg.decode() {
                Ok(event) => println!("{event}"),
                Err(e) => warn!("{e}"),
            },
            Ok(None) | Err(TransportError::Cancelled(_)) => return Ok(()),
            Err(e) if e.is_recoverable() => warn!("{e}"),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reads `]]>]]>`-framed requests on stdin and writes framed replies to stdout.
fn relay(client: &mut RpcClient<Channel>, user: Option<&str>) -> Result<(), Box<dyn Error>> {
    let framing = Framing::Ssh;
    let mut frames = FrameAccumulator::new();
    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();
    let mut buf = [0u8; 4096];

    loop {
        let n = stdin.read(&mut buf)?;
        if n == 0 {
            debug!("stdin closed with {} bytes pending", frames.pending().len());
            return Ok(());
        }

        for frame in frames.extend(&buf[..n]) {
            if frame.is_empty() {
                continue;
            }
            let out = match with_user(&frame, user) {
                Ok(request) => {
                    let reply = client.request(&Message::encode(&request)?)?;
                    framing.wrap(reply.body_str()?)
                }
                Err(e) => {
                    let err = RpcError::malformed_message(e.to_string());
                    framing.wrap_error(&err.to_xml(), &e.to_string())
                }
            };
            stdout.write_all(out.as_bytes())?;
            stdout.flush()?;
        }
    }
}

/// Stamps the `<rpc>` in `frame` with the relaying user's name.
fn with_user(frame: &str, user: Option<&str>) -> Result<String, Box<dyn Error>> {
    let mut doc = XmlNode::parse(frame)?;
    let rpc = doc.child_mut("rpc").ok_or("expected an rpc element")?;
    if let Some(user) = user {
        rpc.set_attribute("username", user);
    }
    Ok(doc.to_string())
}

fn interactive(client: &mut RpcClient<Channel>, user: Option<&str>) -> Result<(), Box<dyn Error>> {
    loop {
        let cmd = match prompt(io::stdin().lock(), io::stdout().lock()) {
            Ok(c) => c,
            Err(PromptError::Unrecognized(cmd)) => {
                eprintln!("unrecognized command '{cmd}'");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let operation = match cmd {
            Command::Exit => {
                let _ = client.request_reply(&rpc(user, "<close-session/>")?);
                return Ok(());
            }
            Command::Rpc(op) if op.is_empty() => continue,
            Command::Rpc(op) => op,
        };

        match client.request_reply(&rpc(user, &operation)?) {
            Ok(reply) => print_reply(&reply),
            Err(e) if e.is_recoverable() => eprintln!("{e}"),
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_reply(reply: &XmlNode) {
    match RpcError::from_reply(reply) {
        Some(err) => eprintln!("error: {err}"),
        None => println!("{reply}"),
    }
}
