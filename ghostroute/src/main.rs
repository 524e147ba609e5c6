use anyhow::Context;
use clap::{Parser, Subcommand};
use ghostroute_core::config::ConfigLoader;
use ghostroute_core::{
    AddressFamily, ConnectOutcome, ConnectRequest, Decision, Destination, Engine, PolicySnapshot, SocketHandle,
    SocketTransport, SocketType,
};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "ghostroute")]
#[command(about = "Route connections through a SOCKS5 or HTTP CONNECT proxy using virtual addresses")]
struct Args {
    /// Config file (defaults to $GHOSTROUTE_CONFIG, then the user config dir)
    #[arg(long, short = 'c', env = "GHOSTROUTE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the config, then print the effective policy
    Check,

    /// Print the routing decision for a destination
    Decide {
        /// IP address or host name (names get a virtual address first)
        addr: String,
        port: u16,
        /// Treat the attempt as a datagram socket
        #[arg(long)]
        udp: bool,
    },

    /// Resolve a name the way intercepted lookups are answered
    Resolve {
        name: String,
        /// Request an IPv6 answer
        #[arg(long)]
        ipv6: bool,
    },

    /// Connect to HOST:PORT through the engine and relay stdin/stdout
    Connect {
        host: String,
        port: u16,
        /// First write to send once connected
        #[arg(long)]
        send: Option<String>,
        /// Use a non-blocking connect completed from the event loop
        #[arg(long = "async")]
        overlapped: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ConfigLoader::load_or_default(args.config.clone())?;

    // GHOSTROUTE_LOG wins, then -v, then the configured level
    let filter = std::env::var("GHOSTROUTE_LOG").unwrap_or_else(|_| {
        if args.verbose {
            "debug".to_string()
        } else {
            config.common.level().to_string().to_lowercase()
        }
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let engine = Arc::new(Engine::from_config(&config).context("invalid configuration")?);

    match args.command {
        Command::Check => {
            print_policy(engine.snapshot());
            Ok(())
        }
        Command::Decide { addr, port, udp } => {
            let socket_type = if udp { SocketType::Datagram } else { SocketType::Stream };
            let ip = lookup(&engine, &addr, None)?;
            let destination = Destination::from(SocketAddr::new(ip, port));

            match engine.decide(Some(&destination), socket_type) {
                Decision::Passthrough => println!("passthrough"),
                Decision::Reject(reason) => println!("reject: {} ({:?})", reason, reason.category()),
                Decision::Redirect(target) => println!("redirect: {} via {}", target, engine.snapshot().proxy),
            }
            Ok(())
        }
        Command::Resolve { name, ipv6 } => {
            let family = ipv6.then_some(AddressFamily::Inet6);
            for ip in engine.resolve(&name, family)? {
                match engine.reverse_lookup(ip) {
                    Some(domain) => println!("{ip}\t(virtual for {domain})"),
                    None => println!("{ip}"),
                }
            }
            Ok(())
        }
        Command::Connect {
            host,
            port,
            send,
            overlapped,
        } => connect(engine, &host, port, send, overlapped).await,
    }
}

fn print_policy(policy: &PolicySnapshot) {
    println!("proxy:            {} (enabled: {})", policy.proxy, policy.proxy_enabled());
    println!(
        "fake_ip:          {} (enabled: {})",
        policy.fake_ip.cidr, policy.fake_ip.enabled
    );
    println!(
        "timeouts:         connect={:?} send={:?} recv={:?}",
        policy.timeouts.connect, policy.timeouts.send, policy.timeouts.recv
    );
    let ports: Vec<String> = policy.allowed_ports.iter().map(u16::to_string).collect();
    println!(
        "allowed_ports:    {}",
        if ports.is_empty() { "all".to_string() } else { ports.join(",") }
    );
    println!("dns_mode:         {:?}", policy.dns_mode);
    println!("ipv6_mode:        {:?}", policy.ipv6_mode);
    println!("udp_mode:         {:?} (exempt: {:?})", policy.udp_mode, policy.udp_exempt_ports);
    println!("traffic_logging:  {}", policy.traffic_logging);
    println!("routing:          enabled={}", policy.routing.is_enabled());
    for rule in policy.routing.rules() {
        println!("  - {} -> {}", rule.name, rule.action);
    }
}

fn lookup(engine: &Engine, name: &str, family: Option<AddressFamily>) -> anyhow::Result<IpAddr> {
    engine
        .resolve(name, family)?
        .into_iter()
        .next()
        .with_context(|| format!("no address for {name}"))
}

async fn connect(
    engine: Arc<Engine>,
    host: &str,
    port: u16,
    send: Option<String>,
    overlapped: bool,
) -> anyhow::Result<()> {
    let ip = lookup(&engine, host, None)?;
    let addr = SocketAddr::new(ip, port);
    let mut transport = SocketTransport::tcp_for(&addr, 0)?;
    let handle = socket_handle(&transport);
    transport = SocketTransport::new(transport.into_socket(), handle);

    tracing::info!("connect: {} ({}) on socket {}", host, addr, handle);

    let payload = send.map(String::into_bytes);
    let decide_engine = Arc::clone(&engine);
    let (outcome, mut transport, payload) = tokio::task::spawn_blocking(move || {
        let destination = Destination::from(addr);
        let mut request = if overlapped {
            ConnectRequest::overlapped(destination, handle)
        } else {
            ConnectRequest::blocking(destination)
        };
        request.payload = payload.as_deref();
        let outcome = decide_engine.on_connect(&request, &mut transport);
        (outcome, transport, payload)
    })
    .await?;

    match outcome {
        ConnectOutcome::Passthrough => {
            tracing::info!("connect: passthrough to {}", addr);
            let timeout = engine.snapshot().timeouts.connect;
            // A virtual address has nothing behind it; dial the real host
            let real = match engine.reverse_lookup(ip) {
                Some(domain) => (domain.as_str(), port)
                    .to_socket_addrs()?
                    .find(|a| a.is_ipv4() == addr.is_ipv4())
                    .with_context(|| format!("no address for {domain}"))?,
                None => addr,
            };
            let socket = transport.into_socket();
            socket.connect_timeout(&socket2::SockAddr::from(real), timeout)?;
            let stream = std::net::TcpStream::from(socket);
            if let Some(data) = payload.as_deref() {
                std::io::Write::write_all(&mut &stream, data)?;
            }
            relay(stream).await?;
        }
        ConnectOutcome::Rejected(failure) => {
            let category = failure.category();
            return Err(failure.into_io_error()).with_context(|| format!("connection rejected ({category:?})"));
        }
        ConnectOutcome::RedirectedSuccess { bytes_sent } => {
            tracing::info!("connect: tunnel up, {} payload bytes sent", bytes_sent);
            relay(transport.into_socket().into()).await?;
        }
        ConnectOutcome::RedirectedPending(key) => {
            transport = wait_connected(transport, engine.snapshot().timeouts.connect).await?;

            let complete_engine = Arc::clone(&engine);
            let (result, transport) = tokio::task::spawn_blocking(move || {
                let result = complete_engine.complete_if_pending(key, &mut transport);
                (result, transport)
            })
            .await?;

            let done = result
                .context("pending connect expired before completion")?
                .context("tunnel completion failed")?;
            tracing::info!(
                "connect: tunnel up after completion, {}/{} payload bytes sent",
                done.bytes_sent,
                done.requested
            );
            relay(transport.into_socket().into()).await?;
        }
    }

    engine.on_close(handle);
    Ok(())
}

/// Wait for the non-blocking connect to become writable
#[cfg(unix)]
async fn wait_connected(
    transport: SocketTransport,
    timeout: std::time::Duration,
) -> anyhow::Result<SocketTransport> {
    use tokio::io::unix::AsyncFd;

    let async_fd = AsyncFd::new(transport)?;
    {
        let mut guard = tokio::time::timeout(timeout, async_fd.writable())
            .await
            .context("timed out waiting for proxy connect")??;
        guard.retain_ready();
    }
    Ok(async_fd.into_inner())
}

#[cfg(not(unix))]
async fn wait_connected(
    _transport: SocketTransport,
    _timeout: std::time::Duration,
) -> anyhow::Result<SocketTransport> {
    anyhow::bail!("--async is only supported on unix")
}

#[cfg(unix)]
fn socket_handle(transport: &SocketTransport) -> SocketHandle {
    use std::os::fd::AsRawFd;
    transport.as_raw_fd() as SocketHandle
}

#[cfg(not(unix))]
fn socket_handle(_transport: &SocketTransport) -> SocketHandle {
    u64::from(std::process::id())
}

/// Copy stdin to the socket and the socket to stdout until both sides close
async fn relay(stream: std::net::TcpStream) -> anyhow::Result<()> {
    stream.set_nonblocking(true)?;
    let mut stream = tokio::net::TcpStream::from_std(stream)?;
    let mut stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());

    let (up, down) = tokio::io::copy_bidirectional(&mut stdio, &mut stream).await?;
    tracing::debug!("relay closed: {} bytes up, {} bytes down", up, down);
    Ok(())
}
