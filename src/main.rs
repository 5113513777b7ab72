use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use rand::Rng;
use socket2::Protocol;

use rawpkt::hextools::packet_dump;
use rawpkt::{
    build_tcp_packet, open_raw_socket, run_receive_loop, send_packet, send_protocol,
    IdentificationPolicy, Packet, RawSocketSet, ReceiveConfig, ReceiveStats, StopEvent, TcpFlags,
};

const DEFAULT_PORT: u16 = 80;
const DEFAULT_SOCKETS: usize = 10;
const CONTROLLER_TICK: Duration = Duration::from_millis(100);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Craft a raw IPv4/TCP packet, optionally send it, and listen on a pool of
/// raw sockets until interrupted.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Source IPv4 address written into the packet.
    #[arg(short, long, default_value_t = Ipv4Addr::LOCALHOST)]
    source: Ipv4Addr,

    /// Destination IPv4 address.
    #[arg(short, long)]
    target: Ipv4Addr,

    /// Destination port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Source port; a random ephemeral port when omitted.
    #[arg(long)]
    source_port: Option<u16>,

    /// Sequence number; random when omitted.
    #[arg(long)]
    seq: Option<u32>,

    /// Acknowledgment number.
    #[arg(long, default_value_t = 0)]
    ack: u32,

    /// TCP flags, e.g. `syn` or `syn,ack`.
    #[arg(short, long, default_value = "syn")]
    flags: TcpFlags,

    /// Payload carried after the TCP header.
    #[arg(long)]
    payload: Option<String>,

    /// Use this IP identification instead of a random one.
    #[arg(long)]
    fixed_id: Option<u16>,

    /// Actually send the packet through a raw socket.
    #[arg(long)]
    send: bool,

    /// Raw sockets to listen on; 0 skips listening.
    #[arg(long, default_value_t = DEFAULT_SOCKETS)]
    sockets: usize,

    /// Stop listening after this many seconds; 0 listens until Ctrl+C.
    #[arg(long, default_value_t = 0)]
    listen_secs: u64,

    /// Readiness wait timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Print hex dumps of sent and received packets.
    #[arg(long)]
    dump: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut rng = rand::thread_rng();
    let source_port = cli.source_port.unwrap_or_else(|| rng.gen_range(32768..u16::MAX));
    let sequence_number = cli.seq.unwrap_or_else(|| rng.gen());
    let id_policy = match cli.fixed_id {
        Some(id) => IdentificationPolicy::Fixed(id),
        None => IdentificationPolicy::Random,
    };
    let payload = cli.payload.as_deref().unwrap_or_default().as_bytes();

    let packet = build_tcp_packet(
        cli.source,
        cli.target,
        source_port,
        cli.port,
        sequence_number,
        cli.ack,
        cli.flags,
        payload,
        id_policy,
    )
    .context("building packet")?;
    let bytes = packet.serialize().context("serializing packet")?;

    info!(
        "{} packet {}:{} -> {}:{} seq={} ({} bytes)",
        cli.flags,
        cli.source,
        source_port,
        cli.target,
        cli.port,
        sequence_number,
        bytes.len()
    );
    if cli.dump {
        println!("{}", packet_dump(&bytes, "TCP"));
    } else {
        debug!("\n{}", packet_dump(&bytes, "TCP"));
    }

    if !cli.send && cli.sockets == 0 {
        return Ok(());
    }

    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        bail!("raw sockets require root privileges");
    }

    let stop = StopEvent::new();
    let controller = (cli.sockets > 0).then(|| spawn_controller(stop.clone(), cli.listen_secs));
    let config = ReceiveConfig {
        timeout: Duration::from_millis(cli.timeout_ms),
        ..Default::default()
    };
    let dump = cli.dump;
    let result = send_and_listen(
        cli.send.then_some(&packet),
        cli.sockets,
        &stop,
        &config,
        |index, data| {
            info!("received {} bytes on socket {index}", data.len());
            if dump {
                println!("{}", packet_dump(data, "IP"));
            }
        },
    );

    // let the controller exit even if the loop ended on its own
    stop.set();
    if controller.is_some_and(|handle| handle.join().is_err()) {
        warn!("stop controller thread panicked");
    }

    if let Some(stats) = result? {
        info!(
            "done: {} datagrams, {} bytes, {} read errors",
            stats.datagrams, stats.bytes, stats.read_errors
        );
    }
    Ok(())
}

/// Sends `packet` if given, then listens on `sockets` raw TCP sockets until
/// `stop` is set.
///
/// The listen pool is opened first. Raw sockets only see packets that
/// arrive after they exist, so a fast reply would otherwise be missed.
fn send_and_listen<F>(
    packet: Option<&Packet>,
    sockets: usize,
    stop: &StopEvent,
    config: &ReceiveConfig,
    on_datagram: F,
) -> Result<Option<ReceiveStats>>
where
    F: FnMut(usize, &[u8]),
{
    let pool = match sockets {
        0 => None,
        count => Some(RawSocketSet::open(count, Protocol::TCP).context("opening listen sockets")?),
    };

    if let Some(packet) = packet {
        let socket = open_raw_socket(send_protocol()).context("opening send socket")?;
        let sent = send_packet(&socket, packet).context("sending packet")?;
        info!(
            "sent {sent} bytes to {}:{}",
            packet.ip_header().destination(),
            packet.tcp_header().destination_port()
        );
    }

    let Some(pool) = pool else {
        return Ok(None);
    };
    info!("listening on {} raw sockets, press Ctrl+C to stop", pool.len());
    let stats = run_receive_loop(&pool, stop, config, on_datagram).context("receive session failed")?;
    Ok(Some(stats))
}

/// Forwards Ctrl+C, and the optional listen deadline, to `stop`.
fn spawn_controller(stop: StopEvent, listen_secs: u64) -> thread::JoinHandle<()> {
    // SAFETY: the handler only stores to an atomic, which is signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as *const () as libc::sighandler_t);
    }

    let deadline = (listen_secs > 0).then(|| Instant::now() + Duration::from_secs(listen_secs));

    thread::spawn(move || loop {
        if stop.is_set() {
            return;
        }
        if INTERRUPTED.load(Ordering::SeqCst) {
            info!("interrupted, stopping receive loop");
            stop.set();
            return;
        }
        if deadline.is_some_and(|at| Instant::now() >= at) {
            info!("listen time elapsed, stopping receive loop");
            stop.set();
            return;
        }
        thread::sleep(CONTROLLER_TICK);
    })
}
