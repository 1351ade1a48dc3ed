//! `gadgetctl trace`: Run a trace until Ctrl+C.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use clap::{Args, Subcommand};

use gadget_common::config::GadgetConfig;
use gadget_common::error::GadgetError;
use gadget_common::types::{ContainerFilter, ContainerInfo, Operation, Trace, TraceName, TraceSpec};
use gadget_core::namespace::NetnsEnter;
use gadget_core::netfilter::{Iptables, PacketFilter};
use gadget_ebpf::gc::MapSweeper;
use gadget_runtime::dns::DnsPacket;
use gadget_runtime::registry::{GadgetContext, GadgetRegistry, TraceManager};
use gadget_runtime::selector::StaticSelector;
use gadget_runtime::sink::WriterSink;
use gadget_runtime::tracer::PacketFilterFactory;

use crate::output::{self, BOLD, RESET};

/// Arguments for the `trace` command.
#[derive(Args, Debug)]
pub struct TraceArgs {
    /// Gadget to run.
    #[command(subcommand)]
    pub gadget: TraceGadget,
}

/// Gadgets runnable from the command line.
#[derive(Subcommand, Debug)]
pub enum TraceGadget {
    /// Trace which iptables rules process packets of the selected containers.
    Iptables(IptablesArgs),
    /// Trace DNS queries and responses and their latency.
    Dns(DnsArgs),
}

/// Identity of the trace.
#[derive(Args, Debug)]
pub struct TraceNameArgs {
    /// Namespace of the trace.
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Name of the trace.
    #[arg(long)]
    pub name: Option<String>,
}

/// Arguments for `trace iptables`.
#[derive(Args, Debug)]
pub struct IptablesArgs {
    /// Identity of the trace.
    #[command(flatten)]
    pub trace: TraceNameArgs,

    /// Container to trace, as `id:pid[:veth]`. Repeatable.
    #[arg(long = "container", value_parser = parse_container)]
    pub containers: Vec<ContainerInfo>,
}

/// Arguments for `trace dns`.
///
/// The DNS probe sees every container on the node, so there is no
/// container selection.
#[derive(Args, Debug)]
pub struct DnsArgs {
    /// Identity of the trace.
    #[command(flatten)]
    pub trace: TraceNameArgs,

    /// Pinned query map of a loaded DNS probe, garbage-collected while the
    /// trace runs.
    #[arg(long)]
    pub query_map: Option<PathBuf>,

    /// Decoded DNS packets as JSON lines, `-` for stdin. Each one is
    /// published as an event, responses with their latency.
    #[arg(long)]
    pub packets: Option<PathBuf>,
}

/// Parses `id:pid[:veth]`.
fn parse_container(value: &str) -> Result<ContainerInfo, String> {
    let mut parts = value.splitn(3, ':');
    let id = parts.next().filter(|s| !s.is_empty()).ok_or("missing container id")?;
    let pid = parts
        .next()
        .ok_or("missing pid, expected id:pid[:veth]")?
        .parse::<u32>()
        .map_err(|e| format!("invalid pid: {e}"))?;
    if pid == 0 {
        return Err("pid 0 is the host, not a container".to_owned());
    }
    let veth_peer = parts.next().filter(|s| !s.is_empty()).map(str::to_owned);
    Ok(ContainerInfo {
        id: id.to_owned(),
        pid,
        veth_peer,
        name: id.to_owned(),
        ..ContainerInfo::default()
    })
}

/// Executes the `trace` command.
///
/// # Errors
///
/// Returns an error if the trace fails to start, or stops leaving rules
/// behind.
pub fn execute(args: TraceArgs, config: GadgetConfig) -> anyhow::Result<()> {
    let (gadget, identity, containers, query_map, packets) = match args.gadget {
        TraceGadget::Iptables(iptables) => ("iptables", iptables.trace, iptables.containers, None, None),
        TraceGadget::Dns(dns) => {
            let map = dns.query_map.map(|p| open_query_map(&p, &config)).transpose()?;
            let packets = dns.packets.map(|p| read_packets(&p)).transpose()?;
            ("dns", dns.trace, Vec::new(), map, packets)
        }
    };

    let name = TraceName::new(
        identity.namespace,
        identity.name.unwrap_or_else(|| format!("trace-{gadget}")),
    );
    let context = GadgetContext {
        config,
        selector: Arc::new(StaticSelector::new(containers)),
        netns: Arc::new(NetnsEnter::new()),
        packet_filter: iptables_factory(),
        sink: Arc::new(WriterSink::new(std::io::stdout())),
        query_map,
    };
    let mut manager = TraceManager::new(GadgetRegistry::with_defaults(), context);
    let mut trace = Trace::new(
        name,
        TraceSpec {
            gadget: gadget.to_owned(),
            node: None,
            filter: ContainerFilter::default(),
            ..TraceSpec::default()
        },
    );

    output::print_header();
    manager.operate(&mut trace, Operation::Start);
    output::print_status(&trace, Operation::Start);
    if let Some(error) = &trace.status.operation_error {
        anyhow::bail!("trace {} failed to start: {error}", trace.name);
    }

    run_until_interrupt(&manager, &trace.name, packets)?;

    manager.operate(&mut trace, Operation::Stop);
    output::print_status(&trace, Operation::Stop);
    if let Some(error) = &trace.status.operation_error {
        anyhow::bail!("trace {} stopped with residue: {error}", trace.name);
    }
    Ok(())
}

fn iptables_factory() -> PacketFilterFactory {
    Arc::new(|| -> Result<Arc<dyn PacketFilter>, GadgetError> { Ok(Arc::new(Iptables::new()?)) })
}

#[cfg(all(feature = "ebpf", target_os = "linux"))]
fn open_query_map(path: &std::path::Path, config: &GadgetConfig) -> anyhow::Result<Arc<dyn MapSweeper>> {
    use gadget_core::clock::SystemClock;
    use gadget_ebpf::bpf::{BpfQueryMap, DnsQueryKey};
    use gadget_ebpf::gc::StaleEntrySweep;

    let map = BpfQueryMap::<DnsQueryKey>::from_pin(path).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(Arc::new(StaleEntrySweep::new(
        Arc::new(map),
        Arc::new(SystemClock),
        config.gc.cutoff,
    )))
}

#[cfg(not(all(feature = "ebpf", target_os = "linux")))]
fn open_query_map(path: &std::path::Path, _config: &GadgetConfig) -> anyhow::Result<Arc<dyn MapSweeper>> {
    anyhow::bail!(
        "cannot open {}: gadgetctl was built without the `ebpf` feature",
        path.display()
    )
}

/// Decodes packets from `path` on a reader thread.
///
/// Lines that do not decode are logged and skipped. The channel closes at
/// end of input.
fn read_packets(path: &Path) -> anyhow::Result<Receiver<DnsPacket>> {
    let input: Box<dyn BufRead + Send> = if path == Path::new("-") {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(path).map_err(|e| anyhow::anyhow!("cannot open {}: {e}", path.display()))?;
        Box::new(BufReader::new(file))
    };

    let (tx, rx) = mpsc::channel();
    let _reader = std::thread::Builder::new()
        .name("dns-packets".into())
        .spawn(move || {
            for (line, packet) in decode_packets(input) {
                match packet {
                    Ok(packet) => {
                        if tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(line, error = %e, "skipping undecodable packet"),
                }
            }
            tracing::debug!("end of packet input");
        })?;
    Ok(rx)
}

/// Numbered packets of `input`, blank lines skipped. Stops at the first
/// read error.
fn decode_packets(input: impl BufRead) -> impl Iterator<Item = (usize, serde_json::Result<DnsPacket>)> {
    input
        .lines()
        .map_while(|line| line.inspect_err(|e| tracing::warn!(error = %e, "reading packets")).ok())
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| (n + 1, serde_json::from_str(&line)))
}

fn run_until_interrupt(
    manager: &TraceManager,
    name: &TraceName,
    mut packets: Option<Receiver<DnsPacket>>,
) -> anyhow::Result<()> {
    const POLL: Duration = Duration::from_millis(250);

    eprintln!();
    eprintln!("  Tracing. Press {BOLD}Ctrl+C{RESET} to stop...");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    while running.load(Ordering::SeqCst) {
        let Some(rx) = &packets else {
            std::thread::sleep(POLL);
            continue;
        };
        match rx.recv_timeout(POLL) {
            Ok(packet) => {
                let _ = manager.publish_dns(name, &packet);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => packets = None,
        }
    }
    eprintln!();
    Ok(())
}
