use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context as _, bail};
use clap::Parser;
use ifring::{ContextStats, EngineConfig, LinkState, Packet, SubmitError};
use ifring_sim::frame::{Endpoint, payload_seq, seq_payload, to_packet, udp_frame, udp_payload};
use ifring_sim::{Leaks, Sim, SimConfig, StackEvent};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser, Debug)]
#[command(about = "Push UDP traffic through the engine over a simulated loopback NIC")]
struct Args {
    /// Number of frames to send
    #[clap(short = 'n', long, default_value_t = 10_000)]
    count: u64,

    /// UDP payload size in bytes
    #[clap(short, long, default_value_t = 512)]
    size: usize,

    /// Bytes per transmit buffer; frames larger than this are scattered
    #[clap(long, default_value_t = 256)]
    segment: usize,

    /// Frames per submission
    #[clap(short, long, default_value_t = 32)]
    batch: usize,

    /// Concurrent producer tasks
    #[clap(short, long, default_value_t = 4)]
    producers: u64,

    /// Queue pairs
    #[clap(short, long, default_value_t = 2)]
    queues: u16,

    /// Descriptors per TX and RX ring
    #[clap(long, default_value_t = 512)]
    ring: u32,

    /// Fail every n-th DMA mapping
    #[clap(long)]
    map_fault_every: Option<u64>,

    /// Fail every n-th buffer allocation
    #[clap(long)]
    alloc_fault_every: Option<u64>,

    /// Stall the transmit engine halfway through, like 2s or 300ms
    #[clap(long)]
    stall: Option<String>,

    /// Take the link down for a moment a quarter of the way through
    #[clap(long)]
    flap: bool,

    /// Ring the doorbell after every batch instead of coalescing
    #[clap(long)]
    immediate: bool,

    /// Coalesce received TCP segments
    #[clap(long)]
    lro: bool,

    /// Give up waiting for frames after this long
    #[clap(long, default_value = "10s")]
    timeout: String,
}

#[derive(Debug, Default)]
struct Tally {
    sent: AtomicU64,
    /// Frames never built because the pool refused a buffer.
    skipped: AtomicU64,
    received: AtomicU64,
    bytes: AtomicU64,
    corrupt: AtomicU64,
    duplicate: AtomicU64,
    hung: AtomicU64,
}

struct Traffic {
    src: Endpoint,
    dst: Endpoint,
    size: usize,
    segment: usize,
    batch: u64,
    producers: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    let args = Args::parse();

    let timeout = humantime::parse_duration(&args.timeout).context("invalid --timeout")?;
    let stall = args
        .stall
        .as_deref()
        .map(humantime::parse_duration)
        .transpose()
        .context("invalid --stall")?;
    if args.size < 8 {
        bail!("payload size must be at least 8 bytes");
    }

    let cfg = SimConfig {
        nqsets: args.queues,
        ntxd: args.ring,
        nrxd: args.ring,
        ..SimConfig::default()
    };
    let engine = EngineConfig {
        lro: Some(args.lro),
        doorbell: args.immediate.then_some(ifring::DoorbellPolicy::Immediate),
        ..EngineConfig::default()
    };
    let mut sim = Sim::start(cfg, engine)?;
    let events = sim.take_events().context("event stream already taken")?;
    if let Some(n) = args.map_fault_every {
        sim.arena.inject_faults(n);
    }
    if let Some(n) = args.alloc_fault_every {
        sim.pool.inject_faults(n);
    }
    let sim = Arc::new(sim);

    let tally = Arc::new(Tally::default());
    let receiver = tokio::spawn(receive(events, args.count, tally.clone()));
    let traffic = Arc::new(Traffic {
        src: Endpoint {
            mac: [0x02, 0, 0, 0, 0, 1],
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9000),
        },
        dst: Endpoint {
            mac: [0x02, 0, 0, 0, 0, 2],
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 9001),
        },
        size: args.size,
        segment: args.segment,
        batch: args.batch.max(1) as u64,
        producers: args.producers.max(1),
    });

    let started = Instant::now();
    let share = args.count.div_ceil(traffic.producers);
    let producers: Vec<_> = (0..traffic.producers)
        .map(|p| {
            let seqs = (p * share).min(args.count)..((p + 1) * share).min(args.count);
            tokio::spawn(produce(sim.clone(), traffic.clone(), tally.clone(), p, seqs))
        })
        .collect();

    let (mut flapped, mut stalled) = (!args.flap, stall.is_none());
    while !producers.iter().all(|h| h.is_finished()) {
        let sent = tally.sent.load(Ordering::Relaxed);
        if !flapped && sent >= args.count / 4 {
            flap_link(&sim).await;
            flapped = true;
        }
        if let Some(d) = stall.filter(|_| !stalled && sent >= args.count / 2) {
            log::info!("stalling TX for {}", humantime::format_duration(d));
            sim.nic.stall_tx(true);
            tokio::time::sleep(d).await;
            sim.nic.stall_tx(false);
            stalled = true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for h in producers {
        h.await??;
    }

    let deadline = started + timeout;
    let expected = args.count - tally.skipped.load(Ordering::Relaxed);
    let mut last = (0, Instant::now());
    while Instant::now() < deadline {
        let got = tally.received.load(Ordering::Relaxed);
        if got >= expected {
            break;
        }
        if got != last.0 {
            last = (got, Instant::now());
        } else if idle(&sim.ctx.stats()) && last.1.elapsed() > Duration::from_millis(500) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let elapsed = started.elapsed();

    let stats = sim.ctx.stats();
    let nic = sim.nic.stats();
    let sim = Arc::into_inner(sim).context("simulator still shared")?;
    let (pool, arena) = (sim.pool.clone(), sim.arena.clone());
    sim.shutdown().await;
    receiver.await?;
    let leaks = Leaks::check(&pool, &arena);

    report(&args, &tally, &stats, elapsed);
    log::info!("device: {nic:?}");
    log::info!("pool: {:?}, arena: {:?}", pool.stats(), arena.stats());
    if !leaks.is_clean() {
        bail!("leaked {} buffers and {} mappings", leaks.buffers, leaks.mappings);
    }
    let bad = tally.corrupt.load(Ordering::Relaxed) + tally.duplicate.load(Ordering::Relaxed);
    if bad > 0 {
        bail!("{bad} corrupt or duplicate frames");
    }
    Ok(())
}

/// Sends the frames `seqs` in batches. Producer `p` spreads its batches over
/// the queues starting at flow `p`.
async fn produce(
    sim: Arc<Sim>,
    t: Arc<Traffic>,
    tally: Arc<Tally>,
    p: u64,
    seqs: Range<u64>,
) -> anyhow::Result<()> {
    let mut flow = p as u32;
    let mut seq = seqs.start;
    while seq < seqs.end {
        let n = (seqs.end - seq).min(t.batch);
        let mut pkts = Vec::with_capacity(n as usize);
        for s in seq..seq + n {
            let frame = udp_frame(&t.src, &t.dst, &seq_payload(s, t.size))?;
            match to_packet(&*sim.pool, &frame, t.segment) {
                Some(mut pkt) => {
                    pkt.meta.flowid = Some(flow);
                    pkts.push(pkt);
                }
                None => {
                    tally.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        submit(&sim, pkts).await?;
        tally.sent.fetch_add(n, Ordering::Relaxed);
        seq += n;
        flow = flow.wrapping_add(t.producers as u32);
    }
    Ok(())
}

/// Submits `pkts`, backing off while the submission ring is full or a
/// watchdog reset has the interface down.
async fn submit(sim: &Sim, mut pkts: Vec<Packet>) -> anyhow::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match sim.ctx.submit(pkts) {
            Ok(()) => return Ok(()),
            Err(SubmitError::Full(back)) => {
                pkts = back;
                tokio::time::sleep(Duration::from_micros(100)).await;
            }
            Err(SubmitError::NotRunning(back)) if Instant::now() < deadline => {
                pkts = back;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Err(e) => bail!("submit failed: {e}"),
        }
    }
}

async fn flap_link(sim: &Sim) {
    log::info!("taking the link down");
    sim.nic.set_link(LinkState::Down);
    tokio::time::sleep(Duration::from_millis(100)).await;
    sim.nic.set_link(LinkState::Up);
}

/// Nothing queued or in flight on any queue.
fn idle(stats: &ContextStats) -> bool {
    stats.tx.iter().all(|t| t.in_use == 0 && t.ring.pending == 0)
}

async fn receive(mut events: UnboundedReceiver<StackEvent>, count: u64, tally: Arc<Tally>) {
    let mut seen = vec![false; count as usize];
    while let Some(ev) = events.recv().await {
        match ev {
            StackEvent::Packet { pkt, .. } => {
                let bytes = pkt.to_vec();
                let seq = udp_payload(&bytes).and_then(|(_, p)| payload_seq(p));
                match seq.and_then(|s| seen.get_mut(s as usize)) {
                    Some(slot) if *slot => {
                        tally.duplicate.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(slot) => {
                        *slot = true;
                        tally.received.fetch_add(1, Ordering::Relaxed);
                        tally.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    }
                    None => {
                        tally.corrupt.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            StackEvent::Link(state) => log::info!("link is {state:?}"),
            StackEvent::Hung(qid) => {
                log::warn!("queue {qid} hung, device reset");
                tally.hung.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn report(args: &Args, tally: &Tally, stats: &ContextStats, elapsed: Duration) {
    let received = tally.received.load(Ordering::Relaxed);
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "sent {} received {} ({:.1}%) in {}, {:.0} frames/s, {:.1} MB/s",
        args.count,
        received,
        received as f64 * 100.0 / args.count.max(1) as f64,
        humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)),
        received as f64 / secs,
        tally.bytes.load(Ordering::Relaxed) as f64 / secs / 1e6,
    );
    println!(
        "skipped {} corrupt {} duplicate {} hung {} watchdog resets {}",
        tally.skipped.load(Ordering::Relaxed),
        tally.corrupt.load(Ordering::Relaxed),
        tally.duplicate.load(Ordering::Relaxed),
        tally.hung.load(Ordering::Relaxed),
        stats.watchdog_events,
    );
    for t in &stats.tx {
        let c = &t.counters;
        println!(
            "txq {}: {} packets, {} doorbells, {} defrag, {} map failures, {} no-desc, {} flushed",
            t.id, c.packets, c.doorbells, c.defrag, c.map_failed, c.no_desc_avail, c.flushed
        );
    }
    for r in &stats.rx {
        let Some(fl) = r.free_lists.first() else {
            continue;
        };
        println!(
            "rxq {}: {} packets, {} allocs, {} alloc failures, {} map failures",
            r.id, r.packets, fl.allocs, fl.alloc_failures, fl.map_failures
        );
    }
}
