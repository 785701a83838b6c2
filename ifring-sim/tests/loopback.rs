use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use ifring::{EngineConfig, LinkState, Packet};
use ifring_sim::frame::{Endpoint, payload_seq, seq_payload, to_packet, udp_frame, udp_payload};
use ifring_sim::{Leaks, Sim, SimConfig, StackEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, timeout};

#[derive(Debug, Default)]
struct Collected {
    frames: Vec<(u16, u64)>,
    corrupt: usize,
    links: Vec<LinkState>,
    hung: Vec<u16>,
}

impl Collected {
    /// Reads events until `done` holds or `limit` passes.
    async fn until(
        &mut self,
        events: &mut UnboundedReceiver<StackEvent>,
        limit: Duration,
        done: impl Fn(&Collected) -> bool,
    ) {
        let deadline = Instant::now() + limit;
        while !done(self) {
            let left = deadline.saturating_duration_since(Instant::now());
            match timeout(left, events.recv()).await {
                Ok(Some(ev)) => self.push(ev),
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn push(&mut self, ev: StackEvent) {
        match ev {
            StackEvent::Packet { qid, pkt } => {
                let bytes = pkt.to_vec();
                match udp_payload(&bytes).and_then(|(_, p)| payload_seq(p)) {
                    Some(seq) => self.frames.push((qid, seq)),
                    None => self.corrupt += 1,
                }
            }
            StackEvent::Link(state) => self.links.push(state),
            StackEvent::Hung(qid) => self.hung.push(qid),
        }
    }
}

fn endpoints() -> (Endpoint, Endpoint) {
    (
        Endpoint {
            mac: [0x02, 0, 0, 0, 0, 1],
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9000),
        },
        Endpoint {
            mac: [0x02, 0, 0, 0, 0, 2],
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 9001),
        },
    )
}

fn frames(sim: &Sim, seqs: std::ops::Range<u64>, size: usize, seg: usize, flow: u32) -> Vec<Packet> {
    let (src, dst) = endpoints();
    seqs.map(|s| {
        let frame = udp_frame(&src, &dst, &seq_payload(s, size)).unwrap();
        let mut pkt = to_packet(&*sim.pool, &frame, seg).unwrap();
        pkt.meta.flowid = Some(flow);
        pkt
    })
    .collect()
}

fn small(nqsets: u16) -> SimConfig {
    SimConfig {
        nqsets,
        ntxd: 256,
        nrxd: 256,
        ..SimConfig::default()
    }
}

/// Submits `pkts`, retrying while a reset has the interface down.
async fn submit_when_running(sim: &Sim, mut pkts: Vec<Packet>) {
    for _ in 0..200 {
        match sim.ctx.submit(pkts) {
            Ok(()) => return,
            Err(e) => pkts = e.into_packets(),
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("interface did not come back");
}

async fn finish(sim: Sim) -> Leaks {
    let (pool, arena) = (sim.pool.clone(), sim.arena.clone());
    sim.shutdown().await;
    Leaks::check(&pool, &arena)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loopback_delivers_every_frame() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut sim = Sim::start(small(2), EngineConfig::default()).unwrap();
    let mut events = sim.take_events().unwrap();

    for batch in 0..30u64 {
        let pkts = frames(&sim, batch * 10..batch * 10 + 10, 600, 256, batch as u32);
        sim.ctx.submit(pkts).unwrap();
    }
    let mut got = Collected::default();
    got.until(&mut events, Duration::from_secs(5), |c| c.frames.len() >= 300)
        .await;

    assert_eq!(got.corrupt, 0);
    let seqs: HashSet<u64> = got.frames.iter().map(|&(_, s)| s).collect();
    assert_eq!(seqs.len(), 300);
    assert_eq!(got.frames.len(), 300);
    let queues: HashSet<u16> = got.frames.iter().map(|&(q, _)| q).collect();
    assert_eq!(queues.len(), 2);

    let stats = sim.ctx.stats();
    let sent: u64 = stats.tx.iter().map(|t| t.counters.packets).sum();
    assert_eq!(sent, 300);
    assert_eq!(sim.nic.stats().rx_no_buffer, 0);

    drop(events);
    assert!(finish(sim).await.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scattered_receive_strips_pad() {
    let mut sim = Sim::start(small(1), EngineConfig::default()).unwrap();
    let mut events = sim.take_events().unwrap();

    // 3042-byte frames span two 2048-byte receive buffers
    let pkts = frames(&sim, 0..4, 3000, 1024, 0);
    sim.ctx.submit(pkts).unwrap();
    let mut got = Collected::default();
    got.until(&mut events, Duration::from_secs(5), |c| c.frames.len() >= 4)
        .await;

    assert_eq!(got.corrupt, 0);
    assert_eq!(
        got.frames.iter().map(|&(_, s)| s).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    drop(events);
    assert!(finish(sim).await.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_link_down_holds_then_delivers() {
    let mut sim = Sim::start(small(1), EngineConfig::default()).unwrap();
    let mut events = sim.take_events().unwrap();
    let mut got = Collected::default();
    got.until(&mut events, Duration::from_secs(2), |c| !c.links.is_empty())
        .await;
    assert_eq!(got.links, vec![LinkState::Up]);

    sim.nic.set_link(LinkState::Down);
    got.until(&mut events, Duration::from_secs(2), |c| c.links.len() == 2)
        .await;
    assert_eq!(sim.ctx.link_state(), LinkState::Down);

    sim.ctx.submit(frames(&sim, 0..20, 100, 256, 0)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sim.ctx.stats().tx[0].ring.pending, 20);
    assert_eq!(sim.nic.stats().tx_frames, 0);

    sim.nic.set_link(LinkState::Up);
    got.until(&mut events, Duration::from_secs(5), |c| c.frames.len() >= 20)
        .await;
    assert_eq!(got.frames.len(), 20);
    assert_eq!(got.links, vec![LinkState::Up, LinkState::Down, LinkState::Up]);
    drop(events);
    assert!(finish(sim).await.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_queue_is_reset_once() {
    let engine = EngineConfig {
        watchdog_interval: Some(Duration::from_millis(20)),
        ..EngineConfig::default()
    };
    let mut sim = Sim::start(small(1), engine).unwrap();
    let mut events = sim.take_events().unwrap();
    let mut got = Collected::default();

    sim.nic.stall_tx(true);
    sim.ctx.submit(frames(&sim, 0..5, 100, 256, 0)).unwrap();
    got.until(&mut events, Duration::from_secs(3), |c| !c.hung.is_empty())
        .await;
    assert_eq!(got.hung, vec![0]);
    assert!(got.frames.is_empty());
    assert!(!sim.nic.is_stalled());
    assert_eq!(sim.nic.stats().resets, 1);
    assert_eq!(sim.ctx.stats().watchdog_events, 1);

    // the queue works again after the reset
    submit_when_running(&sim, frames(&sim, 5..10, 100, 256, 0)).await;
    got.until(&mut events, Duration::from_secs(5), |c| c.frames.len() >= 5)
        .await;
    let seqs: HashSet<u64> = got.frames.iter().map(|&(_, s)| s).collect();
    assert!((5..10).all(|s| seqs.contains(&s)));
    assert!(!seqs.iter().any(|&s| s < 5));
    assert_eq!(sim.ctx.stats().watchdog_events, 1);
    drop(events);
    assert!(finish(sim).await.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mapping_faults_do_not_leak() {
    let mut sim = Sim::start(small(1), EngineConfig::default()).unwrap();
    let mut events = sim.take_events().unwrap();
    sim.arena.inject_faults(7);

    for batch in 0..10u64 {
        sim.ctx
            .submit(frames(&sim, batch * 20..batch * 20 + 20, 300, 128, 0))
            .unwrap();
    }
    let mut got = Collected::default();
    got.until(&mut events, Duration::from_secs(2), |c| c.frames.len() >= 200)
        .await;

    assert_eq!(got.corrupt, 0);
    assert!(!got.frames.is_empty());
    assert!(got.frames.len() < 200);
    assert!(sim.arena.stats().injected_faults > 0);
    let tx = &sim.ctx.stats().tx[0];
    assert!(tx.counters.map_failed > 0);
    drop(events);
    assert!(finish(sim).await.is_clean());
}
