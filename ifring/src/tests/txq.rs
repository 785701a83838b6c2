use std::time::Duration;

use super::mock::{Harness, params};
use crate::config::{DoorbellPolicy, EngineConfig};
use crate::device::LinkState;
use crate::error::{EncapError, SubmitError};
use crate::mp_ring::RingState;
use crate::txq::{QueueState, TxQueue};

fn queue(h: &Harness) -> std::sync::Arc<TxQueue> {
    let txq = TxQueue::new(0, h.shared.clone());
    txq.start();
    txq
}

fn immediate() -> EngineConfig {
    EngineConfig {
        doorbell: Some(DoorbellPolicy::Immediate),
        ..EngineConfig::default()
    }
}

#[test]
fn test_transmit_encodes_and_rings() {
    let h = Harness::new(params(), immediate());
    let txq = queue(&h);
    let pkts = (0..3).map(|_| h.pool.packet(&[60])).collect();
    txq.transmit(pkts).unwrap();

    let stats = txq.stats();
    assert_eq!(stats.counters.packets, 3);
    assert_eq!(stats.counters.bytes, 180);
    assert_eq!(stats.in_use, 3);
    assert_eq!(stats.ring.state, RingState::Idle);
    assert_eq!(h.dev.calls().tx_flushes, vec![(0, 3)]);
}

#[test]
fn test_no_descriptors_leaves_rest_queued() {
    let h = Harness::new(params(), immediate());
    let txq = queue(&h);
    h.dev.script_encap([
        Ok(()),
        Err(EncapError::NoDescriptors),
        Err(EncapError::NoDescriptors),
    ]);
    let pkts = (0..3).map(|_| h.pool.packet(&[60])).collect();
    txq.transmit(pkts).unwrap();

    let stats = txq.stats();
    assert_eq!(stats.counters.packets, 1);
    assert_eq!(stats.ring.pending, 2);
    assert_eq!(stats.ring.state, RingState::Stalled);
    assert!(txq.task().is_pending());
    assert_eq!(h.mapper.active(), 1);
    assert_eq!(h.pool.outstanding(), 3);

    txq.check_drain(64);
    let stats = txq.stats();
    assert_eq!(stats.counters.packets, 3);
    assert_eq!(stats.ring.state, RingState::Idle);
}

#[test]
fn test_unencodable_packet_is_dropped_once() {
    let mut p = params();
    p.tx_nsegments = 2;
    let h = Harness::new(p, immediate());
    let txq = queue(&h);
    // full segments leave no tailroom to collapse into, and 4 x 2000 bytes
    // exceeds the largest pool buffer
    let pkt = h.pool.packet(&[2000, 2000, 2000, 2000]);
    txq.transmit(vec![pkt]).unwrap();

    let c = txq.stats().counters;
    assert_eq!(c.defrag_failed, 1);
    assert_eq!(c.map_failed, 1);
    assert_eq!(c.packets, 0);
    assert!(h.dev.calls().encaps.is_empty());
    assert_eq!(txq.stats().in_use, 0);
    assert_eq!(h.pool.outstanding(), 0);
    assert_eq!(h.mapper.active(), 0);
}

#[test]
fn test_collapse_rescues_fragmented_packet() {
    let mut p = params();
    p.tx_nsegments = 2;
    let h = Harness::new(p, immediate());
    let txq = queue(&h);
    let pkt = h.pool.packet_with_room(512, &[40, 40, 40, 40]);
    txq.transmit(vec![pkt]).unwrap();

    let calls = h.dev.calls();
    assert_eq!(calls.encaps.len(), 1);
    assert_eq!(calls.encaps[0].nsegs, 2);
    assert_eq!(calls.encaps[0].len, 160);
    assert_eq!(txq.stats().counters.defrag, 0);
}

#[test]
fn test_defrag_after_device_rejects_segments() {
    let h = Harness::new(params(), immediate());
    let txq = queue(&h);
    h.dev.script_encap([Err(EncapError::TooManySegments)]);
    let pkt = h.pool.packet(&[100, 100, 100]);
    txq.transmit(vec![pkt]).unwrap();

    let c = txq.stats().counters;
    assert_eq!(c.encap_efbig, 1);
    assert_eq!(c.defrag, 1);
    assert_eq!(c.packets, 1);
    let calls = h.dev.calls();
    assert_eq!(calls.encaps.len(), 2);
    assert_eq!(calls.encaps[1].nsegs, 1);
}

#[test]
fn test_producer_index_follows_encap() {
    let h = Harness::new(params(), immediate());
    let txq = queue(&h);
    let mut expected_pidx = 0;
    for round in 0..6 {
        let pkts = (0..2).map(|_| h.pool.packet(&[64, 64, 64])).collect();
        txq.transmit(pkts).unwrap();
        let calls = h.dev.calls();
        let last = *calls.encaps.last().unwrap();
        assert_eq!(last.pidx, (expected_pidx + 3) % 16, "round {round}");
        expected_pidx = (last.pidx + 3) % 16;
        let &(_, flushed) = calls.tx_flushes.last().unwrap();
        assert_eq!(flushed, expected_pidx);
        assert_eq!(txq.stats().pidx, expected_pidx);
        drop(calls);
        h.dev.complete(0, 6);
    }
}

#[test]
fn test_completions_release_buffers() {
    let h = Harness::new(params(), immediate());
    let txq = queue(&h);
    let pkts = (0..4).map(|_| h.pool.packet(&[60, 30])).collect();
    txq.transmit(pkts).unwrap();
    assert_eq!(txq.stats().in_use, 8);
    assert_eq!(h.pool.outstanding(), 8);

    h.dev.complete(0, 8);
    txq.tx_task();
    let stats = txq.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.processed, 8);
    assert_eq!(stats.cleaned, 8);
    assert_eq!(stats.counters.reclaimed, 8);
    assert_eq!(h.pool.outstanding(), 0);
    assert_eq!(h.mapper.active(), 0);
}

#[test]
fn test_doorbell_threshold_and_fallback() {
    let cfg = EngineConfig {
        doorbell: Some(DoorbellPolicy::Deferred {
            threshold: 2,
            min_occupancy: 0,
            delay: Duration::from_millis(1),
        }),
        ..EngineConfig::default()
    };
    let h = Harness::new(params(), cfg);
    let txq = queue(&h);
    let pkts = (0..5).map(|_| h.pool.packet(&[60])).collect();
    txq.transmit(pkts).unwrap();
    // two threshold rings, then no runtime to arm the callout on
    assert_eq!(h.dev.calls().tx_flushes, vec![(0, 2), (0, 4), (0, 5)]);
}

#[test]
fn test_link_down_keeps_submissions() {
    let h = Harness::new(params(), immediate());
    let txq = queue(&h);
    h.shared.set_link(LinkState::Down);
    let pkts = (0..2).map(|_| h.pool.packet(&[60])).collect();
    txq.transmit(pkts).unwrap();
    let stats = txq.stats();
    assert_eq!(stats.ring.pending, 2);
    assert!(stats.counters.not_ready > 0);
    assert!(h.dev.calls().encaps.is_empty());

    h.shared.set_link(LinkState::Up);
    txq.check_drain(64);
    assert_eq!(txq.stats().counters.packets, 2);
    assert_eq!(txq.stats().ring.pending, 0);
}

#[test]
fn test_full_ring_rejects_whole_batch() {
    let cfg = EngineConfig {
        submit_ring_size: Some(8),
        ..immediate()
    };
    let h = Harness::new(params(), cfg);
    let txq = queue(&h);
    h.shared.set_link(LinkState::Down);
    let pkts = (0..7).map(|_| h.pool.packet(&[60])).collect();
    txq.transmit(pkts).unwrap();

    let back = match txq.transmit(vec![h.pool.packet(&[60])]) {
        Err(SubmitError::Full(back)) => back,
        other => panic!("expected Full, got {other:?}"),
    };
    assert_eq!(back.len(), 1);
    assert_eq!(txq.stats().ring.pending, 7);
}

#[test]
fn test_closed_queue_rejects() {
    let h = Harness::new(params(), immediate());
    let txq = queue(&h);
    txq.close();
    let err = txq.transmit(vec![h.pool.packet(&[60])]).unwrap_err();
    assert!(matches!(err, SubmitError::Closed(_)));
    assert_eq!(err.into_packets().len(), 1);
}

#[test]
fn test_watchdog_strikes() {
    let h = Harness::new(params(), immediate());
    let txq = queue(&h);
    assert_eq!(txq.watchdog_check(), QueueState::Active);

    txq.transmit(vec![h.pool.packet(&[60])]).unwrap();
    assert_eq!(txq.watchdog_check(), QueueState::Active);
    assert_eq!(txq.watchdog_check(), QueueState::Active);
    assert_eq!(txq.watchdog_check(), QueueState::Hung);
    assert_eq!(txq.state(), QueueState::Hung);

    txq.clear_hang();
    assert_eq!(txq.state(), QueueState::Active);
    // an unreclaimed completion counts as progress
    h.dev.complete(0, 1);
    assert_eq!(txq.watchdog_check(), QueueState::Active);
    txq.tx_task();
    assert_eq!(txq.watchdog_check(), QueueState::Active);
    assert_eq!(txq.stats().in_use, 0);
}

#[test]
fn test_stop_releases_in_flight() {
    let h = Harness::new(params(), immediate());
    let txq = queue(&h);
    let pkts = (0..3).map(|_| h.pool.packet(&[60])).collect();
    txq.transmit(pkts).unwrap();
    assert_eq!(txq.stop(), 3);
    let stats = txq.stats();
    assert_eq!(stats.state, QueueState::Idle);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.pidx, 0);
    assert_eq!(stats.counters.packets, 0);
    assert_eq!(h.pool.outstanding(), 0);
    assert_eq!(h.mapper.active(), 0);
}

#[test]
fn test_doorbell_threshold_counts_descriptors() {
    let cfg = EngineConfig {
        doorbell: Some(DoorbellPolicy::Deferred {
            threshold: 6,
            min_occupancy: 0,
            delay: Duration::from_millis(1),
        }),
        ..EngineConfig::default()
    };
    let h = Harness::new(params(), cfg);
    let txq = queue(&h);
    let pkts = (0..3).map(|_| h.pool.packet(&[60, 60, 60])).collect();
    txq.transmit(pkts).unwrap();

    // two 3-descriptor packets reach the threshold; without a runtime the
    // remainder is rung at the end of the batch
    assert_eq!(h.dev.calls().tx_flushes, vec![(0, 6), (0, 9)]);
    assert_eq!(txq.stats().counters.doorbells, 2);
}
