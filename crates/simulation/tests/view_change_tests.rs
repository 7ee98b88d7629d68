//! View-change scenarios: silent primaries, equivocation, and fault
//! thresholds.

use palisade_pbft::PbftConfig;
use palisade_simulation::{ByzantineMode, NetworkConfig, SimulationRunner};
use palisade_types::{ClientId, Digest, KeyPair, Request};
use std::collections::HashMap;
use std::time::Duration;
use tracing_test::traced_test;

fn four_replica_config() -> NetworkConfig {
    NetworkConfig {
        num_replicas: 4,
        latency: Duration::from_millis(10),
        jitter_fraction: 0.1,
        packet_loss_rate: 0.0,
    }
}

fn byzantine_pbft_config() -> PbftConfig {
    PbftConfig {
        checkpoint_period: 5,
        request_timeout: Duration::from_millis(500),
        new_view_timeout: Duration::from_millis(500),
        byzantine: true,
    }
}

fn request(seed: u8) -> Request {
    let key = KeyPair::from_seed(&[200 + seed; 32]);
    Request::new(
        format!("op-{seed}").into_bytes(),
        ClientId(seed as u64),
        seed as u64,
        &key,
    )
}

fn assert_agreement(runner: &SimulationRunner, num_replicas: u32) {
    for a in 0..num_replicas {
        let by_seq: HashMap<u64, Digest> = runner.delivered(a).iter().copied().collect();
        for b in a + 1..num_replicas {
            for (seq_no, digest) in runner.delivered(b) {
                if let Some(other) = by_seq.get(seq_no) {
                    assert_eq!(
                        other, digest,
                        "replicas {a} and {b} disagree at seq {seq_no}"
                    );
                }
            }
        }
    }
}

#[traced_test]
#[test]
fn test_silent_primary_recovers_through_view_change() {
    let mut runner = SimulationRunner::new(four_replica_config(), byzantine_pbft_config(), 21);
    runner.set_byzantine(0, ByzantineMode::Silent);

    let req = request(1);
    let digest = req.digest();
    runner.submit_request(1, req);
    runner.run_for(Duration::from_secs(5));

    // The correct replicas moved to view 1 (new primary: replica 1) and
    // delivered the request there.
    for r in 1..4 {
        assert_eq!(runner.replica(r).view(), 1, "replica {r} view");
        assert!(runner.replica(r).is_active(), "replica {r} active");
        assert!(
            runner.view_changes(r).contains(&1),
            "replica {r} never installed view 1"
        );
        assert_eq!(
            runner.delivered(r),
            &[(1, digest)],
            "replica {r} delivery log"
        );
        assert!(runner.halted(r).is_none());
    }
    assert_agreement(&runner, 4);
}

#[traced_test]
#[test]
fn test_view_change_with_no_pending_work_keeps_log_empty() {
    // The primary goes silent before any request exists; a later request
    // still triggers the view change (the primary never orders it) and
    // nothing is delivered twice or out of order.
    let mut runner = SimulationRunner::new(four_replica_config(), byzantine_pbft_config(), 22);
    runner.set_byzantine(0, ByzantineMode::Silent);

    runner.run_for(Duration::from_secs(2));
    // No work, no timers, no view change.
    for r in 1..4 {
        assert_eq!(runner.replica(r).view(), 0);
        assert!(runner.delivered(r).is_empty());
    }

    let req = request(3);
    let digest = req.digest();
    runner.submit_request(2, req);
    runner.run_for(Duration::from_secs(5));

    for r in 1..4 {
        assert_eq!(runner.replica(r).view(), 1, "replica {r}");
        assert_eq!(runner.delivered(r), &[(1, digest)]);
    }
}

#[traced_test]
#[test]
fn test_equivocating_primary_cannot_split_the_log() {
    let mut runner = SimulationRunner::new(four_replica_config(), byzantine_pbft_config(), 23);
    runner.set_byzantine(0, ByzantineMode::EquivocatePrePrepare);

    // Two requests give the equivocator a second digest to play with.
    let req_a = request(1);
    let req_b = request(2);
    let digest_a = req_a.digest();
    let digest_b = req_b.digest();
    runner.submit_request(0, req_a);
    runner.run_for(Duration::from_millis(50));
    runner.submit_request(0, req_b);
    runner.run_for(Duration::from_secs(10));

    // The split assignments cannot all commit; the view changes and the
    // correct replicas converge on one order covering both requests.
    for r in 1..4 {
        assert!(runner.halted(r).is_none(), "replica {r} halted");
        assert!(
            runner.replica(r).view() >= 1,
            "replica {r} never left the equivocator's view"
        );
        let digests: Vec<Digest> = runner.delivered(r).iter().map(|(_, d)| *d).collect();
        assert!(digests.contains(&digest_a), "replica {r} lost request A");
        assert!(digests.contains(&digest_b), "replica {r} lost request B");
    }
    assert_agreement(&runner, 4);

    // Quiescent network: the correct replicas hold identical logs.
    let reference = runner.delivered(1).to_vec();
    for r in 2..4 {
        assert_eq!(runner.delivered(r), reference.as_slice(), "replica {r}");
    }
}

#[traced_test]
#[test]
fn test_f_faults_tolerated_f_plus_one_not() {
    let mut runner = SimulationRunner::new(four_replica_config(), byzantine_pbft_config(), 24);

    // Exactly f = 1 unreachable replica: progress continues.
    runner.network_mut().isolate_replica(3);
    let req = request(1);
    let digest = req.digest();
    runner.submit_request(0, req);
    runner.run_for(Duration::from_secs(2));

    for r in 0..3 {
        assert_eq!(
            runner.delivered(r),
            &[(1, digest)],
            "replica {r} should progress with f faults"
        );
    }
    assert!(runner.delivered(3).is_empty());

    // f + 1 = 2 unreachable replicas: the rest cannot form quorums.
    runner.network_mut().isolate_replica(2);
    runner.submit_request(0, request(2));
    runner.run_for(Duration::from_secs(5));

    for r in 0..4 {
        assert_eq!(
            runner.delivered(r).len(),
            if r < 3 { 1 } else { 0 },
            "replica {r} must not progress past the first request"
        );
        assert!(runner.halted(r).is_none());
    }
}

#[traced_test]
#[test]
fn test_lagging_replica_catches_up_via_state_transfer() {
    // Replica 3 misses the first checkpoint interval entirely, then
    // rejoins: the stable checkpoint evidence pulls it forward through
    // the fetch hook.
    let mut runner = SimulationRunner::new(four_replica_config(), byzantine_pbft_config(), 25);
    runner.network_mut().isolate_replica(3);

    for seed in 1..=5 {
        runner.submit_request(0, request(seed));
        runner.run_for(Duration::from_millis(100));
    }
    runner.run_for(Duration::from_secs(2));
    for r in 0..3 {
        assert_eq!(runner.replica(r).low_watermark(), 5, "replica {r}");
    }
    assert!(runner.delivered(3).is_empty());

    // Heal and generate the next checkpoint interval; replica 3 sees the
    // new checkpoint votes and transfers state.
    runner.network_mut().heal_all();
    for seed in 6..=10 {
        runner.submit_request(0, request(seed));
        runner.run_for(Duration::from_millis(100));
    }
    runner.run_for(Duration::from_secs(5));

    assert!(
        runner.replica(3).low_watermark() >= 5,
        "replica 3 never caught up: h = {}",
        runner.replica(3).low_watermark()
    );
    assert!(runner.halted(3).is_none());
    assert_agreement(&runner, 4);
}
