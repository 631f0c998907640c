//! End-to-end scenarios: engines talking over the ideal fabric.

use std::time::Duration;

use rand::{Rng, SeedableRng};

use msgsim::app::{Call, CallReturn, MsgArgs};
use msgsim::config::EngineConfig;
use msgsim::engine::EngineError;
use msgsim::heap::SimAddr;
use msgsim::nic::{WireHeader, SHORT_MSG_Q};
use msgsim::request::{Datatype, IoVec, MatchInfo, RankId, ANY_SRC, ANY_TAG};
use msgsim::time::MonotonicTime;
use msgsim::wait::WaitOutcome;
use msgsim_util::bench::{Bench, BenchBuilder, ExecutionError};
use msgsim_util::fabric::WireEvent;
use msgsim_util::helper_models::{Journal, Op, PingPong, Script};

const BUF: SimAddr = SimAddr::new(0x10_0000);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn bytes(peer: RankId, tag: u64, len: u32) -> MsgArgs {
    MsgArgs::new(BUF, len, Datatype::Char, peer, tag)
}

fn script(ops: Vec<Op>) -> (Script, Journal) {
    let s = Script::new(ops);
    let j = s.journal();

    (s, j)
}

fn bench_of(config: EngineConfig, scripts: Vec<Script>) -> Bench {
    init_tracing();

    scripts
        .into_iter()
        .fold(BenchBuilder::new().with_config(config), |b, s| b.add_app(s))
        .build()
        .unwrap()
}

fn done(ret: &CallReturn) -> &WaitOutcome {
    match ret {
        CallReturn::Done(outcome) => outcome,
        other => panic!("expected a completed call, got {:?}", other),
    }
}

fn info(ret: &CallReturn) -> MatchInfo {
    done(ret).first().and_then(|s| s.info).unwrap()
}

fn at_us(us: u64) -> MonotonicTime {
    MonotonicTime::EPOCH + Duration::from_micros(us)
}

#[test]
fn eager_message_is_delivered() {
    let (s0, j0) = script(vec![Op::Call(Call::Send(bytes(1, 5, 64)))]);
    let (s1, j1) = script(vec![Op::Call(Call::Recv(bytes(0, 5, 64)))]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1]);

    let report = bench.run().unwrap();

    assert_eq!(j0.len(), 1);
    assert_eq!(
        info(&j1.returns()[0]),
        MatchInfo {
            tag: 5,
            rank: 0,
            count: 64
        }
    );
    assert_eq!(report.stats[0].eager_sends, 1);
    assert_eq!(report.stats[0].rendezvous_sends, 0);
    assert_eq!(report.stats[1].matched, 1);
    assert!(matches!(
        bench.fabric().log(),
        [WireEvent::Delivered {
            src: 0,
            dest: 1,
            tag: SHORT_MSG_Q,
            len: 96,
            ..
        }]
    ));
}

#[test]
fn rendezvous_gets_then_acknowledges() {
    const LEN: u32 = 1024 * 1024;

    let (s0, j0) = script(vec![Op::Call(Call::Send(bytes(1, 5, LEN)))]);
    let (s1, j1) = script(vec![Op::Call(Call::Recv(bytes(0, 5, LEN)))]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1]);

    let report = bench.run().unwrap();
    assert_eq!(report.stats[0].rendezvous_sends, 1);
    assert_eq!(info(&j1.returns()[0]).count, LEN);

    let log = bench.fabric().log();
    assert_eq!(log.len(), 3);

    let (hdr_time, rdv) = match &log[0] {
        WireEvent::Delivered {
            time,
            src: 0,
            dest: 1,
            tag: SHORT_MSG_Q,
            hdr: WireHeader::Match(hdr),
            ..
        } => (*time, hdr.key),
        other => panic!("expected the rendezvous header, got {:?}", other),
    };
    assert!(rdv.is_rendezvous());

    let get_time = match &log[1] {
        WireEvent::GetDone {
            time,
            node: 1,
            from: 0,
            rdv: key,
            len,
        } => {
            assert_eq!(*key, rdv);
            assert_eq!(*len, LEN as usize);
            *time
        }
        other => panic!("expected the GET, got {:?}", other),
    };
    assert!(get_time > hdr_time);

    match &log[2] {
        WireEvent::Delivered {
            time,
            src: 1,
            dest: 0,
            tag,
            hdr: WireHeader::Ack(key),
            ..
        } => {
            assert_eq!(*key, rdv);
            assert_eq!(*tag, rdv.as_tag());
            assert!(*time > get_time);
            // The sender only returns once acknowledged.
            assert!(j0.entries()[0].0 >= *time);
        }
        other => panic!("expected the acknowledgement, got {:?}", other),
    }
}

#[test]
fn length_threshold_selects_protocol() {
    let config = EngineConfig {
        short_msg_length: 1024,
        ..EngineConfig::default()
    };
    let (s0, _) = script(vec![
        Op::Call(Call::Send(bytes(1, 1, 1024))),
        Op::Call(Call::Send(bytes(1, 2, 1025))),
    ]);
    let (s1, j1) = script(vec![
        Op::Call(Call::Recv(bytes(0, 1, 1024))),
        Op::Call(Call::Recv(bytes(0, 2, 1025))),
    ]);
    let mut bench = bench_of(config, vec![s0, s1]);

    let report = bench.run().unwrap();

    assert_eq!(report.stats[0].eager_sends, 1);
    assert_eq!(report.stats[0].rendezvous_sends, 1);
    let tags: Vec<u64> = j1.returns().iter().map(|r| info(r).tag).collect();
    assert_eq!(tags, vec![1, 2]);
    let gets: Vec<usize> = bench
        .fabric()
        .log()
        .iter()
        .filter_map(|e| match e {
            WireEvent::GetDone { len, .. } => Some(*len),
            _ => None,
        })
        .collect();
    assert_eq!(gets, vec![1025]);
}

#[test]
fn random_lengths_follow_the_threshold() {
    init_tracing();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x11);
    let config = EngineConfig {
        short_msg_length: 1024,
        ..EngineConfig::default()
    };
    let lens: Vec<u32> = (0..16).map(|_| rng.gen_range(1..4096)).collect();
    let (s0, _) = script(
        lens.iter()
            .enumerate()
            .map(|(i, &len)| Op::Call(Call::Send(bytes(1, i as u64, len))))
            .collect(),
    );
    let (s1, j1) = script(
        lens.iter()
            .enumerate()
            .map(|(i, &len)| Op::Call(Call::Recv(bytes(0, i as u64, len))))
            .collect(),
    );
    let start = at_us(1_000);
    let mut bench = BenchBuilder::new()
        .with_config(config)
        .with_start_time(start)
        .add_app(s0)
        .add_app(s1)
        .build()
        .unwrap();

    let report = bench.run().unwrap();

    let eager = lens.iter().filter(|&&len| len <= 1024).count() as u64;
    assert_eq!(report.stats[0].eager_sends, eager);
    assert_eq!(report.stats[0].rendezvous_sends, lens.len() as u64 - eager);
    let counts: Vec<u32> = j1.returns().iter().map(|r| info(r).count).collect();
    assert_eq!(counts, lens);
    assert!(j1.entries().iter().all(|(time, _)| *time > start));
}

#[test]
fn ragged_vectored_send_aborts_the_run() {
    let iov = vec![
        IoVec::new(BUF, 4096),
        IoVec::new(SimAddr::new(0x20_0000), 2),
    ];
    let (s0, _) = script(vec![Op::Call(Call::Send(MsgArgs::vectored(
        iov,
        Datatype::Int,
        1,
        9,
    )))]);
    let (s1, j1) = script(vec![Op::Call(Call::Recv(MsgArgs::new(
        BUF,
        1024,
        Datatype::Int,
        0,
        9,
    )))]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1]);

    match bench.run() {
        Err(ExecutionError::Fatal(e)) => {
            assert_eq!(e.node, 0);
            assert_eq!(
                e.error,
                EngineError::PartialElement {
                    len: 4098,
                    dtype_size: 4
                }
            );
        }
        other => panic!("expected a fatal error, got {:?}", other),
    }
    assert!(j1.is_empty());
    assert!(bench.fabric().log().is_empty());
}

#[test]
fn wildcard_receives_take_any_source_and_tag() {
    let (s0, _) = script(vec![Op::Call(Call::Send(bytes(2, 1, 8)))]);
    let (s1, _) = script(vec![Op::Call(Call::Send(bytes(2, 2, 8)))]);
    let (s2, j2) = script(vec![
        Op::Call(Call::Irecv(bytes(ANY_SRC, ANY_TAG, 8))),
        Op::Call(Call::Irecv(bytes(ANY_SRC, ANY_TAG, 8))),
        Op::WaitAll(vec![0, 1]),
    ]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1, s2]);

    bench.run().unwrap();

    let returns = j2.returns();
    assert_eq!(returns.len(), 3);
    let mut got: Vec<(RankId, u64)> = done(&returns[2])
        .completed
        .iter()
        .map(|c| c.status.info.unwrap())
        .map(|i| (i.rank, i.tag))
        .collect();
    got.sort();
    assert_eq!(got, vec![(0, 1), (1, 2)]);
}

#[test]
fn wildcard_receive_takes_oldest_unexpected() {
    let (s0, _) = script(vec![Op::Call(Call::Send(bytes(2, 1, 8)))]);
    let (s1, _) = script(vec![
        Op::Call(Call::Compute(Duration::from_micros(5))),
        Op::Call(Call::Send(bytes(2, 2, 8))),
    ]);
    let (s2, j2) = script(vec![
        Op::Call(Call::Compute(Duration::from_micros(50))),
        Op::Call(Call::MakeProgress),
        Op::Call(Call::Recv(bytes(ANY_SRC, ANY_TAG, 8))),
        Op::Call(Call::Recv(bytes(ANY_SRC, ANY_TAG, 8))),
    ]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1, s2]);

    let report = bench.run().unwrap();

    let returns = j2.returns();
    let first = info(&returns[2]);
    let second = info(&returns[3]);
    assert_eq!((first.rank, first.tag), (0, 1));
    assert_eq!((second.rank, second.tag), (1, 2));
    assert_eq!(report.stats[2].unexpected, 2);
}

#[test]
fn ignored_tag_bits_are_masked() {
    let (s0, _) = script(vec![Op::Call(Call::Send(bytes(1, 0x1ab, 8)))]);
    let (s1, j1) = script(vec![Op::Call(Call::Recv(
        bytes(0, 0x100, 8).with_ignore(0xff),
    ))]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1]);

    bench.run().unwrap();

    assert_eq!(info(&j1.returns()[0]).tag, 0x1ab);
}

#[test]
fn cancelled_receive_is_not_matched() {
    let (s0, _) = script(vec![
        Op::Call(Call::Compute(Duration::from_micros(10))),
        Op::Call(Call::Send(bytes(1, 9, 8))),
    ]);
    let (s1, j1) = script(vec![
        Op::Call(Call::Irecv(bytes(0, 9, 8))),
        Op::Cancel(0),
        Op::Call(Call::Recv(bytes(0, 9, 8))),
    ]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1]);

    let report = bench.run().unwrap();

    let returns = j1.returns();
    assert!(matches!(returns[0], CallReturn::Posted(_)));
    assert_eq!(returns[1], CallReturn::Cancel { cancelled: true });
    assert_eq!(info(&returns[2]).rank, 0);
    assert_eq!(report.stats[1].cancelled, 1);
    assert_eq!(report.stats[1].matched, 1);
}

#[test]
fn test_then_wait_any() {
    let (s0, _) = script(vec![
        Op::Call(Call::Compute(Duration::from_micros(20))),
        Op::Call(Call::Send(bytes(1, 2, 8))),
    ]);
    let (s1, j1) = script(vec![
        Op::Call(Call::Irecv(bytes(0, 1, 8))),
        Op::Call(Call::Irecv(bytes(0, 2, 8))),
        Op::TestAny(vec![0, 1]),
        Op::WaitAny(vec![0, 1]),
        Op::Cancel(0),
    ]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1]);

    bench.run().unwrap();

    let returns = j1.returns();
    match &returns[2] {
        CallReturn::Test { flag, outcome } => {
            assert!(!flag);
            assert!(outcome.completed.is_empty());
        }
        other => panic!("expected a test result, got {:?}", other),
    }
    let any = done(&returns[3]);
    assert_eq!(any.completed.len(), 1);
    assert_eq!(any.completed[0].index, 1);
    assert_eq!(any.completed[0].status.info.map(|i| i.tag), Some(2));
    assert_eq!(returns[4], CallReturn::Cancel { cancelled: true });
}

#[test]
fn held_messages_are_pulled_in_by_need_recv() {
    let config = EngineConfig {
        min_posted_short_buffers: 1,
        ..EngineConfig::default()
    };
    let (s0, j0) = script(vec![
        Op::Call(Call::Isend(bytes(1, 0, 64))),
        Op::Call(Call::Isend(bytes(1, 1, 64))),
        Op::Call(Call::Isend(bytes(1, 2, 64))),
        Op::Call(Call::Isend(bytes(1, 3, 64))),
        Op::WaitAll(vec![0, 1, 2, 3]),
    ]);
    let (s1, j1) = script(vec![
        Op::Call(Call::Compute(Duration::from_micros(50))),
        Op::Call(Call::Recv(bytes(0, ANY_TAG, 64))),
        Op::Call(Call::Recv(bytes(0, ANY_TAG, 64))),
        Op::Call(Call::Recv(bytes(0, ANY_TAG, 64))),
        Op::Call(Call::Recv(bytes(0, ANY_TAG, 64))),
    ]);
    let mut bench = bench_of(config, vec![s0, s1]);

    let report = bench.run().unwrap();

    assert_eq!(done(&j0.returns()[4]).completed.len(), 4);
    let tags: Vec<u64> = j1.returns()[1..].iter().map(|r| info(r).tag).collect();
    assert_eq!(tags, vec![0, 1, 2, 3]);
    assert!(report.stats[1].need_recv_buffers >= 1);
    assert_eq!(bench.fabric().held(1), 0);
}

#[test]
fn progress_moves_arrivals_to_unexpected() {
    let (s0, _) = script(vec![Op::Call(Call::Send(bytes(1, 4, 32)))]);
    let (s1, j1) = script(vec![
        Op::Call(Call::Compute(Duration::from_micros(50))),
        Op::Call(Call::MakeProgress),
        Op::Call(Call::Recv(bytes(0, 4, 32))),
    ]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1]);

    let report = bench.run().unwrap();

    assert_eq!(j1.returns()[1], CallReturn::Progress);
    assert_eq!(info(&j1.returns()[2]).tag, 4);
    assert_eq!(report.stats[1].unexpected, 1);
    assert_eq!(report.stats[1].matched, 1);
}

#[test]
fn late_long_receive_gets_after_posting() {
    const LEN: u32 = 32 * 1024;

    let (s0, _) = script(vec![Op::Call(Call::Send(bytes(1, 7, LEN)))]);
    let (s1, j1) = script(vec![
        Op::Call(Call::Compute(Duration::from_micros(100))),
        Op::Call(Call::Recv(bytes(0, 7, LEN))),
    ]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1]);

    bench.run().unwrap();

    assert_eq!(info(&j1.returns()[1]).count, LEN);
    let get = bench
        .fabric()
        .log()
        .iter()
        .find(|e| matches!(e, WireEvent::GetDone { .. }))
        .map(WireEvent::time)
        .unwrap();
    assert!(get >= at_us(100));
}

#[test]
fn co_located_ranks_use_loopback() {
    let config = EngineConfig {
        nics_per_node: 2,
        ..EngineConfig::default()
    };
    let (s0, j0) = script(vec![
        Op::Call(Call::Send(bytes(1, 1, 64))),
        Op::Call(Call::Send(bytes(1, 2, 16 * 1024))),
    ]);
    let (s1, j1) = script(vec![
        Op::Call(Call::Recv(bytes(0, 1, 64))),
        Op::Call(Call::Recv(bytes(0, 2, 16 * 1024))),
    ]);
    let mut bench = bench_of(config, vec![s0, s1]);

    let report = bench.run().unwrap();

    assert!(bench.fabric().log().is_empty());
    assert_eq!(report.stats[0].loopback_sends, 2);
    assert_eq!(report.stats[0].eager_sends, 0);
    assert_eq!(report.stats[0].rendezvous_sends, 0);
    assert_eq!(j0.len(), 2);
    let got: Vec<(u64, u32)> = j1
        .returns()
        .iter()
        .map(info)
        .map(|i| (i.tag, i.count))
        .collect();
    assert_eq!(got, vec![(1, 64), (2, 16 * 1024)]);
}

#[test]
fn blocked_application_is_a_deadlock() {
    let (s0, _) = script(vec![Op::Call(Call::Recv(bytes(1, 3, 8)))]);
    let (s1, _) = script(Vec::new());
    let mut bench = bench_of(EngineConfig::default(), vec![s0, s1]);

    match bench.run() {
        Err(ExecutionError::Deadlock(nodes)) => assert_eq!(nodes, vec![0]),
        other => panic!("expected a deadlock, got {:?}", other),
    }
    assert!(bench.is_finished(1));
    assert!(!bench.is_finished(0));
}

#[test]
fn fatal_error_aborts_the_run() {
    let (s0, _) = script(vec![Op::Call(Call::Init)]);
    let mut bench = bench_of(EngineConfig::default(), vec![s0]);

    match bench.run() {
        Err(ExecutionError::Fatal(e)) => {
            assert_eq!(e.node, 0);
            assert_eq!(e.error, EngineError::AlreadyInitialized);
        }
        other => panic!("expected a fatal error, got {:?}", other),
    }
}

#[test]
fn ping_pong_completes() {
    init_tracing();
    let think = Duration::from_micros(1);
    let mut bench = BenchBuilder::new()
        .add_app(PingPong::initiator(1, 256, 10).with_think_time(think))
        .add_app(PingPong::responder(0, 256, 10).with_think_time(think))
        .build()
        .unwrap();

    let report = bench.run().unwrap();

    for stats in &report.stats {
        assert_eq!(stats.sends, 10);
        assert_eq!(stats.recvs, 10);
        assert_eq!(stats.matched, 10);
    }
    assert!(report.end_time >= at_us(20));
}
