use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use adc_types::{AdcError, ChannelSet, Sample, SchedulerConfig};
use proptest::prelude::*;
use timer_service::TimerService;

use super::state::State;
use super::*;
use crate::mock::{DriverCommand, MockDriver, MockLog};
use crate::sinks::{EventRecord, Semaphore};

const CH0: ChannelSet = ChannelSet::single(0);
const WAIT: Duration = Duration::from_secs(2);

fn setup(slots: usize) -> (TimerService, Arc<AdcScheduler<MockDriver>>, MockLog) {
    let _ = env_logger::builder().is_test(true).try_init();
    let timers = TimerService::new().unwrap();
    let (driver, log) = MockDriver::new();
    let config = SchedulerConfig { max_low_speed: slots, ..SchedulerConfig::default() };
    let scheduler = AdcScheduler::new(driver, &timers, &config).unwrap();
    (timers, scheduler, log)
}

fn triggered(count: usize, fire_now: bool) -> DriverCommand {
    DriverCommand::TimerTriggered { channels: CH0, count, fire_now }
}

fn immediate(channel: u8) -> DriverCommand {
    DriverCommand::Immediate { channels: ChannelSet::single(channel), count: 1 }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn hundred_samples_ten_per_event_wraps_after_ten_events() {
    let (_timers, scheduler, log) = setup(2);
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    scheduler.start().unwrap();
    assert_eq!(
        log.take(),
        vec![DriverCommand::StartTimer { channels: CH0, frequency: 1000 }, triggered(10, false)]
    );

    for i in 0..10usize {
        scheduler.on_conversion_complete(&[i as Sample; 10]);
        let result = scheduler.last_result();
        assert_eq!(result.count, 10);
        assert_eq!(result.offset, i * 10);
        assert_eq!(result.sequence, i as u64 + 1);
        assert!(result.flags.is_clean());
        assert_eq!(log.last(), Some(triggered(10, false)));
    }

    let status = scheduler.status();
    assert_eq!(status.write_pos, 0);
    assert_eq!(status.remaining, 100);

    let mut out = [0; 10];
    assert_eq!(scheduler.read_high_speed(&scheduler.last_result(), &mut out), 10);
    assert_eq!(out, [9; 10]);
}

#[test]
fn uneven_buffer_shortens_the_block_before_wrap() {
    let (_timers, scheduler, log) = setup(1);
    scheduler.init(CH0, 500, vec![0; 25], 10).unwrap();
    scheduler.start().unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        let Some(DriverCommand::TimerTriggered { count, .. }) = log.last_conversion() else {
            panic!("expected a timer-triggered conversion");
        };
        scheduler.on_conversion_complete(&vec![1; count]);
        let result = scheduler.last_result();
        seen.push((result.offset, result.count));
    }
    assert_eq!(seen, vec![(0, 10), (10, 10), (20, 5), (0, 10)]);
}

#[test]
fn partial_completion_waits_for_rest_of_chunk() {
    let (_timers, scheduler, log) = setup(1);
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    scheduler.start().unwrap();
    log.take();

    scheduler.on_conversion_complete(&[1; 4]);
    assert!(log.take().is_empty());
    let first = scheduler.last_result();
    assert_eq!((first.offset, first.count, first.sequence), (0, 4, 1));

    scheduler.on_conversion_complete(&[2; 6]);
    let second = scheduler.last_result();
    assert_eq!((second.offset, second.count, second.sequence), (4, 6, 2));
    assert_eq!(log.take(), vec![triggered(10, false)]);

    // More samples than the chunk asked for are clamped.
    scheduler.on_conversion_complete(&[3; 15]);
    assert_eq!(scheduler.last_result().count, 10);
    assert_eq!(scheduler.status().write_pos, 20);
}

#[test]
fn pool_of_two_refuses_third_until_one_frees() {
    let (_timers, scheduler, log) = setup(2);
    let (tx, rx) = flume::unbounded();

    for ch in [1u8, 2] {
        let tx = tx.clone();
        assert!(scheduler
            .request_async(ChannelSet::single(ch), Vec::new(), move |r| tx.send(r).unwrap())
            .is_ok());
    }
    assert_eq!(scheduler.free_slots(), 0);

    let err = scheduler
        .request_async(ChannelSet::single(3), vec![9; 4], |_| {})
        .unwrap_err();
    assert!(matches!(err, RequestError::ResourceExhausted(_)));
    assert_eq!(err.into_buffer(), vec![9; 4]);

    assert_eq!(log.last_conversion(), Some(immediate(1)));
    scheduler.on_conversion_complete(&[42]);
    let result = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(result.channels, ChannelSet::single(1));
    assert_eq!(result.samples, vec![42]);
    assert!(!result.errored);
    assert_eq!(scheduler.free_slots(), 1);
    assert_eq!(log.last_conversion(), Some(immediate(2)));

    let tx3 = tx.clone();
    assert!(scheduler
        .request_async(ChannelSet::single(3), Vec::new(), move |r| tx3.send(r).unwrap())
        .is_ok());

    // Slot 1 finishes; the scan wraps to the new request in slot 0.
    scheduler.on_conversion_complete(&[43]);
    assert_eq!(log.last_conversion(), Some(immediate(3)));
    scheduler.on_conversion_complete(&[44]);

    let mut rest: Vec<_> = (0..2).map(|_| rx.recv_timeout(WAIT).unwrap().samples).collect();
    rest.sort();
    assert_eq!(rest, vec![vec![43], vec![44]]);
    assert!(wait_until(|| scheduler.free_slots() == 2));
}

#[test]
fn round_robin_interleaves_high_speed_and_retries_errors() {
    let (_timers, scheduler, _log) = setup(3);
    scheduler.init(CH0, 1000, vec![0; 40], 10).unwrap();
    scheduler.start().unwrap();

    let (tx, rx) = flume::unbounded();
    for ch in 1..=3u8 {
        let tx = tx.clone();
        scheduler
            .request_async(ChannelSet::single(ch), Vec::new(), move |r| tx.send(r).unwrap())
            .unwrap();
    }
    let converter = || scheduler.status().converter;
    assert_eq!(converter(), ConverterState::HighSpeed);

    scheduler.on_conversion_complete(&[0; 10]);
    assert_eq!(converter(), ConverterState::LowSpeed(0));
    scheduler.on_conversion_error(7);
    assert_eq!(converter(), ConverterState::LowSpeed(1));
    scheduler.on_conversion_complete(&[11]);
    assert_eq!(converter(), ConverterState::LowSpeed(2));
    scheduler.on_conversion_complete(&[12]);
    assert_eq!(converter(), ConverterState::HighSpeed);
    scheduler.on_conversion_complete(&[0; 10]);
    assert_eq!(converter(), ConverterState::LowSpeed(0));
    scheduler.on_conversion_complete(&[10]);
    assert_eq!(converter(), ConverterState::HighSpeed);

    let mut results: Vec<_> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    results.sort_by_key(|r| r.channels.bits());
    assert_eq!(results[0].samples, vec![10]);
    assert!(results[0].errored);
    assert_eq!(results[1].samples, vec![11]);
    assert!(!results[1].errored);
    assert_eq!(results[2].samples, vec![12]);
}

#[test]
fn failing_slot_is_retried_until_it_succeeds() {
    let (_timers, scheduler, log) = setup(1);
    let (tx, rx) = flume::unbounded();
    scheduler
        .request_async(ChannelSet::single(4), Vec::new(), move |r| tx.send(r).unwrap())
        .unwrap();

    for code in 0..5 {
        log.take();
        scheduler.on_conversion_error(code);
        assert_eq!(log.take(), vec![immediate(4)]);
    }
    scheduler.on_conversion_complete(&[99]);
    let result = rx.recv_timeout(WAIT).unwrap();
    assert!(result.errored);
    assert_eq!(result.samples, vec![99]);
    assert_eq!(scheduler.status().converter, ConverterState::Idle);
}

#[test]
fn missed_tick_fires_next_conversion_now_and_flags_result() {
    let (_timers, scheduler, log) = setup(1);
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    scheduler.start().unwrap();
    scheduler
        .request_async(ChannelSet::single(1), Vec::new(), |_| {})
        .unwrap();

    scheduler.on_conversion_complete(&[0; 10]);
    assert_eq!(log.last_conversion(), Some(immediate(1)));
    scheduler.on_timer_missed();
    scheduler.on_conversion_complete(&[5]);
    assert_eq!(log.last_conversion(), Some(triggered(10, true)));

    scheduler.on_conversion_complete(&[0; 10]);
    assert!(scheduler.last_result().flags.lost_event);
    assert_eq!(log.last_conversion(), Some(triggered(10, false)));

    scheduler.on_conversion_complete(&[0; 10]);
    assert!(scheduler.last_result().flags.is_clean());
}

#[test]
fn high_speed_error_is_retried_and_reported_once() {
    let (_timers, scheduler, log) = setup(1);
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    scheduler.start().unwrap();
    log.take();

    scheduler.on_conversion_error(1);
    assert_eq!(log.take(), vec![triggered(10, false)]);
    assert!(scheduler.status().high_speed_error);

    scheduler.on_conversion_complete(&[0; 10]);
    assert!(scheduler.last_result().flags.error);
    assert!(!scheduler.status().high_speed_error);
    scheduler.on_conversion_complete(&[0; 10]);
    assert!(!scheduler.last_result().flags.error);
}

#[test]
fn start_and_stop_are_idempotent() {
    let (_timers, scheduler, log) = setup(1);
    assert_eq!(scheduler.start(), Err(AdcError::NotConfigured));

    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    scheduler.start().unwrap();
    scheduler.start().unwrap();
    let starts = log
        .commands()
        .iter()
        .filter(|c| matches!(c, DriverCommand::StartTimer { .. }))
        .count();
    assert_eq!(starts, 1);

    scheduler.stop();
    assert_eq!(log.last(), Some(DriverCommand::StopTimer { channels: CH0 }));
    let status = scheduler.status();
    assert!(!status.high_speed_active);
    assert_eq!(status.converter, ConverterState::Idle);

    log.take();
    scheduler.stop();
    assert!(log.take().is_empty());
}

#[test]
fn stop_leaves_low_speed_conversion_in_flight() {
    let (_timers, scheduler, log) = setup(1);
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    scheduler.start().unwrap();
    scheduler
        .request_async(ChannelSet::single(1), Vec::new(), |_| {})
        .unwrap();
    scheduler.on_conversion_complete(&[0; 10]);

    scheduler.stop();
    assert_eq!(scheduler.status().converter, ConverterState::LowSpeed(0));
    assert_eq!(log.last(), Some(DriverCommand::StopTimer { channels: CH0 }));

    scheduler.on_conversion_complete(&[1]);
    assert_eq!(scheduler.status().converter, ConverterState::Idle);
}

#[test]
fn init_stops_stream_and_clears_sinks() {
    let (_timers, scheduler, _log) = setup(1);
    let semaphore = Arc::new(Semaphore::new(0, 8));
    let record = Arc::new(EventRecord::new());

    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    scheduler.set_notification_sink(Some(Arc::clone(&semaphore)), Some(Arc::clone(&record)));
    scheduler.start().unwrap();
    scheduler.on_conversion_complete(&[0; 10]);
    assert_eq!(semaphore.available(), 1);
    assert_eq!(record.load().sequence, 1);

    scheduler.init(CH0, 1000, vec![0; 50], 10).unwrap();
    let status = scheduler.status();
    assert!(!status.high_speed_active);
    assert_eq!(status.remaining, 50);
    assert_eq!(scheduler.last_result().sequence, 0);

    scheduler.start().unwrap();
    scheduler.on_conversion_complete(&[0; 10]);
    assert_eq!(semaphore.available(), 1);
    assert_eq!(record.load().sequence, 1);
    assert_eq!(scheduler.last_result().sequence, 1);
}

#[test]
fn sinks_can_be_cleared_independently() {
    let (_timers, scheduler, _log) = setup(1);
    let semaphore = Arc::new(Semaphore::new(0, 8));
    let record = Arc::new(EventRecord::new());
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    scheduler.set_notification_sink(Some(Arc::clone(&semaphore)), Some(Arc::clone(&record)));
    scheduler.set_notification_sink(Some(Arc::clone(&semaphore)), None);
    scheduler.start().unwrap();

    scheduler.on_conversion_complete(&[0; 10]);
    assert_eq!(semaphore.available(), 1);
    assert_eq!(record.load().sequence, 0);
}

static ISR_SAMPLES: AtomicUsize = AtomicUsize::new(0);

fn count_isr_samples(samples: &[Sample]) {
    ISR_SAMPLES.fetch_add(samples.len(), Ordering::SeqCst);
}

#[test]
fn isr_callback_sees_each_batch_until_init() {
    let (_timers, scheduler, _log) = setup(1);
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    scheduler.set_isr_callback(Some(count_isr_samples));
    scheduler.start().unwrap();

    scheduler.on_conversion_complete(&[0; 4]);
    scheduler.on_conversion_complete(&[0; 6]);
    assert_eq!(ISR_SAMPLES.load(Ordering::SeqCst), 10);

    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    scheduler.start().unwrap();
    scheduler.on_conversion_complete(&[0; 10]);
    assert_eq!(ISR_SAMPLES.load(Ordering::SeqCst), 10);
}

#[test]
fn blocking_request_returns_converted_samples() {
    let (_timers, scheduler, log) = setup(1);
    let channels = ChannelSet::from_channels(&[0, 1]);

    let requester = Arc::clone(&scheduler);
    let handle = thread::spawn(move || requester.request_blocking(channels, Vec::new()));

    assert!(wait_until(|| log.last_conversion().is_some()));
    assert_eq!(log.last_conversion(), Some(DriverCommand::Immediate { channels, count: 2 }));
    scheduler.on_conversion_complete(&[100, 200]);

    let result = handle.join().unwrap().unwrap();
    assert_eq!(result.samples, vec![100, 200]);
    assert_eq!(result.channels, channels);
}

#[test]
fn blocking_request_waits_for_a_free_slot() {
    let (_timers, scheduler, log) = setup(1);
    let (tx, rx) = flume::unbounded();
    scheduler
        .request_async(ChannelSet::single(1), Vec::new(), move |r| tx.send(r).unwrap())
        .unwrap();

    let requester = Arc::clone(&scheduler);
    let handle = thread::spawn(move || requester.request_blocking(ChannelSet::single(2), Vec::new()));

    thread::sleep(Duration::from_millis(30));
    assert_eq!(log.last_conversion(), Some(immediate(1)));
    assert!(!handle.is_finished());

    scheduler.on_conversion_complete(&[1]);
    rx.recv_timeout(WAIT).unwrap();
    assert!(wait_until(|| log.last_conversion() == Some(immediate(2))));
    scheduler.on_conversion_complete(&[2]);

    let result = handle.join().unwrap().unwrap();
    assert_eq!(result.samples, vec![2]);
}

#[test]
fn listeners_receive_events_until_dropped() {
    let (_timers, scheduler, _log) = setup(1);
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    let rx = scheduler.listen();
    assert!(scheduler.status().using_timer_service);
    scheduler.start().unwrap();

    scheduler.on_conversion_complete(&[7; 10]);
    let event = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(event.result.sequence, 1);
    assert_eq!(&event.samples[..], &[7; 10]);

    drop(rx);
    scheduler.on_conversion_complete(&[8; 10]);
    assert!(wait_until(|| !scheduler.status().using_timer_service));
}

#[test]
fn init_drops_listeners() {
    let (_timers, scheduler, _log) = setup(1);
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    let rx = scheduler.listen();
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
    assert!(!scheduler.status().using_timer_service);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(rx.is_disconnected());
}

#[test]
fn listener_flag_matches_timer_when_init_races_listen() {
    let (_timers, scheduler, _log) = setup(1);
    scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();

    for _ in 0..200 {
        let listener = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.listen())
        };
        scheduler.init(CH0, 1000, vec![0; 100], 10).unwrap();
        let _rx = listener.join().unwrap();

        let status = scheduler.status();
        assert_eq!(status.using_timer_service, scheduler.high_speed_timer.is_active());
    }
}

#[test]
fn invalid_configuration_is_rejected() {
    let _ = env_logger::builder().is_test(true).try_init();
    let timers = TimerService::new().unwrap();
    let (driver, _log) = MockDriver::new();
    let config = SchedulerConfig { max_low_speed: 0, ..SchedulerConfig::default() };
    assert!(matches!(
        AdcScheduler::new(driver, &timers, &config),
        Err(AdcError::ConfigurationError(_))
    ));

    let (_timers, scheduler, _log) = setup(1);
    assert!(scheduler.init(CH0, 1000, Vec::new(), 10).is_err());
    assert!(scheduler.init(CH0, 1000, vec![0; 10], 0).is_err());
    assert!(scheduler.init(ChannelSet::EMPTY, 1000, vec![0; 10], 10).is_err());
    assert!(scheduler.init(CH0, 0, vec![0; 10], 10).is_err());

    let err = scheduler
        .request_async(ChannelSet::EMPTY, vec![1], |_| {})
        .unwrap_err();
    assert_eq!(err, RequestError::NoChannels(vec![1]));
    assert!(scheduler.request_blocking(ChannelSet::EMPTY, Vec::new()).is_err());
    assert_eq!(scheduler.free_slots(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn high_speed_cursor_wraps_exactly_at_buffer_len(
        len in 1usize..200,
        per_event in 1usize..32,
        splits in proptest::collection::vec(1usize..8, 1..32),
    ) {
        let (driver, log) = MockDriver::new();
        let mut state = State::new(driver, 1);
        let _ = state.reconfigure(CH0, 100, vec![0; len], per_event);
        state.start_high_speed_stream();

        let mut pieces = splits.iter().cycle();
        let mut produced = 0;
        while produced < 2 * len {
            let requested = match log.last_conversion() {
                Some(DriverCommand::TimerTriggered { count, .. }) => count,
                other => return Err(TestCaseError::fail(format!("unexpected conversion {:?}", other))),
            };
            prop_assert!(requested <= per_event);

            let mut left = requested;
            while left > 0 {
                let piece = pieces.next().copied().unwrap_or(1).min(left);
                let before = state.hs.write_pos;
                state.complete(&vec![1; piece]);
                prop_assert_eq!(state.hs.last.offset, before);
                prop_assert_eq!(state.hs.last.count, piece);
                left -= piece;
                produced += piece;
                prop_assert_eq!(state.hs.write_pos, produced % len);
            }
            if requested < per_event {
                prop_assert_eq!(produced % len, 0);
            }
        }
    }

    #[test]
    fn no_slot_is_serviced_twice_between_services_of_another(
        slots in 1usize..6,
        high_speed in any::<bool>(),
        outcomes in proptest::collection::vec(any::<bool>(), 1..200),
    ) {
        let (driver, _log) = MockDriver::new();
        let mut state = State::new(driver, slots);
        let _ = state.reconfigure(CH0, 100, vec![0; 50], 5);
        if high_speed {
            state.start_high_speed_stream();
        }
        for _ in 0..slots {
            let claimed = state.claim(ChannelSet::single(1), vec![0], Box::new(|_| {})).is_ok();
            prop_assert!(claimed);
            state.kick();
        }

        let mut serviced = Vec::new();
        for ok in outcomes {
            match state.converter {
                ConverterState::LowSpeed(idx) => {
                    serviced.push(idx);
                    if ok {
                        state.complete(&[1]);
                        if let Some((callback, result)) = state.take_finished(idx) {
                            callback(result);
                        }
                        let claimed = state.claim(ChannelSet::single(1), vec![0], Box::new(|_| {})).is_ok();
                        prop_assert!(claimed);
                        state.kick();
                    } else {
                        state.fail();
                    }
                }
                ConverterState::HighSpeed => {
                    let chunk = vec![1; state.hs.chunk_left];
                    state.complete(&chunk);
                }
                ConverterState::Idle => prop_assert!(false, "converter idle with pending slots"),
            }
        }

        for (i, &slot) in serviced.iter().enumerate() {
            let Some(next) = serviced[i + 1..].iter().position(|&s| s == slot) else { continue };
            let between = &serviced[i + 1..i + 1 + next];
            for other in 0..slots {
                prop_assert!(between.iter().filter(|&&s| s == other).count() <= 1);
            }
        }
    }
}
