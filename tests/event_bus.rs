#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Event bus delivery guarantees

use session_protocol::config::{EventBusConfig, OverflowPolicy};
use session_protocol::error::ProtocolError;
use session_protocol::events::EventBus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct Tick(u32);

#[derive(Debug, Clone, PartialEq)]
struct Tock(&'static str);

async fn wait_for_delivered(bus: &EventBus, expected: u64) {
    for _ in 0..500 {
        if bus.stats().delivered + bus.stats().failed >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bus delivered {:?}, expected {expected}", bus.stats());
}

#[test]
fn passthrough_reaches_target_subscribers() {
    let bus = EventBus::default();
    let module = bus.emitter();
    let client = bus.emitter();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = seen.clone();
    bus.register::<Tick, _>(client, move |t| {
        s.lock().unwrap().push(("client", t.0));
        Ok(())
    })
    .unwrap();
    let s = seen.clone();
    bus.register::<Tick, _>(module, move |t| {
        s.lock().unwrap().push(("module", t.0));
        Ok(())
    })
    .unwrap();
    bus.passthrough::<Tick>(module, client).unwrap();

    // Origin subscribers first, then those reached through the route
    assert_eq!(bus.emit(module, Tick(1)), 2);
    bus.drain();
    assert_eq!(*seen.lock().unwrap(), vec![("module", 1), ("client", 1)]);

    // Other shapes are not forwarded
    assert_eq!(bus.emit(module, Tock("x")), 0);
}

#[test]
fn chained_passthrough_is_followed() {
    let bus = EventBus::default();
    let a = bus.emitter();
    let b = bus.emitter();
    let c = bus.emitter();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    bus.register::<Tick, _>(c, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    bus.passthrough::<Tick>(a, b).unwrap();
    bus.passthrough::<Tick>(b, c).unwrap();
    // Duplicate route is ignored
    bus.passthrough::<Tick>(a, b).unwrap();

    bus.emit(a, Tick(0));
    bus.drain();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn deregistered_emitter_gets_no_further_invocations() {
    let bus = EventBus::default();
    let a = bus.emitter();
    let b = bus.emitter();
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let h = hits.clone();
        bus.register::<Tick, _>(a, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    }
    let h = hits.clone();
    bus.register::<Tick, _>(b, move |_| {
        h.fetch_add(100, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    assert_eq!(bus.deregister_emitter(a), 3);
    assert_eq!(bus.emit(a, Tick(1)), 0);
    assert_eq!(bus.emit(b, Tick(1)), 1);
    bus.drain();
    assert_eq!(hits.load(Ordering::SeqCst), 100);
}

#[test]
fn deregistering_origin_keeps_target_subscribers() {
    let bus = EventBus::default();
    let module = bus.emitter();
    let client = bus.emitter();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = seen.clone();
    bus.register::<Tick, _>(module, move |t| {
        s.lock().unwrap().push(("module", t.0));
        Ok(())
    })
    .unwrap();
    let s = seen.clone();
    bus.register::<Tick, _>(client, move |t| {
        s.lock().unwrap().push(("client", t.0));
        Ok(())
    })
    .unwrap();
    bus.passthrough::<Tick>(module, client).unwrap();

    assert_eq!(bus.deregister_emitter(module), 1);
    // The route survives; only the origin's own subscriptions are gone
    assert_eq!(bus.emit(module, Tick(7)), 1);
    bus.drain();
    assert_eq!(*seen.lock().unwrap(), vec![("client", 7)]);
}

#[test]
fn removing_routes_stops_forwarding() {
    let bus = EventBus::default();
    let a = bus.emitter();
    let b = bus.emitter();
    let c = bus.emitter();
    bus.register::<Tick, _>(b, |_| Ok(())).unwrap();
    bus.passthrough::<Tick>(a, b).unwrap();
    bus.passthrough::<Tock>(a, b).unwrap();
    bus.passthrough::<Tick>(c, a).unwrap();
    assert_eq!(bus.passthrough_routes(), 3);

    assert_eq!(bus.remove_passthroughs(a), 3);
    assert_eq!(bus.passthrough_routes(), 0);
    assert_eq!(bus.emit(a, Tick(1)), 0);
}

#[test]
fn already_queued_invocations_survive_deregistration() {
    let bus = EventBus::default();
    let a = bus.emitter();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    bus.register::<Tick, _>(a, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    bus.emit(a, Tick(1));
    bus.deregister_emitter(a);
    bus.drain();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn faulty_subscribers_are_isolated() {
    let bus = EventBus::default();
    let a = bus.emitter();
    let seen = Arc::new(Mutex::new(Vec::new()));

    bus.register::<Tick, _>(a, |_| Err(ProtocolError::Custom("subscriber error".into())))
        .unwrap();
    bus.register::<Tick, _>(a, |_| panic!("subscriber panic")).unwrap();
    let s = seen.clone();
    bus.register::<Tick, _>(a, move |t| {
        s.lock().unwrap().push(t.0);
        Ok(())
    })
    .unwrap();

    bus.emit(a, Tick(1));
    bus.emit(a, Tick(2));
    assert_eq!(bus.drain(), 6);

    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    let stats = bus.stats();
    assert_eq!(stats.failed, 4);
    assert_eq!(stats.delivered, 2);
}

#[test]
fn buses_are_isolated() {
    let first = EventBus::default();
    let second = EventBus::default();
    let a = first.emitter();
    let b = second.emitter();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    first
        .register::<Tick, _>(a, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    // Emitter ids may coincide across buses; subscriptions do not leak
    assert_eq!(second.emit(b, Tick(1)), 0);
    assert_eq!(second.drain(), 0);
    assert_eq!(first.pending(), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn overflow_counts_drops() {
    let bus = EventBus::new(EventBusConfig {
        queue_capacity: 3,
        overflow: OverflowPolicy::DropOldest,
    });
    let a = bus.emitter();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    bus.register::<Tick, _>(a, move |t| {
        s.lock().unwrap().push(t.0);
        Ok(())
    })
    .unwrap();

    for i in 0..5 {
        bus.emit(a, Tick(i));
    }
    assert_eq!(bus.pending(), 3);
    bus.drain();
    assert_eq!(*seen.lock().unwrap(), vec![2, 3, 4]);
    assert_eq!(bus.stats().dropped, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_preserves_order_without_overlap() {
    const COUNT: u32 = 2_000;

    let bus = EventBus::default();
    let a = bus.emitter();
    let in_flight = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::with_capacity(COUNT as usize)));

    for label in ["first", "second"] {
        let in_flight = in_flight.clone();
        let overlaps = overlaps.clone();
        let seen = seen.clone();
        bus.register::<Tick, _>(a, move |t| {
            if in_flight.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            seen.lock().unwrap().push((t.0, label));
            in_flight.store(false, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    }

    let consumer = bus.start().unwrap();

    // A second thread competes with the consumer by draining directly
    let competitor = {
        let bus = bus.clone();
        std::thread::spawn(move || {
            for _ in 0..200 {
                bus.drain();
                std::thread::yield_now();
            }
        })
    };

    for i in 0..COUNT {
        bus.emit(a, Tick(i));
    }
    competitor.join().unwrap();
    wait_for_delivered(&bus, u64::from(COUNT) * 2).await;

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let seen = seen.lock().unwrap();
    let expected: Vec<_> = (0..COUNT)
        .flat_map(|i| [(i, "first"), (i, "second")])
        .collect();
    assert_eq!(*seen, expected);

    bus.shutdown();
    consumer.join().unwrap();
}

#[tokio::test]
async fn shutdown_stops_consumer_and_refuses_emissions() {
    let bus = EventBus::default();
    let a = bus.emitter();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    bus.register::<Tick, _>(a, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    let consumer = bus.start().unwrap();
    bus.emit(a, Tick(1));
    wait_for_delivered(&bus, 1).await;

    bus.shutdown();
    consumer.join().unwrap();
    assert!(bus.is_shut_down());
    assert_eq!(bus.emit(a, Tick(2)), 0);
    assert!(matches!(bus.start(), Err(ProtocolError::EventBusClosed)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn slow_subscriber_does_not_stall_the_runtime() {
    let bus = EventBus::default();
    let a = bus.emitter();
    bus.register::<Tick, _>(a, |_| {
        std::thread::sleep(Duration::from_millis(400));
        Ok(())
    })
    .unwrap();
    let consumer = bus.start().unwrap();

    bus.emit(a, Tick(1));
    let ticker = tokio::spawn(async {
        let mut worst = Duration::ZERO;
        for _ in 0..30 {
            let before = std::time::Instant::now();
            tokio::time::sleep(Duration::from_millis(10)).await;
            worst = worst.max(before.elapsed());
        }
        worst
    });
    let worst = ticker.await.unwrap();
    wait_for_delivered(&bus, 1).await;

    bus.shutdown();
    consumer.join().unwrap();
    assert!(worst < Duration::from_millis(200), "runtime stalled for {worst:?}");
}

#[test]
fn consumer_runs_without_a_runtime() {
    let bus = EventBus::default();
    let a = bus.emitter();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    bus.register::<Tick, _>(a, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    let consumer = bus.start().unwrap();
    bus.emit(a, Tick(1));
    bus.emit(a, Tick(2));
    for _ in 0..500 {
        if bus.stats().delivered == 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    bus.shutdown();
    consumer.join().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
