use crate::*;

use std::cell::Cell;

const MINUTE: Duration = Duration::from_secs(60);

fn assert_holds(sim: &mut Sim, node: usize, data: &[u8]) {
    let stored = sim.stored(node);
    assert!(stored.len() >= data.len(), "node {node} holds {} bytes", stored.len());
    assert_eq!(&stored[..data.len()], data, "node {node} content differs");
    assert!(
        stored[data.len()..].iter().all(|&b| b == 0),
        "node {node} padding is not zero"
    );
}

#[test]
fn joiner_receives_three_page_object() {
    let data = pattern(600, 1);
    let mut sim = Sim::new(1);
    sim.seed(&data, 1);
    let joiner = sim.join();

    assert!(sim.run_until(10 * MINUTE, |s| s.has(joiner, 1)), "joiner never completed");

    let object = sim.object(joiner);
    assert_eq!(object.page_count(), 3);
    assert_eq!(object.size(), 3 * 256);
    // complete pages are never rewritten
    assert_eq!(object.page_writes(), 3);
    assert_holds(&mut sim, joiner, &data);
}

#[test]
fn version_switches_only_when_every_page_is_complete() {
    let data = pattern(1000, 2);
    let mut sim = Sim::new(2);
    sim.seed(&data, 7);
    let joiner = sim.join();

    let complete = Cell::new(0usize);
    let finished = sim.run_until(10 * MINUTE, |s| {
        let object = s.object(joiner);
        let now = object.pages().iter().filter(|p| p.is_complete()).count();
        assert!(now >= complete.get(), "a complete page was lost");
        complete.set(now);
        if object.version() == 7 {
            assert!(object.is_complete(), "version advanced with pages missing");
        } else {
            assert_eq!(object.version(), 0);
        }
        s.has(joiner, 7)
    });

    assert!(finished);
    assert_eq!(complete.get(), 4);
    assert_holds(&mut sim, joiner, &data);
}

#[test]
fn object_crosses_a_line_of_nodes() {
    let data = pattern(700, 3);
    let mut sim = Sim::new(3).line();
    sim.seed(&data, 1);
    let middle = sim.join();
    let far = sim.join();

    assert!(sim.run_until(20 * MINUTE, |s| s.has(far, 1)), "far node never completed");
    assert!(sim.has(middle, 1));
    assert_holds(&mut sim, middle, &data);
    assert_holds(&mut sim, far, &data);
}

#[test]
fn lossy_neighbourhood_converges() {
    let data = pattern(900, 4);
    let mut sim = Sim::new(4).loss(0.2);
    sim.seed(&data, 3);
    let joiners: Vec<usize> = (0..3).map(|_| sim.join()).collect();

    let all = |s: &Sim| joiners.iter().all(|&j| s.has(j, 3));
    assert!(sim.run_until(60 * MINUTE, all), "not converged after {:?}", sim.elapsed());
    assert!(sim.dropped > 0);
    for &j in &joiners {
        assert_holds(&mut sim, j, &data);
    }
}

#[test]
fn corrupted_packets_are_refetched() {
    let data = pattern(512, 5);
    let mut sim = Sim::new(5).corrupt(0.15);
    sim.seed(&data, 1);
    let joiner = sim.join();

    assert!(sim.run_until(30 * MINUTE, |s| s.has(joiner, 1)));
    assert!(sim.corrupted > 0);
    assert_holds(&mut sim, joiner, &data);
}

#[test]
fn rudolph_sends_one_packet_pages() {
    let data = pattern(200, 6);
    let mut sim = Sim::new(6).variant(Variant::Rudolph);
    sim.seed(&data, 1);
    let joiner = sim.join();

    assert!(sim.run_until(10 * MINUTE, |s| s.has(joiner, 1)));
    let object = sim.object(joiner);
    assert_eq!(object.page_count(), 4);
    assert_eq!(object.size(), 4 * 64);
    assert_holds(&mut sim, joiner, &data);
}

#[test]
fn newer_version_replaces_installed_object() {
    let old = pattern(600, 7);
    let new = pattern(600, 8);
    let mut sim = Sim::new(7);
    let first = sim.seed(&old, 1);
    let joiner = sim.join();
    assert!(sim.run_until(10 * MINUTE, |s| s.has(joiner, 1)));

    sim.seed(&new, 2);
    let upgraded = |s: &Sim| s.has(first, 2) && s.has(joiner, 2);
    assert!(sim.run_until(30 * MINUTE, upgraded), "old nodes kept version 1");

    assert_holds(&mut sim, first, &new);
    assert_holds(&mut sim, joiner, &new);
}

#[test]
fn consistent_neighbourhood_stays_quiet() {
    let data = pattern(300, 9);
    let mut sim = Sim::new(9);
    sim.seed(&data, 1);
    sim.seed(&data, 1);

    let start = sim.delivered;
    assert!(!sim.run_until(30 * MINUTE, |_| false));
    // two summaries per round at most, rounds growing towards T_HIGH
    let frames = sim.delivered - start;
    assert!(frames <= 70, "{frames} frames in a consistent neighbourhood");
    for n in 0..2 {
        assert!(sim.has(n, 1));
        assert_eq!(sim.object(n).page_writes(), 0);
    }
}
