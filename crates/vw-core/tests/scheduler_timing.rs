//! Timing properties of the shared poll scheduler.
//!
//! Bounds carry slack for loaded CI machines; the lower bounds are strict
//! because the next deadline is always measured from the start of a run.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vw_core::scheduler::{PollJob, PollScheduler};

const SLACK: Duration = Duration::from_millis(2);
const LATE: Duration = Duration::from_millis(150);

fn recorder(ticks: &Arc<Mutex<Vec<Instant>>>) -> PollJob {
    let ticks = ticks.clone();
    Box::new(move || ticks.lock().unwrap().push(Instant::now()))
}

fn min_gap(ticks: &[Instant]) -> Duration {
    ticks
        .windows(2)
        .map(|w| w[1] - w[0])
        .min()
        .unwrap_or(Duration::MAX)
}

fn check_reschedule(t1: Duration, t2: Duration) {
    let scheduler = PollScheduler::new().unwrap();
    let ticks = Arc::new(Mutex::new(Vec::new()));

    let old = scheduler.schedule(recorder(&ticks), t1, t1);
    thread::sleep(t1 * 3 + t1 / 2);

    let changed_at = Instant::now();
    let new = scheduler.reschedule(&old, recorder(&ticks), t1, t2);
    let before: Vec<Instant> = ticks.lock().unwrap().clone();
    thread::sleep(t2 * 4);
    scheduler.cancel(&new);

    let all = ticks.lock().unwrap().clone();
    assert!(before.len() >= 2, "old task barely ran: {}", before.len());
    assert!(all.len() > before.len(), "new task never ran");
    assert!(old.is_cancelled());

    // Never two ticks closer together than the smaller period.
    let floor = t1.min(t2);
    assert!(
        min_gap(&all) + SLACK >= floor,
        "ticks {:?} apart, floor {:?}",
        min_gap(&all),
        floor
    );

    // The first new tick comes no later than one new period after the last
    // old tick, or right away if that moment had already passed.
    let last_old = *before.last().unwrap();
    let first_new = all[before.len()];
    let due = (last_old + t2).max(changed_at);
    assert!(
        first_new <= due + LATE,
        "first new tick {:?} after due",
        first_new.saturating_duration_since(due)
    );
}

#[test]
fn reschedule_to_shorter_period() {
    check_reschedule(Duration::from_millis(60), Duration::from_millis(20));
}

#[test]
fn reschedule_to_longer_period() {
    check_reschedule(Duration::from_millis(20), Duration::from_millis(60));
}

#[test]
fn reschedule_before_first_run_keeps_earlier_deadline() {
    let scheduler = PollScheduler::new().unwrap();
    let ticks = Arc::new(Mutex::new(Vec::new()));

    let start = Instant::now();
    let old = scheduler.schedule(recorder(&ticks), Duration::from_millis(30), Duration::from_secs(60));
    let new = scheduler.reschedule(
        &old,
        recorder(&ticks),
        Duration::from_secs(60),
        Duration::from_secs(60),
    );
    thread::sleep(Duration::from_millis(200));

    let ticks = ticks.lock().unwrap().clone();
    assert_eq!(ticks.len(), 1);
    assert!(ticks[0] - start >= Duration::from_millis(30) - SLACK);
    assert_eq!(new.executions(), 1);
    assert_eq!(old.executions(), 0);
}

#[test]
fn slow_task_delays_others_without_overlap() {
    let scheduler = PollScheduler::new().unwrap();
    let running = Arc::new(Mutex::new(0u32));
    let overlaps = Arc::new(Mutex::new(0u32));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let running = running.clone();
            let overlaps = overlaps.clone();
            let job: PollJob = Box::new(move || {
                {
                    let mut r = running.lock().unwrap();
                    *r += 1;
                    if *r > 1 {
                        *overlaps.lock().unwrap() += 1;
                    }
                }
                thread::sleep(Duration::from_millis(5));
                *running.lock().unwrap() -= 1;
            });
            scheduler.schedule(job, Duration::from_millis(1), Duration::from_millis(5))
        })
        .collect();

    thread::sleep(Duration::from_millis(100));
    for h in &handles {
        scheduler.cancel(h);
        assert!(h.executions() > 0);
    }
    assert_eq!(*overlaps.lock().unwrap(), 0);
}
