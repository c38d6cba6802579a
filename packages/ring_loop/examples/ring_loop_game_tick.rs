//! Example of a small game world driven by one event loop.
//!
//! Producer threads publish player moves into the ring buffer. The agent applies them to the
//! world state it owns, a periodic task reports the world every 100ms, and a time-sharing task
//! recomputes a leaderboard in slices so it never blocks event processing for long.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use ring_loop::{
    AgentError, EventLoop, FnAgent, RingEvent, ScheduleOptions, Step, TimeSharingContext,
    WaitStrategy,
};

const KIND_MOVE: i32 = 1;
const PLAYERS: i64 = 8;

fn main() {
    // The agent owns the world; the reporting task only reads a snapshot of it.
    let positions = Arc::new(Mutex::new(HashMap::<i64, i64>::new()));

    let event_loop = EventLoop::builder()
        .name("game-world")
        .capacity(1024)
        .wait_strategy(WaitStrategy::Blocking)
        .build(FnAgent::new({
            let positions = Arc::clone(&positions);
            move |event: &mut RingEvent| {
                if event.kind != KIND_MOVE {
                    return Err(AgentError::failed(format!("unknown event kind {}", event.kind)));
                }

                *positions.lock().entry(event.long_a).or_default() += event.long_b;
                Ok(())
            }
        }))
        .unwrap();

    let report = event_loop.schedule_with_fixed_delay(Duration::ZERO, Duration::from_millis(100), {
        let positions = Arc::clone(&positions);
        move || println!("{} players on the map", positions.lock().len())
    });

    thread::scope(|scope| {
        for player in 0..PLAYERS {
            let handle = event_loop.handle();
            scope.spawn(move || {
                for step in 0..1_000 {
                    handle
                        .publish_event(|event| {
                            event.kind = KIND_MOVE;
                            event.long_a = player;
                            event.long_b = step % 3 - 1;
                        })
                        .unwrap();
                }
            });
        }
    });

    let leaderboard = event_loop.schedule_time_sharing(
        ScheduleOptions::only_once(Duration::ZERO).timeout_by_duration(Duration::from_secs(1)),
        {
            let positions = Arc::clone(&positions);
            let mut ranked = Vec::new();
            let mut next_player = 0;
            move |_: &TimeSharingContext| {
                // One player per slice.
                let position = positions.lock().get(&next_player).copied().unwrap_or_default();
                ranked.push((position, next_player));
                next_player += 1;

                if next_player < PLAYERS {
                    return Step::Continue;
                }

                ranked.sort_unstable_by(|a, b| b.cmp(a));
                Step::Success(ranked.clone())
            }
        },
    );

    for (position, player) in leaderboard.join().unwrap() {
        println!("player {player} at {position}");
    }

    report.cancel();
    event_loop.shutdown();
    event_loop.termination_future().join().unwrap();
    println!("world shut down after report {:?}", report.state());
}
