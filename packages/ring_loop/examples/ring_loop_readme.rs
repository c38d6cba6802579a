//! The example from the package README.

use std::time::Duration;

use ring_loop::{EventLoop, FnAgent, ScheduleOptions, Step};

fn main() {
    let event_loop = EventLoop::builder()
        .name("world")
        .build(FnAgent::new(|event| {
            println!("player {} moved", event.long_a);
            Ok(())
        }))
        .unwrap();

    event_loop
        .publish_event(|event| {
            event.kind = 1;
            event.long_a = 42;
        })
        .unwrap();

    // A computation split into slices that run between events.
    let mut visited = 0;
    let result = event_loop.schedule_time_sharing(
        ScheduleOptions::fixed_delay(Duration::ZERO, Duration::from_millis(1))
            .timeout_by_count(100),
        move |_| {
            visited += 10;
            if visited >= 50 {
                Step::Success(visited)
            } else {
                Step::Continue
            }
        },
    );

    assert_eq!(result.join().unwrap(), 50);

    event_loop.shutdown();
    event_loop.termination_future().join().unwrap();
}
