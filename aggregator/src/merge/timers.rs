//! Timer tree merge
//!
//! Timers match by name at each level of the tree. Matched nodes sum their
//! durations and counts; unmatched subtrees are appended as-is.

use trellis_shared::{RootTimers, Timer};

pub fn merge_root_timers(target: &mut RootTimers, source: &RootTimers) {
    merge_timers(&mut target.main_thread, &source.main_thread);
    merge_timers(&mut target.aux_thread, &source.aux_thread);
    merge_timers(&mut target.async_timers, &source.async_timers);
}

pub fn merge_timers(target: &mut Vec<Timer>, source: &[Timer]) {
    for timer in source {
        match target.iter_mut().find(|t| t.name == timer.name) {
            Some(existing) => merge_timer(existing, timer),
            None => target.push(timer.clone()),
        }
    }
}

fn merge_timer(target: &mut Timer, source: &Timer) {
    target.total_nanos += source.total_nanos;
    target.count += source.count;
    target.active |= source.active;
    target.extended |= source.extended;
    merge_timers(&mut target.child_timers, &source.child_timers);
}
