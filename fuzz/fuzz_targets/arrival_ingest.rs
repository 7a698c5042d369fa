#![no_main]

use std::sync::Arc;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tsbridge_node::receive::SubscriberContext;
use tsbridge_node::{ActionHandle, HostScheduler, LocalScheduler, ManualClock, SubscriberConfig};

const START: i64 = 1_700_000_000_000_000_000;

fuzz_target!(|data: &[u8]| {
    let scheduler = Arc::new(LocalScheduler::new(Arc::new(ManualClock::new(START))));
    let config = SubscriberConfig::new("memory", "fuzz/arrivals");
    let ctx = SubscriberContext::new(&config, scheduler.clone(), ActionHandle(0));
    let before = scheduler.current_tag();
    let outcome = ctx.handle_arrival(Bytes::copy_from_slice(data), START);
    assert!(outcome.tag > before);
});
