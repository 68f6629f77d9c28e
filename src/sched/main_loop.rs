//! The reactor-driving loop fiber.
//!
//! Two phases, one invariant: while workers are runnable the loop fiber
//! drains the reactor without blocking and then parks so user fibers get the
//! thread; once nothing is runnable it blocks the whole thread inside
//! `run_one`, which is where the thread sleeps on I/O. The park is released
//! either by the dispatcher's `suspend_until` (all ready peers drained) or
//! by the switch bound in `pick_next` (workers would otherwise starve the
//! reactor).

use std::sync::Arc;

use super::SchedAlgorithm;
use crate::runtime::{current_parts, RuntimeShared};
use crate::tracing_compat::{debug, trace};

/// Body of the `"io_loop"` fiber. Returns once the reactor is stopped and
/// drained; the suspend timer is released on the way out, turning later
/// wake requests into no-ops.
pub(crate) fn run(rt: &Arc<RuntimeShared>) {
    let reactor = rt.reactor.clone();

    while !reactor.stopped() {
        if rt.core.lock().algo.has_ready_fibers() {
            // Feed the reactor without blocking, then give the thread to
            // the ready fibers until they all suspend.
            while reactor.poll() > 0 {}
            wait_till_fibers_suspend(rt);
        } else {
            trace!("run_one: enter");
            rt.core.lock().algo.enter_run_one();
            let n = reactor.run_one();
            rt.core.lock().algo.leave_run_one();
            trace!(dispatched = n, "run_one: leave");
            if n == 0 {
                break;
            }
        }
    }

    debug!("io loop exited");
    rt.core.lock().algo.release_suspend_timer();
}

/// Parks the loop fiber until all ready peers have drained (the dispatcher
/// called `suspend_until`) or the switch bound fired.
fn wait_till_fibers_suspend(rt: &Arc<RuntimeShared>) {
    let (ctx, _) = current_parts().expect("loop wait outside a fiber");
    trace!("loop wait: start");
    rt.park_current(&ctx, |core| {
        core.algo.begin_loop_wait(Arc::clone(&ctx));
        true
    });
    rt.core.lock().algo.end_loop_wait();
    trace!("loop wait: end");
}
