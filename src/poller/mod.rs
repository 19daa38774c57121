use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::app::AppContext;

mod threshold;

pub use threshold::run as run_threshold_watch;

pub const THRESHOLD_WATCH_LOOP: &str = "threshold_watch";

type LoopFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type LoopFn = fn(AppContext) -> LoopFuture;

/// Spawn all poller loops and return their join handles.
pub fn spawn_all(ctx: AppContext) -> Vec<JoinHandle<()>> {
    let interval = ctx.config.sample_intervals.threshold_watch;
    let budget = ctx.config.timeouts.probe + Duration::from_secs(1);

    vec![spawn_loop(
        ctx,
        THRESHOLD_WATCH_LOOP,
        interval,
        budget,
        poll_threshold_watch,
    )]
}

fn spawn_loop(
    ctx: AppContext,
    loop_name: &'static str,
    interval: Duration,
    budget: Duration,
    poll_fn: LoopFn,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            loop_name,
            interval = ?interval,
            budget = ?budget,
            "starting poller loop"
        );

        // the first tick completes immediately
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = poll_once(ctx.clone(), loop_name, budget, poll_fn).await {
                error!(loop_name, error = ?err, "poller loop iteration failed");
            }
        }
    })
}

async fn poll_once(
    ctx: AppContext,
    loop_name: &'static str,
    budget: Duration,
    poll_fn: LoopFn,
) -> Result<()> {
    let start = Instant::now();
    match poll_fn(ctx.clone()).await {
        Ok(_) => {
            let elapsed = start.elapsed();
            ctx.metrics.observe_duration(loop_name, elapsed);
            if elapsed > budget {
                warn!(
                    loop_name,
                    elapsed = ?elapsed,
                    budget = ?budget,
                    "loop exceeded budget"
                );
            } else {
                info!(
                    loop_name,
                    elapsed = ?elapsed,
                    "loop completed successfully"
                );
            }
            ctx.metrics.record_success(loop_name, true);
            ctx.state.record_loop_success(loop_name).await;
            Ok(())
        }
        Err(err) => {
            ctx.metrics.record_success(loop_name, false);
            ctx.metrics.inc_error(loop_name);
            ctx.state
                .record_loop_failure(loop_name, err.to_string())
                .await;
            Err(err)
        }
    }
}

fn poll_threshold_watch(ctx: AppContext) -> LoopFuture {
    Box::pin(async move { threshold::run(&ctx).await.map(|_| ()) })
}
