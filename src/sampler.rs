use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::api::PositionSource;
use crate::entities::Coordinates;

/// Minimum time between forwarded samples.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Minimum displacement that forwards a sample before the interval elapses.
pub const MIN_SAMPLE_DISPLACEMENT_METERS: f64 = 5.0;

type Callback = Arc<dyn Fn(Coordinates) + Send + Sync>;

/// Continuous GPS sampling over an injected [`PositionSource`].
///
/// The consumer's callback lives in an indirection cell that is read at call
/// time, so re-invoking [`start`](LocationSampler::start) with a new closure
/// swaps the target without restarting the watch. A stale closure can never
/// keep receiving samples after a fresher one was supplied.
pub struct LocationSampler {
    source: Arc<dyn PositionSource>,
    callback: Arc<Mutex<Option<Callback>>>,
    last_error: Arc<Mutex<Option<String>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    epoch: AtomicU64,
}

impl LocationSampler {
    pub fn new(source: Arc<dyn PositionSource>) -> Self {
        Self {
            source,
            callback: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
            watch_task: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// Begins (or re-targets) sampling.
    ///
    /// On the first call this requests permission, forwards one immediate
    /// high-accuracy fix, then consumes the watch stream with the
    /// interval/displacement throttle applied. While a watch is already
    /// running, the call only replaces the callback.
    #[tracing::instrument(skip_all)]
    pub async fn start<F>(&self, callback: F)
    where
        F: Fn(Coordinates) + Send + Sync + 'static,
    {
        *self.callback.lock().unwrap() = Some(Arc::new(callback));

        if self.watch_task.lock().unwrap().is_some() {
            return;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(err) = self.source.request_permission().await {
            tracing::warn!("positioning permission denied: {}", err.message);
            *self.last_error.lock().unwrap() = Some(err.message);
            return;
        }

        if self.epoch.load(Ordering::SeqCst) != epoch {
            // stopped while the permission prompt was pending
            return;
        }

        // one immediate fix so the consumer never waits for the first tick
        match self.source.current_position().await {
            Ok(position) => forward(&self.callback, position),
            Err(err) => tracing::warn!("one-shot position fix failed: {}", err.message),
        }

        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }

        let source = self.source.clone();
        let callback = self.callback.clone();
        let last_error = self.last_error.clone();

        let task = tokio::spawn(async move {
            let mut stream = source.watch();
            let mut last_forwarded: Option<(Instant, Coordinates)> = None;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(position) => {
                        if !accept(&last_forwarded, &position) {
                            continue;
                        }

                        last_forwarded = Some((Instant::now(), position));
                        forward(&callback, position);
                    }
                    Err(err) => {
                        tracing::warn!("watch error: {}", err.message);
                        *last_error.lock().unwrap() = Some(err.message);
                    }
                }
            }
        });

        *self.watch_task.lock().unwrap() = Some(task);
    }

    /// Cancels the continuous watch. Idempotent; safe before `start`
    /// completes and safe to call repeatedly.
    pub fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(task) = self.watch_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }
}

/// Interval/displacement throttle: a sample goes through when enough time
/// passed or the device moved far enough, whichever comes first.
fn accept(last_forwarded: &Option<(Instant, Coordinates)>, position: &Coordinates) -> bool {
    match last_forwarded {
        None => true,
        Some((at, previous)) => {
            at.elapsed() >= MIN_SAMPLE_INTERVAL
                || previous.distance_meters(position) >= MIN_SAMPLE_DISPLACEMENT_METERS
        }
    }
}

fn forward(callback: &Arc<Mutex<Option<Callback>>>, position: Coordinates) {
    if !position.is_valid() {
        return;
    }

    // read the cell at call time; never capture the callback itself
    let current = callback.lock().unwrap().clone();

    if let Some(callback) = current {
        callback(position);
    }
}
