use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt};

use crate::error::{DispatchError, Result};

/// Completion record of one or more device submissions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchStats {
    pub kernels: Vec<String>,
    pub submissions: u32,
    /// Time the queue spent executing the submissions.
    pub device_time: Duration,
}

impl LaunchStats {
    pub fn single(kernel: impl Into<String>, device_time: Duration) -> Self {
        Self {
            kernels: vec![kernel.into()],
            submissions: 1,
            device_time,
        }
    }

    pub fn absorb(&mut self, other: LaunchStats) {
        self.kernels.extend(other.kernels);
        self.submissions += other.submissions;
        self.device_time += other.device_time;
    }
}

/// Drives a backend's completion callbacks (e.g. `device.poll`).
pub type Poller = Arc<dyn Fn() + Send + Sync>;

/// Joinable handle for asynchronous device work.
pub struct KernelFuture {
    inner: BoxFuture<'static, Result<LaunchStats>>,
    pollers: Vec<Poller>,
}

impl fmt::Debug for KernelFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelFuture")
            .field("pollers", &self.pollers.len())
            .finish_non_exhaustive()
    }
}

impl KernelFuture {
    pub fn ready(stats: LaunchStats) -> Self {
        Self {
            inner: future::ready(Ok(stats)).boxed(),
            pollers: Vec::new(),
        }
    }

    pub fn failed(err: DispatchError) -> Self {
        Self {
            inner: future::ready(Err(err)).boxed(),
            pollers: Vec::new(),
        }
    }

    /// Completes when the sender side fires; a dropped sender is a device error.
    pub fn from_receiver(rx: oneshot::Receiver<Result<LaunchStats>>, context: &str) -> Self {
        let context = context.to_string();
        let inner = async move {
            rx.await
                .map_err(|_| DispatchError::device(format!("{context}: completion signal dropped")))?
        }
        .boxed();
        Self {
            inner,
            pollers: Vec::new(),
        }
    }

    pub fn with_poller(mut self, poller: Poller) -> Self {
        self.pollers.push(poller);
        self
    }

    /// Block the calling thread until the work completes.
    pub fn wait(self) -> Result<LaunchStats> {
        for poller in &self.pollers {
            poller();
        }
        pollster::block_on(self.inner)
    }

    /// Merge several futures into one that completes once all of them have.
    ///
    /// Every constituent is driven to completion; the first error in
    /// submission order is reported afterwards.
    pub fn merge(mut futures: Vec<KernelFuture>) -> KernelFuture {
        if futures.len() <= 1 {
            return futures
                .pop()
                .unwrap_or_else(|| KernelFuture::ready(LaunchStats::default()));
        }
        let mut pollers = Vec::new();
        let mut inners = Vec::with_capacity(futures.len());
        for fut in futures {
            pollers.extend(fut.pollers);
            inners.push(fut.inner);
        }
        let inner = future::join_all(inners)
            .map(|results| {
                let mut merged = LaunchStats::default();
                let mut first_err = None;
                for result in results {
                    match result {
                        Ok(stats) => merged.absorb(stats),
                        Err(err) => {
                            if first_err.is_none() {
                                first_err = Some(err);
                            }
                        }
                    }
                }
                match first_err {
                    Some(err) => Err(err),
                    None => Ok(merged),
                }
            })
            .boxed();
        KernelFuture { inner, pollers }
    }
}

impl Future for KernelFuture {
    type Output = Result<LaunchStats>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}
