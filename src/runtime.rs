use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub(crate) fn sleep(duration: Duration) -> BoxFuture<()> {
    Box::pin(async move {
        let _ = async_io::Timer::after(duration).await;
    })
}

/// Sleep for `duration`, or forever when `None`.
pub(crate) fn deadline(duration: Option<Duration>) -> BoxFuture<()> {
    match duration {
        Some(d) => sleep(d),
        None => Box::pin(futures_util::future::pending()),
    }
}

/// Drive a future to completion on the current thread.
pub fn block_on<T>(future: impl Future<Output = T>) -> T {
    async_io::block_on(future)
}
