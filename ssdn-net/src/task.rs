use tokio::task::JoinHandle;

/// Aborts the wrapped task when dropped.
pub(crate) struct TaskGuard<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
