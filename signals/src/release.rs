/// A registration that can be torn down. Releasing must be idempotent and safe to call from any thread.
pub trait Release: Send + Sync {
    fn release(&self);
}

impl<R: Release + ?Sized> Release for Box<R> {
    fn release(&self) { (**self).release() }
}

impl<R: Release + ?Sized> Release for std::sync::Arc<R> {
    fn release(&self) { (**self).release() }
}
