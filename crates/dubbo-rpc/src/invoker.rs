//! The invoker abstraction.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::invocation::Invocation;
use crate::result::RpcResult;
use crate::url::Url;

/// Something that can carry out an invocation.
///
/// Protocol invokers talk to one provider, filter chains wrap another
/// invoker, and cluster invokers choose among many.
#[async_trait]
pub trait Invoker: Send + Sync {
    fn url(&self) -> &Url;

    fn is_available(&self) -> bool;

    async fn invoke(&self, invocation: &mut Invocation) -> RpcResult;

    /// Releases resources. The invoker reports unavailable afterwards.
    fn destroy(&self);
}

/// URL plus availability flags shared by concrete invokers.
#[derive(Debug)]
pub struct BaseInvoker {
    url: Url,
    available: AtomicBool,
    destroyed: AtomicBool,
}

impl BaseInvoker {
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self {
            url,
            available: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire) && !self.is_destroyed()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Marks the invoker destroyed. Returns `false` if it already was.
    pub fn destroy(&self) -> bool {
        self.available.store(false, Ordering::Release);
        !self.destroyed.swap(true, Ordering::AcqRel)
    }
}
