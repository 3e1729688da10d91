//! Composition of instead closures.
//!
//! Instead closures nest: the most recently installed one is outermost and
//! receives, as its first argument, a callable that runs the next one in.
//! The innermost callable runs the original implementation.
//!
//! ```text
//! call ──► B(original = ─► A(original = ─► original))
//! ```

use crate::error::Result;
use crate::hook::closures::Interceptor;
use crate::runtime::invocation::invoke;
use crate::runtime::{Block, BlockPtr, Imp, SignatureDescriptor};
use std::sync::Arc;

pub(crate) struct Chain {
    signature: Arc<SignatureDescriptor>,
    original: Imp,
    /// Installation order: `links[0]` is innermost.
    links: Vec<Interceptor>,
}

impl Chain {
    pub(crate) fn new(signature: Arc<SignatureDescriptor>, original: Imp) -> Self {
        Chain {
            signature,
            original,
            links: Vec::new(),
        }
    }

    /// Wraps the current chain in `link`, which becomes outermost.
    #[must_use]
    pub(crate) fn wrap(mut self, link: Interceptor) -> Self {
        self.links.push(link);
        self
    }

    /// Runs the outermost link.
    ///
    /// # Safety
    ///
    /// `args` and `ret` must be valid for the method signature.
    pub(crate) unsafe fn call(self, args: &[*mut u8], ret: *mut u8) -> Result<()> {
        let depth = self.links.len();
        // SAFETY: forwarded caller contract.
        unsafe { call_depth(&Arc::new(self), depth, args, ret) }
    }
}

/// Runs the chain made of the first `depth` links.
unsafe fn call_depth(
    chain: &Arc<Chain>,
    depth: usize,
    args: &[*mut u8],
    ret: *mut u8,
) -> Result<()> {
    let Some(link) = depth.checked_sub(1).map(|index| &chain.links[index]) else {
        // SAFETY: forwarded caller contract.
        return unsafe { invoke(&chain.original, &chain.signature, args, ret) };
    };

    let inner = next_callable(chain, depth - 1);
    let mut inner_ptr: BlockPtr = inner.as_ptr();
    let mut link_args = Vec::with_capacity(args.len() + 1);
    link_args.push(std::ptr::from_mut(&mut inner_ptr).cast::<u8>());
    link_args.extend_from_slice(args);

    let imp = Imp::Block(link.block.clone());
    // SAFETY: the link's signature is (callable, method arguments...) with
    // the method's return type (checked at install time); `inner` outlives
    // the call.
    unsafe { invoke(&imp, &link.signature, &link_args, ret) }
}

/// The callable handed to the link at `depth`: runs the first `depth`
/// links, or the original when `depth` is 0.
fn next_callable(chain: &Arc<Chain>, depth: usize) -> Block {
    let chain_ref = Arc::clone(chain);
    Block::with_signature(Arc::clone(&chain.signature), move |call| {
        // SAFETY: the callable is invoked with the method signature.
        let result = unsafe {
            call_depth(&chain_ref, depth, call.raw_arguments(), call.raw_return())
        };
        if let Err(err) = result {
            oxhook_log::error!("calling the original implementation failed: {err}");
        }
    })
}
