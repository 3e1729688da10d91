//! Interceptor closures of a hooked method, in installation order.

use crate::error::Result;
use crate::hook::Mode;
use crate::hook::chain::Chain;
use crate::runtime::invocation::invoke;
use crate::runtime::{Block, Imp, Selector, SignatureDescriptor};
use fxhash::FxHashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A hook closure together with its decoded signature.
#[derive(Clone)]
pub(crate) struct Interceptor {
    pub(crate) block: Block,
    pub(crate) signature: Arc<SignatureDescriptor>,
}

/// The before, instead and after closures of one method.
#[derive(Clone, Default)]
pub(crate) struct ClosureSet {
    before: Vec<Interceptor>,
    instead: Vec<Interceptor>,
    after: Vec<Interceptor>,
}

impl ClosureSet {
    fn list_mut(&mut self, mode: Mode) -> &mut Vec<Interceptor> {
        match mode {
            Mode::Before => &mut self.before,
            Mode::Instead => &mut self.instead,
            Mode::After => &mut self.after,
        }
    }

    pub(crate) fn append(&mut self, mode: Mode, interceptor: Interceptor) {
        self.list_mut(mode).push(interceptor);
    }

    /// Removes the most recently appended occurrence of `block`.
    pub(crate) fn remove(&mut self, mode: Mode, block: &Block) -> Option<Interceptor> {
        let list = self.list_mut(mode);
        let index = list.iter().rposition(|i| i.block.ptr_eq(block))?;
        Some(list.remove(index))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.before.is_empty() && self.instead.is_empty() && self.after.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.before.len() + self.instead.len() + self.after.len()
    }

    /// Runs the befores, then the instead chain (or `original`), then the
    /// afters.
    ///
    /// # Safety
    ///
    /// `args` and `ret` must be valid for `signature`.
    pub(crate) unsafe fn run(
        &self,
        signature: &Arc<SignatureDescriptor>,
        original: &Imp,
        args: &[*mut u8],
        ret: *mut u8,
    ) -> Result<()> {
        for interceptor in &self.before {
            // SAFETY: forwarded caller contract.
            unsafe { run_observer(interceptor, args)? };
        }

        if self.instead.is_empty() {
            // SAFETY: forwarded caller contract.
            unsafe { invoke(original, signature, args, ret)? };
        } else {
            let chain = self
                .instead
                .iter()
                .cloned()
                .fold(Chain::new(Arc::clone(signature), original.clone()), Chain::wrap);
            // SAFETY: forwarded caller contract.
            unsafe { chain.call(args, ret)? };
        }

        for interceptor in &self.after {
            // SAFETY: forwarded caller contract.
            unsafe { run_observer(interceptor, args)? };
        }
        Ok(())
    }
}

/// Calls a before or after closure with the prefix of the arguments it
/// declared; its result is discarded.
unsafe fn run_observer(interceptor: &Interceptor, args: &[*mut u8]) -> Result<()> {
    let count = interceptor.signature.argument_count().min(args.len());
    let imp = Imp::Block(interceptor.block.clone());
    // SAFETY: the closure's parameters are a prefix of the method's
    // (checked at install time).
    unsafe {
        invoke(
            &imp,
            &interceptor.signature,
            &args[..count],
            std::ptr::null_mut(),
        )
    }
}

/// Per-instance closures, stored as an associated value on the hooked
/// instance and keyed by selector.
#[derive(Default)]
pub(crate) struct InstanceHooks {
    by_selector: Mutex<FxHashMap<Selector, ClosureSet>>,
}

impl InstanceHooks {
    pub(crate) fn append(&self, selector: Selector, mode: Mode, interceptor: Interceptor) {
        self.by_selector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(selector)
            .or_default()
            .append(mode, interceptor);
    }

    pub(crate) fn remove(
        &self,
        selector: Selector,
        mode: Mode,
        block: &Block,
    ) -> Option<Interceptor> {
        let mut by_selector = self.by_selector.lock().unwrap_or_else(PoisonError::into_inner);
        let set = by_selector.get_mut(&selector)?;
        let removed = set.remove(mode, block);
        if set.is_empty() {
            by_selector.remove(&selector);
        }
        removed
    }

    pub(crate) fn snapshot(&self, selector: Selector) -> ClosureSet {
        self.by_selector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&selector)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_selector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}
