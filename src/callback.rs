//! Callback registry: register, replace, and replace-self operations on a
//! context's callback vector.
//!
//! Callbacks run in strict reverse registration order around the kernel
//! capture. A callback returns 0 to let the chain proceed; any other value
//! breaks the contract and aborts the process. Thread-context registrations
//! redirect to the dedicated checkpoint thread's context, since that is the
//! vector actually executed when dispatch happens in thread context.
//!
//! Callers hold a critical section around all of these (the public entry
//! points take one internally).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{self, Context};
use crate::cs;
use crate::error::{CrError, CrResult};
use crate::thread;
use crate::types::{CallbackContext, CallbackId, CrState, MAX_CALLBACKS};

/// A registered checkpoint callback.
///
/// Return 0 to continue the chain. Callbacks re-enter the engine through
/// [`checkpoint`](crate::checkpoint) to order their post-resume work against
/// the capture.
pub type CallbackFn = Box<dyn FnMut() -> i32 + Send>;

/// Shared cell holding one callback. The engine clones the `Arc` out of the
/// vector and drops the vector lock before invoking, because the running
/// callback may legally replace itself (which takes the vector lock).
pub(crate) type CallbackCell = Arc<Mutex<Option<CallbackFn>>>;

pub(crate) struct CallbackEntry {
    pub(crate) context: CallbackContext,
    pub(crate) cell: CallbackCell,
}

/// Append a callback to `ctx`'s vector. Caller holds a critical section.
pub(crate) fn do_register(
    ctx: &Context,
    func: CallbackFn,
    context_tag: CallbackContext,
) -> CrResult<CallbackId> {
    let mut callbacks = ctx.callbacks.lock();
    let index = callbacks.len();
    if index >= MAX_CALLBACKS {
        return Err(CrError::ResourceExhausted);
    }

    callbacks.push(CallbackEntry {
        context: context_tag,
        cell: Arc::new(Mutex::new(Some(func))),
    });

    Ok(CallbackId {
        index: index as u32,
        context: context_tag,
    })
}

/// Swap the callback in an existing slot. Caller holds a critical section.
///
/// The slot's context tag is fixed at registration; `func = None` empties the
/// slot, which the engine then skips.
pub(crate) fn do_replace(
    ctx: &Context,
    id: CallbackId,
    func: Option<CallbackFn>,
    context_tag: CallbackContext,
) -> CrResult<()> {
    if context_tag != id.context {
        return Err(CrError::ContextMismatch {
            id: id.context,
            requested: context_tag,
        });
    }

    let mut callbacks = ctx.callbacks.lock();
    let entry = callbacks
        .get_mut(id.index as usize)
        .ok_or(CrError::InvalidArgument("callback id out of bounds"))?;

    // A fresh cell, not a write through the old one: the old cell may be
    // locked by the engine mid-invocation right now.
    entry.cell = Arc::new(Mutex::new(func));
    Ok(())
}

/// Register a callback on the calling thread's context (signal context) or
/// on the shared checkpoint thread (thread context).
///
/// Fails with [`CrError::Busy`] from inside a running callback and
/// [`CrError::ResourceExhausted`] at the capacity ceiling.
pub fn register_callback<F>(func: F, context_tag: CallbackContext) -> CrResult<CallbackId>
where
    F: FnMut() -> i32 + Send + 'static,
{
    let ctx = context::current().ok_or(CrError::NotInitialized)?;

    let state = cs::do_enter(&ctx);
    let result = if state == CrState::Active {
        Err(CrError::Busy)
    } else {
        match context_tag {
            CallbackContext::Signal => do_register(&ctx, Box::new(func), context_tag),
            CallbackContext::Thread => thread::register_thread_callback(Box::new(func)),
        }
    };
    cs::do_leave(&ctx);

    result
}

/// Replace a previously registered callback.
///
/// `context_tag` must match the context encoded in `id`; the update is not
/// atomic with respect to a checkpoint already unwinding, which is the
/// caller's responsibility (hold a critical section across any grouping that
/// must be seen together).
pub fn replace_callback<F>(id: CallbackId, func: F, context_tag: CallbackContext) -> CrResult<()>
where
    F: FnMut() -> i32 + Send + 'static,
{
    replace_inner(id, Some(Box::new(func)), context_tag)
}

/// Empty a callback slot. The engine skips empty slots; ids of other
/// callbacks are unaffected.
pub fn clear_callback(id: CallbackId) -> CrResult<()> {
    replace_inner(id, None, id.context)
}

fn replace_inner(
    id: CallbackId,
    func: Option<CallbackFn>,
    context_tag: CallbackContext,
) -> CrResult<()> {
    let ctx = context::current().ok_or(CrError::NotInitialized)?;

    let state = cs::do_enter(&ctx);
    let result = if state == CrState::Active {
        Err(CrError::Busy)
    } else {
        match context_tag {
            CallbackContext::Signal => do_replace(&ctx, id, func, context_tag),
            CallbackContext::Thread => thread::replace_thread_callback(id, func, context_tag),
        }
    };
    cs::do_leave(&ctx);

    result
}

/// From inside a running callback: replace this callback's own registration.
pub fn replace_self<F>(func: F) -> CrResult<()>
where
    F: FnMut() -> i32 + Send + 'static,
{
    let ctx = context::current().ok_or(CrError::NotInitialized)?;
    if ctx.state() != CrState::Active {
        return Err(CrError::NotInCallback);
    }

    let index = ctx.run.id.load(std::sync::atomic::Ordering::Relaxed);
    let context_tag = {
        let callbacks = ctx.callbacks.lock();
        callbacks
            .get(index as usize)
            .ok_or(CrError::InvalidArgument("no running callback"))?
            .context
    };

    let id = CallbackId {
        index: index as u32,
        context: context_tag,
    };
    do_replace(&ctx, id, Some(Box::new(func)), context_tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    fn fresh_context() -> Context {
        Context::new_for_testing()
    }

    #[test]
    fn register_hands_out_sequential_slots() {
        let ctx = fresh_context();
        let a = do_register(&ctx, Box::new(|| 0), CallbackContext::Signal).unwrap();
        let b = do_register(&ctx, Box::new(|| 0), CallbackContext::Signal).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(ctx.callback_count(), 2);
    }

    #[test]
    fn replace_requires_matching_context() {
        let ctx = fresh_context();
        let id = do_register(&ctx, Box::new(|| 0), CallbackContext::Signal).unwrap();

        let err = do_replace(&ctx, id, Some(Box::new(|| 0)), CallbackContext::Thread)
            .unwrap_err();
        assert!(matches!(err, CrError::ContextMismatch { .. }));

        do_replace(&ctx, id, Some(Box::new(|| 0)), CallbackContext::Signal).unwrap();
    }

    #[test]
    fn replace_rejects_out_of_bounds_ids() {
        let ctx = fresh_context();
        let bogus = CallbackId {
            index: 3,
            context: CallbackContext::Signal,
        };
        let err = do_replace(&ctx, bogus, None, CallbackContext::Signal).unwrap_err();
        assert!(matches!(err, CrError::InvalidArgument(_)));
    }

    #[test]
    fn registration_stops_at_the_capacity_ceiling() {
        let ctx = fresh_context();
        for _ in 0..crate::types::MAX_CALLBACKS {
            do_register(&ctx, Box::new(|| 0), CallbackContext::Signal).unwrap();
        }
        let err = do_register(&ctx, Box::new(|| 0), CallbackContext::Signal).unwrap_err();
        assert_eq!(err, CrError::ResourceExhausted);
        assert_eq!(ctx.callback_count(), crate::types::MAX_CALLBACKS);
    }

    proptest::proptest! {
        #[test]
        fn ids_are_dense_and_context_tagged(
            thread_tags in proptest::collection::vec(proptest::bool::ANY, 1..64)
        ) {
            let ctx = fresh_context();
            for (i, is_thread) in thread_tags.iter().enumerate() {
                let tag = if *is_thread {
                    CallbackContext::Thread
                } else {
                    CallbackContext::Signal
                };
                let id = do_register(&ctx, Box::new(|| 0), tag).unwrap();
                proptest::prop_assert_eq!(id.index(), i as u32);
                proptest::prop_assert_eq!(id.context(), tag);

                let opposite = if *is_thread {
                    CallbackContext::Signal
                } else {
                    CallbackContext::Thread
                };
                proptest::prop_assert!(do_replace(&ctx, id, None, opposite).is_err());
                proptest::prop_assert!(do_replace(&ctx, id, Some(Box::new(|| 0)), tag).is_ok());
            }
        }
    }

    #[test]
    fn replace_swaps_the_cell_not_its_contents() {
        let ctx = fresh_context();
        let id = do_register(&ctx, Box::new(|| 0), CallbackContext::Signal).unwrap();

        let old_cell = Arc::clone(&ctx.callbacks.lock()[0].cell);
        // Simulate the engine holding the cell mid-invocation.
        let engine_guard = old_cell.lock();

        do_replace(&ctx, id, Some(Box::new(|| 7)), CallbackContext::Signal).unwrap();
        drop(engine_guard);

        let new_cell = Arc::clone(&ctx.callbacks.lock()[0].cell);
        assert!(!Arc::ptr_eq(&old_cell, &new_cell));
        let rc = (new_cell.lock().as_mut().unwrap())();
        assert_eq!(rc, 7);
    }
}
