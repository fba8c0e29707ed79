//! Single-owner handle to one engine context.
//!
//! Every call into the engine goes through [`ContextHandle::enter`], which
//! holds a re-entrant guard for the whole call (argument marshalling
//! included). A host method invoked by script may call back into the same
//! context on the same thread; other threads wait.

use super::{Engine, EngineLimits, InterruptHandler, MemoryUsage, RawContext};
use crate::error::{BridgeError, Result};
use crate::trace::CallFrame;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct HandleState {
    raw: RawContext,
    depth: usize,
    close_requested: bool,
    entries: Vec<Vec<CallFrame>>,
}

/// Owner of one engine context
pub struct ContextHandle {
    id: Uuid,
    engine: Arc<dyn Engine>,
    leak_warnings: bool,
    state: ReentrantMutex<RefCell<HandleState>>,
}

impl ContextHandle {
    /// Create a context on the engine
    pub fn create(engine: Arc<dyn Engine>, leak_warnings: bool) -> Result<Self> {
        let raw = engine.create();
        if raw.is_null() {
            return Err(BridgeError::OutOfMemory(
                "cannot create script context".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        info!(context_id = %id, raw = raw.get(), "Created script context");

        Ok(Self {
            id,
            engine,
            leak_warnings,
            state: ReentrantMutex::new(RefCell::new(HandleState {
                raw,
                depth: 0,
                close_requested: false,
                entries: Vec::new(),
            })),
        })
    }

    /// Unique id of this handle
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the context has been closed (or is closing)
    pub fn is_closed(&self) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.raw.is_null() || state.close_requested
    }

    /// Run `f` against the live context.
    ///
    /// `frames` describe the bridge entry point and its caller, innermost
    /// first; they are visible through [`host_frames`](Self::host_frames)
    /// until `f` returns.
    pub fn enter<T>(
        &self,
        frames: Vec<CallFrame>,
        f: impl FnOnce(&dyn Engine, RawContext) -> Result<T>,
    ) -> Result<T> {
        let guard = self.state.lock();
        let raw = {
            let mut state = guard.borrow_mut();
            if state.raw.is_null() || state.close_requested {
                return Err(BridgeError::NullContext);
            }
            state.depth += 1;
            state.entries.push(frames);
            state.raw
        };

        let _exit = Exit { handle: self };
        f(self.engine.as_ref(), raw)
    }

    /// Current limits of the context
    pub fn limits(&self) -> Result<EngineLimits> {
        self.enter(Vec::new(), |engine, raw| engine.limits(raw).ok_or(BridgeError::NullContext))
    }

    /// Replace the limits of the context
    pub fn set_limits(&self, limits: EngineLimits) -> Result<()> {
        self.enter(Vec::new(), |engine, raw| {
            engine.set_limits(raw, limits);
            Ok(())
        })
    }

    /// Bytes the context may allocate; -1 for no limit
    pub fn set_memory_limit(&self, bytes: i64) -> Result<()> {
        let limits = self.limits()?;
        self.set_limits(EngineLimits {
            memory_limit: bytes,
            ..limits
        })
    }

    /// Bytes allocated between garbage collections; -1 disables automatic collection
    pub fn set_gc_threshold(&self, bytes: i64) -> Result<()> {
        let limits = self.limits()?;
        self.set_limits(EngineLimits {
            gc_threshold: bytes,
            ..limits
        })
    }

    /// Bytes of stack script calls may use; 0 disables the check
    pub fn set_max_stack_size(&self, bytes: i64) -> Result<()> {
        let limits = self.limits()?;
        self.set_limits(EngineLimits {
            max_stack_size: bytes,
            ..limits
        })
    }

    /// Allocation statistics of the context
    pub fn memory_usage(&self) -> Result<MemoryUsage> {
        self.enter(Vec::new(), |engine, raw| engine.memory_usage(raw).ok_or(BridgeError::NullContext))
    }

    /// Run a garbage collection now
    pub fn gc(&self) -> Result<()> {
        self.enter(Vec::new(), |engine, raw| {
            engine.gc(raw);
            Ok(())
        })
    }

    /// Install or clear the handler polled while script runs
    pub fn set_interrupt_handler(&self, handler: Option<Arc<dyn InterruptHandler>>) -> Result<()> {
        self.enter(Vec::new(), |engine, raw| {
            engine.set_interrupt_handler(raw, handler);
            Ok(())
        })
    }

    /// Host frames of every active entry, innermost first
    pub fn host_frames(&self) -> Vec<CallFrame> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.entries.iter().rev().flatten().cloned().collect()
    }

    /// Destroy the context. Later calls fail with `NullContext`.
    ///
    /// Closing from inside a call defers destruction until the outermost call
    /// returns.
    pub fn close(&self) {
        let guard = self.state.lock();
        let raw = {
            let mut state = guard.borrow_mut();
            if state.raw.is_null() || state.close_requested {
                return;
            }
            if state.depth > 0 {
                debug!(context_id = %self.id, "Deferring close until the active call returns");
                state.close_requested = true;
                return;
            }
            std::mem::replace(&mut state.raw, RawContext::NULL)
        };
        self.destroy(raw);
    }

    fn destroy(&self, raw: RawContext) {
        self.engine.destroy(raw);
        info!(context_id = %self.id, "Destroyed script context");
    }
}

/// Leaves one entry, unwinding included
struct Exit<'a> {
    handle: &'a ContextHandle,
}

impl Drop for Exit<'_> {
    fn drop(&mut self) {
        let deferred = {
            let guard = self.handle.state.lock();
            let mut state = guard.borrow_mut();
            state.depth -= 1;
            state.entries.pop();
            if state.depth == 0 && state.close_requested {
                Some(std::mem::replace(&mut state.raw, RawContext::NULL))
            } else {
                None
            }
        };
        if let Some(raw) = deferred {
            self.handle.destroy(raw);
        }
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        let raw = std::mem::replace(&mut self.state.get_mut().get_mut().raw, RawContext::NULL);
        if !raw.is_null() {
            if self.leak_warnings {
                warn!(context_id = %self.id, "Script context leaked without close");
            }
            self.destroy(raw);
        }
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedEngine;

    fn handle(engine: &Arc<ScriptedEngine>) -> ContextHandle {
        ContextHandle::create(engine.clone(), false).unwrap()
    }

    #[test]
    fn test_create_out_of_memory() {
        let engine = Arc::new(ScriptedEngine::with_capacity(1));
        let _first = handle(&engine);
        let err = ContextHandle::create(engine.clone(), false).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfMemory(_)));
    }

    #[test]
    fn test_close_is_idempotent_and_fails_fast() {
        let engine = Arc::new(ScriptedEngine::new());
        let h = handle(&engine);
        assert_eq!(engine.live_contexts(), 1);
        h.close();
        h.close();
        assert!(h.is_closed());
        assert_eq!(engine.live_contexts(), 0);
        let err = h.enter(vec![], |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, BridgeError::NullContext));
    }

    #[test]
    fn test_drop_destroys_leaked_context() {
        let engine = Arc::new(ScriptedEngine::new());
        drop(handle(&engine));
        assert_eq!(engine.live_contexts(), 0);
    }

    #[test]
    fn test_close_inside_call_is_deferred() {
        let engine = Arc::new(ScriptedEngine::new());
        let h = handle(&engine);
        h.enter(vec![], |_, raw| {
            h.close();
            assert!(!raw.is_null());
            assert_eq!(engine.live_contexts(), 1);
            assert!(matches!(
                h.enter(vec![], |_, _| Ok(())),
                Err(BridgeError::NullContext)
            ));
            Ok(())
        })
        .unwrap();
        assert_eq!(engine.live_contexts(), 0);
    }

    #[test]
    fn test_host_frames_innermost_first() {
        let engine = Arc::new(ScriptedEngine::new());
        let h = handle(&engine);
        h.enter(vec![CallFrame::native("outer")], |_, _| {
            h.enter(vec![CallFrame::native("inner")], |_, _| {
                let names: Vec<_> = h.host_frames().into_iter().map(|f| f.function).collect();
                assert_eq!(names, vec!["inner", "outer"]);
                Ok(())
            })
        })
        .unwrap();
        assert!(h.host_frames().is_empty());
    }

    #[test]
    fn test_limits_round_trip() {
        let engine = Arc::new(ScriptedEngine::new());
        let h = handle(&engine);
        assert_eq!(h.limits().unwrap(), EngineLimits::default());

        h.set_memory_limit(1024 * 1024 + 1).unwrap();
        h.set_gc_threshold(1024 * 1024 + 2).unwrap();
        h.set_max_stack_size(1024 * 1024 + 3).unwrap();
        let limits = h.limits().unwrap();
        assert_eq!(limits.memory_limit, 1024 * 1024 + 1);
        assert_eq!(limits.gc_threshold, 1024 * 1024 + 2);
        assert_eq!(limits.max_stack_size, 1024 * 1024 + 3);
        assert_eq!(h.memory_usage().unwrap().memory_allocated_limit, 1024 * 1024 + 1);

        h.close();
        assert!(matches!(h.memory_usage(), Err(BridgeError::NullContext)));
        assert!(matches!(h.set_memory_limit(-1), Err(BridgeError::NullContext)));
    }

    #[test]
    fn test_panic_inside_call_leaves_handle_usable() {
        let engine = Arc::new(ScriptedEngine::new());
        let h = handle(&engine);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            h.enter(vec![CallFrame::native("outer")], |_, _| -> Result<()> { panic!("host failure") })
        }));
        assert!(outcome.is_err());
        assert!(h.host_frames().is_empty());
        assert!(h.enter(vec![], |_, _| Ok(())).is_ok());
    }

    #[test]
    fn test_panic_after_close_still_destroys() {
        let engine = Arc::new(ScriptedEngine::new());
        let h = handle(&engine);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            h.enter(vec![], |_, _| -> Result<()> {
                h.close();
                panic!("host failure")
            })
        }));
        assert!(outcome.is_err());
        assert!(h.is_closed());
        assert_eq!(engine.live_contexts(), 0);
    }
}
