//! Thread-local snapshot context
//!
//! Each thread keeps:
//! - a stack of entered frames (a snapshot, or the global snapshot of one runtime)
//! - a stack of read hooks installed by `observe_reads`
//! - a suspension depth for read hooks
//!
//! Every push is paired with a guard that pops on drop, so a panicking
//! block never leaves a stale frame behind.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::handle::Snapshot;
use super::runtime::RuntimeId;
use crate::state::CellId;

pub(crate) enum Frame {
    Snapshot(Snapshot),
    Global(RuntimeId),
}

impl Frame {
    fn runtime(&self) -> RuntimeId {
        match self {
            Frame::Snapshot(snapshot) => snapshot.runtime().id(),
            Frame::Global(runtime) => *runtime,
        }
    }
}

struct ReadHook {
    runtime: RuntimeId,
    on_read: Rc<dyn Fn(CellId)>,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static READ_HOOKS: RefCell<Vec<ReadHook>> = const { RefCell::new(Vec::new()) };
    static SUSPENDED: Cell<usize> = const { Cell::new(0) };
}

/// The innermost snapshot entered on this thread for `runtime`.
///
/// `None` when nothing is entered or the innermost frame is the runtime's
/// global snapshot.
pub(crate) fn current_for(runtime: RuntimeId) -> Option<Snapshot> {
    FRAMES.with(|frames| {
        frames
            .borrow()
            .iter()
            .rev()
            .find(|frame| frame.runtime() == runtime)
            .and_then(|frame| match frame {
                Frame::Snapshot(snapshot) => Some(snapshot.clone()),
                Frame::Global(_) => None,
            })
    })
}

struct FrameGuard;

impl Drop for FrameGuard {
    fn drop(&mut self) {
        // Dropped outside the borrow: the last snapshot handle may dispose.
        let frame = FRAMES.with(|frames| frames.borrow_mut().pop());
        drop(frame);
    }
}

/// Run `block` with `frame` on top of this thread's stack.
pub(crate) fn with_frame<R, F: FnOnce() -> R>(frame: Frame, block: F) -> R {
    FRAMES.with(|frames| frames.borrow_mut().push(frame));
    let _guard = FrameGuard;
    block()
}

struct HookGuard;

impl Drop for HookGuard {
    fn drop(&mut self) {
        let hook = READ_HOOKS.with(|hooks| hooks.borrow_mut().pop());
        drop(hook);
    }
}

/// Run `block` with a read hook installed for `runtime`.
pub(crate) fn with_read_hook<R, F: FnOnce() -> R>(
    runtime: RuntimeId,
    on_read: Rc<dyn Fn(CellId)>,
    block: F,
) -> R {
    READ_HOOKS.with(|hooks| hooks.borrow_mut().push(ReadHook { runtime, on_read }));
    let _guard = HookGuard;
    block()
}

struct SuspendGuard;

impl SuspendGuard {
    fn enter() -> Self {
        SUSPENDED.with(|s| s.set(s.get() + 1));
        SuspendGuard
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        SUSPENDED.with(|s| s.set(s.get() - 1));
    }
}

/// Run `block` with every read hook on this thread suspended.
pub(crate) fn without_read_hooks<R, F: FnOnce() -> R>(block: F) -> R {
    let _guard = SuspendGuard::enter();
    block()
}

/// Report a read of `cell` to every hook installed for `runtime`.
///
/// Hooks run suspended: reads they perform are not reported.
pub(crate) fn notify_read(runtime: RuntimeId, cell: CellId) {
    if SUSPENDED.with(|s| s.get()) > 0 {
        return;
    }
    let hooks: Vec<Rc<dyn Fn(CellId)>> = READ_HOOKS.with(|hooks| {
        hooks
            .borrow()
            .iter()
            .filter(|hook| hook.runtime == runtime)
            .map(|hook| Rc::clone(&hook.on_read))
            .collect()
    });
    if hooks.is_empty() {
        return;
    }
    let _guard = SuspendGuard::enter();
    for hook in hooks {
        hook(cell);
    }
}
