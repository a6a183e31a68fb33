//! Recording contexts: one command list paired with one allocator,
//! checked out of a per-kind pool, recorded on freely from any thread,
//! and submitted through the owning queue.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use sgpu_hal::{Device, RawList};
use sgpu_types::{
    Barrier, FenceValue, QueueKind, ResourceState, SplitPhase, SubmitError, TrackedResource,
};

use crate::manager::QueueManager;
use crate::queue::lost_on;

/// Barriers buffer in the context and flush to the list in batches of
/// at most this many.
pub const MAX_PENDING_BARRIERS: usize = 16;

// ── CommandContext ──────────────────────────────────────────

/// A checked-out recording session. Holds its list and allocator
/// exclusively, so recording never touches shared state; the queue is
/// only involved at `flush`/`finish`.
pub struct CommandContext<D: Device> {
    manager: Arc<QueueManager<D>>,
    kind: QueueKind,
    home: Weak<ContextPool<D>>,
    allocator: Option<D::Allocator>,
    list: Option<D::List>,
    pending_barriers: Vec<Barrier>,
}

impl<D: Device> CommandContext<D> {
    /// A bare context, not yet recording. Prefer
    /// `ContextPool::allocate_context`, which recycles and initializes
    /// in one step; a directly built context must call `initialize`
    /// before recording and is dropped rather than pooled after
    /// `finish`.
    pub fn new(manager: Arc<QueueManager<D>>, kind: QueueKind) -> CommandContext<D> {
        CommandContext {
            manager,
            kind,
            home: Weak::new(),
            allocator: None,
            list: None,
            pending_barriers: Vec::with_capacity(MAX_PENDING_BARRIERS),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Barriers recorded but not yet flushed to the list.
    pub fn pending_barrier_count(&self) -> usize {
        self.pending_barriers.len()
    }

    /// Arm the context for recording: borrow an allocator from the
    /// queue's pool and reset the retained list against it, creating
    /// the list first if this context never had one.
    pub fn initialize(&mut self) -> Result<(), SubmitError> {
        debug_assert!(self.allocator.is_none(), "context already recording");
        match self.list.as_mut() {
            Some(list) => {
                let queue = self.manager.queue(self.kind);
                let allocator = queue.request_allocator()?;
                if let Err(err) = list.reset(&allocator) {
                    queue.salvage_allocator(allocator);
                    return Err(lost_on(err));
                }
                self.allocator = Some(allocator);
            }
            None => {
                let (allocator, list) = self.manager.create_command_list(self.kind.into())?;
                self.allocator = Some(allocator);
                self.list = Some(list);
            }
        }
        Ok(())
    }

    // ── Barrier recording ───────────────────────────────────

    /// Record `resource`'s move to `new_state`. Completes an open split
    /// transition when `new_state` is its target; a same-state request
    /// degenerates to a UAV barrier when the state is
    /// `UNORDERED_ACCESS`. Compute contexts only accept states the
    /// compute queue can legally hold.
    pub fn transition_resource(
        &mut self,
        resource: &mut TrackedResource,
        new_state: ResourceState,
        flush_now: bool,
    ) -> Result<(), SubmitError> {
        self.require_recording()?;
        let old_state = resource.usage;
        if self.kind == QueueKind::Compute {
            assert!(
                ResourceState::COMPUTE_QUEUE_ALLOWED.contains(old_state),
                "resource state {old_state:?} not legal on the compute queue"
            );
            assert!(
                ResourceState::COMPUTE_QUEUE_ALLOWED.contains(new_state),
                "resource state {new_state:?} not legal on the compute queue"
            );
        }
        if old_state != new_state {
            debug_assert!(self.pending_barriers.len() < MAX_PENDING_BARRIERS);
            let phase = if resource.transitioning == Some(new_state) {
                resource.transitioning = None;
                SplitPhase::End
            } else {
                SplitPhase::Full
            };
            self.pending_barriers.push(Barrier::Transition {
                resource: resource.handle,
                before: old_state,
                after: new_state,
                phase,
            });
            resource.usage = new_state;
        } else if new_state == ResourceState::UNORDERED_ACCESS {
            return self.insert_uav_barrier(resource, flush_now);
        }
        self.maybe_flush(flush_now)
    }

    /// Open a split transition: the `Begin` half records now, the `End`
    /// half when a later `transition_resource` names the same target.
    /// The resource keeps its old usage state until then. An older
    /// split still in flight is completed first.
    pub fn begin_resource_transition(
        &mut self,
        resource: &mut TrackedResource,
        new_state: ResourceState,
        flush_now: bool,
    ) -> Result<(), SubmitError> {
        self.require_recording()?;
        if let Some(target) = resource.transitioning {
            self.transition_resource(resource, target, false)?;
        }
        let old_state = resource.usage;
        if old_state != new_state {
            debug_assert!(self.pending_barriers.len() < MAX_PENDING_BARRIERS);
            self.pending_barriers.push(Barrier::Transition {
                resource: resource.handle,
                before: old_state,
                after: new_state,
                phase: SplitPhase::Begin,
            });
            resource.transitioning = Some(new_state);
        }
        self.maybe_flush(flush_now)
    }

    /// Order UAV accesses to `resource` across dispatches/draws.
    pub fn insert_uav_barrier(
        &mut self,
        resource: &TrackedResource,
        flush_now: bool,
    ) -> Result<(), SubmitError> {
        self.require_recording()?;
        debug_assert!(self.pending_barriers.len() < MAX_PENDING_BARRIERS);
        self.pending_barriers.push(Barrier::Uav {
            resource: resource.handle,
        });
        self.maybe_flush(flush_now)
    }

    /// Order reuse of memory shared by two placed resources.
    pub fn insert_alias_barrier(
        &mut self,
        before: &TrackedResource,
        after: &TrackedResource,
        flush_now: bool,
    ) -> Result<(), SubmitError> {
        self.require_recording()?;
        debug_assert!(self.pending_barriers.len() < MAX_PENDING_BARRIERS);
        self.pending_barriers.push(Barrier::Alias {
            before: before.handle,
            after: after.handle,
        });
        self.maybe_flush(flush_now)
    }

    /// Push all buffered barriers into the list.
    pub fn flush_resource_barriers(&mut self) -> Result<(), SubmitError> {
        if self.pending_barriers.is_empty() {
            return Ok(());
        }
        let Some(list) = self.list.as_mut() else {
            return Err(SubmitError::NotInitialized);
        };
        list.record_barriers(&self.pending_barriers);
        self.pending_barriers.clear();
        Ok(())
    }

    fn maybe_flush(&mut self, flush_now: bool) -> Result<(), SubmitError> {
        if flush_now || self.pending_barriers.len() >= MAX_PENDING_BARRIERS {
            self.flush_resource_barriers()?;
        }
        Ok(())
    }

    fn require_recording(&self) -> Result<(), SubmitError> {
        if self.allocator.is_some() {
            Ok(())
        } else {
            Err(SubmitError::NotInitialized)
        }
    }

    // ── Submission ──────────────────────────────────────────

    /// Submit what has been recorded so far and keep recording. The
    /// used allocator retires at the returned fence value; the list is
    /// re-armed with a fresh one, so work recorded after this call is
    /// ordered behind the submitted batch but shares nothing with it.
    pub fn flush(&mut self, wait: bool) -> Result<FenceValue, SubmitError> {
        self.flush_resource_barriers()?;
        let Some(list) = self.list.as_mut() else {
            return Err(SubmitError::NotInitialized);
        };
        let Some(allocator) = self.allocator.take() else {
            return Err(SubmitError::NotInitialized);
        };
        let queue = self.manager.queue(self.kind);
        let value = queue.execute_and_retire(list, allocator)?;
        let fresh = queue.request_allocator()?;
        if let Err(err) = list.reset(&fresh) {
            queue.salvage_allocator(fresh);
            return Err(lost_on(err));
        }
        self.allocator = Some(fresh);
        if wait {
            queue.wait_for_fence(value, None)?;
        }
        Ok(value)
    }

    /// Submit and release: the allocator retires at the returned fence
    /// value and the context goes back to its pool for reuse.
    pub fn finish(mut self, wait: bool) -> Result<FenceValue, SubmitError> {
        self.flush_resource_barriers()?;
        let Some(mut list) = self.list.take() else {
            return Err(SubmitError::NotInitialized);
        };
        let Some(allocator) = self.allocator.take() else {
            self.list = Some(list);
            return Err(SubmitError::NotInitialized);
        };
        let queue = self.manager.queue(self.kind);
        let result = queue.execute_and_retire(&mut list, allocator);
        self.list = Some(list);
        let value = result?;
        let kind = self.kind;
        let manager = Arc::clone(&self.manager);
        if let Some(pool) = self.home.upgrade() {
            pool.recycle(self);
        }
        if wait {
            manager.queue(kind).wait_for_fence(value, None)?;
        }
        Ok(value)
    }
}

impl<D: Device> Drop for CommandContext<D> {
    fn drop(&mut self) {
        // A context dropped mid-recording abandons its list, but the
        // allocator goes back to the pool. Nothing in it was submitted,
        // so parking it behind the queue's issued work is safe.
        if let Some(allocator) = self.allocator.take() {
            warn!(kind = ?self.kind, "command context dropped while recording; salvaging its allocator");
            self.manager.queue(self.kind).salvage_allocator(allocator);
        }
    }
}

// ── ContextPool ─────────────────────────────────────────────

/// Recycles finished contexts per queue kind, keeping their command
/// list objects alive across checkouts.
pub struct ContextPool<D: Device> {
    manager: Arc<QueueManager<D>>,
    available: [Mutex<Vec<CommandContext<D>>>; QueueKind::COUNT],
    self_ref: Weak<ContextPool<D>>,
}

impl<D: Device> ContextPool<D> {
    pub fn new(manager: Arc<QueueManager<D>>) -> Arc<ContextPool<D>> {
        Arc::new_cyclic(|self_ref| ContextPool {
            manager,
            available: std::array::from_fn(|_| Mutex::new(Vec::new())),
            self_ref: self_ref.clone(),
        })
    }

    pub fn manager(&self) -> &Arc<QueueManager<D>> {
        &self.manager
    }

    /// Pop a free context of `kind`, or build one if none are parked,
    /// and arm it for recording. Its `finish` returns it here.
    pub fn allocate_context(&self, kind: QueueKind) -> Result<CommandContext<D>, SubmitError> {
        let recycled = self.available[kind.index()].lock().pop();
        let mut context = match recycled {
            Some(context) => context,
            None => {
                debug!(?kind, "creating command context");
                let mut context = CommandContext::new(Arc::clone(&self.manager), kind);
                context.home = self.self_ref.clone();
                context
            }
        };
        context.initialize()?;
        Ok(context)
    }

    /// Free contexts currently parked for `kind`.
    pub fn available(&self, kind: QueueKind) -> usize {
        self.available[kind.index()].lock().len()
    }

    fn recycle(&self, context: CommandContext<D>) {
        debug_assert!(context.allocator.is_none(), "recycling a recording context");
        self.available[context.kind.index()].lock().push(context);
    }
}
