//! Hierarchical lock manager for scheduling rules.
//!
//! Each job holds at most one rule. A job that already holds a rule may
//! acquire any rule it contains without waiting (the nesting depth is
//! counted); asking for anything else is [`WorkspaceError::IllegalNesting`].
//!
//! Waiters queue in arrival order. A request is granted when no other job
//! holds a conflicting rule and no earlier waiter asks for a conflicting
//! one, so a broad rule is not starved by a stream of narrow ones while
//! disjoint requests still pass each other.
//! A wait abandoned by dropping its future leaves the queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use canopy_types::JobId;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::rules::SchedulingRule;

#[derive(Debug)]
struct Held {
    job: JobId,
    rule: SchedulingRule,
    depth: usize,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    rule: SchedulingRule,
}

#[derive(Debug, Default)]
struct LockState {
    held: Vec<Held>,
    waiting: VecDeque<Waiter>,
}

impl LockState {
    fn held_by_others(&self, job: JobId, rule: &SchedulingRule) -> bool {
        self.held
            .iter()
            .any(|h| h.job != job && h.rule.conflicts_with(rule))
    }

    /// Conflicting waiters queued before `ticket` (all of them for `None`).
    fn queued_ahead(&self, ticket: Option<u64>, rule: &SchedulingRule) -> bool {
        self.waiting
            .iter()
            .take_while(|w| Some(w.ticket) != ticket)
            .any(|w| w.rule.conflicts_with(rule))
    }

    fn grantable(&self, job: JobId, rule: &SchedulingRule, ticket: Option<u64>) -> bool {
        !self.held_by_others(job, rule) && !self.queued_ahead(ticket, rule)
    }

    fn dequeue(&mut self, ticket: u64) {
        self.waiting.retain(|w| w.ticket != ticket);
    }
}

/// Grants and releases scheduling rules.
#[derive(Debug, Default)]
pub struct RuleManager {
    state: Mutex<LockState>,
    changed: Notify,
    next_ticket: AtomicU64,
}

impl RuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `rule` can be held by `job`.
    ///
    /// Fails with `LockTimeout` when `timeout` elapses first and with
    /// `OperationCanceled` when `cancel` fires. Either way nothing is held.
    pub async fn acquire(
        self: &Arc<Self>,
        job: JobId,
        rule: SchedulingRule,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> WorkspaceResult<RuleGuard> {
        let ticket = {
            let mut state = self.state.lock();
            if let Some(held) = state.held.iter_mut().find(|h| h.job == job) {
                if !held.rule.contains(&rule) {
                    return Err(WorkspaceError::IllegalNesting {
                        requested: rule,
                        held: held.rule.clone(),
                    });
                }
                held.depth += 1;
                trace!(%job, %rule, depth = held.depth, "nested rule");
                return Ok(self.guard(job));
            }
            if state.grantable(job, &rule, None) {
                debug!(%job, %rule, "rule granted");
                state.held.push(Held {
                    job,
                    rule,
                    depth: 1,
                });
                return Ok(self.guard(job));
            }
            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            state.waiting.push_back(Waiter {
                ticket,
                rule: rule.clone(),
            });
            ticket
        };

        debug!(%job, %rule, "waiting for rule");
        // Leaves the queue however this future ends, dropped included.
        let mut pending = Pending {
            manager: &**self,
            ticket: Some(ticket),
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let granted = {
                let mut state = self.state.lock();
                if state.grantable(job, &rule, Some(ticket)) {
                    state.dequeue(ticket);
                    state.held.push(Held {
                        job,
                        rule: rule.clone(),
                        depth: 1,
                    });
                    true
                } else {
                    false
                }
            };
            if granted {
                pending.ticket = None;
                debug!(%job, %rule, "rule granted after wait");
                // The queue shrank; later waiters may now pass.
                self.changed.notify_waiters();
                return Ok(self.guard(job));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(WorkspaceError::OperationCanceled),
                _ = sleep_until(deadline) => return Err(WorkspaceError::LockTimeout(rule)),
            }
        }
    }

    /// Wait until no job holds or waits for a rule conflicting with `rule`.
    pub async fn join(
        &self,
        rule: &SchedulingRule,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> WorkspaceResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let busy = {
                let state = self.state.lock();
                state.held.iter().any(|h| h.rule.conflicts_with(rule))
                    || state.waiting.iter().any(|w| w.rule.conflicts_with(rule))
            };
            if !busy {
                return Ok(());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(WorkspaceError::OperationCanceled),
                _ = sleep_until(deadline) => {
                    return Err(WorkspaceError::WaitTimeout(format!("jobs on {rule}")));
                }
            }
        }
    }

    /// Rules currently held, with their holders.
    pub fn held(&self) -> Vec<(JobId, SchedulingRule)> {
        self.state
            .lock()
            .held
            .iter()
            .map(|h| (h.job, h.rule.clone()))
            .collect()
    }

    /// The rule `job` holds, if any.
    pub fn held_by(&self, job: JobId) -> Option<SchedulingRule> {
        self.state
            .lock()
            .held
            .iter()
            .find(|h| h.job == job)
            .map(|h| h.rule.clone())
    }

    /// Number of queued acquisitions.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    fn guard(self: &Arc<Self>, job: JobId) -> RuleGuard {
        RuleGuard {
            manager: Arc::clone(self),
            job,
        }
    }

    fn abandon(&self, ticket: u64) {
        self.state.lock().dequeue(ticket);
        self.changed.notify_waiters();
    }

    fn release(&self, job: JobId) {
        {
            let mut state = self.state.lock();
            let Some(index) = state.held.iter().position(|h| h.job == job) else {
                return;
            };
            let held = &mut state.held[index];
            held.depth -= 1;
            if held.depth > 0 {
                return;
            }
            let held = state.held.swap_remove(index);
            debug!(%job, rule = %held.rule, "rule released");
        }
        self.changed.notify_waiters();
    }
}

/// A queued acquisition. Dequeues its ticket on drop unless granted.
struct Pending<'a> {
    manager: &'a RuleManager,
    ticket: Option<u64>,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            trace!(ticket, "abandoning rule wait");
            self.manager.abandon(ticket);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Proof of holding a rule. Releases one nesting level on drop.
#[derive(Debug)]
pub struct RuleGuard {
    manager: Arc<RuleManager>,
    job: JobId,
}

impl RuleGuard {
    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RuleGuard {
    fn drop(&mut self) {
        self.manager.release(self.job);
    }
}
