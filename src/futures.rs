use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Claim, Error, EventKind, OrchestrationContext, ScheduleRequest};

/// Future returned by the `schedule_*` methods of [`OrchestrationContext`].
///
/// On its first poll it claims the next scheduling event in history order (or records a
/// new one). From then on it resolves only from the completion whose `source_event_id`
/// equals the claimed event id.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    request: ScheduleRequest,
    claimed_event_id: Option<u64>,
}

impl DurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, request: ScheduleRequest) -> Self {
        Self {
            ctx,
            request,
            claimed_event_id: None,
        }
    }

    /// Scheduling event this future is bound to, once polled.
    pub fn scheduling_event_id(&self) -> Option<u64> {
        self.claimed_event_id
    }
}

impl Future for DurableFuture {
    type Output = Result<String, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.lock();

        let id = match this.claimed_event_id {
            Some(id) => id,
            None => match inner.claim(&this.request) {
                Claim::Recorded(id) | Claim::Scheduled(id) => {
                    this.claimed_event_id = Some(id);
                    id
                }
                Claim::Deferred | Claim::Mismatch => return Poll::Pending,
            },
        };

        let Some(completion) = inner.completion_for(id) else {
            return Poll::Pending;
        };

        match (&this.request, completion) {
            (ScheduleRequest::Activity { .. }, EventKind::ActivityCompleted { result }) => Poll::Ready(Ok(result)),
            (ScheduleRequest::Activity { .. }, EventKind::ActivityFailed { error }) => Poll::Ready(Err(error)),
            (ScheduleRequest::SubOrchestration { .. }, EventKind::SubOrchestrationCompleted { result }) => {
                Poll::Ready(Ok(result))
            }
            (ScheduleRequest::SubOrchestration { .. }, EventKind::SubOrchestrationFailed { error }) => {
                Poll::Ready(Err(error))
            }
            (request, other) => {
                inner.flag_nondeterminism(format!(
                    "{} at event {id} was answered by {}",
                    request.describe(),
                    other.name()
                ));
                Poll::Pending
            }
        }
    }
}
