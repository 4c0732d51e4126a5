// ── Poll scheduler ──
//
// Periodically asks the session to read devices the event stream does not
// cover. The scheduler never drives the connection: while the session is
// not active it waits, and it resumes with an immediate poll once the
// session is back.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use loxinflux_api::{PollTarget, SessionRequest, SessionRequester};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::filter::FilterRuleSet;
use crate::model::StructureIndex;

/// Types whose read command returns inconsistent values.
const UNPOLLABLE_TYPES: &[&str] = &["VIRTUALTEXTIN"];

/// Devices worth polling: hidden from the visualisation (visible ones are
/// pushed), readable, and allowed by the poll-source rules.
pub fn poll_targets(index: &StructureIndex, rules: &FilterRuleSet) -> Vec<PollTarget> {
    let mut targets: Vec<PollTarget> = index
        .devices()
        .iter()
        .filter(|d| !d.visible)
        .filter(|d| !UNPOLLABLE_TYPES.contains(&d.kind.as_str()))
        .filter(|d| rules.allows_poll(d))
        .map(|d| PollTarget {
            uuid: d.uuid.clone(),
            secured: d.secured,
        })
        .collect();
    targets.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    targets
}

pub struct PollScheduler {
    requester: SessionRequester,
    index: Arc<ArcSwap<StructureIndex>>,
    rules: Arc<FilterRuleSet>,
    interval: Duration,
}

impl PollScheduler {
    pub fn new(
        requester: SessionRequester,
        index: Arc<ArcSwap<StructureIndex>>,
        rules: Arc<FilterRuleSet>,
        interval: Duration,
    ) -> Self {
        Self {
            requester,
            index,
            rules,
            interval,
        }
    }

    /// Run until cancelled or the session task stops.
    pub async fn run(self, cancel: CancellationToken) {
        let mut state = self.requester.state();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !state.borrow_and_update().is_active() {
                tracing::debug!("poll scheduler suspended until session is active");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    active = state.wait_for(|s| s.is_active()) => {
                        if active.is_err() {
                            break;
                        }
                    }
                }
                ticker.reset_immediately();
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !state.borrow().is_active() {
                continue;
            }

            let targets = poll_targets(&self.index.load(), &self.rules);
            if targets.is_empty() {
                tracing::trace!("nothing to poll");
                continue;
            }
            tracing::debug!(devices = targets.len(), "polling devices");
            if !self.requester.submit(SessionRequest::Poll(targets)).await {
                break;
            }
        }
        tracing::debug!("poll scheduler stopped");
    }
}
