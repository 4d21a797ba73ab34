//! Explicit per-job subscription registry.
//!
//! Each subscription gets a handle; unsubscribing with a stale handle (one
//! superseded by a newer subscription for the same job) is a no-op. When a
//! control channel is attached, every change is mirrored to the transport as
//! a [`ControlFrame`].

use std::collections::HashMap;

use tokio::sync::mpsc;

use super::types::ControlFrame;
use crate::state_machine::JobId;

/// Proof of a live subscription; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub job_id: JobId,
    token: u64,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    active: HashMap<JobId, u64>,
    next_token: u64,
    control: Option<mpsc::UnboundedSender<ControlFrame>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route control frames to a transport and replay current subscriptions
    /// onto it, so a fresh connection picks up where the last one stopped.
    pub fn attach(&mut self, control: mpsc::UnboundedSender<ControlFrame>) {
        for job_id in self.active.keys() {
            let _ = control.send(ControlFrame::Subscribe {
                job_id: job_id.clone(),
            });
        }
        self.control = Some(control);
    }

    /// Subscribe to events for `job_id`. Subscribing twice keeps one
    /// subscription and returns the existing handle.
    pub fn subscribe(&mut self, job_id: &str) -> SubscriptionHandle {
        if let Some(&token) = self.active.get(job_id) {
            return SubscriptionHandle {
                job_id: job_id.to_string(),
                token,
            };
        }

        let token = self.next_token;
        self.next_token += 1;
        self.active.insert(job_id.to_string(), token);
        self.send(ControlFrame::Subscribe {
            job_id: job_id.to_string(),
        });
        tracing::debug!(job_id, "subscribed to job events");
        SubscriptionHandle {
            job_id: job_id.to_string(),
            token,
        }
    }

    /// Drop the subscription `handle` refers to, if it is still current.
    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> bool {
        if self.active.get(&handle.job_id) != Some(&handle.token) {
            return false;
        }
        self.unsubscribe_job(&handle.job_id)
    }

    /// Drop whatever subscription exists for `job_id`.
    pub fn unsubscribe_job(&mut self, job_id: &str) -> bool {
        if self.active.remove(job_id).is_none() {
            return false;
        }
        self.send(ControlFrame::Unsubscribe {
            job_id: job_id.to_string(),
        });
        tracing::debug!(job_id, "unsubscribed from job events");
        true
    }

    pub fn is_subscribed(&self, job_id: &str) -> bool {
        self.active.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn send(&mut self, frame: ControlFrame) {
        let closed = match &self.control {
            Some(control) => control.send(frame).is_err(),
            None => false,
        };
        if closed {
            tracing::warn!("event transport closed, dropping control channel");
            self.control = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_is_deduplicated() {
        let mut registry = SubscriptionRegistry::new();
        let a = registry.subscribe("gen-1");
        let b = registry.subscribe("gen-1");
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_handle_does_not_unsubscribe_newer() {
        let mut registry = SubscriptionRegistry::new();
        let old = registry.subscribe("gen-1");
        assert!(registry.unsubscribe(&old));
        let _new = registry.subscribe("gen-1");
        assert!(!registry.unsubscribe(&old));
        assert!(registry.is_subscribed("gen-1"));
    }

    #[test]
    fn mirrors_changes_to_control_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("early");
        registry.attach(tx);

        registry.subscribe("gen-1");
        registry.unsubscribe_job("gen-1");

        let frames: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            frames,
            vec![
                ControlFrame::Subscribe {
                    job_id: "early".into()
                },
                ControlFrame::Subscribe {
                    job_id: "gen-1".into()
                },
                ControlFrame::Unsubscribe {
                    job_id: "gen-1".into()
                },
            ]
        );
    }

    #[test]
    fn closed_transport_is_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut registry = SubscriptionRegistry::new();
        registry.attach(tx);
        registry.subscribe("gen-1");
        assert!(registry.is_subscribed("gen-1"));
    }
}
