//! Event to per-recipient fan-out.
//!
//! `FanOut::dispatch` never fails: lookups that error resolve to "nothing to
//! do", enrichment failure drops the event, and a failed send only affects its
//! own recipient.
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::content::ContentService;
use crate::db::{AccountResolver, SubscriptionResolver};
use crate::model::{ContentPublishedEvent, LinkedAccount, MarkupFormat, RenderedNotification};
use crate::notifier::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every linked recipient was attempted.
    Delivered,
    NoSubscribers,
    NoLinkedAccounts,
    EnrichmentFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub subscribers: usize,
    pub linked: usize,
    pub sent: usize,
    pub failed: usize,
    pub outcome: Outcome,
}

impl DispatchReport {
    fn skipped(subscribers: usize, linked: usize, outcome: Outcome) -> Self {
        Self {
            subscribers,
            linked,
            sent: 0,
            failed: 0,
            outcome,
        }
    }
}

#[derive(Clone)]
pub struct FanOut {
    subscriptions: Arc<dyn SubscriptionResolver>,
    accounts: Arc<dyn AccountResolver>,
    content: Arc<dyn ContentService>,
    notifier: Arc<dyn Notifier>,
    max_concurrent_sends: usize,
}

impl FanOut {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionResolver>,
        accounts: Arc<dyn AccountResolver>,
        content: Arc<dyn ContentService>,
        notifier: Arc<dyn Notifier>,
        max_concurrent_sends: usize,
    ) -> Self {
        Self {
            subscriptions,
            accounts,
            content,
            notifier,
            max_concurrent_sends: max_concurrent_sends.max(1),
        }
    }

    #[instrument(skip_all, fields(creator_id = event.creator_id, content_id = event.content_id))]
    pub async fn dispatch(&self, event: ContentPublishedEvent) -> DispatchReport {
        let subscriber_ids: BTreeSet<i64> = match self.subscriptions.subscribers_of(event.creator_id).await {
            Ok(subs) => subs.into_iter().map(|s| s.subscriber_id).collect(),
            Err(err) => {
                warn!(?err, "subscription lookup failed; treating as no subscribers");
                BTreeSet::new()
            }
        };
        if subscriber_ids.is_empty() {
            debug!("no subscribers");
            return DispatchReport::skipped(0, 0, Outcome::NoSubscribers);
        }

        let recipients = self.resolve_accounts(&subscriber_ids).await;
        if recipients.is_empty() {
            debug!(subscribers = subscriber_ids.len(), "no linked accounts");
            return DispatchReport::skipped(subscriber_ids.len(), 0, Outcome::NoLinkedAccounts);
        }

        // One fetch per event; every recipient gets the same body.
        let body = match self.content.fetch(event.content_id).await {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "enrichment failed; dropping event");
                return DispatchReport::skipped(
                    subscriber_ids.len(),
                    recipients.len(),
                    Outcome::EnrichmentFailed,
                );
            }
        };

        let sends: Pin<Box<dyn Future<Output = Vec<bool>> + Send + '_>> = Box::pin(
            stream::iter(recipients.iter())
            .map(|account| {
                let notification = RenderedNotification {
                    recipient: account.external_recipient_id,
                    body: body.clone(),
                    format: MarkupFormat::MarkdownV2,
                };
                let subscriber_id = account.subscriber_id;
                async move {
                    match self.notifier.send(&notification).await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(%err, subscriber_id, recipient = err.recipient, "send failed");
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.max_concurrent_sends)
            .collect(),
        );
        let results: Vec<bool> = sends.await;

        let sent = results.iter().filter(|ok| **ok).count();
        let report = DispatchReport {
            subscribers: subscriber_ids.len(),
            linked: recipients.len(),
            sent,
            failed: results.len() - sent,
            outcome: Outcome::Delivered,
        };
        info!(
            subscribers = report.subscribers,
            linked = report.linked,
            sent = report.sent,
            failed = report.failed,
            "event dispatched"
        );
        report
    }

    /// Subscribers without a link are skipped; so are lookups that fail.
    async fn resolve_accounts(&self, subscriber_ids: &BTreeSet<i64>) -> Vec<LinkedAccount> {
        let mut accounts = Vec::with_capacity(subscriber_ids.len());
        let mut seen = BTreeSet::new();
        for &subscriber_id in subscriber_ids {
            match self.accounts.linked_account_of(subscriber_id).await {
                Ok(Some(account)) => {
                    if seen.insert(account.external_recipient_id) {
                        accounts.push(account);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(?err, subscriber_id, "account lookup failed; skipping subscriber");
                }
            }
        }
        accounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::EnrichError;
    use crate::model::Subscription;
    use crate::notifier::{SendError, SendErrorKind};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct Subs(Result<Vec<i64>, &'static str>);

    #[async_trait]
    impl SubscriptionResolver for Subs {
        async fn subscribers_of(&self, creator_id: i64) -> Result<Vec<Subscription>> {
            match &self.0 {
                Ok(ids) => Ok(ids
                    .iter()
                    .map(|&subscriber_id| Subscription {
                        creator_id,
                        subscriber_id,
                    })
                    .collect()),
                Err(msg) => Err(anyhow!(*msg)),
            }
        }
    }

    struct Accounts(HashMap<i64, i64>);

    #[async_trait]
    impl AccountResolver for Accounts {
        async fn linked_account_of(&self, subscriber_id: i64) -> Result<Option<LinkedAccount>> {
            if subscriber_id < 0 {
                return Err(anyhow!("db down"));
            }
            Ok(self.0.get(&subscriber_id).map(|&rid| LinkedAccount {
                subscriber_id,
                external_recipient_id: rid,
            }))
        }
    }

    #[derive(Default)]
    struct Content {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentService for Content {
        async fn fetch(&self, content_id: i64) -> Result<String, EnrichError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EnrichError::Status(500))
            } else {
                Ok(format!("recipe {content_id}"))
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        fail_for: Vec<i64>,
        calls: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, n: &RenderedNotification) -> Result<(), SendError> {
            self.calls.lock().await.push(n.recipient);
            if self.fail_for.contains(&n.recipient) {
                return Err(SendError::new(n.recipient, SendErrorKind::Other("blocked".into())));
            }
            Ok(())
        }
    }

    fn fan_out(
        subs: Subs,
        accounts: &[(i64, i64)],
        content: Arc<Content>,
        notifier: Arc<Recorder>,
    ) -> FanOut {
        FanOut::new(
            Arc::new(subs),
            Arc::new(Accounts(accounts.iter().copied().collect())),
            content,
            notifier,
            2,
        )
    }

    const EVENT: ContentPublishedEvent = ContentPublishedEvent {
        creator_id: 7,
        content_id: 42,
    };

    #[tokio::test]
    async fn subscription_query_failure_is_a_noop() {
        let content = Arc::new(Content::default());
        let notifier = Arc::new(Recorder::default());
        let fo = fan_out(Subs(Err("boom")), &[(3, 1003)], content.clone(), notifier.clone());

        let report = fo.dispatch(EVENT).await;
        assert_eq!(report.outcome, Outcome::NoSubscribers);
        assert_eq!(content.calls.load(Ordering::SeqCst), 0);
        assert!(notifier.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unlinked_subscribers_skip_enrichment() {
        let content = Arc::new(Content::default());
        let notifier = Arc::new(Recorder::default());
        let fo = fan_out(Subs(Ok(vec![3, 9])), &[], content.clone(), notifier.clone());

        let report = fo.dispatch(EVENT).await;
        assert_eq!(report.outcome, Outcome::NoLinkedAccounts);
        assert_eq!(report.subscribers, 2);
        assert_eq!(content.calls.load(Ordering::SeqCst), 0);
        assert!(notifier.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn account_lookup_error_skips_only_that_subscriber() {
        let content = Arc::new(Content::default());
        let notifier = Arc::new(Recorder::default());
        let fo = fan_out(
            Subs(Ok(vec![-1, 3])),
            &[(3, 1003)],
            content.clone(),
            notifier.clone(),
        );

        let report = fo.dispatch(EVENT).await;
        assert_eq!(report.sent, 1);
        assert_eq!(*notifier.calls.lock().await, vec![1003]);
    }

    #[tokio::test]
    async fn duplicate_subscriptions_send_once() {
        let content = Arc::new(Content::default());
        let notifier = Arc::new(Recorder::default());
        let fo = fan_out(
            Subs(Ok(vec![3, 3, 3])),
            &[(3, 1003)],
            content.clone(),
            notifier.clone(),
        );

        let report = fo.dispatch(EVENT).await;
        assert_eq!(report.subscribers, 1);
        assert_eq!(notifier.calls.lock().await.len(), 1);
        assert_eq!(content.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enrichment_failure_sends_nothing() {
        let content = Arc::new(Content {
            fail: true,
            ..Default::default()
        });
        let notifier = Arc::new(Recorder::default());
        let fo = fan_out(
            Subs(Ok(vec![3, 15])),
            &[(3, 1003), (15, 1015)],
            content.clone(),
            notifier.clone(),
        );

        let report = fo.dispatch(EVENT).await;
        assert_eq!(report.outcome, Outcome::EnrichmentFailed);
        assert_eq!(report.linked, 2);
        assert_eq!(report.sent, 0);
        assert!(notifier.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_send_does_not_stop_siblings() {
        let content = Arc::new(Content::default());
        let notifier = Arc::new(Recorder {
            fail_for: vec![1003],
            ..Default::default()
        });
        let fo = fan_out(
            Subs(Ok(vec![3, 9, 15])),
            &[(3, 1003), (9, 1009), (15, 1015)],
            content.clone(),
            notifier.clone(),
        );

        let report = fo.dispatch(EVENT).await;
        assert_eq!(report.outcome, Outcome::Delivered);
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);
        let mut calls = notifier.calls.lock().await.clone();
        calls.sort();
        assert_eq!(calls, vec![1003, 1009, 1015]);
    }
}
