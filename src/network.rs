// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Sites talk to one another only through [Transport]. The [Network] here is
//! an in-process implementation: one bounded mpsc channel per site, which is
//! that site's inbox. It makes no ordering promises beyond what the channels
//! happen to give, and it can be told to lose messages, which is how the
//! tests model crashed sites and dropped packets.

use crate::Envelope;
use async_std::sync::{Arc, RwLock};
use futures::{
    channel::mpsc::{self, Receiver, Sender},
    future::BoxFuture,
    FutureExt, SinkExt,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

/// A "site identifier" which should be unique across any present or future
/// configuration of a cluster. Initiators and partition replicas each have
/// one.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteId(pub u64);

impl std::fmt::Debug for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("#{}", self.0))
    }
}

/// The receiving end of a site's mailbox.
pub type Inbox = Receiver<Envelope>;

/// Delivers envelopes to other sites' inboxes. Delivery is best-effort and
/// unordered; sending to an unknown or crashed site silently loses the
/// message.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, envelope: Envelope) -> BoxFuture<'static, ()>;
}

type DropRule = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct Network {
    inboxes: Arc<RwLock<HashMap<SiteId, Sender<Envelope>>>>,
    drop_rules: Arc<RwLock<Vec<DropRule>>>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Network {
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            drop_rules: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Creates the inbox for `site`, replacing any previous one. `capacity`
    /// bounds how many envelopes may sit undelivered before senders wait.
    pub async fn register(&self, site: SiteId, capacity: usize) -> Inbox {
        let (send, recv) = mpsc::channel(capacity);
        debug!("registering inbox for site {:?}", site);
        self.inboxes.write().await.insert(site, send);
        recv
    }

    /// Models a crash of `site`: its inbox closes and everything sent to it
    /// from now on is lost.
    pub async fn disconnect(&self, site: SiteId) {
        debug!("disconnecting site {:?}", site);
        self.inboxes.write().await.remove(&site);
    }

    /// Loses every envelope matching `rule` until the network shuts down.
    pub async fn drop_matching<F>(&self, rule: F)
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        self.drop_rules.write().await.push(Box::new(rule));
    }

    /// Closes every inbox. Site loops drain what they have and exit.
    pub async fn shutdown(&self) {
        debug!("shutting down network");
        self.inboxes.write().await.clear();
        self.drop_rules.write().await.clear();
    }

    async fn deliver(&self, envelope: Envelope) {
        if self.drop_rules.read().await.iter().any(|r| r(&envelope)) {
            trace!(
                "dropping {:?} for {:?} from {:?} to {:?}",
                envelope.kind(),
                envelope.txn_id,
                envelope.source,
                envelope.destination
            );
            return;
        }
        let inbox = self.inboxes.read().await.get(&envelope.destination).cloned();
        match inbox {
            None => trace!(
                "no inbox for {:?}, losing {:?} for {:?}",
                envelope.destination,
                envelope.kind(),
                envelope.txn_id
            ),
            Some(mut inbox) => {
                let destination = envelope.destination;
                if inbox.send(envelope).await.is_err() {
                    trace!("inbox for {:?} closed during send", destination);
                }
            }
        }
    }
}

impl Transport for Network {
    fn send(&self, envelope: Envelope) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move { this.deliver(envelope).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Decision, Message, TxnId};
    use async_std::task;
    use futures::StreamExt;

    fn decision(to: u64) -> Envelope {
        Envelope::new(
            TxnId::new(1, SiteId(9)),
            SiteId(9),
            SiteId(to),
            Message::Decision(Decision::Commit),
        )
    }

    #[test]
    fn delivers_to_registered_inbox() {
        task::block_on(async {
            let net = Network::new();
            let mut inbox = net.register(SiteId(1), 4).await;
            net.send(decision(1)).await;
            assert_eq!(inbox.next().await, Some(decision(1)));
        });
    }

    #[test]
    fn loses_messages_to_unknown_and_dropped_sites() {
        task::block_on(async {
            let net = Network::new();
            let mut inbox = net.register(SiteId(1), 4).await;
            net.send(decision(2)).await;
            net.drop_matching(|e| e.destination == SiteId(1)).await;
            net.send(decision(1)).await;
            net.shutdown().await;
            assert_eq!(inbox.next().await, None);
        });
    }
}
