//! Routing of server-initiated pushes.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::client::inner::ClientInner;
use crate::client::refresh::RefreshScheduler;
use crate::client::types::ChannelPublication;
use crate::errors::ClientError;
use crate::protocol::{Disconnect, Join, Leave, Publication, Push, PushData, Subscribe, Unsubscribe};
use crate::subscription::{self, ServerSubscription};

/// Unsubscribe push codes at or above this mean the client should try to
/// subscribe again; lower codes are terminal for the subscription.
const UNSUBSCRIBE_CODE_RECOVERABLE: u32 = 2500;

pub(crate) struct PushRouter;

impl PushRouter {
    pub(crate) fn route(
        client: &Arc<Mutex<ClientInner>>,
        push: Push,
        closer: &mpsc::Sender<Disconnect>,
    ) {
        match push.data {
            PushData::Publication(publication) => {
                Self::on_publication(client, &push.channel, publication)
            }
            PushData::Join(join) => Self::on_join(client, &push.channel, join),
            PushData::Leave(leave) => Self::on_leave(client, &push.channel, leave),
            PushData::Subscribe(subscribe) => {
                Self::on_server_subscribe(client, &push.channel, subscribe)
            }
            PushData::Unsubscribe(unsubscribe) => {
                Self::on_unsubscribe(client, &push.channel, unsubscribe)
            }
            PushData::Message(message) => {
                let inner = client.lock().unwrap();
                if let Some(tx) = &inner.message_tx {
                    let _ = tx.send(message.data);
                }
            }
            PushData::Disconnect(disconnect) => {
                // the session closer funnels this into the state machine
                let _ = closer.try_send(disconnect);
            }
            PushData::Refresh(refresh) => RefreshScheduler::handle_refresh_push(client, refresh),
            PushData::Connect(_) => {
                // the greeting is consumed by the connect reply; a second
                // one mid-session is a protocol violation
                client
                    .lock()
                    .unwrap()
                    .emit_error(ClientError::Protocol("unexpected connect push".into()));
            }
            PushData::Empty => {}
        }
    }

    fn on_publication(
        client: &Arc<Mutex<ClientInner>>,
        channel: &str,
        publication: Publication,
    ) {
        let mut inner = client.lock().unwrap();
        let publication_tx = inner.publication_tx.clone();
        let mut resubscribe = None;

        if let Some(sub_id) = inner.sub_name_to_id.get(channel).copied() {
            let Some(sub) = inner.subscriptions.get_mut(sub_id) else {
                return;
            };
            if sub.state == subscription::State::Unsubscribed {
                return;
            }
            if sub.recoverable {
                if !publication.epoch.is_empty()
                    && !sub.epoch.is_empty()
                    && publication.epoch != sub.epoch
                {
                    // the stream lineage changed under us; recover from
                    // the stored position through a fresh subscribe
                    log::debug!(
                        "epoch mismatch on channel {}: {} != {}",
                        channel,
                        publication.epoch,
                        sub.epoch
                    );
                    if sub.state == subscription::State::Subscribed {
                        sub.move_to_subscribing();
                    }
                    resubscribe = Some(sub_id);
                } else if publication.offset != 0 && publication.offset < sub.offset {
                    log::debug!(
                        "stale publication on channel {}: offset {} < {}",
                        channel,
                        publication.offset,
                        sub.offset
                    );
                    return;
                } else if publication.offset != 0 {
                    sub.offset = publication.offset;
                }
            }
            if resubscribe.is_none() {
                sub.notify_publication(publication.clone());
            }
        } else if let Some(server_sub) = inner.server_subs.get_mut(channel) {
            if server_sub.recoverable && publication.offset != 0 {
                if publication.offset < server_sub.offset {
                    return;
                }
                server_sub.offset = publication.offset;
            }
        } else {
            log::debug!("publication for unknown channel {}", channel);
            return;
        }

        if let Some(sub_id) = resubscribe {
            if let Some(ch) = inner.sub_ch_write.as_ref() {
                let _ = ch.send(sub_id);
            }
            return;
        }

        if let Some(tx) = publication_tx {
            let _ = tx.send(ChannelPublication {
                channel: channel.to_string(),
                publication,
            });
        }
    }

    fn on_join(client: &Arc<Mutex<ClientInner>>, channel: &str, join: Join) {
        let mut inner = client.lock().unwrap();
        if let Some(sub_id) = inner.sub_name_to_id.get(channel).copied() {
            if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
                sub.notify_join(join.info.unwrap_or_default());
            }
        }
    }

    fn on_leave(client: &Arc<Mutex<ClientInner>>, channel: &str, leave: Leave) {
        let mut inner = client.lock().unwrap();
        if let Some(sub_id) = inner.sub_name_to_id.get(channel).copied() {
            if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
                sub.notify_leave(leave.info.unwrap_or_default());
            }
        }
    }

    fn on_server_subscribe(client: &Arc<Mutex<ClientInner>>, channel: &str, subscribe: Subscribe) {
        let mut inner = client.lock().unwrap();
        inner.server_subs.insert(
            channel.to_string(),
            ServerSubscription {
                state: subscription::State::Subscribed,
                recoverable: subscribe.recoverable,
                epoch: subscribe.epoch,
                offset: subscribe.offset,
            },
        );
    }

    fn on_unsubscribe(client: &Arc<Mutex<ClientInner>>, channel: &str, unsubscribe: Unsubscribe) {
        let mut inner = client.lock().unwrap();
        if inner.server_subs.remove(channel).is_some() {
            return;
        }
        let Some(sub_id) = inner.sub_name_to_id.get(channel).copied() else {
            return;
        };

        let mut resubscribe = false;
        if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
            if sub.state == subscription::State::Unsubscribed {
                return;
            }
            if unsubscribe.code >= UNSUBSCRIBE_CODE_RECOVERABLE {
                if sub.state == subscription::State::Subscribed {
                    sub.move_to_subscribing();
                }
                resubscribe = true;
            } else {
                let error = ClientError::subscription(
                    channel,
                    ClientError::Reply {
                        code: unsubscribe.code,
                        message: unsubscribe.reason,
                        temporary: false,
                    },
                );
                sub.move_to_unsubscribed(Some(error));
            }
        }

        if resubscribe {
            if let Some(ch) = inner.sub_ch_write.as_ref() {
                let _ = ch.send(sub_id);
            }
        }
    }
}
