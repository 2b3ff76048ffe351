//! Stanza business logic behind the Ready states.
//!
//! The core negotiates streams and routes; what a stanza means is up to a
//! [`StanzaHandler`]. [`DefaultHandler`] answers the minimum a client needs
//! (roster fetch, ping, legacy session) and delivers everything else through
//! the router.

use std::sync::Arc;

use async_trait::async_trait;
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, warn};

use crate::error::is_error_stanza;
use crate::parser::ns;
use crate::router::Resource;
use crate::storage::User;
use crate::stream::Stream;
use crate::types::{Flavor, StanzaType};
use crate::XmppError;

/// XEP-0199 ping namespace.
pub const PING_NS: &str = "urn:xmpp:ping";

/// Called by Ready states after the core's own bookkeeping.
#[async_trait]
pub trait StanzaHandler: Send + Sync {
    /// Handle one stanza. A stanza error is answered to the sender.
    async fn handle(&self, stream: &mut Stream, stanza: Element) -> Result<(), XmppError>;

    /// The account behind `jid` changed on some node.
    async fn user_updated(&self, stream: &mut Stream, jid: &BareJid) -> Result<(), XmppError>;

    /// The connection is going away.
    async fn disconnected(&self, stream: &mut Stream);
}

/// Routing-only handler with roster and presence broadcast.
#[derive(Debug, Default)]
pub struct DefaultHandler;

impl DefaultHandler {
    pub fn new() -> Self {
        Self
    }

    /// Answer iq addressed to the server or the sender's own account.
    fn server_iq(&self, stream: &mut Stream, iq: &Element) -> Result<(), XmppError> {
        match iq.attr("type") {
            Some("result") | Some("error") => return Ok(()),
            Some("get") | Some("set") => {}
            _ => return Err(XmppError::bad_request(Some("iq without valid type".into()))),
        }
        let is_get = iq.attr("type") == Some("get");

        if is_get && iq.has_child("query", ns::ROSTER) {
            let user = stream
                .session()
                .user()
                .ok_or_else(|| XmppError::not_authorized(None))?;
            let reply = result_iq(iq).append(user.roster_query()).build();
            stream.write(&reply);
            return Ok(());
        }
        if is_get && iq.has_child("ping", PING_NS) {
            stream.write(&result_iq(iq).build());
            return Ok(());
        }
        if iq.has_child("session", ns::SESSION) {
            stream.write(&result_iq(iq).build());
            return Ok(());
        }
        Err(XmppError::service_unavailable(None))
    }

    /// Send a presence without `to` to the subscribers of the account and to
    /// its other available resources.
    async fn broadcast_presence(&self, stream: &mut Stream, presence: &Element) {
        let Some(user) = stream.session().user() else {
            return;
        };
        let Some(own) = stream.session().jid() else {
            return;
        };
        let router = Arc::clone(stream.router());

        for contact in subscribers(&user) {
            let mut copy = presence.clone();
            copy.set_attr("to", contact.to_string());
            if let Err(e) = router.deliver(copy).await {
                debug!(to = %contact, error = %e, "Presence not delivered");
            }
        }

        let asking = Jid::from(own.clone());
        let siblings = router
            .available_resources(&[Jid::from(own.to_bare())], &asking)
            .await;
        for sibling in siblings {
            if sibling.jid().as_ref() == Some(&own) {
                continue;
            }
            let mut copy = presence.clone();
            if let Some(jid) = sibling.jid() {
                copy.set_attr("to", jid.to_string());
            }
            if let Err(e) = sibling.write(copy).await {
                debug!(error = %e, "Presence to own resource failed");
            }
        }
    }

    /// On available presence, show the resource which of its contacts are
    /// online.
    async fn send_contact_presence(&self, stream: &mut Stream) {
        let Some(user) = stream.session().user() else {
            return;
        };
        let Some(own) = stream.session().jid() else {
            return;
        };
        let contacts: Vec<Jid> = user
            .roster
            .iter()
            .filter(|c| matches!(c.subscription.as_str(), "to" | "both"))
            .map(|c| Jid::from(c.jid.clone()))
            .collect();
        if contacts.is_empty() {
            return;
        }

        let asking = Jid::from(own.clone());
        let online: Vec<Resource> = stream
            .router()
            .available_resources(&contacts, &asking)
            .await;
        for resource in online {
            if let Some(mut presence) = resource.last_presence() {
                presence.set_attr("to", own.to_string());
                stream.write(&presence);
            }
        }
    }
}

#[async_trait]
impl StanzaHandler for DefaultHandler {
    async fn handle(&self, stream: &mut Stream, stanza: Element) -> Result<(), XmppError> {
        let router = Arc::clone(stream.router());
        if !matches!(stream.flavor(), Flavor::Client | Flavor::Http) {
            return router.deliver(stanza).await;
        }

        let to_self = match stanza.attr("to") {
            None => true,
            Some(to) => {
                let to = Jid::new(to).map_err(|e| {
                    XmppError::stanza(
                        crate::error::StanzaErrorCondition::JidMalformed,
                        Some(e.to_string()),
                    )
                })?;
                (to.node().is_none() && router.config().is_local_domain(to.domain().as_str()))
                    || Some(to.to_bare()) == stream.session().bare_jid()
            }
        };

        match StanzaType::of(&stanza) {
            StanzaType::Iq if to_self => self.server_iq(stream, &stanza),
            StanzaType::Presence if stanza.attr("to").is_none() => {
                self.broadcast_presence(stream, &stanza).await;
                if stanza.attr("type").is_none() {
                    self.send_contact_presence(stream).await;
                }
                Ok(())
            }
            _ => router.deliver(stanza).await,
        }
    }

    async fn user_updated(&self, stream: &mut Stream, jid: &BareJid) -> Result<(), XmppError> {
        let Some(user) = stream.storage().find_user(jid).await? else {
            warn!(jid = %jid, "Updated account no longer exists");
            return Ok(());
        };
        stream.session().set_user(user.clone());

        if stream.session().is_interested() {
            if let Some(own) = stream.session().jid() {
                let push = Element::builder("iq", ns::JABBER_CLIENT)
                    .attr("type", "set")
                    .attr("id", format!("push-{}", uuid::Uuid::new_v4().simple()))
                    .attr("to", own.to_string())
                    .append(user.roster_query())
                    .build();
                stream.write(&push);
            }
        }
        Ok(())
    }

    async fn disconnected(&self, stream: &mut Stream) {
        if !matches!(stream.flavor(), Flavor::Client | Flavor::Http) {
            return;
        }
        if !stream.session().is_available() {
            return;
        }
        let Some(own) = stream.session().jid() else {
            return;
        };
        stream.session().set_available(false);
        stream.session().set_last_presence(None);

        let unavailable = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("type", "unavailable")
            .attr("from", own.to_string())
            .build();
        self.broadcast_presence(stream, &unavailable).await;
    }
}

/// Contacts allowed to see this account's presence.
fn subscribers(user: &User) -> impl Iterator<Item = &BareJid> {
    user.roster
        .iter()
        .filter(|c| matches!(c.subscription.as_str(), "from" | "both"))
        .map(|c| &c.jid)
}

/// Start a `type='result'` reply to `iq`.
pub fn result_iq(iq: &Element) -> minidom::ElementBuilder {
    let mut reply = Element::builder("iq", ns::JABBER_CLIENT).attr("type", "result");
    if let Some(id) = iq.attr("id") {
        reply = reply.attr("id", id);
    }
    if let Some(from) = iq.attr("from") {
        reply = reply.attr("to", from);
    }
    reply
}

/// Whether `stanza` must not be answered with an error.
pub fn is_silent(stanza: &Element) -> bool {
    is_error_stanza(stanza) || stanza.attr("type") == Some("result")
}
