//! Storage collaborator: accounts, rosters, vCards and private XML fragments.
//!
//! The core only needs a narrow CRUD contract. [`Storage`] is the async
//! interface every state uses; synchronous backends implement
//! [`BlockingStorage`] and are wrapped in [`Deferred`], which runs each call
//! on the blocking pool and resumes the caller once it completes.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use jid::BareJid;
use minidom::Element;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::UserConfig;
use crate::parser::ns;
use crate::XmppError;

/// A roster entry. Subscription semantics belong to the handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Contact address
    pub jid: BareJid,
    /// Display name
    pub name: Option<String>,
    /// `none`, `to`, `from` or `both`
    pub subscription: String,
    /// Pending outbound request, normally `subscribe`
    pub ask: Option<String>,
    /// Roster groups
    pub groups: Vec<String>,
}

impl Contact {
    /// Create a contact with no subscription.
    pub fn new(jid: BareJid) -> Self {
        Self {
            jid,
            name: None,
            subscription: "none".to_string(),
            ask: None,
            groups: Vec::new(),
        }
    }

    /// Render as a `jabber:iq:roster` `<item/>`.
    pub fn to_roster_item(&self) -> Element {
        let mut item = Element::builder("item", ns::ROSTER)
            .attr("jid", self.jid.to_string())
            .attr("subscription", self.subscription.as_str())
            .attr("name", self.name.clone())
            .attr("ask", self.ask.clone())
            .build();
        for group in &self.groups {
            item.append_child(
                Element::builder("group", ns::ROSTER)
                    .append(minidom::Node::Text(group.clone()))
                    .build(),
            );
        }
        item
    }
}

/// A local account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Account address
    pub jid: BareJid,
    /// Display name
    pub name: Option<String>,
    /// Argon2 PHC string; accounts without one cannot log in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Contacts
    pub roster: Vec<Contact>,
}

impl User {
    /// Create an account without a password or contacts.
    pub fn new(jid: BareJid) -> Self {
        Self {
            jid,
            name: None,
            password_hash: None,
            roster: Vec::new(),
        }
    }

    /// Look up a contact by address.
    pub fn contact(&self, jid: &BareJid) -> Option<&Contact> {
        self.roster.iter().find(|c| &c.jid == jid)
    }

    /// Render the full roster as a `<query xmlns='jabber:iq:roster'/>`.
    pub fn roster_query(&self) -> Element {
        let mut query = Element::builder("query", ns::ROSTER).build();
        for contact in &self.roster {
            query.append_child(contact.to_roster_item());
        }
        query
    }
}

/// Hash a password into an Argon2 PHC string.
pub fn hash_password(password: &str) -> Result<String, XmppError> {
    let salt_bytes: [u8; 16] = rand::random();
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| XmppError::storage(format!("salt encoding failed: {}", e)))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| XmppError::storage(format!("password hashing failed: {}", e)))
}

/// Check a password against an Argon2 PHC string.
pub fn verify_password(password: &str, phc: &str) -> bool {
    PasswordHash::new(phc)
        .and_then(|hash| Argon2::default().verify_password(password.as_bytes(), &hash))
        .is_ok()
}

/// Async storage interface consumed by the core.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Return the account when `password` is valid for `username`.
    async fn authenticate(
        &self,
        username: &BareJid,
        password: &str,
    ) -> Result<Option<User>, XmppError>;

    /// Load an account.
    async fn find_user(&self, jid: &BareJid) -> Result<Option<User>, XmppError>;

    /// Create or replace an account.
    async fn save_user(&self, user: &User) -> Result<(), XmppError>;

    /// Load a vCard.
    async fn find_vcard(&self, jid: &BareJid) -> Result<Option<Element>, XmppError>;

    /// Store a vCard.
    async fn save_vcard(&self, jid: &BareJid, card: &Element) -> Result<(), XmppError>;

    /// Load the private XML fragment with the same name and namespace as `node`.
    async fn find_fragment(
        &self,
        jid: &BareJid,
        node: &Element,
    ) -> Result<Option<Element>, XmppError>;

    /// Store a private XML fragment keyed by its name and namespace.
    async fn save_fragment(&self, jid: &BareJid, node: &Element) -> Result<(), XmppError>;
}

/// Synchronous storage backend, see [`Deferred`].
pub trait BlockingStorage: Send + Sync {
    /// See [`Storage::authenticate`].
    fn authenticate(&self, username: &BareJid, password: &str) -> Result<Option<User>, XmppError>;
    /// See [`Storage::find_user`].
    fn find_user(&self, jid: &BareJid) -> Result<Option<User>, XmppError>;
    /// See [`Storage::save_user`].
    fn save_user(&self, user: &User) -> Result<(), XmppError>;
    /// See [`Storage::find_vcard`].
    fn find_vcard(&self, jid: &BareJid) -> Result<Option<Element>, XmppError>;
    /// See [`Storage::save_vcard`].
    fn save_vcard(&self, jid: &BareJid, card: &Element) -> Result<(), XmppError>;
    /// See [`Storage::find_fragment`].
    fn find_fragment(&self, jid: &BareJid, node: &Element) -> Result<Option<Element>, XmppError>;
    /// See [`Storage::save_fragment`].
    fn save_fragment(&self, jid: &BareJid, node: &Element) -> Result<(), XmppError>;
}

/// Runs a [`BlockingStorage`] off the reactor.
pub struct Deferred<B> {
    inner: Arc<B>,
}

impl<B: BlockingStorage + 'static> Deferred<B> {
    /// Wrap a blocking backend.
    pub fn new(inner: B) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn defer<T, F>(&self, call: F) -> Result<T, XmppError>
    where
        T: Send + 'static,
        F: FnOnce(&B) -> Result<T, XmppError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || call(&inner))
            .await
            .map_err(|e| XmppError::storage(format!("storage task failed: {}", e)))?
    }
}

#[async_trait]
impl<B: BlockingStorage + 'static> Storage for Deferred<B> {
    async fn authenticate(
        &self,
        username: &BareJid,
        password: &str,
    ) -> Result<Option<User>, XmppError> {
        let username = username.clone();
        let password = password.to_string();
        self.defer(move |s| s.authenticate(&username, &password)).await
    }

    async fn find_user(&self, jid: &BareJid) -> Result<Option<User>, XmppError> {
        let jid = jid.clone();
        self.defer(move |s| s.find_user(&jid)).await
    }

    async fn save_user(&self, user: &User) -> Result<(), XmppError> {
        let user = user.clone();
        self.defer(move |s| s.save_user(&user)).await
    }

    async fn find_vcard(&self, jid: &BareJid) -> Result<Option<Element>, XmppError> {
        let jid = jid.clone();
        self.defer(move |s| s.find_vcard(&jid)).await
    }

    async fn save_vcard(&self, jid: &BareJid, card: &Element) -> Result<(), XmppError> {
        let jid = jid.clone();
        let card = card.clone();
        self.defer(move |s| s.save_vcard(&jid, &card)).await
    }

    async fn find_fragment(
        &self,
        jid: &BareJid,
        node: &Element,
    ) -> Result<Option<Element>, XmppError> {
        let jid = jid.clone();
        let node = node.clone();
        self.defer(move |s| s.find_fragment(&jid, &node)).await
    }

    async fn save_fragment(&self, jid: &BareJid, node: &Element) -> Result<(), XmppError> {
        let jid = jid.clone();
        let node = node.clone();
        self.defer(move |s| s.save_fragment(&jid, &node)).await
    }
}

/// In-memory backend. Password checks hash with Argon2, so it is used
/// through [`Deferred`].
#[derive(Default)]
pub struct MemoryStorage {
    users: RwLock<HashMap<BareJid, User>>,
    vcards: RwLock<HashMap<BareJid, Element>>,
    fragments: RwLock<HashMap<(BareJid, String), Element>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account with a plaintext password, hashing it first.
    pub fn add_user(&self, jid: BareJid, password: &str) -> Result<(), XmppError> {
        let mut user = User::new(jid);
        user.password_hash = Some(hash_password(password)?);
        self.users.write().insert(user.jid.clone(), user);
        Ok(())
    }

    /// Add or replace an account as-is.
    pub fn insert_user(&self, user: User) {
        self.users.write().insert(user.jid.clone(), user);
    }

    /// Build a store holding the accounts listed in configuration.
    pub fn from_config(users: &[UserConfig]) -> Result<Self, XmppError> {
        let storage = Self::new();
        for entry in users {
            let jid = BareJid::new(&entry.jid)
                .map_err(|e| XmppError::config(format!("invalid user {}: {}", entry.jid, e)))?;
            PasswordHash::new(&entry.password_hash)
                .map_err(|e| XmppError::config(format!("invalid password hash for {}: {}", jid, e)))?;
            let mut user = User::new(jid);
            user.name = entry.name.clone();
            user.password_hash = Some(entry.password_hash.clone());
            storage.insert_user(user);
        }
        Ok(storage)
    }

    fn fragment_key(jid: &BareJid, node: &Element) -> (BareJid, String) {
        (jid.clone(), format!("{}|{}", node.name(), node.ns()))
    }
}

impl BlockingStorage for MemoryStorage {
    fn authenticate(&self, username: &BareJid, password: &str) -> Result<Option<User>, XmppError> {
        let user = self.users.read().get(username).cloned();
        let verified = user.filter(|u| {
            u.password_hash
                .as_deref()
                .map(|phc| verify_password(password, phc))
                .unwrap_or(false)
        });
        debug!(user = %username, success = verified.is_some(), "Password check");
        Ok(verified)
    }

    fn find_user(&self, jid: &BareJid) -> Result<Option<User>, XmppError> {
        Ok(self.users.read().get(jid).cloned())
    }

    fn save_user(&self, user: &User) -> Result<(), XmppError> {
        self.users.write().insert(user.jid.clone(), user.clone());
        Ok(())
    }

    fn find_vcard(&self, jid: &BareJid) -> Result<Option<Element>, XmppError> {
        Ok(self.vcards.read().get(jid).cloned())
    }

    fn save_vcard(&self, jid: &BareJid, card: &Element) -> Result<(), XmppError> {
        self.vcards.write().insert(jid.clone(), card.clone());
        Ok(())
    }

    fn find_fragment(&self, jid: &BareJid, node: &Element) -> Result<Option<Element>, XmppError> {
        Ok(self
            .fragments
            .read()
            .get(&Self::fragment_key(jid, node))
            .cloned())
    }

    fn save_fragment(&self, jid: &BareJid, node: &Element) -> Result<(), XmppError> {
        self.fragments
            .write()
            .insert(Self::fragment_key(jid, node), node.clone());
        Ok(())
    }
}
