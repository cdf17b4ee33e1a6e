//! Publisher runtime
//!
//! A [`Publisher`] owns its identity, its signer and the collections of its
//! own and discovered objects. After [`Publisher::start`] a single loop task
//! wakes every tick and
//!
//! 1. publishes the identity and any updated nodes, inputs and outputs
//!    (signed, retained), saving a rotated identity to disk first;
//! 2. runs the discovery callback and schedules a full republication once the
//!    discovery interval has elapsed;
//! 3. runs the poll callback once the poll interval has elapsed;
//! 4. exits when the running flag has been cleared by [`Publisher::stop`].
//!
//! Inbound messages are handled on the transport's dispatch thread:
//!
//! ```text
//! <domain>/+/$identity              remote identities, own DSS rotation
//! <domain>/+/+/$node                discovered nodes
//! <domain>/+/+/+/+/$input|$output   discovered inputs and outputs
//! <domain>/<self>/+/$configure      node configuration
//! <domain>/<self>/+/$alias          node alias
//! <domain>/<self>/+/+/+/$set        input commands
//! ```
//!
//! Rejected messages are logged and dropped. No state changes on rejection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::address::{base_address, publisher_address, Address, MessageType};
use crate::collection::{Discoverable, DomainCollection};
use crate::config::PublisherConfig;
use crate::envelope::EnvelopeKind;
use crate::error::{PublisherError, PublisherResult};
use crate::identity::{store, FullIdentity, IdentityManager, PublisherIdentity, DSS_PUBLISHER_ID};
use crate::signer::{KeyResolver, MessageSigner};
use crate::transport::Transport;
use crate::types::{
    DiscoveryObject, InputDiscovery, NodeAliasMessage, NodeConfigureMessage, NodeDiscovery,
    OutputDiscovery, SetInputMessage,
};

/// Discovery and poll callback
pub type PublisherCallback = Arc<dyn Fn(&Publisher) + Send + Sync>;

/// Called after an accepted `$set` for one of our inputs
pub type InputHandler = Arc<dyn Fn(&Publisher, &InputDiscovery, &SetInputMessage) + Send + Sync>;

/// Called after an accepted `$configure` has been applied to one of our nodes
pub type ConfigureHandler =
    Arc<dyn Fn(&Publisher, &NodeDiscovery, &NodeConfigureMessage) + Send + Sync>;

type InboundHandler = fn(&Publisher, &str, &str) -> PublisherResult<()>;

#[derive(Default)]
struct Handlers {
    discovery: Option<PublisherCallback>,
    poll: Option<PublisherCallback>,
    input: Option<InputHandler>,
    configure: Option<ConfigureHandler>,
}

struct PublisherInner {
    config: PublisherConfig,
    transport: Arc<dyn Transport>,
    identity: Arc<IdentityManager>,
    signer: Arc<MessageSigner>,

    nodes: DomainCollection<NodeDiscovery>,
    inputs: DomainCollection<InputDiscovery>,
    outputs: DomainCollection<OutputDiscovery>,

    domain_nodes: DomainCollection<NodeDiscovery>,
    domain_inputs: DomainCollection<InputDiscovery>,
    domain_outputs: DomainCollection<OutputDiscovery>,

    handlers: RwLock<Handlers>,
    running: AtomicBool,
    subscribed: AtomicBool,
    stopped_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

/// One publisher on the bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    /// Create a publisher and load or create its identity.
    ///
    /// With `identity_file` set the identity is loaded from (or created at)
    /// that path; otherwise a fresh in-memory identity is used.
    pub fn new(config: PublisherConfig, transport: Arc<dyn Transport>) -> PublisherResult<Self> {
        config.validate()?;

        let identity = Arc::new(IdentityManager::new(&config.domain, &config.publisher_id));
        match &config.identity_file {
            Some(path) => identity.setup(path, &config.organization, &config.location)?,
            None => identity.create_ephemeral(&config.organization, &config.location)?,
        };

        let resolver: KeyResolver = {
            let identity = identity.clone();
            Arc::new(move |address: &str| identity.get_publisher_key(address))
        };
        let signer = Arc::new(MessageSigner::new(
            transport.clone(),
            identity.publisher_address(),
            identity.signing_key(),
            resolver,
        ));

        Ok(Self {
            inner: Arc::new(PublisherInner {
                config,
                transport,
                identity,
                signer,
                nodes: DomainCollection::new(),
                inputs: DomainCollection::new(),
                outputs: DomainCollection::new(),
                domain_nodes: DomainCollection::new(),
                domain_inputs: DomainCollection::new(),
                domain_outputs: DomainCollection::new(),
                handlers: RwLock::new(Handlers::default()),
                running: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                stopped_rx: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.inner.config
    }

    /// `domain/publisherId`
    pub fn publisher_address(&self) -> String {
        self.inner.identity.publisher_address()
    }

    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.inner.identity
    }

    pub fn signer(&self) -> &Arc<MessageSigner> {
        &self.inner.signer
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Own nodes
    pub fn nodes(&self) -> &DomainCollection<NodeDiscovery> {
        &self.inner.nodes
    }

    /// Own inputs
    pub fn inputs(&self) -> &DomainCollection<InputDiscovery> {
        &self.inner.inputs
    }

    /// Own outputs
    pub fn outputs(&self) -> &DomainCollection<OutputDiscovery> {
        &self.inner.outputs
    }

    /// Nodes discovered in the domain
    pub fn domain_nodes(&self) -> &DomainCollection<NodeDiscovery> {
        &self.inner.domain_nodes
    }

    /// Inputs discovered in the domain
    pub fn domain_inputs(&self) -> &DomainCollection<InputDiscovery> {
        &self.inner.domain_inputs
    }

    /// Outputs discovered in the domain
    pub fn domain_outputs(&self) -> &DomainCollection<OutputDiscovery> {
        &self.inner.domain_outputs
    }

    /// Add or replace an own node; it is published on the next tick
    pub fn update_node(&self, node: NodeDiscovery) {
        self.inner.nodes.update(node);
    }

    pub fn update_input(&self, input: InputDiscovery) {
        self.inner.inputs.update(input);
    }

    pub fn update_output(&self, output: OutputDiscovery) {
        self.inner.outputs.update(output);
    }

    pub fn set_discovery_handler(&self, handler: impl Fn(&Publisher) + Send + Sync + 'static) {
        self.inner.handlers.write().discovery = Some(Arc::new(handler));
    }

    pub fn set_poll_handler(&self, handler: impl Fn(&Publisher) + Send + Sync + 'static) {
        self.inner.handlers.write().poll = Some(Arc::new(handler));
    }

    pub fn set_input_handler(
        &self,
        handler: impl Fn(&Publisher, &InputDiscovery, &SetInputMessage) + Send + Sync + 'static,
    ) {
        self.inner.handlers.write().input = Some(Arc::new(handler));
    }

    pub fn set_configure_handler(
        &self,
        handler: impl Fn(&Publisher, &NodeDiscovery, &NodeConfigureMessage) + Send + Sync + 'static,
    ) {
        self.inner.handlers.write().configure = Some(Arc::new(handler));
    }

    /// Subscribe and start the loop; returns once the loop is running.
    pub async fn start(&self) -> PublisherResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(PublisherError::InvalidOperation(
                "publisher already running".to_string(),
            ));
        }
        if !self.inner.subscribed.swap(true, Ordering::SeqCst) {
            self.subscribe_all();
        }

        let (started_tx, started_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        *self.inner.stopped_rx.lock() = Some(stopped_rx);

        let publisher = self.clone();
        tokio::spawn(async move {
            publisher.run_loop(started_tx, stopped_tx).await;
        });

        started_rx.await.map_err(|_| {
            PublisherError::InvalidOperation("loop exited before starting".to_string())
        })?;
        info!(publisher = %self.publisher_address(), "Publisher started");
        Ok(())
    }

    /// Clear the running flag and wait for the loop to leave its body.
    ///
    /// Waits at most about one tick. Does nothing if not started.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let stopped_rx = self.inner.stopped_rx.lock().take();
        if let Some(stopped_rx) = stopped_rx {
            let _ = stopped_rx.await;
            info!(publisher = %self.publisher_address(), "Publisher stopped");
        }
    }

    async fn run_loop(self, started: oneshot::Sender<()>, stopped: oneshot::Sender<()>) {
        let config = &self.inner.config;
        let mut interval = tokio::time::interval(config.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // both countdowns start elapsed so the first tick runs the callbacks
        let mut discovery_due = Instant::now();
        let mut poll_due = Instant::now();

        let _ = started.send(());
        debug!(tick_ms = config.tick_ms, "Publisher loop entered");

        loop {
            interval.tick().await;

            let identity_published = self.publish_updates();

            let now = Instant::now();
            if now >= discovery_due {
                self.republish_discovery(!identity_published);
                let handler = self.inner.handlers.read().discovery.clone();
                if let Some(handler) = handler {
                    handler(&self);
                }
                discovery_due = now + config.discovery_interval();
            }

            if now >= poll_due {
                let handler = self.inner.handlers.read().poll.clone();
                if let Some(handler) = handler {
                    handler(&self);
                }
                poll_due = now + config.poll_interval();
            }

            if !self.inner.running.load(Ordering::SeqCst) {
                break;
            }
        }

        debug!("Publisher loop left");
        let _ = stopped.send(());
    }

    /// Publish the dirty identity and updated own objects.
    ///
    /// Returns whether the identity was published.
    fn publish_updates(&self) -> bool {
        let mut identity_published = false;
        if let Some(full) = self.inner.identity.take_dirty() {
            self.persist_identity(&full);
            self.publish_identity(&full.identity);
            identity_published = true;
        }
        self.publish_updated(&self.inner.nodes);
        self.publish_updated(&self.inner.inputs);
        self.publish_updated(&self.inner.outputs);
        identity_published
    }

    /// Republish the identity now and all own objects on the next tick
    fn republish_discovery(&self, include_identity: bool) {
        if include_identity {
            if let Some(identity) = self.inner.identity.public_identity() {
                self.publish_identity(&identity);
            }
        }
        self.inner.nodes.mark_all_updated();
        self.inner.inputs.mark_all_updated();
        self.inner.outputs.mark_all_updated();
    }

    fn persist_identity(&self, full: &FullIdentity) {
        if let Some(path) = &self.inner.config.identity_file {
            if let Err(e) = store::save(path, full) {
                warn!(path = %path.display(), error = %e, "Failed to save identity");
            }
        }
    }

    fn publish_identity(&self, identity: &PublisherIdentity) {
        if let Err(e) = self
            .inner
            .signer
            .publish_signed(&identity.address, true, identity)
        {
            warn!(address = %identity.address, error = %e, "Failed to publish identity");
        }
    }

    fn publish_updated<T: Discoverable>(&self, collection: &DomainCollection<T>) {
        for object in collection.take_updated() {
            if let Err(e) = self
                .inner
                .signer
                .publish_signed(object.address(), true, &object)
            {
                warn!(address = object.address(), error = %e, "Failed to publish discovery");
            }
        }
    }

    /// Ask another publisher to change one of its inputs.
    ///
    /// With `encrypt` the command is encrypted for the owning publisher, which
    /// requires its identity to be known.
    pub fn set_remote_input(&self, input_address: &str, value: &str, encrypt: bool) -> PublisherResult<()> {
        let address = command_address(input_address, MessageType::Set)?;
        let message = SetInputMessage {
            address: address.clone(),
            sender: self.publisher_address(),
            timestamp: Utc::now(),
            value: value.to_string(),
        };
        self.send_command(&address, &message, encrypt)
    }

    /// Ask another publisher to change configuration attributes of a node
    pub fn configure_remote_node(
        &self,
        node_address: &str,
        attr: BTreeMap<String, String>,
        encrypt: bool,
    ) -> PublisherResult<()> {
        let address = command_address(node_address, MessageType::Configure)?;
        let message = NodeConfigureMessage {
            address: address.clone(),
            sender: self.publisher_address(),
            timestamp: Utc::now(),
            attr,
        };
        self.send_command(&address, &message, encrypt)
    }

    /// Ask another publisher to set the alias of a node
    pub fn set_remote_alias(&self, node_address: &str, alias: &str, encrypt: bool) -> PublisherResult<()> {
        let address = command_address(node_address, MessageType::Alias)?;
        let message = NodeAliasMessage {
            address: address.clone(),
            sender: self.publisher_address(),
            timestamp: Utc::now(),
            alias: alias.to_string(),
        };
        self.send_command(&address, &message, encrypt)
    }

    fn send_command<T: Serialize>(&self, address: &str, message: &T, encrypt: bool) -> PublisherResult<()> {
        if !encrypt {
            return self.inner.signer.publish_signed(address, false, message);
        }
        let recipient = self
            .inner
            .identity
            .get_publisher_key(address)
            .ok_or_else(|| PublisherError::UnknownIssuer(base_address(address)))?;
        self.inner
            .signer
            .publish_encrypted(address, false, message, &recipient)
    }

    fn subscribe_all(&self) {
        let domain = &self.inner.config.domain;
        let own = self.publisher_address();

        self.subscribe_with(&format!("{}/+/$identity", domain), Publisher::on_identity);
        self.subscribe_with(&format!("{}/+/+/$node", domain), Publisher::on_discovery);
        self.subscribe_with(&format!("{}/+/+/+/+/$input", domain), Publisher::on_discovery);
        self.subscribe_with(&format!("{}/+/+/+/+/$output", domain), Publisher::on_discovery);
        self.subscribe_with(&format!("{}/+/$configure", own), Publisher::on_configure);
        self.subscribe_with(&format!("{}/+/$alias", own), Publisher::on_alias);
        self.subscribe_with(&format!("{}/+/+/+/$set", own), Publisher::on_set_input);
    }

    fn subscribe_with(&self, pattern: &str, handle: InboundHandler) {
        let inner: Weak<PublisherInner> = Arc::downgrade(&self.inner);
        self.inner.transport.subscribe(
            pattern,
            Arc::new(move |address: &str, wire: &str| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let publisher = Publisher { inner };
                if let Err(e) = handle(&publisher, address, wire) {
                    warn!(
                        publisher = %publisher.publisher_address(),
                        address,
                        error = %e,
                        kind = ?e.kind(),
                        "Rejected message"
                    );
                }
            }),
        );
    }

    fn on_identity(&self, address: &str, wire: &str) -> PublisherResult<()> {
        let topic = Address::parse(address)?;
        if topic.publisher_id == self.inner.config.publisher_id {
            return self.on_own_identity(address, wire);
        }
        if EnvelopeKind::detect(wire) == Some(EnvelopeKind::Encrypted) {
            // identity rotation meant for another publisher
            return Ok(());
        }
        self.inner.identity.handle_identity_message(address, wire)?;
        Ok(())
    }

    /// A message on our own identity address: either the echo of our own
    /// announcement or a DSS rotation encrypted for us.
    fn on_own_identity(&self, address: &str, wire: &str) -> PublisherResult<()> {
        if EnvelopeKind::detect(wire) != Some(EnvelopeKind::Encrypted) {
            debug!(address, "Ignoring own identity announcement");
            return Ok(());
        }

        let decoded = self.inner.signer.decode(wire)?;
        let dss = format!("{}/{}", self.inner.config.domain, DSS_PUBLISHER_ID);
        if decoded.issuer.as_deref().and_then(publisher_address) != Some(dss) {
            return Err(PublisherError::PolicyViolation(format!(
                "identity update on {} not signed by the DSS",
                address
            )));
        }

        let full: FullIdentity = decoded.parse()?;
        let dss_key = self.inner.identity.dss_key();
        self.inner.identity.update_from_remote(full, dss_key.as_ref())?;
        if let Some(key) = self.inner.identity.signing_key() {
            self.inner.signer.set_signing_key(key);
        }
        info!(address, "Identity rotated by DSS");
        Ok(())
    }

    fn on_discovery(&self, address: &str, wire: &str) -> PublisherResult<()> {
        let topic = Address::parse(address)?;
        let message_type = topic
            .message_type
            .ok_or_else(|| PublisherError::Malformed(format!("no message type in {}", address)))?;

        let decoded = self.inner.signer.decode(wire)?;
        if self.inner.config.require_signed && !decoded.is_signed {
            return Err(PublisherError::PolicyViolation(format!(
                "unsigned discovery on {}",
                address
            )));
        }
        if let Some(issuer) = &decoded.issuer {
            if publisher_address(issuer) != Some(topic.publisher_address()) {
                return Err(PublisherError::PolicyViolation(format!(
                    "{} published by {}",
                    address, issuer
                )));
            }
        }

        let object = DiscoveryObject::from_payload(message_type, &decoded.payload)?;
        let expected = base_address(address);
        let actual = base_address(object.address());
        if expected != actual {
            return Err(PublisherError::AddressMismatch { expected, actual });
        }
        object.check_fields(&topic)?;

        match object {
            DiscoveryObject::Node(node) => self.inner.domain_nodes.put(address, node),
            DiscoveryObject::Input(input) => self.inner.domain_inputs.put(address, input),
            DiscoveryObject::Output(output) => self.inner.domain_outputs.put(address, output),
            DiscoveryObject::Identity(_) => {
                return Err(PublisherError::Malformed(format!(
                    "identity on discovery address {}",
                    address
                )))
            }
        }
        debug!(address, "Discovered");
        Ok(())
    }

    fn on_set_input(&self, address: &str, wire: &str) -> PublisherResult<()> {
        let message: SetInputMessage =
            self.inner
                .signer
                .decode_from_sender(address, wire, self.inner.config.require_signed)?;
        let input = self.inner.inputs.get(address).ok_or_else(|| {
            PublisherError::InvalidOperation(format!("no input at {}", base_address(address)))
        })?;

        info!(address, sender = %message.sender, "Set input");
        let handler = self.inner.handlers.read().input.clone();
        if let Some(handler) = handler {
            handler(self, &input, &message);
        }
        Ok(())
    }

    fn on_configure(&self, address: &str, wire: &str) -> PublisherResult<()> {
        let message: NodeConfigureMessage =
            self.inner
                .signer
                .decode_from_sender(address, wire, self.inner.config.require_signed)?;
        let mut node = self.own_node(address)?;
        node.attr
            .extend(message.attr.iter().map(|(k, v)| (k.clone(), v.clone())));
        node.timestamp = Utc::now();
        self.inner.nodes.update(node.clone());

        info!(address, sender = %message.sender, "Node configured");
        let handler = self.inner.handlers.read().configure.clone();
        if let Some(handler) = handler {
            handler(self, &node, &message);
        }
        Ok(())
    }

    fn on_alias(&self, address: &str, wire: &str) -> PublisherResult<()> {
        let message: NodeAliasMessage =
            self.inner
                .signer
                .decode_from_sender(address, wire, self.inner.config.require_signed)?;
        let mut node = self.own_node(address)?;
        node.alias = message.alias.clone();
        node.timestamp = Utc::now();
        self.inner.nodes.update(node);

        info!(address, alias = %message.alias, "Node alias set");
        Ok(())
    }

    fn own_node(&self, address: &str) -> PublisherResult<NodeDiscovery> {
        self.inner.nodes.get(address).ok_or_else(|| {
            PublisherError::InvalidOperation(format!("no node at {}", base_address(address)))
        })
    }
}

/// Turn any address under an entity into its command address
fn command_address(address: &str, message_type: MessageType) -> PublisherResult<String> {
    Ok(Address::parse(address)?
        .base()
        .with_message_type(message_type)
        .to_string())
}
