use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use crate::channel::channel_config::ChannelConfig;
use crate::channel::coordinator::{ChannelCoordinator, UpwardSink};
use crate::channel::error::ChannelError;
use crate::channel::listener::{ChannelListener, ErrorHandler, MembershipListener};
use crate::channel::send_options::SendOptions;
use crate::channel::services::ServiceSet;
use crate::interceptor::channel_interceptor::{ChainBottom, ChainTop, ChannelInterceptor, InterceptorChain, SendOutcome};
use crate::interceptor::message_dispatch::MessageDispatchInterceptor;
use crate::membership::member::Member;
use crate::membership::membership_service::{BroadcastMembershipService, MembershipService};
use crate::messaging::channel_message::{ChannelMessage, UniqueId};
use crate::transport::receiver::{ChannelReceiver, ReplicationReceiver};
use crate::transport::sender::{ChannelSender, ReplicationSender};

/// The application's listeners, at the top of the interceptor chain
#[derive(Default)]
struct Listeners {
    channel: RwLock<Vec<Arc<dyn ChannelListener>>>,
    membership: RwLock<Vec<Arc<dyn MembershipListener>>>,
}

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[async_trait]
impl ChainTop for Listeners {
    /// Hands the message to every listener that accepts it. Processing fails if any of them
    ///  fails, and if none of them accepts it.
    async fn message_received(&self, msg: ChannelMessage) -> anyhow::Result<()> {
        let listeners = self.channel.read().unwrap().clone();

        let mut accepted = false;
        let mut result = Ok(());
        for listener in listeners {
            if !listener.accept(&msg) {
                continue;
            }
            accepted = true;
            if let Err(e) = listener.message_received(msg.clone()).await {
                warn!(id = ?msg.unique_id, "error in channel listener: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if !accepted {
            debug!(id = ?msg.unique_id, from = %msg.address, "message was not accepted by any listener");
            anyhow::bail!("message {} was not accepted by any listener", msg.unique_id);
        }
        result
    }

    async fn member_added(&self, member: &Member) {
        let listeners = self.membership.read().unwrap().clone();
        for listener in listeners {
            listener.member_added(member).await;
        }
    }

    async fn member_disappeared(&self, member: &Member) {
        let listeners = self.membership.read().unwrap().clone();
        for listener in listeners {
            listener.member_disappeared(member).await;
        }
    }
}

/// A member's end point for communicating with the other members of a group: it sends messages
///  to members, delivers messages from members to listeners, and keeps track of which members
///  there are.
///
/// Outgoing messages pass through the registered interceptors in registration order before
///  they are sent, incoming messages pass through them in reverse order.
pub struct GroupChannel {
    config: ChannelConfig,
    name: RwLock<String>,
    coordinator: Arc<ChannelCoordinator>,
    sink: Arc<UpwardSink>,
    listeners: Arc<Listeners>,
    interceptors: RwLock<Vec<Arc<dyn ChannelInterceptor>>>,
    chain: RwLock<Option<InterceptorChain>>,
    heartbeat_enabled: RwLock<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl GroupChannel {
    pub fn new(config: ChannelConfig, receiver: Arc<dyn ChannelReceiver>, sender: Arc<dyn ChannelSender>, membership: Arc<dyn MembershipService>) -> GroupChannel {
        let sink: Arc<UpwardSink> = Default::default();
        let coordinator = Arc::new(ChannelCoordinator::new(receiver, sender, membership, sink.clone()));

        let mut interceptors: Vec<Arc<dyn ChannelInterceptor>> = Vec::new();
        if let Some(dispatch) = &config.dispatch {
            interceptors.push(Arc::new(MessageDispatchInterceptor::new(dispatch.clone())));
        }

        GroupChannel {
            name: RwLock::new(config.name.clone()),
            heartbeat_enabled: RwLock::new(config.heartbeat),
            config,
            coordinator,
            sink,
            listeners: Default::default(),
            interceptors: RwLock::new(interceptors),
            chain: RwLock::new(None),
            heartbeat_task: Mutex::new(None),
        }
    }

    /// a channel with the default transport and membership implementations
    pub fn with_defaults(config: ChannelConfig) -> GroupChannel {
        let receiver = Arc::new(ReplicationReceiver::new(config.receiver.clone()));
        let sender = Arc::new(ReplicationSender::new(config.sender.clone()));
        let membership = Arc::new(BroadcastMembershipService::new(config.membership.clone()));
        GroupChannel::new(config, receiver, sender, membership)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write().unwrap() = name.to_string();
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!("channel", name = %self.name())
    }

    /// Appends an interceptor to the chain. Interceptors can only be added while the channel is
    ///  completely stopped.
    pub fn add_interceptor(&self, interceptor: Arc<dyn ChannelInterceptor>) -> Result<(), ChannelError> {
        if self.chain.read().unwrap().is_some() {
            return Err(ChannelError::IllegalState("interceptors can not be added to a started channel".to_string()));
        }
        self.interceptors.write().unwrap().push(interceptor);
        Ok(())
    }

    /// the interceptors in chain order, i.e. in the order in which outgoing messages pass them
    pub fn interceptors(&self) -> Vec<Arc<dyn ChannelInterceptor>> {
        self.interceptors.read().unwrap().clone()
    }

    /// the services that are currently running
    pub fn running(&self) -> ServiceSet {
        self.coordinator.running()
    }

    pub async fn start(&self, svc: ServiceSet) -> Result<(), ChannelError> {
        self.do_start(svc).instrument(self.span()).await
    }

    async fn do_start(&self, svc: ServiceSet) -> Result<(), ChannelError> {
        self.config.validate()
            .map_err(|e| ChannelError::Config(e.to_string()))?;

        let chain = self.chain_for_start()?;
        if let Err(e) = self.coordinator.start(svc).await {
            self.discard_chain_if_stopped();
            return Err(e);
        }
        for (started, interceptor) in chain.interceptors().iter().enumerate() {
            if let Err(e) = interceptor.start(svc).await {
                warn!("starting interceptor {} failed, rolling back: {}", interceptor.name(), e);
                self.roll_back_start(&chain.interceptors()[..started], svc).await;
                return Err(e);
            }
        }
        self.start_heartbeat(&chain);

        info!("channel started {}", svc);
        Ok(())
    }

    /// stops what a failed start started, leaving the channel as it was before
    async fn roll_back_start(&self, started: &[Arc<dyn ChannelInterceptor>], svc: ServiceSet) {
        for interceptor in started.iter().rev() {
            if let Err(e) = interceptor.stop(svc).await {
                warn!("error stopping interceptor {}: {}", interceptor.name(), e);
            }
        }
        if let Err(e) = self.coordinator.stop(svc).await {
            warn!("error stopping services {}: {}", svc, e);
        }
        self.discard_chain_if_stopped();
    }

    /// The chain is built when the first service is started, and discarded when the last one
    ///  is stopped
    fn chain_for_start(&self) -> Result<InterceptorChain, ChannelError> {
        let mut chain = self.chain.write().unwrap();
        if let Some(chain) = chain.as_ref() {
            return Ok(chain.clone());
        }

        let bottom: Arc<dyn ChainBottom> = self.coordinator.clone();
        let new_chain = InterceptorChain::new(self.interceptors(), &bottom, self.listeners.clone())?;
        debug!("built {:?}", new_chain);
        self.sink.set_chain(Some(new_chain.clone()));
        *chain = Some(new_chain.clone());
        Ok(new_chain)
    }

    fn discard_chain_if_stopped(&self) {
        if self.coordinator.running().is_empty() {
            self.sink.set_chain(None);
            self.chain.write().unwrap().take();
            if let Some(handle) = self.heartbeat_task.lock().unwrap().take() {
                handle.abort();
            }
        }
    }

    pub async fn stop(&self, svc: ServiceSet) -> Result<(), ChannelError> {
        self.do_stop(svc).instrument(self.span()).await
    }

    async fn do_stop(&self, svc: ServiceSet) -> Result<(), ChannelError> {
        let chain = self.chain.read().unwrap().clone()
            .ok_or_else(|| ChannelError::IllegalState("channel is not started".to_string()))?;

        let mut result = Ok(());
        for interceptor in chain.interceptors() {
            if let Err(e) = interceptor.stop(svc).await {
                warn!("error stopping interceptor {}: {}", interceptor.name(), e);
                result = Err(e);
            }
        }
        let coordinator_result = self.coordinator.stop(svc).await;
        self.discard_chain_if_stopped();

        info!("channel stopped {}", svc);
        coordinator_result.and(result)
    }

    /// Sends a message to the given members, returning its id. Depending on the send options,
    ///  this returns after the message was acknowledged by all destinations, after it was
    ///  handed to the transport, or after it was queued for asynchronous sending.
    pub async fn send(&self, destinations: &[Member], payload: Bytes, options: SendOptions) -> Result<UniqueId, ChannelError> {
        let msg = self.message(payload, options);
        let id = msg.unique_id;
        self.send_through_chain(destinations, msg, None).await?;
        Ok(id)
    }

    /// Sends a message, reporting the outcome to `handler` instead of returning it. For
    ///  asynchronous messages, the handler is called after the message was actually sent.
    pub async fn send_with_handler(&self, destinations: &[Member], payload: Bytes, options: SendOptions, handler: Arc<dyn ErrorHandler>) -> UniqueId {
        let msg = self.message(payload, options);
        let id = msg.unique_id;
        match self.send_through_chain(destinations, msg, Some(handler.clone())).await {
            Ok(SendOutcome::Sent) => handler.handle_completion(id),
            Ok(SendOutcome::Queued) => {}
            Err(e) => handler.handle_error(e, id),
        }
        id
    }

    fn message(&self, payload: Bytes, options: SendOptions) -> ChannelMessage {
        ChannelMessage::new(self.local_member(false), payload, options)
    }

    async fn send_through_chain(&self, destinations: &[Member], msg: ChannelMessage, handler: Option<Arc<dyn ErrorHandler>>) -> Result<SendOutcome, ChannelError> {
        if destinations.is_empty() {
            return Err(ChannelError::NoDestination);
        }
        let chain = self.chain.read().unwrap().clone()
            .ok_or_else(|| ChannelError::IllegalState("channel is not started".to_string()))?;

        trace!(id = ?msg.unique_id, options = %msg.options, "sending message to {} member(s)", destinations.len());
        chain.down().send_message(destinations.to_vec(), msg, handler)
            .instrument(self.span())
            .await
    }

    pub fn add_channel_listener(&self, listener: Arc<dyn ChannelListener>) {
        let mut listeners = self.listeners.channel.write().unwrap();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_channel_listener(&self, listener: &Arc<dyn ChannelListener>) {
        self.listeners.channel.write().unwrap()
            .retain(|l| !same_listener(l, listener));
    }

    pub fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        let mut listeners = self.listeners.membership.write().unwrap();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_membership_listener(&self, listener: &Arc<dyn MembershipListener>) {
        self.listeners.membership.write().unwrap()
            .retain(|l| !same_listener(l, listener));
    }

    pub fn members(&self) -> Vec<Member> {
        self.coordinator.membership().members()
    }

    pub fn has_members(&self) -> bool {
        self.coordinator.membership().has_members()
    }

    pub fn get_member(&self, member: &Member) -> Option<Member> {
        self.coordinator.membership().get_member(member)
    }

    pub fn local_member(&self, include_alive_time: bool) -> Member {
        self.coordinator.membership().local_member(include_alive_time)
    }

    /// Runs periodic housekeeping in all interceptors and the coordinator. This is called
    ///  automatically unless the automatic heartbeat is switched off.
    pub async fn heartbeat(&self) {
        let chain = self.chain.read().unwrap().clone();
        heartbeat(&self.coordinator, chain.as_ref()).await
    }

    /// Switches the automatic heartbeat on or off. This takes effect when the channel is
    ///  started the next time.
    pub fn set_heartbeat(&self, enabled: bool) {
        *self.heartbeat_enabled.write().unwrap() = enabled;
    }

    fn start_heartbeat(&self, chain: &InterceptorChain) {
        if !*self.heartbeat_enabled.read().unwrap() {
            return;
        }
        let mut task = self.heartbeat_task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let coordinator = Arc::downgrade(&self.coordinator);
        let chain = chain.clone();
        let interval = self.config.heartbeat_interval;
        *task = Some(tokio::spawn(heartbeat_loop(coordinator, chain, interval).instrument(self.span())));
    }
}

impl Drop for GroupChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat_task.lock().unwrap().take() {
            handle.abort();
        }
        self.sink.set_chain(None);
    }
}

async fn heartbeat(coordinator: &ChannelCoordinator, chain: Option<&InterceptorChain>) {
    if let Some(chain) = chain {
        for interceptor in chain.interceptors() {
            interceptor.heartbeat().await;
        }
    }
    coordinator.heartbeat().await;
}

async fn heartbeat_loop(coordinator: Weak<ChannelCoordinator>, chain: InterceptorChain, interval: std::time::Duration) {
    let mut ticks = tokio::time::interval(interval);
    ticks.tick().await;
    loop {
        ticks.tick().await;
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        trace!("heartbeat");
        heartbeat(&coordinator, Some(&chain)).await;
    }
}
