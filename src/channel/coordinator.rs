use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::channel::error::ChannelError;
use crate::channel::listener::MembershipListener;
use crate::channel::send_options::SendOptions;
use crate::channel::services::{ServiceSet, ServiceStates};
use crate::interceptor::channel_interceptor::{ChainBottom, InterceptorChain};
use crate::membership::member::Member;
use crate::membership::membership_service::MembershipService;
use crate::messaging::channel_message::ChannelMessage;
use crate::messaging::MessageListener;
use crate::transport::receiver::ChannelReceiver;
use crate::transport::sender::ChannelSender;

/// The entry point of incoming messages and membership events into the interceptor chain. The
///  transport holds on to this while the chain is only set while the channel is started.
#[derive(Default)]
pub struct UpwardSink {
    chain: RwLock<Option<InterceptorChain>>,
}

impl UpwardSink {
    pub fn set_chain(&self, chain: Option<InterceptorChain>) {
        *self.chain.write().unwrap() = chain;
    }

    fn chain(&self) -> Option<InterceptorChain> {
        self.chain.read().unwrap().clone()
    }
}

#[async_trait]
impl MessageListener for UpwardSink {
    fn accept(&self, msg: &ChannelMessage) -> bool {
        match self.chain() {
            Some(chain) => chain.accept(msg),
            None => false,
        }
    }

    async fn message_received(&self, msg: ChannelMessage) -> anyhow::Result<()> {
        match self.chain() {
            Some(chain) => chain.up().message_received(msg).await,
            None => {
                debug!(id = ?msg.unique_id, "discarding message received by a stopped channel");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MembershipListener for UpwardSink {
    async fn member_added(&self, member: &Member) {
        if let Some(chain) = self.chain() {
            chain.up().member_added(member).await;
        }
    }

    async fn member_disappeared(&self, member: &Member) {
        if let Some(chain) = self.chain() {
            chain.up().member_disappeared(member).await;
        }
    }
}

/// The bottom of the interceptor chain: it owns the transport and the membership service,
///  and it manages their lifecycle.
pub struct ChannelCoordinator {
    receiver: Arc<dyn ChannelReceiver>,
    sender: Arc<dyn ChannelSender>,
    membership: Arc<dyn MembershipService>,
    states: Mutex<ServiceStates>,
}

impl ChannelCoordinator {
    pub fn new(receiver: Arc<dyn ChannelReceiver>, sender: Arc<dyn ChannelSender>, membership: Arc<dyn MembershipService>, sink: Arc<UpwardSink>) -> ChannelCoordinator {
        receiver.set_message_listener(sink.clone());
        membership.set_message_listener(sink.clone());
        membership.set_membership_listener(sink);

        ChannelCoordinator {
            receiver,
            sender,
            membership,
            states: Default::default(),
        }
    }

    pub fn membership(&self) -> &Arc<dyn MembershipService> {
        &self.membership
    }

    pub fn receiver(&self) -> &Arc<dyn ChannelReceiver> {
        &self.receiver
    }

    pub fn sender(&self) -> &Arc<dyn ChannelSender> {
        &self.sender
    }

    pub fn running(&self) -> ServiceSet {
        self.states.lock().unwrap().running()
    }

    /// Starts the requested services in the order receiver, sender, membership listener,
    ///  membership broadcaster. If one of them fails, the ones started before it remain running.
    pub async fn start(&self, svc: ServiceSet) -> Result<(), ChannelError> {
        let services = {
            let mut states = self.states.lock().unwrap();
            if svc.contains(ServiceSet::MBR_TX_SEQ) && !svc.contains(ServiceSet::SND_RX_SEQ) && !states.is_running(ServiceSet::SND_RX_SEQ) {
                return Err(ChannelError::IllegalState("the membership broadcaster requires the receiver to be running".to_string()));
            }
            states.begin_start(svc)?
        };

        let mut pending = services.into_iter();
        while let Some(service) = pending.next() {
            let result = self.start_service(service).await;
            let mut states = self.states.lock().unwrap();
            states.finish(service, result.is_ok());
            if let Err(e) = result {
                warn!("starting {} failed: {}", service, e);
                for not_started in pending.by_ref() {
                    states.finish(not_started, false);
                }
                return Err(e);
            }
            debug!("service {} started", service);
        }
        Ok(())
    }

    async fn start_service(&self, service: ServiceSet) -> Result<(), ChannelError> {
        match service {
            ServiceSet::SND_RX_SEQ => self.receiver.start().await,
            ServiceSet::SND_TX_SEQ => self.sender.start().await,
            ServiceSet::MBR_RX_SEQ => {
                self.update_local_member();
                self.membership.start(ServiceSet::MBR_RX_SEQ).await
            }
            ServiceSet::MBR_TX_SEQ => {
                if !self.update_local_member() {
                    return Err(ChannelError::IllegalState("the receiver has no bound address".to_string()));
                }
                self.membership.start(ServiceSet::MBR_TX_SEQ).await
            }
            _ => Err(ChannelError::Config(format!("{} is not a single service", service))),
        }
    }

    /// advertises the receiver's bound addresses as the local member's, returning `false` if
    ///  the receiver is not bound
    fn update_local_member(&self) -> bool {
        match (self.receiver.host(), self.receiver.port()) {
            (Some(host), Some(port)) => {
                self.membership.set_local_member_properties(host, port, self.receiver.udp_port(), self.receiver.secure_port());
                true
            }
            _ => false,
        }
    }

    /// Stops the requested services in reverse start order. All of them are stopped even if
    ///  stopping one fails, and the first failure is returned.
    pub async fn stop(&self, svc: ServiceSet) -> Result<(), ChannelError> {
        let services = self.states.lock().unwrap().begin_stop(svc)?;

        let mut result = Ok(());
        for service in services {
            let stopped = match service {
                ServiceSet::SND_RX_SEQ => self.receiver.stop().await,
                ServiceSet::SND_TX_SEQ => self.sender.stop().await,
                other => self.membership.stop(other).await,
            };
            self.states.lock().unwrap().finish(service, false);
            match stopped {
                Ok(()) => debug!("service {} stopped", service),
                Err(e) => {
                    warn!("stopping {} failed: {}", service, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        info!("stopped services {}", svc);
        result
    }

    pub async fn heartbeat(&self) {
        trace!("coordinator heartbeat");
        self.membership.heartbeat().await;
        self.sender.heartbeat().await;
        self.receiver.heartbeat().await;
    }
}

#[async_trait]
impl ChainBottom for ChannelCoordinator {
    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage) -> Result<(), ChannelError> {
        if msg.options.contains(SendOptions::MULTICAST) {
            trace!(id = ?msg.unique_id, "broadcasting message");
            return self.membership.broadcast(msg).await;
        }
        self.sender.send_message(destinations, msg).await
    }
}
