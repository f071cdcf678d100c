use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tokio::select;
use tracing::{info, warn, Level};

use tribes::channel::channel::GroupChannel;
use tribes::channel::channel_config::ChannelConfig;
use tribes::channel::listener::{ChannelListener, MembershipListener};
use tribes::channel::send_options::SendOptions;
use tribes::channel::services::ServiceSet;
use tribes::interceptor::encrypt::EncryptInterceptor;
use tribes::interceptor::fragmentation::{FragmentationConfig, FragmentationInterceptor};
use tribes::interceptor::order::{OrderConfig, OrderInterceptor};
use tribes::interceptor::throughput::ThroughputInterceptor;
use tribes::membership::member::Member;
use tribes::messaging::channel_message::ChannelMessage;

/// Runs a group member on localhost, sending a message to all other members periodically.
///
/// Start several of these with the same `--group` ports, e.g.
///  `channel_node a 4000 45000 --group 45000 --group 45001` and
///  `channel_node b 4001 45001 --group 45000 --group 45001`
#[derive(Parser)]
struct Args {
    name: String,
    port: u16,
    membership_port: u16,

    /// membership ports of all members of the group, including this one
    #[clap(long)]
    group: Vec<u16>,

    /// send options, either as a number or as a comma separated list like 'use_ack,secure'
    #[clap(long, default_value = "use_ack")]
    options: String,

    #[clap(long, default_value_t = 2000)]
    interval_millis: u64,

    /// shared secret for encrypting messages that are sent with the 'secure' option
    #[clap(long)]
    secret: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct LoggingListener;

#[async_trait]
impl ChannelListener for LoggingListener {
    async fn message_received(&self, msg: ChannelMessage) -> anyhow::Result<()> {
        info!("received from {}: {}", msg.address, String::from_utf8_lossy(&msg.payload));
        Ok(())
    }
}

#[async_trait]
impl MembershipListener for LoggingListener {
    async fn member_added(&self, member: &Member) {
        info!("member added: {}", member);
    }

    async fn member_disappeared(&self, member: &Member) {
        info!("member disappeared: {}", member);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let options = SendOptions::parse_send_options(&args.options)?;

    let config = ChannelConfig::localhost(&args.name, args.port, args.membership_port, &args.group);
    let channel = GroupChannel::with_defaults(config);

    channel.add_interceptor(Arc::new(OrderInterceptor::new(OrderConfig::default())))?;
    channel.add_interceptor(Arc::new(FragmentationInterceptor::new(FragmentationConfig::default())))?;
    if let Some(secret) = &args.secret {
        channel.add_interceptor(Arc::new(EncryptInterceptor::new(secret)))?;
    }
    channel.add_interceptor(Arc::new(ThroughputInterceptor::new(100)))?;

    let listener = Arc::new(LoggingListener);
    channel.add_channel_listener(listener.clone());
    channel.add_membership_listener(listener);

    channel.start(ServiceSet::DEFAULT).await?;
    info!("started {} as {}", channel.name(), channel.local_member(false));

    let mut ticks = tokio::time::interval(Duration::from_millis(args.interval_millis));
    let mut counter = 0u64;
    loop {
        select! {
            _ = ticks.tick() => {
                let members = channel.members();
                if members.is_empty() {
                    continue;
                }
                counter += 1;
                let payload = Bytes::from(format!("message #{} from {}", counter, args.name));
                if let Err(e) = channel.send(&members, payload, options).await {
                    warn!("send failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    channel.stop(ServiceSet::DEFAULT).await?;
    Ok(())
}
