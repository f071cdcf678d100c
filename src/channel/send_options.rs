use std::fmt::{Debug, Display, Formatter};

use bitflags::bitflags;
use tracing::trace;

use crate::channel::error::ChannelError;

bitflags! {
    /// Send options are independent flags that can be combined arbitrarily. They control how a
    ///  message is transported and confirmed, and which interceptors process it.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct SendOptions: u32 {
        /// The message is a raw byte message: the payload is handed to listeners as it was sent
        const BYTE_MESSAGE = 0x0001;
        /// The sender waits for the receiving side to confirm receipt
        const USE_ACK = 0x0002;
        /// The sender waits for the receiving side to confirm that the message was processed,
        ///  not only received. The receiver sends a 'failed' ack if processing failed.
        const SYNCHRONIZED_ACK = 0x0004;
        /// The message is queued and sent by a background task, the send call returns
        ///  immediately
        const ASYNCHRONOUS = 0x0008;
        /// The message is encrypted by the encryption interceptor
        const SECURE = 0x0010;
        /// The message is sent as a UDP datagram rather than through TCP
        const UDP = 0x0020;
        /// The message is sent to the membership broadcast address(es)
        const MULTICAST = 0x0040;
    }
}

impl SendOptions {
    pub const DEFAULT: SendOptions = SendOptions::USE_ACK;

    /// names in the order of the bits they represent
    const OPTION_NAMES: [&'static str; 7] = ["byte", "use_ack", "sync", "async", "secure", "udp", "multicast"];

    /// true if the sender needs to wait for some kind of confirmation from the receiver
    pub fn requires_ack(&self) -> bool {
        self.intersects(SendOptions::USE_ACK | SendOptions::SYNCHRONIZED_ACK)
    }

    pub fn get_send_option_value(name: &str) -> Result<SendOptions, ChannelError> {
        match name {
            "asynchronous" | "async" => Ok(SendOptions::ASYNCHRONOUS),
            "byte_message" | "byte" => Ok(SendOptions::BYTE_MESSAGE),
            "multicast" => Ok(SendOptions::MULTICAST),
            "secure" => Ok(SendOptions::SECURE),
            "synchronized_ack" | "sync" => Ok(SendOptions::SYNCHRONIZED_ACK),
            "udp" => Ok(SendOptions::UDP),
            "use_ack" => Ok(SendOptions::USE_ACK),
            _ => Err(ChannelError::InvalidOption(name.to_string())),
        }
    }

    /// Parses either a numeric bit mask or a comma separated list of option names. Numeric input
    ///  must not contain bits outside the known options.
    pub fn parse_send_options(input: &str) -> Result<SendOptions, ChannelError> {
        match input.trim().parse::<u32>() {
            Ok(raw) => {
                return SendOptions::from_bits(raw)
                    .ok_or_else(|| ChannelError::InvalidOption(input.to_string()));
            }
            Err(_) => {
                trace!("failed to parse [{}] as integer, send options are possibly set by name(s)", input);
            }
        }

        // trailing separators are ignored, empty names elsewhere are not
        input.trim_end_matches(|c: char| c == ',' || c.is_whitespace())
            .split(',')
            .map(str::trim)
            .try_fold(SendOptions::empty(), |acc, name| {
                Ok(acc | SendOptions::get_send_option_value(name)?)
            })
    }

    /// human-readable list of the options, highest bit first
    pub fn get_send_options_as_string(&self) -> String {
        (0..Self::OPTION_NAMES.len())
            .rev()
            .filter(|&bit| self.bits() & (1 << bit) != 0)
            .map(|bit| Self::OPTION_NAMES[bit])
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Debug for SendOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SendOptions(0x{:04x}: {})", self.bits(), self.get_send_options_as_string())
    }
}

impl Display for SendOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_send_options_as_string())
    }
}
