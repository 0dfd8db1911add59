//! Command registry.
//!
//! Every frame on the wire starts with a one byte command code. This module holds the
//! process-wide table that maps those codes to a [`TcpCommand`], its display name and the
//! reply command a request expects. The table is a constant; nothing mutates it.
//!
//! # Example
//! ```rust
//! use eventlink::protocol::TcpCommand;
//!
//! let command = TcpCommand::from_code(0x82).unwrap();
//! assert_eq!(command, TcpCommand::WriteEvents);
//! assert_eq!(command.expected_reply(), Some(TcpCommand::WriteEventsCompleted));
//! ```
use std::fmt;

/// Static description of one command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub command: TcpCommand,
    pub name: &'static str,
    pub expected_reply: Option<TcpCommand>,
}

macro_rules! commands {
    ($($variant:ident = $code:literal => $reply:expr),* $(,)?) => {
        /// Command codes understood by the event store.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum TcpCommand {
            $($variant = $code,)*
        }

        /// The command table, in code order.
        pub static DESCRIPTORS: &[CommandDescriptor] = &[
            $(CommandDescriptor {
                command: TcpCommand::$variant,
                name: stringify!($variant),
                expected_reply: $reply,
            },)*
        ];

        impl TcpCommand {
            /// Looks up a command by its wire code.
            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(TcpCommand::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

commands! {
    HeartbeatRequest = 0x01 => Some(TcpCommand::HeartbeatResponse),
    HeartbeatResponse = 0x02 => None,
    Ping = 0x03 => Some(TcpCommand::Pong),
    Pong = 0x04 => None,

    WriteEvents = 0x82 => Some(TcpCommand::WriteEventsCompleted),
    WriteEventsCompleted = 0x83 => None,
    TransactionStart = 0x84 => Some(TcpCommand::TransactionStartCompleted),
    TransactionStartCompleted = 0x85 => None,
    TransactionWrite = 0x86 => Some(TcpCommand::TransactionWriteCompleted),
    TransactionWriteCompleted = 0x87 => None,
    TransactionCommit = 0x88 => Some(TcpCommand::TransactionCommitCompleted),
    TransactionCommitCompleted = 0x89 => None,
    DeleteStream = 0x8A => Some(TcpCommand::DeleteStreamCompleted),
    DeleteStreamCompleted = 0x8B => None,

    ReadEvent = 0xB0 => Some(TcpCommand::ReadEventCompleted),
    ReadEventCompleted = 0xB1 => None,
    ReadStreamEventsForward = 0xB2 => Some(TcpCommand::ReadStreamEventsForwardCompleted),
    ReadStreamEventsForwardCompleted = 0xB3 => None,
    ReadStreamEventsBackward = 0xB4 => Some(TcpCommand::ReadStreamEventsBackwardCompleted),
    ReadStreamEventsBackwardCompleted = 0xB5 => None,

    SubscribeToStream = 0xC0 => Some(TcpCommand::SubscriptionConfirmation),
    SubscriptionConfirmation = 0xC1 => None,
    StreamEventAppeared = 0xC2 => None,
    UnsubscribeFromStream = 0xC3 => Some(TcpCommand::SubscriptionDropped),
    SubscriptionDropped = 0xC4 => None,
    ConnectToPersistentSubscription = 0xC5 => Some(TcpCommand::PersistentSubscriptionConfirmation),
    PersistentSubscriptionConfirmation = 0xC6 => None,
    PersistentSubscriptionStreamEventAppeared = 0xC7 => None,
    CreatePersistentSubscription = 0xC8 => Some(TcpCommand::CreatePersistentSubscriptionCompleted),
    CreatePersistentSubscriptionCompleted = 0xC9 => None,
    DeletePersistentSubscription = 0xCA => Some(TcpCommand::DeletePersistentSubscriptionCompleted),
    DeletePersistentSubscriptionCompleted = 0xCB => None,
    PersistentSubscriptionAckEvents = 0xCC => None,
    PersistentSubscriptionNakEvents = 0xCD => None,
    UpdatePersistentSubscription = 0xCE => Some(TcpCommand::UpdatePersistentSubscriptionCompleted),
    UpdatePersistentSubscriptionCompleted = 0xCF => None,

    BadRequest = 0xF0 => None,
    NotHandled = 0xF1 => None,
    Authenticate = 0xF2 => Some(TcpCommand::Authenticated),
    Authenticated = 0xF3 => None,
    NotAuthenticated = 0xF4 => None,
    IdentifyClient = 0xF5 => Some(TcpCommand::ClientIdentified),
    ClientIdentified = 0xF6 => None,
}

impl TcpCommand {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn descriptor(self) -> &'static CommandDescriptor {
        // The table is generated in declaration order, so a linear scan always hits.
        let mut found = &DESCRIPTORS[0];
        for descriptor in DESCRIPTORS {
            if descriptor.command == self {
                found = descriptor;
                break;
            }
        }
        found
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// Reply command a request of this kind is completed by, if it is a request.
    pub fn expected_reply(self) -> Option<TcpCommand> {
        self.descriptor().expected_reply
    }
}

impl TryFrom<u8> for TcpCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        TcpCommand::from_code(value).ok_or(value)
    }
}

impl fmt::Display for TcpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.code())
    }
}
