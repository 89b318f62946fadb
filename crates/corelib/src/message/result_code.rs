//! Result codes carried by responses.

use std::fmt;

/// Outcome of a request, transmitted as an integer wire property.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    /// The local node had no route, or refused to forward.
    NoRouteToDestinationWhileForwarding,
    /// Forwarding failed with an error on an intermediate node.
    ExceptionWhileForwarding,
    /// The request could not be delivered over the channel.
    ExceptionDuringDelivery,
    /// The request reached its destination, but the handler failed.
    ExceptionAtDestination,
    /// No response arrived within the deadline.
    Timeout,
    /// The channel was closed while the response was awaited.
    ChannelClosed,
    /// The channel was closed or broken before the request was sent.
    ChannelClosedOrBrokenBeforeSending,
    /// No handler for the request's message type.
    NoHandlerForMessageType,
    Unknown(i32),
}

impl ResultCode {
    pub fn code(self) -> i32 {
        match self {
            ResultCode::Success => 1,
            ResultCode::NoRouteToDestinationWhileForwarding => 101,
            ResultCode::ExceptionWhileForwarding => 102,
            ResultCode::ExceptionDuringDelivery => 103,
            ResultCode::ExceptionAtDestination => 104,
            ResultCode::Timeout => 105,
            ResultCode::ChannelClosed => 106,
            ResultCode::ChannelClosedOrBrokenBeforeSending => 107,
            ResultCode::NoHandlerForMessageType => 108,
            ResultCode::Unknown(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ResultCode::Success,
            101 => ResultCode::NoRouteToDestinationWhileForwarding,
            102 => ResultCode::ExceptionWhileForwarding,
            103 => ResultCode::ExceptionDuringDelivery,
            104 => ResultCode::ExceptionAtDestination,
            105 => ResultCode::Timeout,
            106 => ResultCode::ChannelClosed,
            107 => ResultCode::ChannelClosedOrBrokenBeforeSending,
            108 => ResultCode::NoHandlerForMessageType,
            other => ResultCode::Unknown(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Unknown(code) => write!(f, "Unknown({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_map_back() {
        for code in [
            ResultCode::Success,
            ResultCode::NoRouteToDestinationWhileForwarding,
            ResultCode::Timeout,
            ResultCode::ChannelClosed,
            ResultCode::NoHandlerForMessageType,
        ] {
            assert_eq!(ResultCode::from_code(code.code()), code);
        }
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        assert_eq!(ResultCode::from_code(42), ResultCode::Unknown(42));
        assert_eq!(ResultCode::Unknown(42).code(), 42);
        assert!(!ResultCode::Unknown(42).is_success());
    }
}
