//! Duplex queue negotiation.
//!
//! The broker only offers one-way queues. During the handshake the client
//! offers its response and request inboxes, the server answers with the
//! shared request inbox and its own response inbox; together they form one
//! logical bidirectional channel with four distinct queue roles.
//!
//! Queue names travel as an opaque token: each name is escaped (`\` → `\\`,
//! `|` → `\|`) and terminated by `|`. Every list, including an empty list
//! or one containing empty names, has exactly one encoding.

use corelib::{Error, Result};

const SEPARATOR: char = '|';
const ESCAPE: char = '\\';

/// Encode a list of queue names into a negotiation token.
pub fn encode_queue_names<S: AsRef<str>>(names: &[S]) -> String {
    let mut token = String::new();
    for name in names {
        for c in name.as_ref().chars() {
            if c == SEPARATOR || c == ESCAPE {
                token.push(ESCAPE);
            }
            token.push(c);
        }
        token.push(SEPARATOR);
    }
    token
}

/// Decode a negotiation token back into queue names.
pub fn decode_queue_names(token: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut current = String::new();
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(escaped @ (SEPARATOR | ESCAPE)) => current.push(escaped),
                Some(other) => {
                    return Err(Error::Protocol(format!("invalid escape sequence '\\{}' in negotiation token", other)))
                }
                None => return Err(Error::Protocol("negotiation token ends with an escape character".into())),
            },
            SEPARATOR => names.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        return Err(Error::Protocol("unterminated queue name in negotiation token".into()));
    }
    Ok(names)
}

fn decode_pair(token: &str, what: &str) -> Result<(String, String)> {
    let mut names = decode_queue_names(token)?;
    if names.len() != 2 {
        return Err(Error::Protocol(format!(
            "{} must contain 2 queue names, found {}",
            what,
            names.len()
        )));
    }
    let second = names.pop().unwrap_or_default();
    let first = names.pop().unwrap_or_default();
    Ok((first, second))
}

/// Queues offered by the connecting side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientQueueOffer {
    /// Where the server sends responses to the client's requests.
    pub response_queue: String,
    /// Where the server sends its own requests to the client.
    pub request_queue: String,
}

impl ClientQueueOffer {
    pub fn encode(&self) -> String {
        encode_queue_names(&[&self.response_queue, &self.request_queue])
    }

    pub fn decode(token: &str) -> Result<Self> {
        let (response_queue, request_queue) = decode_pair(token, "client queue offer")?;
        Ok(Self {
            response_queue,
            request_queue,
        })
    }
}

/// Queues answered by the accepting side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerQueueAnswer {
    /// Shared inbox for all client-to-server requests.
    pub request_queue: String,
    /// Where the client sends responses to the server's requests.
    pub response_queue: String,
}

impl ServerQueueAnswer {
    pub fn encode(&self) -> String {
        encode_queue_names(&[&self.request_queue, &self.response_queue])
    }

    pub fn decode(token: &str) -> Result<Self> {
        let (request_queue, response_queue) = decode_pair(token, "server queue answer")?;
        Ok(Self {
            request_queue,
            response_queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encoding_examples() {
        assert_eq!(encode_queue_names::<&str>(&[]), "");
        assert_eq!(encode_queue_names(&[""]), "|");
        assert_eq!(encode_queue_names(&["a|b", "c\\d"]), "a\\|b|c\\\\d|");
    }

    #[test]
    fn test_names_with_reserved_characters() {
        let names = vec!["temp://x|1".to_string(), "\\|\\".to_string(), String::new()];
        let token = encode_queue_names(&names);
        assert_eq!(decode_queue_names(&token).unwrap(), names);
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(matches!(decode_queue_names("abc"), Err(Error::Protocol(_))));
        assert!(matches!(decode_queue_names("a\\"), Err(Error::Protocol(_))));
        assert!(matches!(decode_queue_names("a\\x|"), Err(Error::Protocol(_))));
        assert!(ClientQueueOffer::decode("only-one|").is_err());
    }

    #[test]
    fn test_offer_and_answer() {
        let offer = ClientQueueOffer {
            response_queue: "temp://a/1".into(),
            request_queue: "temp://a/2".into(),
        };
        assert_eq!(ClientQueueOffer::decode(&offer.encode()).unwrap(), offer);

        let answer = ServerQueueAnswer {
            request_queue: "requests".into(),
            response_queue: "temp://b/7".into(),
        };
        assert_eq!(ServerQueueAnswer::decode(&answer.encode()).unwrap(), answer);
    }

    proptest! {
        #[test]
        fn prop_token_round_trip(names in proptest::collection::vec("[a-z|\\\\/:.0-9]{0,12}", 0..6)) {
            let token = encode_queue_names(&names);
            prop_assert_eq!(decode_queue_names(&token).unwrap(), names);
        }
    }
}
