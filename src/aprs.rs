//! APRS payload formatting shared by the BBS/alerter/weather components: the
//! `:addressee:content{msgid}` message convention and its ack form.

use crate::callsign::Callsign;

const ADDRESSEE_WIDTH: usize = 9;

/// Pad/truncate an addressee callsign (including SSID, e.g. `NA4WX-7`) to the
/// fixed 9-character APRS addressee field.
fn pad_addressee(addressee: &str) -> String {
    let mut s = addressee.to_string();
    s.truncate(ADDRESSEE_WIDTH);
    format!("{s:<ADDRESSEE_WIDTH$}")
}

/// `:<addressee 9-char padded>:<content>{<msgid 1-5 chars>}` -- the msgid
/// suffix is omitted when `msgid` is `None`.
pub fn format_message(addressee: &Callsign, content: &str, msgid: Option<&str>) -> String {
    let addressee = pad_addressee(&addressee.to_string());
    match msgid {
        Some(id) => format!(":{addressee}:{content}{{{id}}}"),
        None => format!(":{addressee}:{content}"),
    }
}

/// `:<addressee padded>:ack<msgid>` with no trailing `{}`.
pub fn format_ack(addressee: &Callsign, msgid: &str) -> String {
    let addressee = pad_addressee(&addressee.to_string());
    format!(":{addressee}:ack{msgid}")
}

/// Same `:addressee:content` shape as [`format_message`], but for addressees
/// that are not callsigns -- APRS bulletin object names like `BLN1WX`.
pub fn format_bulletin(tag: &str, content: &str) -> String {
    let tag = pad_addressee(tag);
    format!(":{tag}:{content}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub addressee: String,
    pub content: String,
    pub msgid: Option<String>,
    pub is_ack: bool,
}

/// Parse an APRS message-format payload body (without the UI-frame envelope).
/// Returns `None` if it does not look like a `:addressee:...` message.
pub fn parse_message(payload: &str) -> Option<ParsedMessage> {
    let rest = payload.strip_prefix(':')?;
    let (addressee, rest) = rest.split_once(':')?;
    let addressee = addressee.trim_end().to_string();

    if let Some(msgid) = rest.strip_prefix("ack") {
        return Some(ParsedMessage {
            addressee,
            content: String::new(),
            msgid: Some(msgid.to_string()),
            is_ack: true,
        });
    }

    if let Some(open) = rest.rfind('{') {
        if rest.ends_with('}') {
            let content = rest[..open].to_string();
            let msgid = rest[open + 1..rest.len() - 1].to_string();
            return Some(ParsedMessage {
                addressee,
                content,
                msgid: Some(msgid),
                is_ack: false,
            });
        }
    }

    Some(ParsedMessage {
        addressee,
        content: rest.to_string(),
        msgid: None,
        is_ack: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    #[test]
    fn formats_and_parses_message_with_msgid() {
        let msg = format_message(&cs("NA4WX-7"), "Hello", Some("42"));
        assert_eq!(msg, ":NA4WX-7  :Hello{42}");
        let parsed = parse_message(&msg).unwrap();
        assert_eq!(parsed.addressee, "NA4WX-7");
        assert_eq!(parsed.content, "Hello");
        assert_eq!(parsed.msgid.as_deref(), Some("42"));
        assert!(!parsed.is_ack);
    }

    #[test]
    fn formats_and_parses_ack() {
        let ack = format_ack(&cs("N0CALL"), "7");
        assert_eq!(ack, ":N0CALL   :ack7");
        let parsed = parse_message(&ack).unwrap();
        assert!(parsed.is_ack);
        assert_eq!(parsed.msgid.as_deref(), Some("7"));
    }

    #[test]
    fn message_without_msgid() {
        let msg = format_message(&cs("ALL"), "bulletin text", None);
        let parsed = parse_message(&msg).unwrap();
        assert_eq!(parsed.content, "bulletin text");
        assert!(parsed.msgid.is_none());
    }
}
