//! Decrypted callback payload, parsed into a closed set of message kinds.

use crate::cache::ConversationKey;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("invalid callback payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("callback payload has no msgtype")]
    MissingType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatType {
    #[default]
    Single,
    Group,
}

/// Kind-specific content of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundContent {
    Text { content: String },
    Image { url: String },
    /// Text and image items in user order.
    Mixed { items: Vec<MixedItem> },
    /// Poll for more output of a running stream.
    Stream { id: String, cursor: u64 },
    Event { event_type: String },
    /// A msgtype this bridge does not handle.
    Unsupported { msgtype: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixedItem {
    Text(String),
    Image(String),
}

/// One webhook call after decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub msgid: String,
    pub aibotid: String,
    pub chattype: ChatType,
    pub chatid: Option<String>,
    pub sender_id: String,
    pub content: InboundContent,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    msgid: String,
    #[serde(default)]
    aibotid: String,
    #[serde(default)]
    chattype: Option<String>,
    #[serde(default)]
    chatid: Option<String>,
    #[serde(default)]
    from: Option<RawFrom>,
    #[serde(default)]
    msgtype: Option<String>,
    #[serde(default)]
    text: Option<RawText>,
    #[serde(default)]
    image: Option<RawImage>,
    #[serde(default)]
    mixed: Option<RawMixed>,
    #[serde(default)]
    stream: Option<RawStream>,
    #[serde(default)]
    event: Option<RawEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFrom {
    #[serde(default, alias = "user_id")]
    userid: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawText {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawImage {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawMixed {
    #[serde(default)]
    msg_item: Vec<RawMixedItem>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMixedItem {
    #[serde(default)]
    msgtype: String,
    #[serde(default)]
    text: Option<RawText>,
    #[serde(default)]
    image: Option<RawImage>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStream {
    #[serde(default)]
    id: String,
    #[serde(default)]
    cursor: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawEvent {
    #[serde(default)]
    eventtype: String,
}

impl InboundMessage {
    /// Parse the decrypted JSON plaintext of a callback.
    pub fn parse(plaintext: &str) -> Result<Self, InboundError> {
        let raw: RawMessage = serde_json::from_str(plaintext)?;
        let msgtype = raw.msgtype.ok_or(InboundError::MissingType)?;
        let content = match msgtype.as_str() {
            "text" => InboundContent::Text {
                content: raw.text.unwrap_or_default().content,
            },
            "image" => InboundContent::Image {
                url: raw.image.unwrap_or_default().url,
            },
            "mixed" => InboundContent::Mixed {
                items: raw
                    .mixed
                    .unwrap_or_default()
                    .msg_item
                    .into_iter()
                    .filter_map(|item| match item.msgtype.as_str() {
                        "text" => item
                            .text
                            .map(|t| t.content)
                            .filter(|c| !c.is_empty())
                            .map(MixedItem::Text),
                        "image" => item
                            .image
                            .map(|i| i.url)
                            .filter(|u| !u.is_empty())
                            .map(MixedItem::Image),
                        _ => None,
                    })
                    .collect(),
            },
            "stream" => {
                let stream = raw.stream.unwrap_or_default();
                InboundContent::Stream {
                    id: stream.id,
                    cursor: stream.cursor,
                }
            }
            "event" => InboundContent::Event {
                event_type: raw.event.unwrap_or_default().eventtype,
            },
            _ => InboundContent::Unsupported { msgtype },
        };
        let chattype = match raw.chattype.as_deref() {
            Some("group") => ChatType::Group,
            _ => ChatType::Single,
        };
        let sender_id = raw
            .from
            .map(|f| f.userid)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "anonymous".to_string());
        Ok(Self {
            msgid: raw.msgid,
            aibotid: raw.aibotid,
            chattype,
            chatid: raw.chatid.filter(|c| !c.is_empty()),
            sender_id,
            content,
        })
    }

    pub fn conversation_key(&self) -> ConversationKey {
        let chat = match self.chattype {
            ChatType::Group => self.chatid.as_deref(),
            ChatType::Single => None,
        };
        ConversationKey::new(&self.aibotid, chat, &self.sender_id)
    }

    /// Query text and attached image urls for message kinds that start a turn.
    pub fn query(&self) -> Option<(String, Vec<String>)> {
        match &self.content {
            InboundContent::Text { content } if !content.trim().is_empty() => {
                Some((content.clone(), Vec::new()))
            }
            InboundContent::Image { url } if !url.is_empty() => Some((String::new(), vec![url.clone()])),
            InboundContent::Mixed { items } if !items.is_empty() => {
                let mut texts = Vec::new();
                let mut urls = Vec::new();
                for item in items {
                    match item {
                        MixedItem::Text(t) => texts.push(t.as_str()),
                        MixedItem::Image(u) => urls.push(u.clone()),
                    }
                }
                Some((texts.join("\n"), urls))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_group_text() {
        let msg = InboundMessage::parse(
            r#"{"msgid":"m1","aibotid":"b1","chattype":"group","chatid":"g1",
                "from":{"userid":"u1"},"msgtype":"text","text":{"content":"hello"}}"#,
        )
        .unwrap();
        assert_eq!(msg.chattype, ChatType::Group);
        assert_eq!(msg.sender_id, "u1");
        assert_eq!(msg.content, InboundContent::Text { content: "hello".to_string() });
        assert_eq!(msg.conversation_key(), ConversationKey::new("b1", Some("g1"), "u1"));
        assert_eq!(msg.query(), Some(("hello".to_string(), Vec::new())));
    }

    #[test]
    fn single_chat_ignores_chatid_and_defaults_sender() {
        let msg = InboundMessage::parse(r#"{"msgid":"m","aibotid":"b","chatid":"x","msgtype":"text","text":{"content":"hi"}}"#)
            .unwrap();
        assert_eq!(msg.sender_id, "anonymous");
        assert_eq!(msg.conversation_key().scope, "single:anonymous");
    }

    #[test]
    fn parses_stream_poll_with_optional_cursor() {
        let msg = InboundMessage::parse(r#"{"msgid":"m","aibotid":"b","msgtype":"stream","stream":{"id":"s1"}}"#).unwrap();
        assert_eq!(msg.content, InboundContent::Stream { id: "s1".to_string(), cursor: 0 });
        let msg = InboundMessage::parse(r#"{"msgtype":"stream","stream":{"id":"s1","cursor":4}}"#).unwrap();
        assert_eq!(msg.content, InboundContent::Stream { id: "s1".to_string(), cursor: 4 });
        assert!(msg.query().is_none());
    }

    #[test]
    fn mixed_joins_text_and_collects_images() {
        let msg = InboundMessage::parse(
            r#"{"msgid":"m","aibotid":"b","from":{"userid":"u"},"msgtype":"mixed","mixed":{"msg_item":[
                {"msgtype":"text","text":{"content":"look"}},
                {"msgtype":"image","image":{"url":"https://a/1"}},
                {"msgtype":"text","text":{"content":"here"}},
                {"msgtype":"voice"}]}}"#,
        )
        .unwrap();
        assert_eq!(
            msg.query(),
            Some(("look\nhere".to_string(), vec!["https://a/1".to_string()]))
        );
    }

    #[test]
    fn events_and_unknown_types() {
        let msg = InboundMessage::parse(r#"{"msgtype":"event","event":{"eventtype":"enter_chat"}}"#).unwrap();
        assert_eq!(msg.content, InboundContent::Event { event_type: "enter_chat".to_string() });
        let msg = InboundMessage::parse(r#"{"msgtype":"voice"}"#).unwrap();
        assert_eq!(msg.content, InboundContent::Unsupported { msgtype: "voice".to_string() });
        assert!(matches!(InboundMessage::parse(r#"{"msgid":"x"}"#), Err(InboundError::MissingType)));
        let blank = InboundMessage::parse(r#"{"msgtype":"text","text":{"content":"  "}}"#).unwrap();
        assert!(blank.query().is_none());
        assert!(matches!(InboundMessage::parse("not json"), Err(InboundError::Json(_))));
    }
}
