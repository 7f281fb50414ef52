//! Callback wire types: query parameters, the encrypted envelope, and the plaintext replies.

use crate::cache::{ChunkContent, Snapshot};
use crate::crypto::{CryptoEnvelope, CryptoError};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Query parameters of both callback methods.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default, alias = "signature")]
    pub msg_signature: Option<String>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub nonce: String,
    /// URL verification challenge (GET only).
    #[serde(default, alias = "echo_ciphertext")]
    pub echostr: Option<String>,
}

/// POST body: `{ "encrypt": "<base64>" }`.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackBody {
    #[serde(alias = "ciphertext")]
    pub encrypt: String,
}

/// Encrypted reply body. `msgsignature` signs `(token, timestamp, nonce, encrypt)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedReply {
    pub encrypt: String,
    pub msgsignature: String,
    pub timestamp: String,
    pub nonce: String,
}

impl EncryptedReply {
    /// Encrypt `plaintext`, echoing the request's timestamp and nonce (fresh ones when absent).
    pub fn seal(
        envelope: &CryptoEnvelope,
        plaintext: &str,
        timestamp: &str,
        nonce: &str,
    ) -> Result<Self, CryptoError> {
        let timestamp = if timestamp.is_empty() {
            unix_seconds().to_string()
        } else {
            timestamp.to_string()
        };
        let nonce = if nonce.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
        } else {
            nonce.to_string()
        };
        let encrypt = envelope.encrypt(plaintext)?;
        let msgsignature = envelope.sign(&timestamp, &nonce, &encrypt);
        Ok(Self {
            encrypt,
            msgsignature,
            timestamp,
            nonce,
        })
    }
}

fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImagePayload {
    pub base64: String,
    pub md5: String,
}

impl ImagePayload {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            base64: base64::engine::general_purpose::STANDARD.encode(data),
            md5: format!("{:x}", md5::compute(data)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "msgtype", rename_all = "lowercase")]
pub enum MsgItem {
    Image { image: ImagePayload },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamBody {
    pub id: String,
    pub finish: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub msg_item: Vec<MsgItem>,
    /// Last seq included; the next poll may send it back as its cursor.
    #[serde(default)]
    pub cursor: u64,
}

/// `{ "msgtype": "stream", "stream": { .. } }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamReply {
    pub msgtype: String,
    pub stream: StreamBody,
}

impl StreamReply {
    pub fn text(id: &str, content: &str, finish: bool, cursor: u64) -> Self {
        Self {
            msgtype: "stream".to_string(),
            stream: StreamBody {
                id: id.to_string(),
                finish,
                content: content.to_string(),
                msg_item: Vec::new(),
                cursor,
            },
        }
    }

    /// Render the chunks of `snapshot` after `from_seq`.
    ///
    /// Text and error chunks are concatenated into `content`. Images only travel on the final
    /// reply, so an unfinished reply stops in front of the first image and its cursor stays there.
    /// With nothing to show yet the acknowledgement text is sent.
    pub fn from_snapshot(snapshot: &Snapshot, from_seq: u64) -> Self {
        let finish = snapshot.completed;
        let mut content = String::new();
        let mut items = Vec::new();
        let mut cursor = from_seq;
        for chunk in &snapshot.chunks {
            match &chunk.content {
                ChunkContent::Text(text) => content.push_str(text),
                ChunkContent::Error(marker) => {
                    if !content.is_empty() && !content.ends_with('\n') {
                        content.push('\n');
                    }
                    content.push_str(marker);
                }
                ChunkContent::Image(data) if finish => items.push(MsgItem::Image {
                    image: ImagePayload::from_bytes(data),
                }),
                ChunkContent::Image(_) => break,
            }
            cursor = chunk.seq;
        }
        if content.is_empty() && items.is_empty() && !finish {
            content = snapshot.placeholder.clone();
        }
        let mut reply = Self::text(&snapshot.stream_id, &content, finish, cursor);
        reply.stream.msg_item = items;
        reply
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Welcome card answered to the `enter_chat` event.
pub fn welcome_card(agent_name: &str) -> String {
    json!({
        "msgtype": "template_card",
        "template_card": {
            "card_type": "text_notice",
            "source": { "desc": agent_name, "desc_color": 1 },
            "main_title": {
                "title": format!("欢迎使用{}", agent_name),
                "desc": "我是您的智能助手，可以帮您解答问题、提供信息和协助工作"
            },
            "emphasis_content": { "title": "在线", "desc": "服务状态" },
            "horizontal_content_list": [
                { "keyname": "功能", "value": "智能问答、知识查询、工作协助" },
                { "keyname": "支持", "value": "文本、图片、混合消息" }
            ],
            "jump_list": [
                { "type": 3, "title": "了解功能", "question": "你有哪些功能？" },
                { "type": 3, "title": "使用帮助", "question": "如何使用你？" }
            ]
        }
    })
    .to_string()
}
