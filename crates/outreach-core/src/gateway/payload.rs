//! Wire payloads accepted by the messaging gateway

use serde::{Deserialize, Serialize};

/// Message body handed to [`super::MessagingGateway::send`].
///
/// Serializes to the `type` + matching object pair the Cloud API expects,
/// e.g. `{"type":"template","template":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Template { template: TemplatePayload },
    Text { text: TextBody },
}

impl OutboundMessage {
    pub fn text(body: impl Into<String>) -> Self {
        OutboundMessage::Text {
            text: TextBody {
                body: body.into(),
                preview_url: false,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Template { .. } => "template",
            OutboundMessage::Text { .. } => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBody {
    pub body: String,
    #[serde(default)]
    pub preview_url: bool,
}

/// Template reference plus the parameters filled in for one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatePayload {
    pub name: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<PayloadComponent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Language {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadComponent {
    Header {
        parameters: Vec<Parameter>,
    },
    Body {
        parameters: Vec<Parameter>,
    },
    /// One block per parameterised button; `index` is the button position as a string
    Button {
        sub_type: String,
        index: String,
        parameters: Vec<Parameter>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Parameter {
    Text { text: String },
    Image { image: MediaLink },
    Video { video: MediaLink },
    Document { document: MediaLink },
}

impl Parameter {
    pub fn text(value: impl Into<String>) -> Self {
        Parameter::Text { text: value.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaLink {
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}
