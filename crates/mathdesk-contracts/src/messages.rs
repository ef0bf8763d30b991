//! Chat-completion message types, serialized in the OpenAI chat wire shape.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Where an attached image lives once the image store has accepted it.
///
/// `Url` is a fetchable location (object store, `file://`), `Inline` is a
/// `data:` URL carrying the base64 bytes themselves. Either way the string is
/// passed to the model untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    Url(String),
    Inline(String),
}

impl ImageReference {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Url(value) | Self::Inline(value) => value.as_str(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Url(_) => "url",
            Self::Inline(_) => "inline",
        }
    }

    /// Short form for logs and events; inline payloads are not echoed.
    pub fn display_label(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Inline(data) => {
                let head = data.split(',').next().unwrap_or_default();
                format!("{head},… ({} chars)", data.len())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(reference: &ImageReference) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                url: reference.as_str().to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    /// First image URL carried by this message, if any.
    pub fn image_url(&self) -> Option<&str> {
        let MessageContent::Parts(parts) = &self.content else {
            return None;
        };
        parts.iter().find_map(|part| match part {
            ContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
            ContentPart::Text { .. } => None,
        })
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(text) => Some(text.as_str()),
            MessageContent::Parts(parts) => parts.iter().find_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            }),
        }
    }
}
