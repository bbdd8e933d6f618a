//! Chat-completion response decoding
//!
//! Providers disagree on where the generated image ends up. The message
//! content is decoded up front into [`MessageContent`] and each shape is
//! searched in a fixed priority order:
//! 1. text content (default model only): a download link or image markdown
//! 2. text content: an embedded base64 data URI
//! 3. structured content: the first `image_url` part
//! 4. anywhere in the serialized response: an embedded base64 data URI

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::generator::api_client::ModelVariant;

static DOWNLOAD_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[点击下载\]\((.*?)\)").expect("valid download link pattern"));

static IMAGE_MARKDOWN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\((.*?)\)").expect("valid image markdown pattern"));

static DATA_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"data:image/[^;]+;base64,[A-Za-z0-9+/=]+").expect("valid data uri pattern")
});

/// Message content as returned by the provider
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain string content, usually markdown
    TextContent(String),
    /// List of typed content parts
    StructuredContent(Vec<Value>),
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    image_url: Option<ImageUrl>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImageUrl {
    Object { url: Option<String> },
    Plain(String),
}

impl ImageUrl {
    fn url(self) -> Option<String> {
        match self {
            ImageUrl::Object { url } => url,
            ImageUrl::Plain(url) => Some(url),
        }
    }
}

/// Content of the first choice's message, if it has a recognised shape
pub fn first_message_content(response: &Value) -> Option<MessageContent> {
    let completion = ChatCompletion::deserialize(response).ok()?;
    let content = completion.choices.into_iter().next()?.message?.content?;
    MessageContent::deserialize(content).ok()
}

fn find_markdown_url(text: &str) -> Option<String> {
    DOWNLOAD_LINK
        .captures(text)
        .or_else(|| IMAGE_MARKDOWN.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|url| !url.is_empty())
}

fn find_data_uri(text: &str) -> Option<String> {
    DATA_URI.find(text).map(|m| m.as_str().to_string())
}

fn find_image_part(parts: &[Value]) -> Option<String> {
    parts
        .iter()
        .filter_map(|part| ContentPart::deserialize(part).ok())
        .filter(|part| part.kind == "image_url")
        .filter_map(|part| part.image_url.and_then(ImageUrl::url))
        .find(|url| !url.is_empty())
}

/// Locate the generated image (URL or data URI) in a provider response
pub fn extract_image_locator(response: &Value, variant: ModelVariant) -> Option<String> {
    let from_content = match first_message_content(response) {
        Some(MessageContent::TextContent(text)) => {
            let markdown = if variant != ModelVariant::NanoBanana {
                find_markdown_url(&text)
            } else {
                None
            };
            markdown.or_else(|| find_data_uri(&text))
        }
        Some(MessageContent::StructuredContent(parts)) => find_image_part(&parts),
        None => None,
    };

    from_content.or_else(|| {
        serde_json::to_string(response)
            .ok()
            .and_then(|raw| find_data_uri(&raw))
    })
}
