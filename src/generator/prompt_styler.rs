//! Prompt decoration with the active style text and the aspect ratio tag

/// Tag appended to every prompt to pin the aspect ratio
pub fn ratio_tag(ratio: &str) -> String {
    format!("图片比例【{}】", ratio)
}

/// Style and ratio applied to each outgoing prompt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptStyle {
    pub style_content: String,
    pub image_ratio: String,
}

impl PromptStyle {
    pub fn new(style_content: impl Into<String>, image_ratio: impl Into<String>) -> Self {
        Self {
            style_content: style_content.into(),
            image_ratio: image_ratio.into(),
        }
    }

    /// Text actually sent to the API for `prompt`.
    ///
    /// A prompt that already carries the ratio tag is treated as decorated and
    /// passed through, so resubmitting never stacks style text twice.
    pub fn decorate(&self, prompt: &str) -> String {
        if self.image_ratio.trim().is_empty() {
            return prompt.to_string();
        }

        let tag = ratio_tag(self.image_ratio.trim());
        if prompt.contains(&tag) {
            return prompt.to_string();
        }

        let style = self.style_content.trim();
        let mut decorated = prompt.to_string();
        if !style.is_empty() && !prompt.contains(style) {
            decorated.push(' ');
            decorated.push_str(style);
        }
        decorated.push(' ');
        decorated.push_str(&tag);
        decorated
    }
}
