//! Template Renderer - Personalizes gateway templates per recipient

use crate::gateway::{
    Language, MediaLink, OutboundMessage, Parameter, PayloadComponent, TemplatePayload,
};
use outreach_storage::filter::FieldRef;
use outreach_storage::models::{
    BindingValue, ButtonKind, HeaderComponent, HeaderFormat, MessageTemplate, Recipient,
    TemplateComponent, VariableBinding,
};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}\s][^{}]*?)\s*\}\}").expect("placeholder pattern is valid")
});

/// Rendered message for one recipient
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    /// What the gateway receives
    pub message: OutboundMessage,
    /// Fully substituted body, stored on the thread and the delivery record
    pub text: String,
}

/// Template renderer
///
/// Every placeholder resolves to something: an explicit binding, a
/// well-known recipient field, a custom field, or finally `[placeholder]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Render a gateway template for `recipient`.
    ///
    /// A template without components renders to an empty component list;
    /// callers decide whether that is acceptable.
    pub fn render(
        &self,
        template: &MessageTemplate,
        bindings: &[VariableBinding],
        recipient: &Recipient,
    ) -> RenderedMessage {
        let resolver = Resolver {
            bindings,
            recipient,
        };
        let mut components = Vec::new();
        let mut text = String::new();

        for component in template.components.iter() {
            match component {
                TemplateComponent::Header(header) => {
                    if let Some(header) = render_header(header, &resolver) {
                        components.push(header);
                    }
                }
                TemplateComponent::Body { text: body } => {
                    let (rendered, parameters) = resolver.substitute(body);
                    text = rendered;
                    if !parameters.is_empty() {
                        components.push(PayloadComponent::Body {
                            parameters: parameters.into_iter().map(Parameter::text).collect(),
                        });
                    }
                }
                TemplateComponent::Footer { .. } => {}
                TemplateComponent::Buttons { buttons } => {
                    for (index, button) in buttons.iter().enumerate() {
                        if button.kind != ButtonKind::Url {
                            continue;
                        }
                        let Some(url) = &button.url else { continue };
                        let (_, parameters) = resolver.substitute(url);
                        if parameters.is_empty() {
                            continue;
                        }
                        components.push(PayloadComponent::Button {
                            sub_type: "url".to_string(),
                            index: index.to_string(),
                            parameters: parameters.into_iter().map(Parameter::text).collect(),
                        });
                    }
                }
            }
        }

        RenderedMessage {
            message: OutboundMessage::Template {
                template: TemplatePayload {
                    name: template.name.clone(),
                    language: Language {
                        code: template.language.clone(),
                    },
                    components,
                },
            },
            text,
        }
    }

    /// Free-text messages are sent verbatim
    pub fn render_text(&self, body: &str) -> RenderedMessage {
        RenderedMessage {
            message: OutboundMessage::text(body),
            text: body.to_string(),
        }
    }
}

fn render_header(header: &HeaderComponent, resolver: &Resolver<'_>) -> Option<PayloadComponent> {
    let media = |link: &String| MediaLink {
        link: link.clone(),
        filename: header.filename.clone(),
    };

    let parameter = match header.format {
        HeaderFormat::Text => {
            let (_, parameters) = resolver.substitute(header.text.as_deref()?);
            if parameters.is_empty() {
                return None;
            }
            return Some(PayloadComponent::Header {
                parameters: parameters.into_iter().map(Parameter::text).collect(),
            });
        }
        HeaderFormat::Image => Parameter::Image {
            image: media(header.media_url.as_ref()?),
        },
        HeaderFormat::Video => Parameter::Video {
            video: media(header.media_url.as_ref()?),
        },
        HeaderFormat::Document => Parameter::Document {
            document: media(header.media_url.as_ref()?),
        },
    };

    Some(PayloadComponent::Header {
        parameters: vec![parameter],
    })
}

struct Resolver<'a> {
    bindings: &'a [VariableBinding],
    recipient: &'a Recipient,
}

impl Resolver<'_> {
    /// Substitute every placeholder in `text`.
    ///
    /// Returns the rendered text and one value per distinct placeholder,
    /// ordered by position when all placeholders are numeric and by first
    /// appearance otherwise.
    fn substitute(&self, text: &str) -> (String, Vec<String>) {
        let mut order: Vec<String> = Vec::new();
        let mut values: HashMap<String, String> = HashMap::new();

        let rendered = PLACEHOLDER
            .replace_all(text, |caps: &Captures<'_>| {
                let name = caps[1].trim().to_string();
                values
                    .entry(name.clone())
                    .or_insert_with(|| {
                        order.push(name.clone());
                        self.resolve(&name)
                    })
                    .clone()
            })
            .into_owned();

        if order.iter().all(|name| name.parse::<u32>().is_ok()) {
            order.sort_by_key(|name| name.parse::<u32>().unwrap_or(u32::MAX));
        }

        let parameters = order
            .iter()
            .map(|name| values.get(name).cloned().unwrap_or_default())
            .collect();

        (rendered, parameters)
    }

    fn resolve(&self, name: &str) -> String {
        let positional = name.parse::<u32>().is_ok();

        let bound = self
            .bindings
            .iter()
            .filter(|b| {
                let key = b.key.trim();
                if positional {
                    key == name
                } else {
                    key.parse::<u32>().is_err() && key.eq_ignore_ascii_case(name)
                }
            })
            .find_map(|b| self.binding_value(&b.value));

        bound
            .or_else(|| well_known_field(name, self.recipient))
            .or_else(|| self.recipient.custom_field_text(name))
            .unwrap_or_else(|| format!("[{}]", name))
    }

    fn binding_value(&self, value: &BindingValue) -> Option<String> {
        match value {
            BindingValue::Static { value } => non_empty(value.clone()),
            BindingValue::Field { field } => match FieldRef::parse(field.trim()) {
                Ok(field) => field.value_of(self.recipient).and_then(non_empty),
                Err(_) => self.recipient.custom_field_text(field.trim()),
            },
        }
    }
}

fn well_known_field(name: &str, recipient: &Recipient) -> Option<String> {
    let value = match name.to_ascii_lowercase().as_str() {
        "name" => recipient.name.clone(),
        "phone" => Some(recipient.phone.clone()),
        "email" => recipient.email.clone(),
        _ => None,
    };
    value.and_then(non_empty)
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
