//! Per-host command templates.
//!
//! Commands may reference `{{host}}`, `{{label}}`, `{{user}}`, `{{rank}}`, `{{nhosts}}` and
//! `{{address}}`. Each host gets its own rendering before any worker starts.

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::DispatchError;

const TEMPLATE_NAME: &str = "command";

#[derive(Debug, Serialize)]
pub struct TemplateParams<'a> {
    pub host: &'a str,
    pub label: &'a str,
    pub user: &'a str,
    pub rank: usize,
    pub nhosts: usize,
    pub address: Option<String>,
}

pub struct CommandTemplate {
    source: String,
    registry: Handlebars<'static>,
    uses_address: bool,
}

impl CommandTemplate {
    pub fn new(source: &str) -> Result<Self, DispatchError> {
        let mut registry = Handlebars::new();
        handlebars_misc_helpers::register(&mut registry);
        // Shell commands are not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(TEMPLATE_NAME, source)
            .map_err(|e| DispatchError::Template {
                template: source.to_string(),
                reason: e.to_string(),
            })?;
        let mut template = Self {
            source: source.to_string(),
            registry,
            uses_address: false,
        };
        template.uses_address = template.depends_on_address();
        Ok(template)
    }

    /// Renders with different addresses, and without one, and compares. Helpers and conditionals that read
    /// the address count; the word appearing in literal text does not.
    fn depends_on_address(&self) -> bool {
        let render = |address: Option<&str>| {
            self.render(&TemplateParams {
                host: "host",
                label: "host",
                user: "user",
                rank: 0,
                nhosts: 1,
                address: address.map(String::from),
            })
            .ok()
        };
        let v4 = render(Some("192.0.2.1"));
        v4 != render(Some("2001:db8::1")) || v4 != render(None)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether rendering needs the resolved address.
    pub fn uses_address(&self) -> bool {
        self.uses_address
    }

    pub fn render(&self, params: &TemplateParams) -> Result<String, DispatchError> {
        self.registry
            .render(TEMPLATE_NAME, params)
            .map_err(|e| DispatchError::Template {
                template: self.source.clone(),
                reason: e.to_string(),
            })
    }
}
