use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::CourierError;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedTemplate {
    pub subject: Option<String>,
    pub body: String,
}

/// Renders a stored template with request data. `Ok(None)` means the template
/// does not exist.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        template_id: &str,
        data: &HashMap<String, Value>,
    ) -> Result<Option<RenderedTemplate>, CourierError>;
}

#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub subject: Option<String>,
    pub body: String,
}

/// In-memory templates using `{{variable}}` placeholders.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, Template>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, template: Template) {
        self.templates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(template.id.clone(), template);
    }

    fn render_string(template: &str, data: &HashMap<String, Value>) -> String {
        let mut result = template.to_string();

        for (key, value) in data {
            let placeholder = format!("{{{{{}}}}}", key);
            let replacement = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            result = result.replace(&placeholder, &replacement);
        }

        result
    }
}

#[async_trait]
impl TemplateRenderer for TemplateRegistry {
    async fn render(
        &self,
        template_id: &str,
        data: &HashMap<String, Value>,
    ) -> Result<Option<RenderedTemplate>, CourierError> {
        let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
        let Some(template) = templates.get(template_id) else {
            return Ok(None);
        };

        Ok(Some(RenderedTemplate {
            subject: template
                .subject
                .as_deref()
                .map(|s| Self::render_string(s, data)),
            body: Self::render_string(&template.body, data),
        }))
    }
}
