//! HTML templates
//!
//! Every `*.html` file below the template directory is compiled up front and
//! registered under its path relative to that directory, minus the
//! extension: `hello.html` is `hello`, `auth/reset.html` is `auth/reset`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use courier_common::internal;
use handlebars::{Handlebars, handlebars_helper};
use serde_json::Value;

use crate::RenderError;

pub trait Renderer: Send + Sync {
    /// Render the body template `template` against `payload`
    fn render(&self, template: &str, payload: &Value) -> Result<String, RenderError>;

    /// Render an inline subject line against `payload`, without HTML escaping
    fn render_subject(&self, subject: &str, payload: &Value) -> Result<String, RenderError>;
}

// Zero-based indices: row 0 is the first, and odd, row
handlebars_helper!(odd: |value: i64| value % 2 == 0);
handlebars_helper!(split: |value: str, separator: str| value.split(separator).collect::<Vec<_>>());
handlebars_helper!(contains: |haystack: str, needle: str| haystack.contains(needle));

fn registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    registry.register_helper("odd", Box::new(odd));
    registry.register_helper("split", Box::new(split));
    registry.register_helper("contains", Box::new(contains));
    registry
}

pub struct TemplateRenderer {
    html: Handlebars<'static>,
    text: Handlebars<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// A renderer with no templates registered
    pub fn new() -> Self {
        let mut text = registry();
        text.register_escape_fn(handlebars::no_escape);

        Self {
            html: registry(),
            text,
        }
    }

    /// Compile every template below `dir`
    ///
    /// # Errors
    ///
    /// The directory could not be walked, or a template failed to compile.
    pub fn load(dir: &Path) -> Result<Self, RenderError> {
        let mut renderer = Self::new();
        let mut found = Vec::new();
        find_templates(dir, dir, &mut found)?;

        for (name, path) in found {
            let source = fs::read_to_string(&path).map_err(|source| RenderError::Io {
                path: path.clone(),
                source,
            })?;
            renderer.register(&name, &source)?;
            internal!(template = %name, "Loaded template");
        }

        internal!(
            level = INFO,
            "Loaded {} templates from {}",
            renderer.html.get_templates().len(),
            dir.display()
        );

        Ok(renderer)
    }

    /// Compile `source` and register it as `name`
    ///
    /// # Errors
    ///
    /// The template does not compile.
    pub fn register(&mut self, name: &str, source: &str) -> Result<(), RenderError> {
        self.html
            .register_template_string(name, source)
            .map_err(|source| RenderError::Compile {
                name: name.to_string(),
                source: Box::new(source),
            })
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.html.has_template(name)
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, template: &str, payload: &Value) -> Result<String, RenderError> {
        if !self.html.has_template(template) {
            return Err(RenderError::NotFound(template.to_string()));
        }

        Ok(self.html.render(template, payload)?)
    }

    fn render_subject(&self, subject: &str, payload: &Value) -> Result<String, RenderError> {
        Ok(self.text.render_template(subject, payload)?)
    }
}

fn find_templates(
    root: &Path,
    dir: &Path,
    found: &mut Vec<(String, PathBuf)>,
) -> Result<(), RenderError> {
    let io = |source| RenderError::Io {
        path: dir.to_path_buf(),
        source,
    };

    for entry in fs::read_dir(dir).map_err(io)? {
        let path = entry.map_err(io)?.path();

        if path.is_dir() {
            find_templates(root, &path, found)?;
        } else if path.extension().is_some_and(|extension| extension == "html")
            && let Ok(relative) = path.strip_prefix(root)
        {
            let name = relative
                .with_extension("")
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            found.push((name, path));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn renderer(name: &str, source: &str) -> TemplateRenderer {
        let mut renderer = TemplateRenderer::new();
        renderer.register(name, source).unwrap();
        renderer
    }

    #[test]
    fn test_render() {
        let renderer = renderer("hello", "<p>Hello {{name}}</p>");

        assert_eq!(
            renderer.render("hello", &json!({ "name": "World" })).unwrap(),
            "<p>Hello World</p>"
        );
    }

    #[test]
    fn test_render_escapes_html() {
        let renderer = renderer("hello", "<p>{{name}}</p>");

        assert_eq!(
            renderer.render("hello", &json!({ "name": "<b>" })).unwrap(),
            "<p>&lt;b&gt;</p>"
        );
    }

    #[test]
    fn test_missing_template() {
        let renderer = TemplateRenderer::new();

        assert!(matches!(
            renderer.render("missing", &Value::Null),
            Err(RenderError::NotFound(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_subject_is_not_escaped() {
        let renderer = TemplateRenderer::new();

        assert_eq!(
            renderer
                .render_subject("Hello {{name}}", &json!({ "name": "Tom & Jerry" }))
                .unwrap(),
            "Hello Tom & Jerry"
        );
        assert_eq!(renderer.render_subject("", &Value::Null).unwrap(), "");
    }

    #[test]
    fn test_helpers() {
        let renderer = renderer(
            "helpers",
            "{{#each items}}{{#if (odd @index)}}o{{else}}e{{/if}}{{/each}}|\
             {{#each (split tags \",\")}}[{{this}}]{{/each}}|\
             {{#if (contains email \"@\")}}valid{{/if}}",
        );

        let rendered = renderer
            .render(
                "helpers",
                &json!({ "items": [1, 2, 3], "tags": "a,b", "email": "a@x" }),
            )
            .unwrap();

        assert_eq!(rendered, "oeo|[a][b]|valid");
    }

    #[test]
    fn test_bad_template_does_not_compile() {
        let mut renderer = TemplateRenderer::new();

        assert!(matches!(
            renderer.register("broken", "{{#if}}"),
            Err(RenderError::Compile { .. })
        ));
    }
}
