//! Prompt templates with `{name}` placeholders.

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::error::{ServiceError, ServiceResult};
use crate::store::{Database, NewPromptTemplate, PromptTemplate, PromptTemplateUpdate};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^{}]+)\}").expect("static regex"))
}

/// Names of every `{name}` placeholder in `content`.
pub fn extract_variables(content: &str) -> BTreeSet<String> {
    placeholder_re()
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateValidation {
    pub is_valid: bool,
    pub variables: Vec<String>,
    pub variable_count: usize,
    pub issues: Vec<String>,
}

pub fn validate(content: &str) -> TemplateValidation {
    let variables: Vec<String> = extract_variables(content).into_iter().collect();
    let mut issues = Vec::new();

    if content.matches('{').count() != content.matches('}').count() {
        issues.push("Mismatched braces - check for unclosed variable declarations".to_string());
    }
    if content.contains("{}") {
        issues.push("Empty variable declarations found".to_string());
    }
    if content.contains("{{") || content.contains("}}") {
        issues.push("Nested braces detected - use single braces for variables".to_string());
    }

    TemplateValidation {
        is_valid: issues.is_empty(),
        variable_count: variables.len(),
        variables,
        issues,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{name}` that has a value in `values`.
///
/// Single pass over the template: substituted text is never re-scanned, and
/// placeholders without a value are left as written.
pub fn substitute(content: &str, values: &Map<String, Value>) -> String {
    placeholder_re()
        .replace_all(content, |caps: &Captures<'_>| match values.get(&caps[1]) {
            Some(value) => value_text(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Declared variables missing from `values`, sorted.
fn missing_variables(declared: &[String], values: &Map<String, Value>) -> Vec<String> {
    let mut missing: Vec<String> = declared
        .iter()
        .filter(|name| !values.contains_key(name.as_str()))
        .cloned()
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

fn ensure_valid(content: &str) -> ServiceResult<Vec<String>> {
    let report = validate(content);
    if !report.is_valid {
        return Err(ServiceError::Validation(format!(
            "Invalid template: {}",
            report.issues.join(", ")
        )));
    }
    Ok(report.variables)
}

/// Template CRUD plus rendering.
#[derive(Clone)]
pub struct PromptEngine {
    db: Database,
}

impl PromptEngine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        owner_id: i64,
        new: NewPromptTemplate,
    ) -> ServiceResult<PromptTemplate> {
        if new.name.trim().is_empty() {
            return Err(ServiceError::Validation("name must not be empty".to_string()));
        }
        let variables = ensure_valid(&new.content)?;
        Ok(self.db.insert_template(owner_id, new, variables).await?)
    }

    pub async fn get(&self, id: i64) -> ServiceResult<PromptTemplate> {
        self.db
            .get_template(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Template with id {} not found", id)))
    }

    pub async fn list(
        &self,
        owner: Option<i64>,
        skip: u32,
        limit: u32,
    ) -> ServiceResult<Vec<PromptTemplate>> {
        Ok(self.db.list_templates(owner, skip, limit).await?)
    }

    /// Apply `update`; variables are re-derived whenever content changes.
    pub async fn update(&self, id: i64, update: PromptTemplateUpdate) -> ServiceResult<PromptTemplate> {
        let mut template = self.get(id).await?;
        if let Some(content) = update.content {
            template.variables = ensure_valid(&content)?;
            template.content = content;
        }
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(ServiceError::Validation("name must not be empty".to_string()));
            }
            template.name = name;
        }
        if let Some(description) = update.description {
            template.description = Some(description);
        }
        if let Some(active) = update.is_active {
            template.is_active = active;
        }
        Ok(self.db.save_template(template).await?)
    }

    pub async fn delete(&self, id: i64) -> ServiceResult<()> {
        if !self.db.delete_template(id).await? {
            return Err(ServiceError::NotFound(format!(
                "Template with id {} not found",
                id
            )));
        }
        Ok(())
    }

    /// New version of an existing template's family, owned by `owner_id`.
    pub async fn create_version(
        &self,
        template_id: i64,
        owner_id: i64,
        content: String,
        description: Option<String>,
    ) -> ServiceResult<PromptTemplate> {
        let base = self.get(template_id).await?;
        let variables = ensure_valid(&content)?;
        Ok(self
            .db
            .insert_next_version(owner_id, &base.name, description, content, variables)
            .await?)
    }

    /// Render an active template.
    ///
    /// Fails with `MissingVariables` naming every declared variable absent
    /// from `values`; extra values are ignored.
    pub async fn render(&self, template_id: i64, values: &Map<String, Value>) -> ServiceResult<String> {
        let template = self.get(template_id).await?;
        if !template.is_active {
            return Err(ServiceError::NotFound(format!(
                "Template with id {} not found",
                template_id
            )));
        }
        render_template(&template, values)
    }
}

/// Render a loaded template against `values`.
pub fn render_template(template: &PromptTemplate, values: &Map<String, Value>) -> ServiceResult<String> {
    let missing = missing_variables(&template.variables, values);
    if !missing.is_empty() {
        return Err(ServiceError::MissingVariables(missing));
    }
    Ok(substitute(&template.content, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::seed_user;
    use crate::store::Role;
    use serde_json::json;

    fn values(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn validate_simple_template() {
        let report = validate("Hello {name}");
        assert!(report.is_valid);
        assert_eq!(report.variables, vec!["name"]);
        assert_eq!(report.variable_count, 1);
    }

    #[test]
    fn validate_flags_unclosed_brace() {
        let report = validate("Hello {name");
        assert!(!report.is_valid);
        assert!(report.issues.iter().any(|i| i.starts_with("Mismatched braces")));
    }

    #[test]
    fn validate_flags_empty_and_doubled_braces() {
        let report = validate("a {} b");
        assert_eq!(report.issues, vec!["Empty variable declarations found"]);

        let report = validate("{{name}}");
        assert!(!report.is_valid);
        assert!(report.issues.iter().any(|i| i.starts_with("Nested braces")));
    }

    #[test]
    fn extract_collapses_duplicates() {
        let vars = extract_variables("{a} {b} {a}");
        assert_eq!(vars.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn substitution_is_not_recursive() {
        let out = substitute(
            "{a} and {b}",
            &values(json!({"a": "{b}", "b": "bee"})),
        );
        assert_eq!(out, "{b} and bee");
    }

    #[test]
    fn substitution_stringifies_non_strings() {
        let out = substitute(
            "{n} {flag} {list} {s}",
            &values(json!({"n": 3, "flag": true, "list": [1, 2], "s": "txt"})),
        );
        assert_eq!(out, "3 true [1,2] txt");
    }

    #[tokio::test]
    async fn render_reports_missing_variables() {
        let db = Database::open_in_memory().await.unwrap();
        let owner = seed_user(&db, "u", Role::User).await;
        let engine = PromptEngine::new(db);
        let template = engine
            .create(
                owner,
                NewPromptTemplate {
                    name: "pair".into(),
                    description: None,
                    content: "{a} then {b}".into(),
                },
            )
            .await
            .unwrap();

        let err = engine
            .render(template.id, &values(json!({"a": "x"})))
            .await
            .unwrap_err();
        match err {
            ServiceError::MissingVariables(names) => assert_eq!(names, vec!["b"]),
            other => panic!("unexpected error: {other}"),
        }

        let text = engine
            .render(template.id, &values(json!({"a": "x", "b": "y", "extra": 1})))
            .await
            .unwrap();
        assert_eq!(text, "x then y");
    }

    #[tokio::test]
    async fn update_rederives_variables_and_rejects_invalid_content() {
        let db = Database::open_in_memory().await.unwrap();
        let owner = seed_user(&db, "u", Role::User).await;
        let engine = PromptEngine::new(db);
        let template = engine
            .create(
                owner,
                NewPromptTemplate {
                    name: "t".into(),
                    description: None,
                    content: "Hi {name}".into(),
                },
            )
            .await
            .unwrap();

        let updated = engine
            .update(
                template.id,
                PromptTemplateUpdate {
                    content: Some("{greeting}, {name}!".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.variables, vec!["greeting", "name"]);

        let err = engine
            .update(
                template.id,
                PromptTemplateUpdate {
                    content: Some("broken {name".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(msg) if msg.starts_with("Invalid template")));
    }

    #[tokio::test]
    async fn inactive_templates_do_not_render() {
        let db = Database::open_in_memory().await.unwrap();
        let owner = seed_user(&db, "u", Role::User).await;
        let engine = PromptEngine::new(db);
        let template = engine
            .create(
                owner,
                NewPromptTemplate {
                    name: "t".into(),
                    description: None,
                    content: "static".into(),
                },
            )
            .await
            .unwrap();
        engine
            .update(
                template.id,
                PromptTemplateUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            engine.render(template.id, &Map::new()).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
