use chrono::Utc;
use serde_json::Value;

use crate::eval::EvalScope;

/// Everything the `{{…}}` renderer may read, keyed by root namespace:
/// `event.*` (inbound event), `project.*`, `now.*`, and the variable
/// scopes as the default.
pub struct TemplateContext<'a> {
    pub event: &'a Value,
    pub project: &'a Value,
    pub scope: &'a EvalScope,
}

/// Render `{{path.to.value}}` placeholders in a template string.
/// Unresolvable paths render as the empty string.
pub fn render(template: &str, ctx: &TemplateContext<'_>) -> String {
    match resolve(template, ctx) {
        Value::String(s) => s,
        other => text(&other),
    }
}

/// Resolve a template to a typed value. A template that is exactly one
/// placeholder returns the underlying value unconverted, so booleans,
/// numbers, and objects survive substitution; anything else renders to a
/// string.
pub fn resolve(template: &str, ctx: &TemplateContext<'_>) -> Value {
    let trimmed = template.trim();
    if let Some(path) = lone_placeholder(trimmed) {
        return resolve_path(path, ctx);
    }

    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        result.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let path = after[..close].trim();
                result.push_str(&text(&resolve_path(path, ctx)));
                rest = &after[close + 2..];
            }
            None => {
                // Unclosed placeholder renders literally.
                result.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    Value::String(result)
}

/// Recursively resolve templates in all string values of a JSON value.
pub fn resolve_value(value: &Value, ctx: &TemplateContext<'_>) -> Value {
    match value {
        Value::String(s) => resolve(s, ctx),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// If the whole template is one `{{…}}` placeholder, return its path.
fn lone_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn resolve_path(path: &str, ctx: &TemplateContext<'_>) -> Value {
    let mut parts = path.split('.');
    let root = match parts.next() {
        Some(r) if !r.is_empty() => r,
        _ => return Value::Null,
    };

    match root {
        "event" => walk(ctx.event, parts),
        "project" => walk(ctx.project, parts),
        "now" => now_value(parts.next().unwrap_or("iso")),
        // Default namespace: the variable store, ordered lookup.
        _ => match ctx.scope.lookup(root) {
            Some(v) => walk_owned(v, parts),
            None => Value::Null,
        },
    }
}

fn walk<'a>(mut current: &'a Value, parts: impl Iterator<Item = &'a str>) -> Value {
    for part in parts {
        match current.get(part) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn walk_owned<'a>(value: Value, parts: impl Iterator<Item = &'a str>) -> Value {
    let mut current = value;
    for part in parts {
        match current.get(part) {
            Some(v) => current = v.clone(),
            None => return Value::Null,
        }
    }
    current
}

fn now_value(field: &str) -> Value {
    let now = Utc::now();
    match field {
        "unix" => Value::Number(now.timestamp().into()),
        "date" => Value::String(now.format("%Y-%m-%d").to_string()),
        "time" => Value::String(now.format("%H:%M:%S").to_string()),
        _ => Value::String(now.to_rfc3339()),
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(event: &'a Value, project: &'a Value, scope: &'a EvalScope) -> TemplateContext<'a> {
        TemplateContext {
            event,
            project,
            scope,
        }
    }

    #[test]
    fn renders_variable_and_event_namespaces() {
        let event = json!({ "text": "/start", "from": { "name": "Bob" } });
        let project = json!({ "id": "p1" });
        let mut scope = EvalScope::default();
        scope.session.insert("points".to_string(), json!(30));

        let c = ctx(&event, &project, &scope);
        assert_eq!(
            render("Hi {{event.from.name}}, you have {{points}} points", &c),
            "Hi Bob, you have 30 points"
        );
        assert_eq!(render("project={{project.id}}", &c), "project=p1");
    }

    #[test]
    fn lone_placeholder_keeps_type() {
        let event = json!({});
        let project = json!({});
        let mut scope = EvalScope::default();
        scope.session.insert("flag".to_string(), json!(true));
        scope
            .session
            .insert("profile".to_string(), json!({ "age": 7 }));

        let c = ctx(&event, &project, &scope);
        assert_eq!(resolve("{{flag}}", &c), json!(true));
        assert_eq!(resolve("{{profile}}", &c), json!({ "age": 7 }));
        assert_eq!(resolve(" {{profile.age}} ", &c), json!(7));
    }

    #[test]
    fn missing_path_renders_empty() {
        let event = json!({});
        let project = json!({});
        let scope = EvalScope::default();
        let c = ctx(&event, &project, &scope);
        assert_eq!(render("x={{nope.deep}}!", &c), "x=!");
    }

    #[test]
    fn unclosed_placeholder_left_as_is() {
        let event = json!({});
        let project = json!({});
        let scope = EvalScope::default();
        let c = ctx(&event, &project, &scope);
        assert_eq!(render("oops {{broken", &c), "oops {{broken");
    }

    #[test]
    fn resolve_value_recurses() {
        let event = json!({ "chat": { "id": 99 } });
        let project = json!({});
        let scope = EvalScope::default();
        let c = ctx(&event, &project, &scope);
        let v = resolve_value(
            &json!({ "chat_id": "{{event.chat.id}}", "items": ["{{event.chat.id}}"] }),
            &c,
        );
        assert_eq!(v, json!({ "chat_id": 99, "items": [99] }));
    }

    #[test]
    fn now_namespace() {
        let event = json!({});
        let project = json!({});
        let scope = EvalScope::default();
        let c = ctx(&event, &project, &scope);
        assert!(matches!(resolve("{{now.unix}}", &c), Value::Number(_)));
        assert!(!render("{{now.date}}", &c).is_empty());
    }
}
