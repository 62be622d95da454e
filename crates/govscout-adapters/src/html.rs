use scraper::Html;
use serde_json::Value as JsonValue;

const SKIPPED_ELEMENTS: [&str; 3] = ["script", "style", "noscript"];

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Flatten an HTML fragment to readable text, dropping script and style
/// content.
pub fn html_to_text(html: &str) -> String {
    if !html.contains('<') {
        return collapse_whitespace(html);
    }
    let fragment = Html::parse_fragment(html);
    let mut pieces = Vec::new();
    for node in fragment.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let skipped = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|el| el.name().to_string()))
            .is_some_and(|name| SKIPPED_ELEMENTS.contains(&name.as_str()));
        if !skipped {
            pieces.push(text.to_string());
        }
    }
    collapse_whitespace(&pieces.join(" "))
}

/// Text of a notice description response: either `{"description": ...}` or
/// an HTML page.
pub fn description_text(body: &str) -> String {
    if let Ok(JsonValue::Object(map)) = serde_json::from_str::<JsonValue>(body) {
        if let Some(description) = map.get("description").and_then(JsonValue::as_str) {
            return html_to_text(description);
        }
    }
    html_to_text(body)
}
