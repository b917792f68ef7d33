use serde_json::{Map, Value};

/// True when a response body is an HTML page rather than data. Checked
/// against the first 100 trimmed characters, case-insensitively.
pub fn is_html_response(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(100).collect::<String>().to_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Detects and parses a string body as JSON, XML, or CSV. Anything else is
/// returned as the raw string.
pub fn parse_body(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::String(String::new());
    }

    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        return json;
    }

    if trimmed.starts_with('<') {
        if let Some(xml) = parse_xml(trimmed) {
            return xml;
        }
    }

    if let Some(csv) = parse_csv(trimmed) {
        return csv;
    }

    Value::String(text.to_string())
}

// --- CSV ---

/// Header row becomes the object keys; values stay strings. Returns None
/// unless the first two rows agree on a field count greater than one.
fn parse_csv(text: &str) -> Option<Value> {
    let mut rows = text.lines().filter(|l| !l.trim().is_empty());
    let header = split_csv_row(rows.next()?);
    if header.len() < 2 {
        return None;
    }

    let mut records = Vec::new();
    for line in rows {
        let fields = split_csv_row(line);
        if records.is_empty() && fields.len() != header.len() {
            return None;
        }
        let mut record = Map::new();
        for (i, name) in header.iter().enumerate() {
            let value = fields.get(i).cloned().unwrap_or_default();
            record.insert(name.clone(), Value::String(value));
        }
        records.push(Value::Object(record));
    }

    if records.is_empty() {
        return None;
    }
    Some(Value::Array(records))
}

fn split_csv_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

// --- XML ---

/// Minimal element-tree parse: `<a><b>1</b><b>2</b></a>` becomes
/// `{"a": {"b": ["1", "2"]}}`. Attributes are kept under `@name` keys.
fn parse_xml(text: &str) -> Option<Value> {
    let mut parser = XmlParser { input: text, pos: 0 };
    parser.skip_prolog();
    let (tag, value) = parser.parse_element()?;
    let mut root = Map::new();
    root.insert(tag, value);
    Some(Value::Object(root))
}

struct XmlParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> XmlParser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn skip_prolog(&mut self) {
        loop {
            self.skip_whitespace();
            if self.rest().starts_with("<?") {
                match self.rest().find("?>") {
                    Some(end) => self.pos += end + 2,
                    None => return,
                }
            } else if self.rest().starts_with("<!--") {
                match self.rest().find("-->") {
                    Some(end) => self.pos += end + 3,
                    None => return,
                }
            } else {
                return;
            }
        }
    }

    fn parse_element(&mut self) -> Option<(String, Value)> {
        self.skip_whitespace();
        if !self.rest().starts_with('<') || self.rest().starts_with("</") {
            return None;
        }
        let open_end = self.rest().find('>')?;
        let raw_tag = &self.rest()[1..open_end];
        let self_closing = raw_tag.ends_with('/');
        let raw_tag = raw_tag.trim_end_matches('/');

        let mut parts = raw_tag.split_whitespace();
        let name = parts.next()?.to_string();
        let mut attributes = Map::new();
        for attr in parts {
            if let Some((key, value)) = attr.split_once('=') {
                attributes.insert(
                    format!("@{key}"),
                    Value::String(value.trim_matches('"').to_string()),
                );
            }
        }

        self.pos += open_end + 1;
        if self_closing {
            return Some((name, Value::Object(attributes)));
        }

        let mut children: Map<String, Value> = attributes;
        let mut text_content = String::new();

        loop {
            self.skip_prolog();
            let rest = self.rest();
            if rest.is_empty() {
                break;
            }
            if let Some(after) = rest.strip_prefix("</") {
                let close_end = after.find('>')?;
                self.pos += 2 + close_end + 1;
                break;
            }
            if rest.starts_with('<') {
                let (child_name, child_value) = self.parse_element()?;
                merge_child(&mut children, child_name, child_value);
            } else {
                let next_tag = rest.find('<').unwrap_or(rest.len());
                text_content.push_str(rest[..next_tag].trim());
                self.pos += next_tag;
            }
        }

        let value = if children.is_empty() {
            Value::String(text_content)
        } else if text_content.is_empty() {
            Value::Object(children)
        } else {
            children.insert("#text".to_string(), Value::String(text_content));
            Value::Object(children)
        };
        Some((name, value))
    }
}

/// Repeated sibling tags collapse into an array.
fn merge_child(children: &mut Map<String, Value>, name: String, value: Value) {
    match children.get_mut(&name) {
        Some(Value::Array(arr)) => arr.push(value),
        Some(existing) => {
            let prior = existing.take();
            *existing = Value::Array(vec![prior, value]);
        }
        None => {
            children.insert(name, value);
        }
    }
}

/// Extracts a remote error out of a parsed body: an object with a non-null
/// `error` or a non-empty `errors` array is treated as a failed call even
/// when the HTTP status was 2xx.
pub fn body_error_message(body: &Value) -> Option<String> {
    let obj = body.as_object()?;
    if let Some(err) = obj.get("error") {
        if !err.is_null() {
            return Some(compact(err));
        }
    }
    if let Some(Value::Array(errs)) = obj.get("errors") {
        if !errs.is_empty() {
            return Some(compact(&Value::Array(errs.clone())));
        }
    }
    None
}

fn compact(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
